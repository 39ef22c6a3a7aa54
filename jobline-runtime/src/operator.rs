//! Job operator
//!
//! Entry point for running jobs: registers job definitions, starts and
//! restarts executions on their own tokio task, stops and abandons them, and
//! answers queries over the repository.
//!
//! # Example
//!
//! ```no_run
//! use jobline_core::{ArtifactRegistry, Job, Properties, Step};
//! use jobline_runtime::{JobOperator, RuntimeConfig};
//! use jobline_storage::InMemoryRepository;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ArtifactRegistry::new();
//! let operator = JobOperator::new(
//!     Arc::new(InMemoryRepository::new()),
//!     Arc::new(registry),
//!     RuntimeConfig::from_env()?,
//! );
//!
//! operator.register_job(Job::new("nightly").with_element(Step::batchlet("purge", "purge-batchlet")))?;
//! let execution_id = operator.start("nightly", Properties::new()).await?;
//! let execution = operator.await_termination(execution_id, None).await?;
//! println!("finished as {}", execution.batch_status);
//! # Ok(())
//! # }
//! ```

use crate::config::{JobOptions, RestartMode, RuntimeConfig};
use crate::context::{JobContext, RuntimeServices};
use crate::job_runner::JobRunner;
use crate::{Error, Result};
use chrono::Utc;
use dashmap::DashMap;
use jobline_core::{
    property_key, ArtifactFactory, BatchStatus, Job, JobExecution, JobExecutionId, JobInstance, JobValidator,
    PartitionExecution, PayloadCodec, Properties, SerializationProvider, StepExecution, StepExecutionId,
};
use jobline_storage::JobRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn, Instrument};

struct RunningExecution {
    context: JobContext,
    finished: watch::Receiver<bool>,
}

/// Codec for the configured provider name; JSON when no offered provider matches
fn select_codec(requested: &str, offered: Option<Arc<dyn SerializationProvider>>) -> PayloadCodec {
    let discovered = offered.filter(|provider| provider.name() == requested);
    let codec = PayloadCodec::select(discovered);
    if codec.provider_name() != requested {
        warn!(
            requested = %requested,
            using = %codec.provider_name(),
            "Requested serialization provider not installed, using default"
        );
    }
    codec
}

/// Starts, restarts, stops and abandons job executions
pub struct JobOperator {
    services: RuntimeServices,
    jobs: DashMap<String, Arc<Job>>,
    running: Arc<DashMap<JobExecutionId, RunningExecution>>,
}

impl JobOperator {
    /// Create an operator using the JSON checkpoint codec
    ///
    /// # Arguments
    ///
    /// * `repository` - Where job, step and partition records are kept
    /// * `factory` - Resolves collaborator references of job definitions
    /// * `config` - Process-wide runtime defaults
    pub fn new(repository: Arc<dyn JobRepository>, factory: Arc<dyn ArtifactFactory>, config: RuntimeConfig) -> Self {
        let codec = select_codec(&config.payload_codec, None);

        Self {
            services: RuntimeServices {
                repository,
                factory,
                codec,
                config: Arc::new(config),
            },
            jobs: DashMap::new(),
            running: Arc::new(DashMap::new()),
        }
    }

    /// Offer a serialization provider for non-primitive checkpoint values.
    ///
    /// It is installed when its name matches the configured `payload_codec`;
    /// call before the first execution starts.
    pub fn with_serialization_provider(mut self, provider: Arc<dyn SerializationProvider>) -> Self {
        self.services.codec = select_codec(&self.services.config.payload_codec, Some(provider));
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.services.config
    }

    pub fn codec(&self) -> &PayloadCodec {
        &self.services.codec
    }

    /// Validate and register a job definition under its id.
    ///
    /// Cycles are accepted only when the job sets `jobline.loop.allowed`.
    pub fn register_job(&self, job: Job) -> Result<()> {
        let allow_loops = job
            .properties
            .get(property_key::LOOP_ALLOWED)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
        JobValidator::new()
            .allow_loops(allow_loops)
            .validate(&job)
            .map_err(|e| Error::Execution(format!("job {} is invalid: {}", job.id, e)))?;

        info!(job = %job.id, elements = job.elements.len(), "Job registered");
        self.jobs.insert(job.id.clone(), Arc::new(job));
        Ok(())
    }

    fn job(&self, name: &str) -> Result<Arc<Job>> {
        self.jobs
            .get(name)
            .map(|job| Arc::clone(job.value()))
            .ok_or_else(|| Error::NotFound(format!("job {} is not registered", name)))
    }

    /// Start a new instance of a registered job
    ///
    /// # Returns
    ///
    /// The id of the new job execution; the job runs on its own task
    #[instrument(skip(self, parameters), fields(job = %job_name))]
    pub async fn start(&self, job_name: &str, parameters: Properties) -> Result<JobExecutionId> {
        let job = self.job(job_name)?;
        let options = JobOptions::resolve(&parameters, &job.properties)?;

        let repository = &self.services.repository;
        let instance = repository.create_job_instance(job_name).await?;
        let execution = repository.create_job_execution(&instance, parameters, None).await?;
        let id = execution.id;

        info!(job_execution_id = %id, instance_id = %instance.id, "Starting job execution");
        self.launch(job, execution, None, options);
        Ok(id)
    }

    /// Restart the most recent execution of a job instance
    ///
    /// # Arguments
    ///
    /// * `execution_id` - The execution to restart; must be the newest of its instance
    /// * `parameters` - Overrides merged over the prior execution's parameters
    ///
    /// # Errors
    ///
    /// Returns `Error::Restart` if:
    /// - The job is not restartable
    /// - A newer execution of the instance exists
    /// - The execution COMPLETED or was ABANDONED
    /// - The execution is still in flight and the restart mode refuses it
    #[instrument(skip(self, parameters), fields(prior_execution_id = %execution_id))]
    pub async fn restart(&self, execution_id: JobExecutionId, parameters: Properties) -> Result<JobExecutionId> {
        let repository = &self.services.repository;
        let mut prior = repository.get_job_execution(execution_id).await?;
        let job = self.job(&prior.job_name)?;

        if !job.restartable {
            return Err(Error::Restart(format!("job {} is not restartable", job.id)));
        }

        let latest = repository
            .job_executions(prior.instance_id)
            .await?
            .into_iter()
            .map(|e| e.id)
            .max();
        if latest != Some(prior.id) {
            return Err(Error::Restart(format!(
                "execution {} is not the most recent execution of its instance",
                prior.id
            )));
        }

        let mut merged = prior.parameters.clone();
        merged.extend(parameters);
        let options = JobOptions::resolve(&merged, &job.properties)?;

        match prior.batch_status {
            BatchStatus::Failed | BatchStatus::Stopped => {}
            BatchStatus::Completed | BatchStatus::Abandoned => {
                return Err(Error::Restart(format!(
                    "execution {} is {} and cannot be restarted",
                    prior.id, prior.batch_status
                )));
            }
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping => {
                let running_here = self.running.contains_key(&prior.id);
                match options.restart_mode {
                    RestartMode::Strict => {
                        return Err(Error::Restart(format!(
                            "execution {} is still {}",
                            prior.id, prior.batch_status
                        )));
                    }
                    RestartMode::Detect if running_here => {
                        return Err(Error::Restart(format!(
                            "execution {} is still running in this process",
                            prior.id
                        )));
                    }
                    RestartMode::Detect | RestartMode::Force => {
                        if running_here {
                            if let Some(running) = self.running.get(&prior.id) {
                                running.context.request_stop();
                            }
                        }
                        warn!(
                            prior_execution_id = %prior.id,
                            status = %prior.batch_status,
                            mode = ?options.restart_mode,
                            "Marking in-flight execution FAILED before restart"
                        );
                        prior.batch_status = BatchStatus::Failed;
                        prior.ended_at = Some(Utc::now());
                        prior.touch();
                        repository.update_job_execution(&prior).await?;
                    }
                }
            }
        }

        let instance = repository.get_job_instance(prior.instance_id).await?;
        let execution = repository
            .create_job_execution(&instance, merged, Some(prior.id))
            .await?;
        let id = execution.id;

        info!(job_execution_id = %id, "Restarting job execution");
        self.launch(job, execution, Some(prior), options);
        Ok(id)
    }

    fn launch(&self, job: Arc<Job>, execution: JobExecution, prior: Option<JobExecution>, options: JobOptions) {
        let id = execution.id;
        let span = tracing::info_span!("job_execution", job = %job.id, job_execution_id = %id);
        let context = JobContext::new(job, execution, prior, self.services.clone(), options);
        let (finished_tx, finished) = watch::channel(false);
        self.running.insert(
            id,
            RunningExecution {
                context: context.clone(),
                finished,
            },
        );

        let running = self.running.clone();
        tokio::spawn(
            async move {
                if let Err(e) = JobRunner::new(context).run().await {
                    warn!(error = %e, "Job execution ended with an error");
                }
                running.remove(&id);
                let _ = finished_tx.send(true);
            }
            .instrument(span),
        );
    }

    /// Request a stop.
    ///
    /// The job execution and its in-flight step and partition records are
    /// marked STOPPING; running units observe the request at their next
    /// checkpoint boundary.
    #[instrument(skip(self), fields(job_execution_id = %execution_id))]
    pub async fn stop(&self, execution_id: JobExecutionId) -> Result<()> {
        let repository = &self.services.repository;
        let mut execution = repository.get_job_execution(execution_id).await?;

        match execution.batch_status {
            BatchStatus::Starting | BatchStatus::Started => {}
            BatchStatus::Stopping => return Ok(()),
            other => {
                return Err(Error::InvalidState(format!(
                    "execution {} is {} and cannot be stopped",
                    execution_id, other
                )))
            }
        }

        execution.batch_status = BatchStatus::Stopping;
        execution.touch();
        repository.update_job_execution(&execution).await?;

        let marked = repository.mark_units_stopping(execution_id).await?;
        debug!(marked, "In-flight steps and partitions marked STOPPING");

        let context = self.running.get(&execution_id).map(|r| r.context.clone());
        match context {
            Some(context) => context.request_stop(),
            None => info!("Execution is not running in this process, marked STOPPING only"),
        }
        Ok(())
    }

    /// Mark a finished execution that is not running as ABANDONED
    #[instrument(skip(self), fields(job_execution_id = %execution_id))]
    pub async fn abandon(&self, execution_id: JobExecutionId) -> Result<()> {
        if self.running.contains_key(&execution_id) {
            return Err(Error::InvalidState(format!(
                "execution {} is still running",
                execution_id
            )));
        }

        let repository = &self.services.repository;
        let mut execution = repository.get_job_execution(execution_id).await?;
        if !execution.batch_status.can_transition_to(BatchStatus::Abandoned) {
            return Err(Error::InvalidState(format!(
                "execution {} is {} and cannot be abandoned",
                execution_id, execution.batch_status
            )));
        }

        execution.batch_status = BatchStatus::Abandoned;
        execution.touch();
        repository.update_job_execution(&execution).await?;
        info!("Job execution abandoned");
        Ok(())
    }

    /// Wait until the execution is no longer running in this process and
    /// return its stored record
    pub async fn await_termination(
        &self,
        execution_id: JobExecutionId,
        timeout: Option<Duration>,
    ) -> Result<JobExecution> {
        let finished = self.running.get(&execution_id).map(|r| r.finished.clone());

        if let Some(mut finished) = finished {
            let wait = async move {
                while !*finished.borrow() {
                    if finished.changed().await.is_err() {
                        break;
                    }
                }
            };
            match timeout {
                Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                    Error::Timeout(format!(
                        "execution {} still running after {}ms",
                        execution_id,
                        limit.as_millis()
                    ))
                })?,
                None => wait.await,
            }
        }

        self.job_execution(execution_id).await
    }

    pub async fn job_execution(&self, execution_id: JobExecutionId) -> Result<JobExecution> {
        Ok(self.services.repository.get_job_execution(execution_id).await?)
    }

    pub async fn step_executions(&self, execution_id: JobExecutionId) -> Result<Vec<StepExecution>> {
        Ok(self.services.repository.step_executions(execution_id).await?)
    }

    pub async fn partition_executions(&self, step_execution_id: StepExecutionId) -> Result<Vec<PartitionExecution>> {
        Ok(self.services.repository.partition_executions(step_execution_id).await?)
    }

    pub async fn job_instance_count(&self, job_name: &str) -> Result<usize> {
        Ok(self.services.repository.job_instance_count(job_name).await?)
    }

    /// Instances of a job, newest first
    pub async fn job_instances(&self, job_name: &str, start: usize, count: usize) -> Result<Vec<JobInstance>> {
        Ok(self.services.repository.job_instances(job_name, start, count).await?)
    }

    /// Executions of a job currently running in this process
    pub fn running_executions(&self, job_name: &str) -> Vec<JobExecutionId> {
        let mut ids: Vec<_> = self
            .running
            .iter()
            .filter(|entry| entry.value().context.job().id == job_name)
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        ids
    }

    /// Most recent executions of a job across all its instances, newest first
    pub async fn job_executions_by_job(&self, job_name: &str, limit: usize) -> Result<Vec<JobExecution>> {
        let repository = &self.services.repository;
        let mut executions = Vec::new();
        for instance in repository.job_instances(job_name, 0, usize::MAX).await? {
            executions.extend(repository.job_executions(instance.id).await?);
        }
        executions.sort_by(|a, b| b.id.cmp(&a.id));
        executions.truncate(limit);
        Ok(executions)
    }

    pub async fn job_names(&self) -> Result<Vec<String>> {
        Ok(self.services.repository.job_names().await?)
    }
}
