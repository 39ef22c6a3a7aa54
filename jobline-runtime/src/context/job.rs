use crate::config::{JobOptions, RuntimeConfig};
use chrono::Utc;
use jobline_core::{
    ArtifactFactory, BatchStatus, Job, JobExecution, JobExecutionId, JobInstanceId, JobScope, PayloadCodec,
    Properties,
};
use jobline_storage::JobRepository;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Collaborators every context of a run reaches through its job context
#[derive(Clone)]
pub struct RuntimeServices {
    pub repository: Arc<dyn JobRepository>,
    pub factory: Arc<dyn ArtifactFactory>,
    pub codec: PayloadCodec,
    pub config: Arc<RuntimeConfig>,
}

/// Runtime wrapper around a running job execution.
///
/// Cheap to clone. Clones share the execution record; [`JobContext::fork`]
/// produces an independent copy for a partition.
#[derive(Clone)]
pub struct JobContext {
    inner: Arc<Inner>,
    cancel: CancellationToken,
}

struct Inner {
    job: Arc<Job>,
    job_name: String,
    instance_id: JobInstanceId,
    execution_id: JobExecutionId,
    parameters: Properties,
    execution: Mutex<JobExecution>,
    prior_execution: Option<JobExecution>,
    services: RuntimeServices,
    options: JobOptions,
    forked: bool,
}

impl JobContext {
    pub fn new(
        job: Arc<Job>,
        execution: JobExecution,
        prior_execution: Option<JobExecution>,
        services: RuntimeServices,
        options: JobOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                job,
                job_name: execution.job_name.clone(),
                instance_id: execution.instance_id,
                execution_id: execution.id,
                parameters: execution.parameters.clone(),
                execution: Mutex::new(execution),
                prior_execution,
                services,
                options,
                forked: false,
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn job(&self) -> &Job {
        &self.inner.job
    }

    /// Snapshot of the execution record
    pub fn execution(&self) -> JobExecution {
        self.inner.execution.lock().clone()
    }

    /// The execution this run restarts, if any
    pub fn prior_execution(&self) -> Option<&JobExecution> {
        self.inner.prior_execution.as_ref()
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.inner.services.repository
    }

    pub fn factory(&self) -> &Arc<dyn ArtifactFactory> {
        &self.inner.services.factory
    }

    pub fn codec(&self) -> &PayloadCodec {
        &self.inner.services.codec
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.services.config
    }

    pub fn options(&self) -> &JobOptions {
        &self.inner.options
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_fork(&self) -> bool {
        self.inner.forked
    }

    /// Same execution, observed through a different stop signal
    pub fn with_cancel_token(&self, cancel: CancellationToken) -> Self {
        Self {
            inner: self.inner.clone(),
            cancel,
        }
    }

    /// Independent copy for a partition; status changes made through the fork
    /// are not seen by the original and never persisted
    pub fn fork(&self, cancel: CancellationToken) -> Self {
        let inner = &self.inner;
        Self {
            inner: Arc::new(Inner {
                job: inner.job.clone(),
                job_name: inner.job_name.clone(),
                instance_id: inner.instance_id,
                execution_id: inner.execution_id,
                parameters: inner.parameters.clone(),
                execution: Mutex::new(self.execution()),
                prior_execution: inner.prior_execution.clone(),
                services: inner.services.clone(),
                options: inner.options.clone(),
                forked: true,
            }),
            cancel,
        }
    }

    /// Apply a status change the state machine allows; refuse and log anything else
    pub fn update_batch_status(&self, to: BatchStatus) -> bool {
        let mut execution = self.inner.execution.lock();
        let from = execution.batch_status;
        if !from.can_transition_to(to) {
            warn!(
                job_execution_id = %execution.id,
                from = %from,
                to = %to,
                "Refusing invalid batch status transition"
            );
            return false;
        }

        execution.batch_status = to;
        match to {
            BatchStatus::Started if execution.started_at.is_none() => execution.started_at = Some(Utc::now()),
            status if status.is_terminal() => execution.ended_at = Some(Utc::now()),
            _ => {}
        }
        execution.touch();
        true
    }

    pub fn set_restart_position(&self, position: Option<String>) {
        self.inner.execution.lock().restart_position = position;
    }

    /// Mark the run STOPPING and signal every unit to stop at its next boundary
    pub fn request_stop(&self) {
        if self.update_batch_status(BatchStatus::Stopping) {
            info!(job_execution_id = %self.inner.execution_id, "Stop requested");
        }
        self.cancel.cancel();
    }

    /// Write the execution record; forks never persist
    pub async fn persist(&self) -> crate::Result<()> {
        if self.inner.forked {
            return Ok(());
        }
        let execution = self.execution();
        self.repository().update_job_execution(&execution).await?;
        Ok(())
    }
}

impl JobScope for JobContext {
    fn job_name(&self) -> &str {
        &self.inner.job_name
    }

    fn instance_id(&self) -> JobInstanceId {
        self.inner.instance_id
    }

    fn execution_id(&self) -> JobExecutionId {
        self.inner.execution_id
    }

    fn batch_status(&self) -> BatchStatus {
        self.inner.execution.lock().batch_status
    }

    fn set_batch_status(&self, status: BatchStatus) {
        self.update_batch_status(status);
    }

    fn exit_status(&self) -> Option<String> {
        self.inner.execution.lock().exit_status.clone()
    }

    fn set_exit_status(&self, status: &str) {
        self.inner.execution.lock().exit_status = Some(status.to_string());
    }

    fn properties(&self) -> &Properties {
        &self.inner.job.properties
    }

    fn parameters(&self) -> &Properties {
        &self.inner.parameters
    }

    fn stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
