//! In-memory repository engine
//!
//! Tables are `DashMap`s keyed by record id; ids come from atomic
//! sequences. Conditional saves check and write under the same shard lock,
//! so a concurrent stop request cannot slip between the check and the write.

use crate::metrics::{time_operation, CHECKPOINT_SAVES_SKIPPED_TOTAL};
use crate::repository::JobRepository;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jobline_core::{
    BatchStatus, JobExecution, JobExecutionId, JobInstance, JobInstanceId, PartitionExecution,
    Properties, StepExecution, StepExecutionId, StepRecord, StepState,
};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Repository keeping every record in process memory
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    instances: DashMap<JobInstanceId, JobInstance>,
    executions: DashMap<JobExecutionId, JobExecution>,
    steps: DashMap<StepExecutionId, StepExecution>,
    partitions: DashMap<(StepExecutionId, u32), PartitionExecution>,
    instance_seq: AtomicI64,
    execution_seq: AtomicI64,
    step_seq: AtomicI64,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(seq: &AtomicI64) -> i64 {
        seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn write_record(&self, job_execution: &JobExecution, record: &StepRecord, unless_stopping: bool) -> Result<bool> {
        if record.job_execution_id() != job_execution.id {
            return Err(Error::Validation(format!(
                "step {} belongs to job execution {}, not {}",
                record.step_name(),
                record.job_execution_id(),
                job_execution.id
            )));
        }

        if unless_stopping && record.state().batch_status == BatchStatus::Stopping {
            return Ok(false);
        }

        match record {
            StepRecord::Step(step) => {
                let mut stored = self
                    .steps
                    .get_mut(&step.id)
                    .ok_or_else(|| Error::NotFound(format!("step execution {}", step.id)))?;
                if unless_stopping && stored.state.batch_status == BatchStatus::Stopping {
                    return Ok(false);
                }
                *stored = step.clone();
            }
            StepRecord::Partition(partition) => {
                if !self.steps.contains_key(&partition.step_execution_id) {
                    return Err(Error::NotFound(format!(
                        "step execution {}",
                        partition.step_execution_id
                    )));
                }
                match self
                    .partitions
                    .entry((partition.step_execution_id, partition.partition_id))
                {
                    Entry::Occupied(mut stored) => {
                        if unless_stopping && stored.get().state.batch_status == BatchStatus::Stopping {
                            return Ok(false);
                        }
                        stored.insert(partition.clone());
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(partition.clone());
                    }
                }
            }
        }

        Ok(true)
    }
}

#[async_trait]
impl JobRepository for InMemoryRepository {
    #[instrument(skip(self))]
    async fn create_job_instance(&self, job_name: &str) -> Result<JobInstance> {
        let _timer = time_operation("create_job_instance");
        if job_name.is_empty() {
            return Err(Error::Validation("job name must not be empty".to_string()));
        }

        let instance = JobInstance {
            id: JobInstanceId(Self::next_id(&self.instance_seq)),
            job_name: job_name.to_string(),
            created_at: Utc::now(),
        };
        self.instances.insert(instance.id, instance.clone());
        debug!(instance_id = %instance.id, "Created job instance");
        Ok(instance)
    }

    async fn get_job_instance(&self, id: JobInstanceId) -> Result<JobInstance> {
        let _timer = time_operation("get_job_instance");
        self.instances
            .get(&id)
            .map(|i| i.clone())
            .ok_or_else(|| Error::NotFound(format!("job instance {}", id)))
    }

    async fn job_instances(&self, job_name: &str, start: usize, count: usize) -> Result<Vec<JobInstance>> {
        let _timer = time_operation("job_instances");
        let mut instances: Vec<JobInstance> = self
            .instances
            .iter()
            .filter(|i| i.job_name == job_name)
            .map(|i| i.clone())
            .collect();
        instances.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(instances.into_iter().skip(start).take(count).collect())
    }

    async fn job_instance_count(&self, job_name: &str) -> Result<usize> {
        let _timer = time_operation("job_instance_count");
        let count = self.instances.iter().filter(|i| i.job_name == job_name).count();
        if count == 0 {
            return Err(Error::NotFound(format!("job {}", job_name)));
        }
        Ok(count)
    }

    async fn job_names(&self) -> Result<Vec<String>> {
        let _timer = time_operation("job_names");
        let mut names: Vec<String> = self.instances.iter().map(|i| i.job_name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    #[instrument(skip(self, instance, parameters), fields(instance_id = %instance.id))]
    async fn create_job_execution(
        &self,
        instance: &JobInstance,
        parameters: Properties,
        restarted_from: Option<JobExecutionId>,
    ) -> Result<JobExecution> {
        let _timer = time_operation("create_job_execution");
        if !self.instances.contains_key(&instance.id) {
            return Err(Error::NotFound(format!("job instance {}", instance.id)));
        }

        let now = Utc::now();
        let execution = JobExecution {
            id: JobExecutionId(Self::next_id(&self.execution_seq)),
            instance_id: instance.id,
            job_name: instance.job_name.clone(),
            batch_status: BatchStatus::Starting,
            exit_status: None,
            parameters,
            restart_position: None,
            restarted_from,
            run_id: Uuid::new_v4(),
            created_at: now,
            started_at: None,
            ended_at: None,
            last_updated: now,
        };
        self.executions.insert(execution.id, execution.clone());
        debug!(job_execution_id = %execution.id, "Created job execution");
        Ok(execution)
    }

    async fn get_job_execution(&self, id: JobExecutionId) -> Result<JobExecution> {
        let _timer = time_operation("get_job_execution");
        self.executions
            .get(&id)
            .map(|e| e.clone())
            .ok_or_else(|| Error::NotFound(format!("job execution {}", id)))
    }

    #[instrument(skip(self, execution), fields(job_execution_id = %execution.id, status = %execution.batch_status))]
    async fn update_job_execution(&self, execution: &JobExecution) -> Result<()> {
        let _timer = time_operation("update_job_execution");
        let mut stored = self
            .executions
            .get_mut(&execution.id)
            .ok_or_else(|| Error::NotFound(format!("job execution {}", execution.id)))?;
        let mut updated = execution.clone();
        updated.touch();
        *stored = updated;
        Ok(())
    }

    async fn job_executions(&self, instance_id: JobInstanceId) -> Result<Vec<JobExecution>> {
        let _timer = time_operation("job_executions");
        let mut executions: Vec<JobExecution> = self
            .executions
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .map(|e| e.clone())
            .collect();
        executions.sort_by_key(|e| e.id);
        Ok(executions)
    }

    #[instrument(skip(self))]
    async fn remove_job_execution(&self, id: JobExecutionId) -> Result<()> {
        let _timer = time_operation("remove_job_execution");
        let status = self
            .executions
            .get(&id)
            .map(|e| e.batch_status)
            .ok_or_else(|| Error::NotFound(format!("job execution {}", id)))?;
        if !status.is_terminal() {
            return Err(Error::Validation(format!(
                "job execution {} is {} and cannot be removed",
                id, status
            )));
        }

        let step_ids: Vec<StepExecutionId> = self
            .steps
            .iter()
            .filter(|s| s.job_execution_id == id)
            .map(|s| s.id)
            .collect();
        self.partitions.retain(|(step_id, _), _| !step_ids.contains(step_id));
        self.steps.retain(|_, s| s.job_execution_id != id);
        self.executions.remove(&id);
        Ok(())
    }

    #[instrument(skip(self, job_execution), fields(job_execution_id = %job_execution.id))]
    async fn create_step_execution(&self, job_execution: &JobExecution, step_name: &str) -> Result<StepExecution> {
        let _timer = time_operation("create_step_execution");
        if !self.executions.contains_key(&job_execution.id) {
            return Err(Error::NotFound(format!("job execution {}", job_execution.id)));
        }

        let step = StepExecution {
            id: StepExecutionId(Self::next_id(&self.step_seq)),
            job_execution_id: job_execution.id,
            step_name: step_name.to_string(),
            state: StepState::default(),
        };
        self.steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn get_step_execution(&self, id: StepExecutionId) -> Result<StepExecution> {
        let _timer = time_operation("get_step_execution");
        self.steps
            .get(&id)
            .map(|s| s.clone())
            .ok_or_else(|| Error::NotFound(format!("step execution {}", id)))
    }

    async fn step_executions(&self, job_execution_id: JobExecutionId) -> Result<Vec<StepExecution>> {
        let _timer = time_operation("step_executions");
        let mut steps: Vec<StepExecution> = self
            .steps
            .iter()
            .filter(|s| s.job_execution_id == job_execution_id)
            .map(|s| s.clone())
            .collect();
        steps.sort_by_key(|s| s.id);
        Ok(steps)
    }

    async fn partition_executions(&self, step_execution_id: StepExecutionId) -> Result<Vec<PartitionExecution>> {
        let _timer = time_operation("partition_executions");
        let mut partitions: Vec<PartitionExecution> = self
            .partitions
            .iter()
            .filter(|p| p.step_execution_id == step_execution_id)
            .map(|p| p.clone())
            .collect();
        partitions.sort_by_key(|p| p.partition_id);
        Ok(partitions)
    }

    #[instrument(skip(self, prior), fields(prior_execution_id = %prior.id))]
    async fn find_original_step_execution_for_restart(
        &self,
        step_name: &str,
        prior: &JobExecution,
    ) -> Result<Option<StepExecution>> {
        let _timer = time_operation("find_original_step_execution_for_restart");
        let original = self
            .steps
            .iter()
            .filter(|s| s.step_name == step_name && s.job_execution_id <= prior.id)
            .filter(|s| {
                self.executions
                    .get(&s.job_execution_id)
                    .map(|e| e.instance_id == prior.instance_id)
                    .unwrap_or(false)
            })
            .max_by_key(|s| (s.job_execution_id, s.id))
            .map(|s| s.clone());
        Ok(original)
    }

    async fn count_step_starts(&self, instance_id: JobInstanceId, step_name: &str) -> Result<u32> {
        let _timer = time_operation("count_step_starts");
        let count = self
            .steps
            .iter()
            .filter(|s| s.step_name == step_name)
            .filter(|s| {
                self.executions
                    .get(&s.job_execution_id)
                    .map(|e| e.instance_id == instance_id)
                    .unwrap_or(false)
            })
            .count();
        Ok(count as u32)
    }

    #[instrument(
        skip(self, job_execution, record),
        fields(step = %record.step_name(), partition = ?record.partition_id())
    )]
    async fn save_persistent_data(&self, job_execution: &JobExecution, record: &StepRecord) -> Result<()> {
        let _timer = time_operation("save_persistent_data");
        self.write_record(job_execution, record, false)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_units_stopping(&self, job_execution_id: JobExecutionId) -> Result<usize> {
        let _timer = time_operation("mark_units_stopping");
        let in_flight = |status: BatchStatus| matches!(status, BatchStatus::Starting | BatchStatus::Started);

        let mut step_ids = Vec::new();
        let mut marked = 0;
        for mut step in self.steps.iter_mut().filter(|s| s.job_execution_id == job_execution_id) {
            step_ids.push(step.id);
            if in_flight(step.state.batch_status) {
                step.state.batch_status = BatchStatus::Stopping;
                marked += 1;
            }
        }
        for mut partition in self
            .partitions
            .iter_mut()
            .filter(|p| step_ids.contains(&p.step_execution_id))
        {
            if in_flight(partition.state.batch_status) {
                partition.state.batch_status = BatchStatus::Stopping;
                marked += 1;
            }
        }

        debug!(marked, "Marked in-flight units STOPPING");
        Ok(marked)
    }

    #[instrument(
        skip(self, job_execution, record),
        fields(step = %record.step_name(), partition = ?record.partition_id())
    )]
    async fn save_persistent_data_if_not_stopping(
        &self,
        job_execution: &JobExecution,
        record: &StepRecord,
    ) -> Result<bool> {
        let _timer = time_operation("save_persistent_data_if_not_stopping");
        let written = self.write_record(job_execution, record, true)?;
        if !written {
            CHECKPOINT_SAVES_SKIPPED_TOTAL.inc();
            debug!("Skipped checkpoint save while stopping");
        }
        Ok(written)
    }
}
