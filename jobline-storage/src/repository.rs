//! Repository gateway
//!
//! Every context level persists through this trait. Implementations must be
//! safe under concurrent saves of distinct partition records of the same
//! step execution.

use crate::Result;
use async_trait::async_trait;
use jobline_core::{
    JobExecution, JobExecutionId, JobInstance, JobInstanceId, PartitionExecution, Properties,
    StepExecution, StepExecutionId, StepRecord,
};

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create_job_instance(&self, job_name: &str) -> Result<JobInstance>;

    async fn get_job_instance(&self, id: JobInstanceId) -> Result<JobInstance>;

    /// Instances of a job, newest first, paged by `start` and `count`
    async fn job_instances(&self, job_name: &str, start: usize, count: usize) -> Result<Vec<JobInstance>>;

    async fn job_instance_count(&self, job_name: &str) -> Result<usize>;

    /// Names of every job with at least one instance, sorted
    async fn job_names(&self) -> Result<Vec<String>>;

    /// New STARTING execution of `instance`
    async fn create_job_execution(
        &self,
        instance: &JobInstance,
        parameters: Properties,
        restarted_from: Option<JobExecutionId>,
    ) -> Result<JobExecution>;

    async fn get_job_execution(&self, id: JobExecutionId) -> Result<JobExecution>;

    async fn update_job_execution(&self, execution: &JobExecution) -> Result<()>;

    /// Executions of an instance, oldest first
    async fn job_executions(&self, instance_id: JobInstanceId) -> Result<Vec<JobExecution>>;

    /// Delete a finished execution and every step and partition record under it
    async fn remove_job_execution(&self, id: JobExecutionId) -> Result<()>;

    /// New STARTING step execution under `job_execution`
    async fn create_step_execution(&self, job_execution: &JobExecution, step_name: &str) -> Result<StepExecution>;

    async fn get_step_execution(&self, id: StepExecutionId) -> Result<StepExecution>;

    /// Step executions created under a job execution, oldest first
    async fn step_executions(&self, job_execution_id: JobExecutionId) -> Result<Vec<StepExecution>>;

    /// Partition records of a step execution, ordered by partition id
    async fn partition_executions(&self, step_execution_id: StepExecutionId) -> Result<Vec<PartitionExecution>>;

    /// The most recent execution of `step_name` within the instance of
    /// `prior`, looking at `prior` and the executions before it
    async fn find_original_step_execution_for_restart(
        &self,
        step_name: &str,
        prior: &JobExecution,
    ) -> Result<Option<StepExecution>>;

    /// How many times a step was started within a job instance
    async fn count_step_starts(&self, instance_id: JobInstanceId, step_name: &str) -> Result<u32>;

    /// Persist the record unconditionally
    async fn save_persistent_data(&self, job_execution: &JobExecution, record: &StepRecord) -> Result<()>;

    /// Move every STARTING or STARTED step and partition record of the
    /// execution to STOPPING, leaving checkpoints and metrics as stored.
    ///
    /// Returns how many records changed.
    async fn mark_units_stopping(&self, job_execution_id: JobExecutionId) -> Result<usize>;

    /// Persist the record unless it or its stored copy is STOPPING.
    ///
    /// Returns whether the record was written.
    async fn save_persistent_data_if_not_stopping(
        &self,
        job_execution: &JobExecution,
        record: &StepRecord,
    ) -> Result<bool>;
}
