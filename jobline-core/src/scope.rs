//! Views of the running job and step handed to collaborators
//!
//! The runtime's contexts implement these traits. Setters take `&self`:
//! contexts are shared between the runner and the collaborator it calls.

use crate::checkpoint::{BatchFailure, Checkpoint, CheckpointData, CodecError, PayloadCodec};
use crate::execution::{JobExecutionId, JobInstanceId};
use crate::job::Properties;
use crate::metric::Metrics;
use crate::status::BatchStatus;

/// The running job execution
pub trait JobScope: Send + Sync {
    fn job_name(&self) -> &str;

    fn instance_id(&self) -> JobInstanceId;

    fn execution_id(&self) -> JobExecutionId;

    fn batch_status(&self) -> BatchStatus;

    /// Refused (and logged) when the state machine does not allow it
    fn set_batch_status(&self, status: BatchStatus);

    fn exit_status(&self) -> Option<String>;

    fn set_exit_status(&self, status: &str);

    /// Job-level properties from the job definition
    fn properties(&self) -> &Properties;

    /// Parameters the execution was started with
    fn parameters(&self) -> &Properties;

    fn stop_requested(&self) -> bool;
}

/// The running step or partition execution
pub trait StepScope: Send + Sync {
    fn job(&self) -> &dyn JobScope;

    fn step_name(&self) -> &str;

    /// Set when this scope is one partition of a partitioned step
    fn partition_id(&self) -> Option<u32>;

    fn batch_status(&self) -> BatchStatus;

    fn set_batch_status(&self, status: BatchStatus);

    fn exit_status(&self) -> Option<String>;

    fn set_exit_status(&self, status: &str);

    /// Step properties, with partition properties merged in for partitions
    fn properties(&self) -> &Properties;

    fn persistent_user_data(&self) -> Option<CheckpointData>;

    fn set_persistent_user_data(&self, data: Option<CheckpointData>);

    fn metrics(&self) -> Metrics;

    fn exception(&self) -> Option<BatchFailure>;

    fn codec(&self) -> &PayloadCodec;
}

/// Typed access to persistent user data
pub trait StepScopeExt: StepScope {
    fn user_data<T: Checkpoint>(&self) -> Result<Option<T>, CodecError> {
        self.persistent_user_data()
            .map(|data| self.codec().decode(&data))
            .transpose()
    }

    fn put_user_data<T: Checkpoint>(&self, value: T) -> Result<(), CodecError> {
        let data = self.codec().encode(value)?;
        self.set_persistent_user_data(Some(data));
        Ok(())
    }
}

impl<S: StepScope + ?Sized> StepScopeExt for S {}
