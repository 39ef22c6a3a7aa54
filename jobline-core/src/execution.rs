//! Execution records
//!
//! Records are plain data: the repository stores them, contexts wrap them at
//! runtime. A job instance owns many job executions; a job execution owns
//! step executions; a partitioned step execution owns partition executions
//! keyed by partition id.

use crate::checkpoint::CheckpointData;
use crate::job::Properties;
use crate::metric::Metrics;
use crate::status::BatchStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! record_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(JobInstanceId);
record_id!(JobExecutionId);
record_id!(StepExecutionId);

/// Identity of a logical job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: JobInstanceId,
    pub job_name: String,
    pub created_at: DateTime<Utc>,
}

/// One run attempt of a job instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: JobExecutionId,
    pub instance_id: JobInstanceId,
    pub job_name: String,
    pub batch_status: BatchStatus,
    pub exit_status: Option<String>,
    pub parameters: Properties,

    /// Element to resume from, recorded by a `stop` transition
    pub restart_position: Option<String>,

    /// Execution this one restarted
    pub restarted_from: Option<JobExecutionId>,

    /// Correlation id used in logs
    pub run_id: Uuid,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl JobExecution {
    /// Exit status as reported to callers: the explicit value, else the batch status
    pub fn effective_exit_status(&self) -> String {
        self.exit_status
            .clone()
            .unwrap_or_else(|| self.batch_status.as_str().to_string())
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

/// Status and checkpoint fields shared by step and partition executions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub batch_status: BatchStatus,
    pub exit_status: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metrics: Metrics,
    pub persistent_user_data: Option<CheckpointData>,
    pub reader_checkpoint: Option<CheckpointData>,
    pub writer_checkpoint: Option<CheckpointData>,

    /// Encoded [`BatchFailure`](crate::checkpoint::BatchFailure) of a failed run
    pub exception: Option<CheckpointData>,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            batch_status: BatchStatus::Starting,
            exit_status: None,
            started_at: None,
            ended_at: None,
            metrics: Metrics::default(),
            persistent_user_data: None,
            reader_checkpoint: None,
            writer_checkpoint: None,
            exception: None,
        }
    }
}

impl StepState {
    pub fn effective_exit_status(&self) -> String {
        self.exit_status
            .clone()
            .unwrap_or_else(|| self.batch_status.as_str().to_string())
    }

    /// Copy the checkpoint fields a restarted run resumes from
    pub fn carry_forward_from(&mut self, original: &StepState) {
        self.persistent_user_data = original.persistent_user_data.clone();
        self.reader_checkpoint = original.reader_checkpoint.clone();
        self.writer_checkpoint = original.writer_checkpoint.clone();
    }
}

/// One execution of a step within a job execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: StepExecutionId,
    pub job_execution_id: JobExecutionId,
    pub step_name: String,
    pub state: StepState,
}

/// One partition of a partitioned step execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionExecution {
    /// Id of the owning step execution
    pub step_execution_id: StepExecutionId,
    pub job_execution_id: JobExecutionId,
    pub step_name: String,
    pub partition_id: u32,
    pub state: StepState,
}

impl PartitionExecution {
    pub fn new(parent: &StepExecution, partition_id: u32) -> Self {
        Self {
            step_execution_id: parent.id,
            job_execution_id: parent.job_execution_id,
            step_name: parent.step_name.clone(),
            partition_id,
            state: StepState::default(),
        }
    }
}

/// Either kind of step-level record, as handed to the repository on save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepRecord {
    Step(StepExecution),
    Partition(PartitionExecution),
}

impl StepRecord {
    pub fn state(&self) -> &StepState {
        match self {
            StepRecord::Step(s) => &s.state,
            StepRecord::Partition(p) => &p.state,
        }
    }

    pub fn state_mut(&mut self) -> &mut StepState {
        match self {
            StepRecord::Step(s) => &mut s.state,
            StepRecord::Partition(p) => &mut p.state,
        }
    }

    pub fn step_name(&self) -> &str {
        match self {
            StepRecord::Step(s) => &s.step_name,
            StepRecord::Partition(p) => &p.step_name,
        }
    }

    pub fn step_execution_id(&self) -> StepExecutionId {
        match self {
            StepRecord::Step(s) => s.id,
            StepRecord::Partition(p) => p.step_execution_id,
        }
    }

    pub fn job_execution_id(&self) -> JobExecutionId {
        match self {
            StepRecord::Step(s) => s.job_execution_id,
            StepRecord::Partition(p) => p.job_execution_id,
        }
    }

    pub fn partition_id(&self) -> Option<u32> {
        match self {
            StepRecord::Step(_) => None,
            StepRecord::Partition(p) => Some(p.partition_id),
        }
    }
}

impl From<StepExecution> for StepRecord {
    fn from(step: StepExecution) -> Self {
        StepRecord::Step(step)
    }
}

impl From<PartitionExecution> for StepRecord {
    fn from(partition: PartitionExecution) -> Self {
        StepRecord::Partition(partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::PayloadCodec;

    fn step_execution() -> StepExecution {
        StepExecution {
            id: StepExecutionId(7),
            job_execution_id: JobExecutionId(3),
            step_name: "load".to_string(),
            state: StepState::default(),
        }
    }

    #[test]
    fn test_new_state_is_starting() {
        let state = StepState::default();
        assert_eq!(state.batch_status, BatchStatus::Starting);
        assert_eq!(state.effective_exit_status(), "STARTING");
    }

    #[test]
    fn test_partition_shares_parent_identity() {
        let parent = step_execution();
        let partition = PartitionExecution::new(&parent, 2);

        let record = StepRecord::from(partition);
        assert_eq!(record.step_execution_id(), parent.id);
        assert_eq!(record.job_execution_id(), parent.job_execution_id);
        assert_eq!(record.partition_id(), Some(2));
        assert_eq!(record.step_name(), "load");
    }

    #[test]
    fn test_carry_forward_copies_checkpoints_only() {
        let codec = PayloadCodec::default();
        let mut original = StepState::default();
        original.batch_status = BatchStatus::Failed;
        original.reader_checkpoint = Some(codec.encode(40i64).unwrap());
        original.writer_checkpoint = Some(codec.encode(38i64).unwrap());
        original.persistent_user_data = Some(codec.encode("cursor".to_string()).unwrap());

        let mut fresh = StepState::default();
        fresh.carry_forward_from(&original);

        assert_eq!(fresh.batch_status, BatchStatus::Starting);
        assert_eq!(fresh.reader_checkpoint, original.reader_checkpoint);
        assert_eq!(fresh.writer_checkpoint, original.writer_checkpoint);
        assert_eq!(fresh.persistent_user_data, original.persistent_user_data);
    }
}
