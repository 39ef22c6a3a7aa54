//! # Jobline Core
//!
//! Building blocks of the Jobline batch engine: the job graph model and its
//! validator, the batch status state machine, execution records, the
//! checkpoint data codec, and the collaborator contracts step logic
//! implements.

pub mod artifacts;
pub mod checkpoint;
pub mod execution;
pub mod job;
pub mod metric;
pub mod partition;
pub mod property_key;
pub mod scope;
pub mod status;
pub mod transition;
pub mod validator;

// Re-export commonly used types
pub use artifacts::{
    ArtifactFactory, ArtifactRegistry, ArtifactRole, Batchlet, Decider, Item, ItemProcessor, ItemReader,
    ItemWriter, JobListener, PartitionAnalyzer, PartitionCollector, PartitionMapper, PartitionReducer,
    ReducerOutcome, StepListener,
};
pub use checkpoint::{
    BatchFailure, Checkpoint, CheckpointData, CodecError, JsonProvider, PayloadCodec, Primitive,
    SerializationProvider,
};
pub use execution::{
    JobExecution, JobExecutionId, JobInstance, JobInstanceId, PartitionExecution, StepExecution,
    StepExecutionId, StepRecord, StepState,
};
pub use job::{Decision, Flow, Job, JobElement, Properties, Split, Step, StepKind};
pub use metric::{MetricType, Metrics};
pub use partition::{PartitionConfig, PartitionPlan};
pub use scope::{JobScope, StepScope, StepScopeExt};
pub use status::BatchStatus;
pub use transition::Transition;
pub use validator::{JobValidator, ValidationError};

/// Result type for Jobline core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Jobline core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid batch status: {0}")]
    InvalidStatus(String),

    #[error("No {role} registered under name {name}")]
    ArtifactNotFound { role: String, name: String },

    #[error("A {role} is already registered under name {name}")]
    DuplicateArtifact { role: String, name: String },

    #[error("Internal error: {0}")]
    Internal(String),
}
