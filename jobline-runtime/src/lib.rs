//! # Jobline Runtime
//!
//! Execution runtime for Jobline jobs: the job → step → partition context
//! hierarchy, the step, partition and job runners, and the [`JobOperator`]
//! that starts, restarts, stops and abandons executions.

pub mod batchlet;
pub mod chunk;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod job_runner;
pub mod metrics;
pub mod operator;
pub mod partition_runner;
pub mod step_runner;
pub mod tracing_config;

// Re-export commonly used types
pub use config::{JobOptions, RestartMode, RuntimeConfig};
pub use context::{JobContext, PartitionContext, StepContext};
pub use job_runner::JobRunner;
pub use operator::JobOperator;
pub use step_runner::StepOutcome;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for runtime operations
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Restart error: {0}")]
    Restart(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Loop detected: element {0} was already visited")]
    LoopDetected(String),

    #[error("Codec error: {0}")]
    Codec(#[from] jobline_core::CodecError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{role} {name} failed during {phase}: {message}")]
    Collaborator {
        role: String,
        name: String,
        phase: String,
        message: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Failure reported by a collaborator, tagged with its role, name and the
    /// phase that failed
    pub fn collaborator(
        role: jobline_core::ArtifactRole,
        name: &str,
        phase: &str,
        err: anyhow::Error,
    ) -> Self {
        Error::Collaborator {
            role: role.to_string(),
            name: name.to_string(),
            phase: phase.to_string(),
            message: format!("{:#}", err),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

impl From<jobline_storage::Error> for Error {
    fn from(e: jobline_storage::Error) -> Self {
        use jobline_storage::Error as StorageError;

        match e {
            StorageError::NotFound(msg) => Error::NotFound(msg),
            StorageError::Validation(msg) => Error::InvalidState(msg),
            StorageError::AlreadyExists(msg) | StorageError::Internal(msg) => Error::Storage(msg),
        }
    }
}

impl From<jobline_core::Error> for Error {
    fn from(e: jobline_core::Error) -> Self {
        use jobline_core::Error as CoreError;

        match e {
            CoreError::Codec(codec) => Error::Codec(codec),
            CoreError::ArtifactNotFound { role, name } => {
                Error::NotFound(format!("no {} registered under name {}", role, name))
            }
            CoreError::Validation(err) => Error::Execution(err.to_string()),
            other => Error::Internal(other.to_string()),
        }
    }
}
