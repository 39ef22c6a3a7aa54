//! # Jobline Storage
//!
//! The repository gateway the runtime persists execution records through,
//! and an in-memory engine for local runs and tests.

pub mod memory;
pub mod metrics;
pub mod repository;

// Re-export commonly used types
pub use memory::InMemoryRepository;
pub use repository::JobRepository;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for storage operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
