//! Error kinds for the job queue engine.
//!
//! These map onto the error kinds described in the design document: storage
//! failures, payload (de)serialization failures, resolution/capability
//! failures, invariant violations, and an invalid table-name configuration
//! error raised at construction time.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no handler registered for task `{0}`")]
    Resolution(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid table identifier `{0}`: must match ^[A-Za-z0-9_]+$")]
    InvalidTable(String),
}

pub type QueueResult<T> = Result<T, QueueError>;
