//! Engine-wide error type.
//!
//! Every layer converges on [`EngineError`]; per-record ingest problems are
//! counted rather than raised (they surface as `hash_indexing_failures`),
//! while command, query, and cluster paths propagate through `Result` with
//! `?`. The variants mirror the classification used by the fanout layer, so
//! replies can carry a stable error class.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors produced by the indexing engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Command or request arguments failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A schema, attribute, or metadata entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Create/add collided with an existing object.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A numeric parameter fell outside its permitted bounds.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// A consistency check (fingerprint/version/slot) failed.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A query ran past its deadline.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The host refused or failed an operation the engine depends on.
    #[error("internal: {0}")]
    Internal(String),

    /// The host reported memory pressure; the operation was paused.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// A remote shard could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        EngineError::AlreadyExists(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        EngineError::OutOfRange(msg.into())
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        EngineError::FailedPrecondition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        EngineError::Internal(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        EngineError::Unavailable(msg.into())
    }

    /// True for classes a fanout orchestrator may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::FailedPrecondition(_) | EngineError::Unavailable(_)
        )
    }
}

impl From<bincode::error::EncodeError> for EngineError {
    fn from(e: bincode::error::EncodeError) -> Self {
        EngineError::Internal(format!("encode failure: {e}"))
    }
}

impl From<bincode::error::DecodeError> for EngineError {
    fn from(e: bincode::error::DecodeError) -> Self {
        EngineError::Internal(format!("decode failure: {e}"))
    }
}
