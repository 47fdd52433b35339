//! Error taxonomy for the alert pipeline.

use thiserror::Error;

/// Pipeline error type.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing notification, connection, or price history.
    #[error("not found: {0}")]
    NotFound(String),

    /// Scope/ownership violation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Expected contention: a cooldown dedup hit or an overlapping
    /// detection cycle. Callers treat this as benign.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Upstream fetch or cycle deadline expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Backing store unreachable; retriable.
    #[error("transient io: {0}")]
    TransientIo(String),

    /// Payload serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether a retry at the caller level can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientIo(_) | PipelineError::Timeout(_))
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => PipelineError::NotFound("row not found".to_string()),
            e @ (sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed) => {
                PipelineError::TransientIo(e.to_string())
            }
            e => PipelineError::Internal(e.to_string()),
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
