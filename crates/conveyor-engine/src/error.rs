//! Job engine error types

use thiserror::Error;

use crate::jobs::JobStatus;

/// Result type alias for job engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Message recorded when a job returns something that cannot be stored.
pub const INVALID_RESULT_MESSAGE: &str = "invalid result type";

/// Errors raised by the job engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No job registered as '{0}'")]
    UnknownJob(String),

    #[error("Job run {0} not found")]
    NotFound(i64),

    #[error("Job run {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: JobStatus,
        to: JobStatus,
    },

    /// The job body declared failure through its context.
    #[error("Job execution failed: {0}")]
    JobFailed(String),

    #[error("invalid result type")]
    InvalidResult,

    #[error("Timed out waiting for job run {run_id} to finish")]
    WaitTimeout { run_id: i64 },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn queue(message: impl std::fmt::Display) -> Self {
        Self::Queue(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_result_message_is_fixed() {
        assert_eq!(EngineError::InvalidResult.to_string(), INVALID_RESULT_MESSAGE);
    }

    #[test]
    fn test_job_failed_wraps_message() {
        let err = EngineError::JobFailed("no rows".to_string());
        assert_eq!(err.to_string(), "Job execution failed: no rows");
    }
}
