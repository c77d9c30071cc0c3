//! Worker error types

use std::time::Duration;

use thiserror::Error;

use crate::jobs::JobId;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine failed to start: {0}")]
    EngineStartup(String),

    #[error("Engine crashed: {0}")]
    EngineCrash(String),

    #[error("Engine protocol error: {0}")]
    Protocol(String),

    #[error("Analysis timed out after {0:?}")]
    AnalysisTimeout(Duration),

    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    #[error("Timed out waiting {0:?} for a free engine")]
    AcquireTimeout(Duration),

    #[error("Engine pool is shut down")]
    PoolClosed,

    #[error("Analysis cancelled")]
    Cancelled,

    #[error("Analysis unavailable: job {job_id} failed after {attempts} attempts ({last_error})")]
    RetryExhausted {
        job_id: JobId,
        attempts: u32,
        last_error: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("SQS error: {0}")]
    Sqs(String),

    #[error("Game not found: {0}")]
    GameNotFound(i64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkerError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkerError::EngineStartup(_)
                | WorkerError::EngineCrash(_)
                | WorkerError::Protocol(_)
                | WorkerError::AnalysisTimeout(_)
                | WorkerError::AcquireTimeout(_)
                | WorkerError::Database(_)
                | WorkerError::Sqs(_)
        )
    }
}

impl From<chess_core::NotationError> for WorkerError {
    fn from(e: chess_core::NotationError) -> Self {
        WorkerError::InvalidPosition(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_split() {
        assert!(WorkerError::EngineCrash("pipe closed".into()).is_retryable());
        assert!(WorkerError::AnalysisTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!WorkerError::InvalidPosition("x".into()).is_retryable());
        assert!(!WorkerError::Cancelled.is_retryable());
        assert!(!WorkerError::PoolClosed.is_retryable());
    }

    #[test]
    fn test_exhausted_display() {
        let err = WorkerError::RetryExhausted {
            job_id: JobId(7),
            attempts: 2,
            last_error: "Engine crashed: eof".into(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Analysis unavailable"));
        assert!(msg.contains("job 7"));
        assert!(msg.contains("2 attempts"));
    }

    #[test]
    fn test_notation_error_maps_to_invalid_position() {
        let err: WorkerError = chess_core::NotationError::IllegalMove {
            ply: 3,
            notation: "Ke9".into(),
        }
        .into();
        assert!(matches!(err, WorkerError::InvalidPosition(_)));
    }
}
