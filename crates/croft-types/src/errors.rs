//! Error types for the Croft system.
//!
//! Two layers: [`FarmError`] for infrastructure-level failures of farm
//! operations, and [`FunctionError`] for the per-slot errors that appear
//! inside a batch's result sequence. A worker crash is an infrastructure
//! fault and is retried internally; it only ever surfaces to the caller as a
//! [`FunctionError::RetriesExhausted`] marker once the retry ceiling is hit.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::BatchId;

/// Main error type for farm operations.
#[derive(Error, Debug)]
pub enum FarmError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown batch id: {0}")]
    UnknownBatch(BatchId),

    #[error("Batch limit reached: {in_flight} batches in flight (max {max})")]
    BatchLimit { in_flight: usize, max: usize },

    #[error("Batch {0} was cancelled")]
    Cancelled(BatchId),

    #[error("Batch {0} made no progress within the stall grace period")]
    Stalled(BatchId),

    #[error("Worker pool exhausted after {respawns} respawns")]
    PoolExhausted { respawns: usize },

    #[error("Farm is shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Croft operations.
pub type FarmResult<T> = Result<T, FarmError>;

/// A domain-level failure occupying one slot of a batch's result sequence.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FunctionError {
    /// The objective function returned an error for this payload. Surfaced
    /// verbatim at the slot's original index; never retried.
    #[error("Objective error: {0}")]
    Objective(String),

    /// Every dispatch attempt of this task ended in a worker crash.
    #[error("Worker crashed on all {attempts} attempts; last crash: {last_crash}")]
    RetriesExhausted { attempts: usize, last_crash: String },

    /// The slot was released by `cancel_batch` before a result was recorded.
    #[error("Evaluation cancelled")]
    Cancelled,
}

impl FunctionError {
    /// Convenience constructor for objective-level errors.
    pub fn objective(message: impl Into<String>) -> Self {
        Self::Objective(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = FarmError::BatchLimit {
            in_flight: 2,
            max: 2,
        };
        assert!(err.to_string().contains("2 batches in flight"));

        let err = FunctionError::RetriesExhausted {
            attempts: 3,
            last_crash: "segfault".into(),
        };
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.to_string().contains("segfault"));
    }

    #[test]
    fn function_error_round_trip() {
        let err = FunctionError::objective("bad input");
        let json = serde_json::to_string(&err).unwrap();
        let back: FunctionError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
