//! Task and batch primitives that flow between the coordinator, the dispatch
//! queue, and the workers.

use serde::{Deserialize, Serialize};

use crate::errors::FunctionError;

/// Monotonically increasing batch identifier. Never reused for the life of a
/// farm.
pub type BatchId = u64;

/// Identifies a worker slot in the pool. A respawned worker keeps its slot id.
pub type WorkerId = usize;

/// Token identifying one dispatch attempt of one task. Results arriving with
/// a token that is no longer live (the task was retried or cancelled in the
/// meantime) are discarded.
pub type AttemptId = u64;

/// An immutable unit of work: one payload at one position of one batch.
///
/// The payload is opaque to the engine; only the [`Executor`] interprets it.
///
/// [`Executor`]: crate::executor::Executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task<P> {
    pub batch_id: BatchId,
    /// Position within the batch, 0-based and unique per batch.
    pub index: u32,
    pub payload: P,
}

impl<P> Task<P> {
    pub fn new(batch_id: BatchId, index: u32, payload: P) -> Self {
        Self {
            batch_id,
            index,
            payload,
        }
    }
}

/// What the caller gets back for one slot of a batch: the objective value, or
/// the domain error that filled the slot instead. Every submitted payload
/// produces exactly one outcome — never a silent gap.
pub type EvalOutcome<V> = Result<V, FunctionError>;

/// Lifecycle state of a batch.
///
/// `Pending` until the first of its tasks is dispatched, `InFlight` while any
/// task is queued or running, then exactly one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Pending,
    InFlight,
    Complete,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_construction() {
        let task = Task::new(7, 3, vec![1.0, 2.0]);
        assert_eq!(task.batch_id, 7);
        assert_eq!(task.index, 3);
        assert_eq!(task.payload, vec![1.0, 2.0]);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!BatchStatus::Pending.is_terminal());
        assert!(!BatchStatus::InFlight.is_terminal());
        assert!(BatchStatus::Complete.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(BatchStatus::Cancelled.is_terminal());
    }

    #[test]
    fn task_serialization_round_trip() {
        let task = Task::new(1, 0, vec![0.5_f64]);
        let json = serde_json::to_string(&task).unwrap();
        let back: Task<Vec<f64>> = serde_json::from_str(&json).unwrap();
        assert_eq!(task, back);
    }
}
