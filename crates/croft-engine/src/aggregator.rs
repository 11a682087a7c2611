//! Write-once result collection and batch completion signaling.
//!
//! The aggregator is the single point of truth for "is this batch done": the
//! scheduler records into it, the coordinator waits on it, and nothing else
//! touches it. Each batch gets a slot vector keyed by task index plus a
//! running counter, so completion detection is O(1) per record rather than a
//! scan.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use croft_types::{BatchId, BatchStatus, EvalOutcome, FarmError, FarmResult, FunctionError};

/// Why a batch ended in [`BatchStatus::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailReason {
    /// Every slot filled in, but all of them with errors.
    AllErrors,
    /// Zero results recorded within the configured stall grace period.
    Stalled,
    /// The pool ran out of live workers.
    PoolExhausted { respawns: usize },
    /// The farm was shut down with the batch still live.
    ShutDown,
}

pub(crate) struct BatchState<V> {
    pub status: BatchStatus,
    pub slots: Vec<Option<EvalOutcome<V>>>,
    pub recorded: usize,
    pub fail_reason: Option<FailReason>,
    pub submitted_at: DateTime<Utc>,
    pub first_dispatch_at: Option<Instant>,
}

/// Per-batch lock + condvar. Waiters block on `completion`; every terminal
/// transition notifies all of them.
pub(crate) struct BatchCell<V> {
    pub state: Mutex<BatchState<V>>,
    pub completion: Condvar,
}

pub(crate) struct ResultAggregator<V> {
    batches: DashMap<BatchId, Arc<BatchCell<V>>>,
    /// Count of non-terminal batches; enforces the pipelining limit K.
    live: AtomicUsize,
}

impl<V: Clone> ResultAggregator<V> {
    pub fn new() -> Self {
        Self {
            batches: DashMap::new(),
            live: AtomicUsize::new(0),
        }
    }

    /// Register a new batch, atomically claiming one of the `max_live` slots.
    /// An empty batch is born complete and does not count against the limit.
    pub fn register(&self, batch_id: BatchId, task_count: usize, max_live: usize) -> FarmResult<()> {
        if task_count > 0 {
            self.live
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                    (live < max_live).then_some(live + 1)
                })
                .map_err(|live| FarmError::BatchLimit {
                    in_flight: live,
                    max: max_live,
                })?;
        }
        let status = if task_count == 0 {
            BatchStatus::Complete
        } else {
            BatchStatus::Pending
        };
        let cell = Arc::new(BatchCell {
            state: Mutex::new(BatchState {
                status,
                slots: vec![None; task_count],
                recorded: 0,
                fail_reason: None,
                submitted_at: Utc::now(),
                first_dispatch_at: None,
            }),
            completion: Condvar::new(),
        });
        self.batches.insert(batch_id, cell);
        Ok(())
    }

    pub fn cell(&self, batch_id: BatchId) -> Option<Arc<BatchCell<V>>> {
        self.batches.get(&batch_id).map(|r| r.value().clone())
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Note the first dispatch of a batch's task: Pending becomes InFlight.
    pub fn mark_in_flight(&self, batch_id: BatchId) {
        if let Some(cell) = self.cell(batch_id) {
            let mut state = cell.state.lock();
            if state.status == BatchStatus::Pending {
                state.status = BatchStatus::InFlight;
                state.first_dispatch_at = Some(Instant::now());
            }
        }
    }

    /// Record one outcome. Write-once per (batch, index): a late duplicate is
    /// discarded, never overwrites. Returns whether the record was accepted.
    pub fn record(&self, batch_id: BatchId, index: u32, outcome: EvalOutcome<V>) -> bool {
        let Some(cell) = self.cell(batch_id) else {
            debug!(batch_id, index, "result for unknown batch discarded");
            return false;
        };
        let mut state = cell.state.lock();
        if state.status.is_terminal() {
            debug!(batch_id, index, "result for terminal batch discarded");
            return false;
        }
        let slot = &mut state.slots[index as usize];
        if slot.is_some() {
            warn!(batch_id, index, "duplicate result discarded");
            return false;
        }
        *slot = Some(outcome);
        state.recorded += 1;

        if state.recorded == state.slots.len() {
            let all_errors = state.slots.iter().all(|s| matches!(s, Some(Err(_))));
            if all_errors {
                state.status = BatchStatus::Failed;
                state.fail_reason = Some(FailReason::AllErrors);
            } else {
                state.status = BatchStatus::Complete;
            }
            self.live.fetch_sub(1, Ordering::AcqRel);
            debug!(batch_id, status = ?state.status, "batch reached terminal state");
            cell.completion.notify_all();
        }
        true
    }

    pub fn is_batch_complete(&self, batch_id: BatchId) -> bool {
        self.cell(batch_id)
            .map(|cell| cell.state.lock().status == BatchStatus::Complete)
            .unwrap_or(false)
    }

    /// Force a batch into `Failed` with the given reason. No-op on terminal
    /// batches.
    pub fn fail_batch(&self, batch_id: BatchId, reason: FailReason) {
        if let Some(cell) = self.cell(batch_id) {
            let mut state = cell.state.lock();
            if !state.status.is_terminal() {
                state.status = BatchStatus::Failed;
                state.fail_reason = Some(reason);
                self.live.fetch_sub(1, Ordering::AcqRel);
                cell.completion.notify_all();
            }
        }
    }

    /// Release a batch's remaining slots as cancelled.
    pub fn cancel_batch(&self, batch_id: BatchId) {
        if let Some(cell) = self.cell(batch_id) {
            let mut state = cell.state.lock();
            if !state.status.is_terminal() {
                for slot in state.slots.iter_mut().filter(|s| s.is_none()) {
                    *slot = Some(Err(FunctionError::Cancelled));
                }
                state.status = BatchStatus::Cancelled;
                self.live.fetch_sub(1, Ordering::AcqRel);
                cell.completion.notify_all();
            }
        }
    }

    /// Fail every non-terminal batch (pool exhaustion, shutdown).
    pub fn fail_all(&self, reason: FailReason) {
        let ids: Vec<BatchId> = self.batches.iter().map(|e| *e.key()).collect();
        for batch_id in ids {
            self.fail_batch(batch_id, reason);
        }
    }

    /// Batches that have dispatched at least one task but recorded nothing
    /// for longer than `grace`.
    pub fn stalled_batches(&self, grace: Duration) -> Vec<BatchId> {
        self.batches
            .iter()
            .filter(|entry| {
                let state = entry.value().state.lock();
                state.status == BatchStatus::InFlight
                    && state.recorded == 0
                    && state
                        .first_dispatch_at
                        .is_some_and(|t| t.elapsed() >= grace)
            })
            .map(|entry| *entry.key())
            .collect()
    }

    /// Drop a batch's bookkeeping entirely (after its results are delivered).
    pub fn remove(&self, batch_id: BatchId) {
        self.batches.remove(&batch_id);
    }
}

/// Pull the recorded outcomes out of a finished batch, ordered by index.
/// Panics if any slot is unfilled; callers only drain terminal
/// Complete/AllErrors batches, where every slot is guaranteed recorded.
pub(crate) fn drain_slots<V>(state: &mut BatchState<V>) -> Vec<EvalOutcome<V>> {
    state
        .slots
        .iter_mut()
        .map(|slot| slot.take().expect("drained batch had an unfilled slot"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use croft_types::FunctionError;

    #[test]
    fn completion_requires_every_index() {
        let agg: ResultAggregator<u32> = ResultAggregator::new();
        agg.register(1, 3, 1).unwrap();
        assert!(!agg.is_batch_complete(1));

        assert!(agg.record(1, 0, Ok(10)));
        assert!(agg.record(1, 2, Ok(30)));
        assert!(!agg.is_batch_complete(1));

        assert!(agg.record(1, 1, Ok(20)));
        assert!(agg.is_batch_complete(1));
        assert_eq!(agg.live_count(), 0);
    }

    #[test]
    fn drained_results_come_back_in_submission_order() {
        let agg: ResultAggregator<u32> = ResultAggregator::new();
        agg.register(4, 3, 1).unwrap();
        // Record out of order, as workers finish.
        agg.record(4, 2, Ok(2));
        agg.record(4, 0, Ok(0));
        agg.record(4, 1, Ok(1));

        let cell = agg.cell(4).unwrap();
        let mut state = cell.state.lock();
        let results = drain_slots(&mut state);
        assert_eq!(results, vec![Ok(0), Ok(1), Ok(2)]);
    }

    #[test]
    fn duplicate_record_is_discarded_not_overwritten() {
        let agg: ResultAggregator<u32> = ResultAggregator::new();
        agg.register(2, 2, 1).unwrap();
        assert!(agg.record(2, 0, Ok(1)));
        assert!(!agg.record(2, 0, Ok(999)));

        agg.record(2, 1, Ok(2));
        let cell = agg.cell(2).unwrap();
        let mut state = cell.state.lock();
        assert_eq!(drain_slots(&mut state), vec![Ok(1), Ok(2)]);
    }

    #[test]
    fn all_error_batch_fails_instead_of_completing() {
        let agg: ResultAggregator<u32> = ResultAggregator::new();
        agg.register(3, 2, 1).unwrap();
        agg.record(3, 0, Err(FunctionError::objective("a")));
        agg.record(3, 1, Err(FunctionError::objective("b")));

        let cell = agg.cell(3).unwrap();
        let state = cell.state.lock();
        assert_eq!(state.status, BatchStatus::Failed);
        assert_eq!(state.fail_reason, Some(FailReason::AllErrors));
    }

    #[test]
    fn batch_limit_enforced_at_registration() {
        let agg: ResultAggregator<u32> = ResultAggregator::new();
        agg.register(0, 1, 1).unwrap();
        let err = agg.register(1, 1, 1).unwrap_err();
        assert!(matches!(
            err,
            FarmError::BatchLimit {
                in_flight: 1,
                max: 1
            }
        ));

        // Terminal batches free their slot.
        agg.record(0, 0, Ok(1));
        assert!(agg.register(1, 1, 1).is_ok());
    }

    #[test]
    fn empty_batch_is_born_complete() {
        let agg: ResultAggregator<u32> = ResultAggregator::new();
        agg.register(7, 0, 1).unwrap();
        assert!(agg.is_batch_complete(7));
        assert_eq!(agg.live_count(), 0);
    }

    #[test]
    fn records_after_cancellation_are_discarded() {
        let agg: ResultAggregator<u32> = ResultAggregator::new();
        agg.register(5, 2, 1).unwrap();
        agg.cancel_batch(5);
        assert!(!agg.record(5, 0, Ok(1)));

        let cell = agg.cell(5).unwrap();
        let state = cell.state.lock();
        assert_eq!(state.status, BatchStatus::Cancelled);
        // Unrecorded slots were released with the cancelled marker.
        assert_eq!(state.slots[0], Some(Err(FunctionError::Cancelled)));
        assert_eq!(state.slots[1], Some(Err(FunctionError::Cancelled)));
    }

    #[test]
    fn stalled_batch_detection() {
        let agg: ResultAggregator<u32> = ResultAggregator::new();
        agg.register(1, 2, 2).unwrap();
        agg.register(2, 2, 2).unwrap();
        agg.mark_in_flight(1);

        std::thread::sleep(Duration::from_millis(20));
        // Batch 2 never dispatched; only batch 1 counts as stalled.
        assert_eq!(agg.stalled_batches(Duration::from_millis(10)), vec![1]);

        // Progress clears the stall.
        agg.record(1, 0, Ok(1));
        assert!(agg.stalled_batches(Duration::from_millis(10)).is_empty());
    }
}
