//! The batch coordinator: the public face of the farm.
//!
//! [`TaskFarm`] accepts batches of opaque payloads from the optimizer's
//! thread, fans them out to the worker pool through the dispatch queue, and
//! reassembles results in submission order. `submit` never blocks beyond the
//! cost of enqueueing; the caller suspends only inside `await_completion`,
//! while dispatch and collection continue on the scheduler thread so the pool
//! stays saturated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use croft_types::{
    BatchId, BatchStatus, EvalOutcome, Executor, FarmConfig, FarmError, FarmResult, Task,
    WorkerState,
};

use crate::aggregator::{drain_slots, FailReason, ResultAggregator};
use crate::pool::{PoolShared, WorkerPool};
use crate::queue::DispatchQueue;
use crate::scheduler::{Command, Scheduler};

/// Error from [`TaskFarm::await_completion`].
#[derive(Error, Debug)]
pub enum AwaitError<V: std::fmt::Debug> {
    /// The timeout elapsed with tasks still outstanding. Carries whatever was
    /// collected so far; the batch stays live, so a later `await_completion`
    /// with a longer timeout can still succeed.
    #[error("Timed out waiting for batch {batch_id}: {} of {total} tasks outstanding", .outstanding.len())]
    Timeout {
        batch_id: BatchId,
        total: usize,
        /// Indexed by submission position; `None` where no result yet.
        partial: Vec<Option<EvalOutcome<V>>>,
        outstanding: Vec<u32>,
    },

    #[error(transparent)]
    Farm(#[from] FarmError),
}

/// Point-in-time view of the farm for logging and monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct FarmStats {
    pub workers: Vec<WorkerState>,
    pub queued_tasks: usize,
    pub live_batches: usize,
    pub degraded: bool,
    pub exhausted: bool,
    pub respawns_used: usize,
}

/// The task farm. Generic over the [`Executor`] so callers plug in whatever
/// evaluation transport they have; the farm itself never inspects payloads or
/// values.
pub struct TaskFarm<E: Executor> {
    config: FarmConfig,
    queue: Arc<Mutex<DispatchQueue<E::Payload>>>,
    aggregator: Arc<ResultAggregator<E::Value>>,
    worker_states: Arc<Mutex<Vec<WorkerState>>>,
    pool_shared: Arc<PoolShared>,
    commands: Sender<Command>,
    next_batch_id: AtomicU64,
    scheduler: Option<JoinHandle<()>>,
}

impl<E: Executor> TaskFarm<E> {
    /// Validate the config, spawn the worker pool and the scheduler thread.
    pub fn new(executor: E, config: FarmConfig) -> FarmResult<Self> {
        config.validate()?;
        let executor = Arc::new(executor);
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let queue = Arc::new(Mutex::new(DispatchQueue::new()));
        let aggregator = Arc::new(ResultAggregator::new());
        let pool_shared = Arc::new(PoolShared::default());

        let pool = WorkerPool::new(
            executor,
            event_tx,
            config.worker_count,
            config.worker_respawn_limit,
            pool_shared.clone(),
        )?;
        let worker_states = pool.states_handle();

        let scheduler = Scheduler::new(
            config.clone(),
            queue.clone(),
            aggregator.clone(),
            pool,
            command_rx,
            event_rx,
        );
        let handle = thread::Builder::new()
            .name("croft-scheduler".into())
            .spawn(move || scheduler.run())?;

        info!(
            workers = config.worker_count,
            pipelining = config.max_in_flight_batches,
            "task farm started"
        );
        Ok(Self {
            config,
            queue,
            aggregator,
            worker_states,
            pool_shared,
            commands: command_tx,
            next_batch_id: AtomicU64::new(0),
            scheduler: Some(handle),
        })
    }

    pub fn config(&self) -> &FarmConfig {
        &self.config
    }

    /// Submit a batch of payloads for evaluation. Non-blocking: the batch is
    /// registered and enqueued atomically, and the new batch id is returned
    /// immediately. Fails with [`FarmError::BatchLimit`] when
    /// `max_in_flight_batches` are already live.
    pub fn submit(&self, payloads: Vec<E::Payload>) -> FarmResult<BatchId> {
        if self.pool_shared.is_exhausted() {
            return Err(FarmError::PoolExhausted {
                respawns: self.pool_shared.respawns_used(),
            });
        }
        let batch_id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
        let count = payloads.len();
        self.aggregator
            .register(batch_id, count, self.config.max_in_flight_batches)?;

        if count > 0 {
            let tasks: Vec<Task<E::Payload>> = payloads
                .into_iter()
                .enumerate()
                .map(|(i, payload)| Task::new(batch_id, i as u32, payload))
                .collect();
            self.queue.lock().enqueue_batch(tasks);
            self.commands
                .send(Command::BatchSubmitted(batch_id))
                .map_err(|_| FarmError::ShutDown)?;
        }
        debug!(batch_id, tasks = count, "batch submitted");
        Ok(batch_id)
    }

    /// Block until the batch reaches a terminal state or the timeout elapses.
    /// `None` uses `default_batch_timeout` from the config.
    ///
    /// Results come back in submission order regardless of completion order.
    /// A batch whose every slot filled with errors still returns `Ok` — the
    /// caller always gets one value-or-error per submitted payload.
    pub fn await_completion(
        &self,
        batch_id: BatchId,
        timeout: Option<Duration>,
    ) -> Result<Vec<EvalOutcome<E::Value>>, AwaitError<E::Value>> {
        let cell = self
            .aggregator
            .cell(batch_id)
            .ok_or(FarmError::UnknownBatch(batch_id))?;
        let timeout = timeout.unwrap_or(self.config.default_batch_timeout);
        // An unrepresentable deadline means "wait indefinitely".
        let deadline = Instant::now().checked_add(timeout);

        let mut state = cell.state.lock();
        loop {
            match state.status {
                BatchStatus::Complete => {
                    let results = drain_slots(&mut state);
                    drop(state);
                    self.aggregator.remove(batch_id);
                    return Ok(results);
                }
                BatchStatus::Failed => {
                    let reason = state.fail_reason;
                    match reason {
                        Some(FailReason::AllErrors) => {
                            let results = drain_slots(&mut state);
                            drop(state);
                            self.aggregator.remove(batch_id);
                            return Ok(results);
                        }
                        Some(FailReason::Stalled) => {
                            drop(state);
                            self.aggregator.remove(batch_id);
                            return Err(FarmError::Stalled(batch_id).into());
                        }
                        Some(FailReason::PoolExhausted { respawns }) => {
                            drop(state);
                            self.aggregator.remove(batch_id);
                            return Err(FarmError::PoolExhausted { respawns }.into());
                        }
                        Some(FailReason::ShutDown) | None => {
                            drop(state);
                            self.aggregator.remove(batch_id);
                            return Err(FarmError::ShutDown.into());
                        }
                    }
                }
                BatchStatus::Cancelled => {
                    drop(state);
                    self.aggregator.remove(batch_id);
                    return Err(FarmError::Cancelled(batch_id).into());
                }
                BatchStatus::Pending | BatchStatus::InFlight => {}
            }

            match deadline {
                Some(deadline) => {
                    if cell.completion.wait_until(&mut state, deadline).timed_out() {
                        // Re-check: completion may have raced the deadline.
                        if state.status.is_terminal() {
                            continue;
                        }
                        let outstanding: Vec<u32> = state
                            .slots
                            .iter()
                            .enumerate()
                            .filter(|(_, slot)| slot.is_none())
                            .map(|(i, _)| i as u32)
                            .collect();
                        return Err(AwaitError::Timeout {
                            batch_id,
                            total: state.slots.len(),
                            partial: state.slots.clone(),
                            outstanding,
                        });
                    }
                }
                None => cell.completion.wait(&mut state),
            }
        }
    }

    /// Submit and wait with the default timeout.
    pub fn run_batch(
        &self,
        payloads: Vec<E::Payload>,
    ) -> Result<Vec<EvalOutcome<E::Value>>, AwaitError<E::Value>> {
        let batch_id = self.submit(payloads)?;
        self.await_completion(batch_id, None)
    }

    /// Forcibly release a batch: queued tasks are dropped, assigned attempts
    /// are revoked (their eventual results are discarded), and every waiter
    /// gets [`FarmError::Cancelled`]. Running objectives cannot be
    /// interrupted; those workers rejoin the idle rotation when they return.
    pub fn cancel_batch(&self, batch_id: BatchId) -> FarmResult<()> {
        if self.aggregator.cell(batch_id).is_none() {
            return Err(FarmError::UnknownBatch(batch_id));
        }
        self.commands
            .send(Command::Cancel(batch_id))
            .map_err(|_| FarmError::ShutDown)
    }

    /// Change the worker pool's target size.
    pub fn resize(&self, target: usize) -> FarmResult<()> {
        if target == 0 {
            return Err(FarmError::Config("cannot resize pool to 0 workers".into()));
        }
        self.commands
            .send(Command::Resize(target))
            .map_err(|_| FarmError::ShutDown)
    }

    pub fn stats(&self) -> FarmStats {
        FarmStats {
            workers: self.worker_states.lock().clone(),
            queued_tasks: self.queue.lock().len(),
            live_batches: self.aggregator.live_count(),
            degraded: self.pool_shared.is_degraded(),
            exhausted: self.pool_shared.is_exhausted(),
            respawns_used: self.pool_shared.respawns_used(),
        }
    }

    /// Stop dispatching, fail live batches, and join every worker. Also runs
    /// on drop.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(handle) = self.scheduler.take() {
            let _ = self.commands.send(Command::Shutdown);
            let _ = handle.join();
            info!("task farm shut down");
        }
    }
}

impl<E: Executor> Drop for TaskFarm<E> {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
