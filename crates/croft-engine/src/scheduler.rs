//! The scheduler: a single control thread that owns the worker pool and the
//! in-flight attempt table.
//!
//! Everything that mutates scheduling state funnels through this loop:
//! coordinator commands on one channel, worker events on another. Attempt
//! tokens close the retry/duplicate race — issuing a retry or a cancellation
//! invalidates the prior attempt, so a stale completion arriving later is
//! discarded instead of double-recording.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{select, Receiver};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use croft_types::{AttemptId, BatchId, Executor, FarmConfig, FunctionError, WorkerId};

use crate::aggregator::{FailReason, ResultAggregator};
use crate::pool::{RespawnOutcome, WorkerPool};
use crate::queue::{Attempted, DispatchQueue};
use crate::worker::{Assignment, WorkerEvent};

/// How long the loop sleeps when there is nothing to do. Bounds the latency
/// of stall detection and pool maintenance.
const TICK: Duration = Duration::from_millis(50);

/// Control messages from the coordinator.
#[derive(Debug)]
pub(crate) enum Command {
    /// Tasks for this batch are already in the shared queue; wake and dispatch.
    BatchSubmitted(BatchId),
    Cancel(BatchId),
    Resize(usize),
    Shutdown,
}

/// A task currently assigned to a worker.
struct Active<P> {
    worker_id: WorkerId,
    attempt: AttemptId,
    entry: Attempted<P>,
}

pub(crate) struct Scheduler<E: Executor> {
    config: FarmConfig,
    queue: Arc<Mutex<DispatchQueue<E::Payload>>>,
    aggregator: Arc<ResultAggregator<E::Value>>,
    pool: WorkerPool<E>,
    commands: Receiver<Command>,
    events: Receiver<WorkerEvent<E::Value>>,
    in_flight: HashMap<(BatchId, u32), Active<E::Payload>>,
    next_attempt: AttemptId,
    exhausted: bool,
}

impl<E: Executor> Scheduler<E> {
    pub fn new(
        config: FarmConfig,
        queue: Arc<Mutex<DispatchQueue<E::Payload>>>,
        aggregator: Arc<ResultAggregator<E::Value>>,
        pool: WorkerPool<E>,
        commands: Receiver<Command>,
        events: Receiver<WorkerEvent<E::Value>>,
    ) -> Self {
        Self {
            config,
            queue,
            aggregator,
            pool,
            commands,
            events,
            in_flight: HashMap::new(),
            next_attempt: 0,
            exhausted: false,
        }
    }

    pub fn run(mut self) {
        info!("scheduler started");
        loop {
            self.pump_dispatch();
            select! {
                recv(self.commands) -> cmd => match cmd {
                    Ok(Command::Shutdown) | Err(_) => break,
                    Ok(cmd) => self.handle_command(cmd),
                },
                recv(self.events) -> event => {
                    if let Ok(event) = event {
                        self.handle_event(event);
                    }
                }
                default(TICK) => {}
            }
            self.check_stall();
        }
        self.shutdown();
    }

    // -- dispatch -----------------------------------------------------------

    /// Assign queued tasks to idle workers until one of them runs out.
    fn pump_dispatch(&mut self) {
        if self.exhausted {
            return;
        }
        self.pool.maintain();
        loop {
            let Some(worker_id) = self.pool.acquire_idle() else {
                break;
            };
            let Some(entry) = self.queue.lock().dequeue() else {
                break;
            };
            let batch_id = entry.task.batch_id;
            let index = entry.task.index;
            let attempt = self.next_attempt;
            self.next_attempt += 1;

            let assignment = Assignment {
                task: entry.task.clone(),
                attempt,
            };
            if self.pool.dispatch(worker_id, assignment) {
                self.aggregator.mark_in_flight(batch_id);
                self.in_flight.insert(
                    (batch_id, index),
                    Active {
                        worker_id,
                        attempt,
                        entry,
                    },
                );
                debug!(worker_id, batch_id, index, attempt, "task dispatched");
            } else {
                // The worker thread vanished without a crash event; put the
                // task back first in line and retire the slot.
                warn!(worker_id, batch_id, index, "dispatch to dead worker");
                self.queue.lock().requeue_front(entry);
                let outcome = self.pool.mark_dead(worker_id);
                self.handle_respawn_outcome(outcome);
                if self.exhausted {
                    break;
                }
            }
        }
    }

    // -- worker events ------------------------------------------------------

    fn handle_event(&mut self, event: WorkerEvent<E::Value>) {
        match event {
            WorkerEvent::Completed {
                worker_id,
                batch_id,
                index,
                attempt,
                outcome,
            } => {
                self.pool.release(worker_id);
                match self.in_flight.get(&(batch_id, index)) {
                    Some(active) if active.attempt == attempt => {
                        self.in_flight.remove(&(batch_id, index));
                        // Domain errors are recorded as-is at their index,
                        // never retried.
                        self.aggregator.record(batch_id, index, outcome);
                    }
                    _ => {
                        debug!(worker_id, batch_id, index, attempt, "stale result discarded");
                    }
                }
            }
            WorkerEvent::Crashed {
                worker_id,
                batch_id,
                index,
                attempt,
                message,
            } => {
                warn!(worker_id, batch_id, index, crash = %message, "worker crashed");
                let respawn = self.pool.mark_dead(worker_id);

                let is_live_attempt = self
                    .in_flight
                    .get(&(batch_id, index))
                    .is_some_and(|active| active.attempt == attempt);
                if is_live_attempt {
                    if let Some(active) = self.in_flight.remove(&(batch_id, index)) {
                        self.resolve_crashed_task(active, message);
                    }
                }
                self.handle_respawn_outcome(respawn);
            }
        }
    }

    /// Retry a crashed task, or fill its slot with the exhausted marker once
    /// the retry ceiling is spent.
    fn resolve_crashed_task(&mut self, active: Active<E::Payload>, message: String) {
        let mut entry = active.entry;
        let batch_id = entry.task.batch_id;
        let index = entry.task.index;
        if entry.retries_used < self.config.task_retry_limit {
            entry.retries_used += 1;
            debug!(
                batch_id,
                index,
                retry = entry.retries_used,
                "requeueing crashed task at queue head"
            );
            self.queue.lock().requeue_front(entry);
        } else {
            let marker = FunctionError::RetriesExhausted {
                attempts: entry.retries_used + 1,
                last_crash: message,
            };
            self.aggregator.record(batch_id, index, Err(marker));
        }
    }

    fn handle_respawn_outcome(&mut self, outcome: RespawnOutcome) {
        if outcome == RespawnOutcome::Exhausted && !self.exhausted {
            self.exhausted = true;
            error!("no live workers remain; failing all live batches");
            self.queue.lock().remove_all();
            self.in_flight.clear();
            self.aggregator.fail_all(FailReason::PoolExhausted {
                respawns: self.config.worker_respawn_limit,
            });
        }
    }

    // -- commands -----------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::BatchSubmitted(batch_id) => {
                debug!(batch_id, "batch submitted");
                // pump_dispatch at the top of the loop picks the tasks up.
            }
            Command::Cancel(batch_id) => self.cancel_batch(batch_id),
            Command::Resize(target) => {
                if let Err(e) = self.pool.resize(target) {
                    error!(target, error = %e, "pool resize failed");
                }
            }
            Command::Shutdown => unreachable!("handled in run()"),
        }
    }

    fn cancel_batch(&mut self, batch_id: BatchId) {
        let dropped = self.queue.lock().remove_batch(batch_id);
        // Revoke live attempts: their results will arrive with stale tokens
        // and be discarded. The threads cannot be interrupted mid-objective;
        // each worker returns to idle when its evaluation returns.
        let before = self.in_flight.len();
        self.in_flight.retain(|(b, _), _| *b != batch_id);
        let revoked = before - self.in_flight.len();
        self.aggregator.cancel_batch(batch_id);
        info!(batch_id, dropped, revoked, "batch cancelled");
    }

    // -- housekeeping -------------------------------------------------------

    fn check_stall(&mut self) {
        let Some(grace) = self.config.stall_grace else {
            return;
        };
        for batch_id in self.aggregator.stalled_batches(grace) {
            warn!(batch_id, grace_ms = grace.as_millis() as u64, "batch stalled; failing");
            self.queue.lock().remove_batch(batch_id);
            self.in_flight.retain(|(b, _), _| *b != batch_id);
            self.aggregator.fail_batch(batch_id, FailReason::Stalled);
        }
    }

    fn shutdown(&mut self) {
        info!("scheduler shutting down");
        self.queue.lock().remove_all();
        self.in_flight.clear();
        self.aggregator.fail_all(FailReason::ShutDown);
        self.pool.shutdown();
    }
}
