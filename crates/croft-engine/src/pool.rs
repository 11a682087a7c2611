//! The worker pool: a fixed-size (resizable) set of worker handles and the
//! authoritative [`WorkerState`] for each slot.
//!
//! The pool lives on the scheduler thread and is the only code that mutates
//! worker state. Other threads read through the shared snapshot handle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use croft_types::{Executor, WorkerId, WorkerState, WorkerStatus};

use crate::worker::{Assignment, WorkerEvent, WorkerHandle};

/// Pool-level counters readable from outside the scheduler thread. Written
/// only by the pool.
#[derive(Debug, Default)]
pub(crate) struct PoolShared {
    degraded: AtomicBool,
    exhausted: AtomicBool,
    respawns_used: AtomicUsize,
}

impl PoolShared {
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Relaxed)
    }

    pub fn respawns_used(&self) -> usize {
        self.respawns_used.load(Ordering::Relaxed)
    }
}

/// What became of a worker after `mark_dead`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RespawnOutcome {
    /// A fresh worker took over the slot.
    Respawned,
    /// The respawn ceiling is spent; the slot stays dead but others live on.
    Degraded { alive: usize },
    /// No live workers remain.
    Exhausted,
}

pub(crate) struct WorkerPool<E: Executor> {
    executor: Arc<E>,
    events: Sender<WorkerEvent<E::Value>>,
    handles: Vec<Option<WorkerHandle<E::Payload>>>,
    states: Arc<Mutex<Vec<WorkerState>>>,
    respawn_limit: usize,
    shared: Arc<PoolShared>,
    /// Desired worker count; surplus busy workers are retired once idle.
    target: usize,
}

impl<E: Executor> WorkerPool<E> {
    pub fn new(
        executor: Arc<E>,
        events: Sender<WorkerEvent<E::Value>>,
        count: usize,
        respawn_limit: usize,
        shared: Arc<PoolShared>,
    ) -> std::io::Result<Self> {
        let mut pool = Self {
            executor,
            events,
            handles: Vec::with_capacity(count),
            states: Arc::new(Mutex::new(Vec::with_capacity(count))),
            respawn_limit,
            shared,
            target: count,
        };
        for worker_id in 0..count {
            let handle =
                WorkerHandle::spawn(worker_id, pool.executor.clone(), pool.events.clone())?;
            pool.handles.push(Some(handle));
            pool.states.lock().push(WorkerState::new(worker_id));
        }
        info!(workers = count, "worker pool started");
        Ok(pool)
    }

    /// Snapshot handle for stats readers.
    pub fn states_handle(&self) -> Arc<Mutex<Vec<WorkerState>>> {
        self.states.clone()
    }

    /// Find an idle worker. Does not change its state; only a successful
    /// dispatch marks it busy.
    pub fn acquire_idle(&self) -> Option<WorkerId> {
        let states = self.states.lock();
        states
            .iter()
            .position(|s| s.is_idle() && self.handles[s.worker_id].is_some())
    }

    /// Send an assignment to a worker and mark it busy. Returns false if the
    /// worker thread turned out to be gone, in which case the caller should
    /// `mark_dead` it and requeue the task.
    pub fn dispatch(&mut self, worker_id: WorkerId, assignment: Assignment<E::Payload>) -> bool {
        let key = (assignment.task.batch_id, assignment.task.index);
        let Some(handle) = self.handles[worker_id].as_ref() else {
            return false;
        };
        if handle.assign(assignment).is_err() {
            return false;
        }
        let mut states = self.states.lock();
        let state = &mut states[worker_id];
        state.status = WorkerStatus::Busy;
        state.current_task = Some(key);
        state.touch();
        true
    }

    /// Return a worker to the idle rotation after its task resolved.
    pub fn release(&mut self, worker_id: WorkerId) {
        let mut states = self.states.lock();
        let state = &mut states[worker_id];
        if state.is_busy() {
            state.status = WorkerStatus::Idle;
            state.current_task = None;
            state.tasks_completed += 1;
            state.touch();
        }
    }

    /// Remove a crashed worker from the rotation, respawning a replacement
    /// into the same slot if the respawn ceiling allows.
    pub fn mark_dead(&mut self, worker_id: WorkerId) -> RespawnOutcome {
        {
            let mut states = self.states.lock();
            let state = &mut states[worker_id];
            state.status = WorkerStatus::Dead;
            state.current_task = None;
        }
        // Drop the handle; the thread already exited on its own.
        if let Some(handle) = self.handles[worker_id].take() {
            handle.join();
        }

        if self.shared.respawns_used() < self.respawn_limit {
            match WorkerHandle::spawn(worker_id, self.executor.clone(), self.events.clone()) {
                Ok(handle) => {
                    self.shared.respawns_used.fetch_add(1, Ordering::Relaxed);
                    self.handles[worker_id] = Some(handle);
                    let mut states = self.states.lock();
                    let state = &mut states[worker_id];
                    state.status = WorkerStatus::Idle;
                    state.respawn_count += 1;
                    state.touch();
                    info!(worker_id, "worker respawned after crash");
                    return RespawnOutcome::Respawned;
                }
                Err(e) => {
                    error!(worker_id, error = %e, "failed to respawn worker");
                }
            }
        }

        let alive = self.alive_count();
        if alive == 0 {
            self.shared.exhausted.store(true, Ordering::Relaxed);
            error!("worker pool exhausted; no live workers remain");
            RespawnOutcome::Exhausted
        } else {
            if !self.shared.is_degraded() {
                self.shared.degraded.store(true, Ordering::Relaxed);
                warn!(
                    alive,
                    respawn_limit = self.respawn_limit,
                    "respawn ceiling reached; pool degraded"
                );
            }
            RespawnOutcome::Degraded { alive }
        }
    }

    /// Change the desired pool size. Growth happens immediately; shrinking
    /// retires idle workers now and busy ones as they finish (see
    /// [`Self::maintain`]).
    pub fn resize(&mut self, target: usize) -> std::io::Result<()> {
        info!(from = self.target, to = target, "resizing worker pool");
        self.target = target;
        while self.alive_count() < self.target {
            let worker_id = self.handles.len();
            let handle = WorkerHandle::spawn(worker_id, self.executor.clone(), self.events.clone())?;
            self.handles.push(Some(handle));
            self.states.lock().push(WorkerState::new(worker_id));
        }
        self.maintain();
        Ok(())
    }

    /// Retire surplus idle workers until the pool matches its target size.
    pub fn maintain(&mut self) {
        while self.alive_count() > self.target {
            let Some(worker_id) = self.acquire_idle() else {
                break;
            };
            debug!(worker_id, "retiring surplus worker");
            if let Some(handle) = self.handles[worker_id].take() {
                handle.join();
            }
            let mut states = self.states.lock();
            states[worker_id].status = WorkerStatus::Dead;
            states[worker_id].current_task = None;
        }
    }

    pub fn alive_count(&self) -> usize {
        self.handles.iter().filter(|h| h.is_some()).count()
    }

    /// Close all task channels and wait for every worker thread to finish.
    pub fn shutdown(&mut self) {
        for handle in self.handles.iter_mut().filter_map(Option::take) {
            handle.join();
        }
        let mut states = self.states.lock();
        for state in states.iter_mut() {
            state.status = WorkerStatus::Dead;
            state.current_task = None;
        }
        info!("worker pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use croft_types::{FnExecutor, FunctionError, Task};

    type TestPool = WorkerPool<FnExecutor<u32, u32, fn(&u32) -> Result<u32, FunctionError>>>;

    fn ok_executor(x: &u32) -> Result<u32, FunctionError> {
        Ok(*x)
    }

    fn panicking_executor(_: &u32) -> Result<u32, FunctionError> {
        panic!("boom")
    }

    fn make_pool(
        count: usize,
        respawn_limit: usize,
        f: fn(&u32) -> Result<u32, FunctionError>,
    ) -> (
        TestPool,
        crossbeam_channel::Receiver<WorkerEvent<u32>>,
        Arc<PoolShared>,
    ) {
        let (event_tx, event_rx) = unbounded();
        let shared = Arc::new(PoolShared::default());
        let pool = WorkerPool::new(
            Arc::new(FnExecutor::new(f)),
            event_tx,
            count,
            respawn_limit,
            shared.clone(),
        )
        .unwrap();
        (pool, event_rx, shared)
    }

    #[test]
    fn starts_with_all_workers_idle() {
        let (mut pool, _events, shared) = make_pool(3, 0, ok_executor);
        assert_eq!(pool.alive_count(), 3);
        assert!(!shared.is_degraded());
        let states = pool.states_handle();
        assert!(states.lock().iter().all(|s| s.is_idle()));
        pool.shutdown();
    }

    #[test]
    fn dispatch_marks_busy_and_release_returns_to_rotation() {
        let (mut pool, events, _shared) = make_pool(1, 0, ok_executor);
        let worker_id = pool.acquire_idle().unwrap();
        assert!(pool.dispatch(
            worker_id,
            Assignment {
                task: Task::new(0, 0, 5),
                attempt: 0,
            }
        ));
        assert!(pool.states_handle().lock()[worker_id].is_busy());
        assert!(pool.acquire_idle().is_none());

        // Wait for the worker to finish before releasing.
        let _ = events.recv().unwrap();
        pool.release(worker_id);
        let states = pool.states_handle();
        assert!(states.lock()[worker_id].is_idle());
        assert_eq!(states.lock()[worker_id].tasks_completed, 1);
        pool.shutdown();
    }

    #[test]
    fn mark_dead_respawns_within_ceiling() {
        let (mut pool, events, shared) = make_pool(1, 1, panicking_executor);
        let worker_id = pool.acquire_idle().unwrap();
        pool.dispatch(
            worker_id,
            Assignment {
                task: Task::new(0, 0, 1),
                attempt: 0,
            },
        );
        match events.recv().unwrap() {
            WorkerEvent::Crashed { worker_id: w, .. } => assert_eq!(w, worker_id),
            other => panic!("expected Crashed, got {other:?}"),
        }

        assert_eq!(pool.mark_dead(worker_id), RespawnOutcome::Respawned);
        assert_eq!(pool.alive_count(), 1);
        assert_eq!(shared.respawns_used(), 1);
        let states = pool.states_handle();
        assert_eq!(states.lock()[worker_id].respawn_count, 1);
        assert!(states.lock()[worker_id].is_idle());
        pool.shutdown();
    }

    #[test]
    fn respawn_ceiling_degrades_then_exhausts() {
        let (mut pool, _events, shared) = make_pool(2, 0, ok_executor);
        assert_eq!(pool.mark_dead(0), RespawnOutcome::Degraded { alive: 1 });
        assert!(shared.is_degraded());
        assert!(!shared.is_exhausted());

        assert_eq!(pool.mark_dead(1), RespawnOutcome::Exhausted);
        assert!(shared.is_exhausted());
        assert_eq!(pool.alive_count(), 0);
        pool.shutdown();
    }

    #[test]
    fn resize_grows_and_shrinks() {
        let (mut pool, _events, _shared) = make_pool(2, 0, ok_executor);
        pool.resize(4).unwrap();
        assert_eq!(pool.alive_count(), 4);

        pool.resize(1).unwrap();
        assert_eq!(pool.alive_count(), 1);
        pool.shutdown();
    }
}
