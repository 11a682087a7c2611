//! Worker threads and their channel handles.
//!
//! Each worker is an OS thread with a bounded(1) task channel in and a shared
//! event channel out. The bounded(1) channel is what guarantees at most one
//! task in flight per worker. A panic inside the executor is reported as a
//! [`WorkerEvent::Crashed`] and kills the thread — the in-process equivalent
//! of a worker process dying mid-task, kept strictly distinct from an
//! objective-level `Err`.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::trace;

use croft_types::{AttemptId, BatchId, Executor, FunctionError, Task, WorkerId};

/// One task handed to one worker, tagged with the attempt token that must
/// still be live for its result to be accepted.
#[derive(Debug)]
pub(crate) struct Assignment<P> {
    pub task: Task<P>,
    pub attempt: AttemptId,
}

/// Events flowing from worker threads back to the scheduler.
#[derive(Debug)]
pub(crate) enum WorkerEvent<V> {
    Completed {
        worker_id: WorkerId,
        batch_id: BatchId,
        index: u32,
        attempt: AttemptId,
        outcome: Result<V, FunctionError>,
    },
    Crashed {
        worker_id: WorkerId,
        batch_id: BatchId,
        index: u32,
        attempt: AttemptId,
        message: String,
    },
}

/// The pool's view of one worker thread.
pub(crate) struct WorkerHandle<P> {
    tasks: Sender<Assignment<P>>,
    join: Option<JoinHandle<()>>,
}

impl<P> WorkerHandle<P> {
    pub fn spawn<E>(
        worker_id: WorkerId,
        executor: Arc<E>,
        events: Sender<WorkerEvent<E::Value>>,
    ) -> std::io::Result<Self>
    where
        E: Executor<Payload = P>,
        P: Send + 'static,
    {
        let (task_tx, task_rx) = bounded::<Assignment<P>>(1);
        let join = thread::Builder::new()
            .name(format!("croft-worker-{worker_id}"))
            .spawn(move || run_worker(worker_id, executor, task_rx, events))?;
        Ok(Self {
            tasks: task_tx,
            join: Some(join),
        })
    }

    /// Hand a task to the worker. Fails only if the worker thread is gone,
    /// in which case the assignment is returned for requeueing.
    pub fn assign(&self, assignment: Assignment<P>) -> Result<(), Assignment<P>> {
        self.tasks.send(assignment).map_err(|e| e.into_inner())
    }

    /// Close the task channel and wait for the thread to finish its current
    /// task, if any.
    pub fn join(mut self) {
        drop(self.tasks);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run_worker<E: Executor>(
    worker_id: WorkerId,
    executor: Arc<E>,
    tasks: Receiver<Assignment<E::Payload>>,
    events: Sender<WorkerEvent<E::Value>>,
) {
    trace!(worker_id, "worker thread started");
    for Assignment { task, attempt } in tasks.iter() {
        let Task {
            batch_id,
            index,
            payload,
        } = task;
        match panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&payload))) {
            Ok(outcome) => {
                let event = WorkerEvent::Completed {
                    worker_id,
                    batch_id,
                    index,
                    attempt,
                    outcome,
                };
                if events.send(event).is_err() {
                    // Scheduler is gone; nothing left to report to.
                    return;
                }
            }
            Err(cause) => {
                let event = WorkerEvent::Crashed {
                    worker_id,
                    batch_id,
                    index,
                    attempt,
                    message: panic_message(cause),
                };
                let _ = events.send(event);
                // A crashed worker does not survive its task.
                return;
            }
        }
    }
    trace!(worker_id, "worker thread stopped");
}

fn panic_message(cause: Box<dyn Any + Send>) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
