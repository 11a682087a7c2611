//! Worker status records. Owned and mutated exclusively by the worker pool;
//! everyone else sees read-only snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{BatchId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    Idle,
    Busy,
    Dead,
}

/// The pool's authoritative record for one worker slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    /// The task currently assigned, if busy.
    pub current_task: Option<(BatchId, u32)>,
    /// Last time the worker was observed alive (dispatch or completion).
    pub last_heartbeat: DateTime<Utc>,
    /// How many times this slot has been respawned after a crash.
    pub respawn_count: usize,
    pub tasks_completed: usize,
}

impl WorkerState {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            status: WorkerStatus::Idle,
            current_task: None,
            last_heartbeat: Utc::now(),
            respawn_count: 0,
            tasks_completed: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    pub fn is_busy(&self) -> bool {
        self.status == WorkerStatus::Busy
    }

    pub fn is_dead(&self) -> bool {
        self.status == WorkerStatus::Dead
    }

    /// Record a liveness observation.
    pub fn touch(&mut self) {
        self.last_heartbeat = Utc::now();
    }
}
