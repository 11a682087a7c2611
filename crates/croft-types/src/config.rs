//! Farm configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{FarmError, FarmResult};

/// Scheduling policy for the dispatch queue. Only one policy is defined:
/// FIFO within a batch, with tasks from older batches preferred over newer
/// ones so a pipelined backlog cannot starve an earlier batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchFairness {
    FifoOldestBatchFirst,
}

impl Default for DispatchFairness {
    fn default() -> Self {
        Self::FifoOldestBatchFirst
    }
}

/// Configuration surface for a task farm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FarmConfig {
    /// Number of workers in the pool.
    pub worker_count: usize,

    /// Maximum number of batches that may be in flight at once (K). Submit
    /// returns `FarmError::BatchLimit` past this.
    pub max_in_flight_batches: usize,

    /// How many times a task is re-dispatched after a worker crash before its
    /// slot is filled with a `RetriesExhausted` marker.
    pub task_retry_limit: usize,

    /// How many crashed workers the pool will replace before it stops
    /// respawning and reports itself degraded.
    pub worker_respawn_limit: usize,

    /// Timeout applied by `await_completion` when the caller passes none.
    pub default_batch_timeout: Duration,

    /// If set, an in-flight batch with zero recorded results for this long is
    /// marked failed.
    pub stall_grace: Option<Duration>,

    pub dispatch_fairness: DispatchFairness,
}

impl Default for FarmConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            worker_count: workers,
            max_in_flight_batches: 1,
            task_retry_limit: 1,
            worker_respawn_limit: workers,
            default_batch_timeout: Duration::from_secs(300),
            stall_grace: None,
            dispatch_fairness: DispatchFairness::default(),
        }
    }
}

impl FarmConfig {
    pub fn with_workers(mut self, n: usize) -> Self {
        self.worker_count = n;
        self
    }

    /// Allow up to `k` batches in flight at once.
    pub fn with_pipelining(mut self, k: usize) -> Self {
        self.max_in_flight_batches = k;
        self
    }

    pub fn with_task_retry_limit(mut self, n: usize) -> Self {
        self.task_retry_limit = n;
        self
    }

    pub fn with_worker_respawn_limit(mut self, n: usize) -> Self {
        self.worker_respawn_limit = n;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_batch_timeout = timeout;
        self
    }

    pub fn with_stall_grace(mut self, grace: Duration) -> Self {
        self.stall_grace = Some(grace);
        self
    }

    pub fn validate(&self) -> FarmResult<()> {
        if self.worker_count == 0 {
            return Err(FarmError::Config("worker_count must be at least 1".into()));
        }
        if self.max_in_flight_batches == 0 {
            return Err(FarmError::Config(
                "max_in_flight_batches must be at least 1".into(),
            ));
        }
        if self.default_batch_timeout.is_zero() {
            return Err(FarmError::Config(
                "default_batch_timeout must be non-zero".into(),
            ));
        }
        if matches!(self.stall_grace, Some(g) if g.is_zero()) {
            return Err(FarmError::Config("stall_grace must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = FarmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_in_flight_batches, 1);
        assert!(config.worker_count >= 1);
    }

    #[test]
    fn builders_apply() {
        let config = FarmConfig::default()
            .with_workers(8)
            .with_pipelining(3)
            .with_task_retry_limit(2)
            .with_worker_respawn_limit(5)
            .with_default_timeout(Duration::from_secs(10))
            .with_stall_grace(Duration::from_secs(2));
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.max_in_flight_batches, 3);
        assert_eq!(config.task_retry_limit, 2);
        assert_eq!(config.worker_respawn_limit, 5);
        assert_eq!(config.default_batch_timeout, Duration::from_secs(10));
        assert_eq!(config.stall_grace, Some(Duration::from_secs(2)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let config = FarmConfig::default().with_workers(0);
        assert!(matches!(config.validate(), Err(FarmError::Config(_))));
    }

    #[test]
    fn zero_pipelining_rejected() {
        let config = FarmConfig::default().with_pipelining(0);
        assert!(config.validate().is_err());
    }
}
