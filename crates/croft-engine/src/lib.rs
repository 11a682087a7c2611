//! Producer/consumer task-farming engine.
//!
//! A [`TaskFarm`] owns a pool of worker threads and distributes batches of
//! independent evaluations across them: submit a batch of payloads, await the
//! completed batch, and get one value-or-error per payload back in submission
//! order. Worker crashes are retried transparently up to a configured limit;
//! domain errors from the objective surface verbatim at their index.

mod aggregator;
mod coordinator;
mod pool;
mod queue;
mod scheduler;
mod worker;

pub use coordinator::{AwaitError, FarmStats, TaskFarm};
