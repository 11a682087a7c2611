//! # croft-optimizer
//!
//! Iterative optimizers and the loop that drives them over a Croft task farm.
//!
//! Provides the pull-based [`Optimizer`] trait, SPSA and exhaustive grid
//! search implementations, the [`ObjectiveSplit`] abstraction separating the
//! farmable evaluation from the cheap objective reduction, and the
//! [`OptimizationDriver`] that pipelines evaluation batches through a
//! [`TaskFarm`](croft_engine::TaskFarm).

mod driver;
mod grid;
mod objective;
mod optimizer;
mod spsa;

pub use driver::{DriverError, OptimizationDriver, RunReport, RunStop, StepRecord};
pub use grid::{GridSearch, GridSpec};
pub use objective::{ObjectiveSplit, SingleEval, SummedObjective};
pub use optimizer::Optimizer;
pub use spsa::{Spsa, SpsaConfig};
