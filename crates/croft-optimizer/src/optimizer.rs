//! The optimizer collaborator interface.
//!
//! Optimizers are pull-based and know nothing about the farm: `propose`
//! yields the next set of parameter vectors to evaluate, `observe` feeds the
//! objective values (or errors) back, and the driver loop in between is free
//! to parallelize however it likes.

use croft_types::EvalOutcome;

/// An iterative optimizer over `Vec<f64>` parameter vectors.
///
/// Each round proposes zero or more parameter vectors; an empty proposal set
/// means the optimizer has nothing further to evaluate. `observe` is called
/// exactly once per round with the same proposals and one objective outcome
/// per proposal, in order. An `Err` outcome means that evaluation failed;
/// optimizers decide for themselves how to react (SPSA skips the update,
/// grid search skips the point).
pub trait Optimizer: Send {
    /// The next parameter vectors to evaluate. Empty when finished.
    fn propose(&mut self) -> Vec<Vec<f64>>;

    /// Feed back one objective outcome per proposal, in proposal order.
    fn observe(&mut self, proposals: &[Vec<f64>], objectives: &[EvalOutcome<f64>]);

    /// Best known point so far and its objective value.
    fn best(&self) -> Option<(Vec<f64>, f64)>;

    fn is_finished(&self) -> bool;

    /// Human-readable optimizer name.
    fn name(&self) -> &str;
}
