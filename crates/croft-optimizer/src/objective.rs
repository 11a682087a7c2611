//! Splitting an objective into farmable pieces.
//!
//! Expensive simulation work parallelizes; the reduction of its outputs to a
//! single scalar does not need to. [`ObjectiveSplit`] captures that split:
//! `expand` turns one parameter vector into the payloads to farm out (one per
//! data instance), and `reduce` folds their outcomes back into the objective
//! value the optimizer sees.

use std::fmt;

use croft_types::{EvalOutcome, FunctionError};

/// How one parameter vector becomes a batch and how the batch becomes an
/// objective value.
pub trait ObjectiveSplit: Send + Sync + 'static {
    type Payload: fmt::Debug + Clone + Send + 'static;

    /// One payload per evaluation instance. Every payload carries the full
    /// parameter vector; the instances differ in their data.
    fn expand(&self, params: &[f64]) -> Vec<Self::Payload>;

    /// Fold the per-instance outcomes into one objective value. Outcomes
    /// arrive in `expand` order.
    fn reduce(&self, outcomes: &[EvalOutcome<f64>]) -> EvalOutcome<f64>;
}

/// Sum the per-instance objective contributions. The first errored instance
/// fails the whole point (a partial sum is not a comparable objective).
pub struct SummedObjective<I> {
    instances: Vec<I>,
}

impl<I> SummedObjective<I> {
    pub fn new(instances: Vec<I>) -> Self {
        Self { instances }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

impl<I> ObjectiveSplit for SummedObjective<I>
where
    I: fmt::Debug + Clone + Send + Sync + 'static,
{
    type Payload = (Vec<f64>, I);

    fn expand(&self, params: &[f64]) -> Vec<(Vec<f64>, I)> {
        self.instances
            .iter()
            .map(|instance| (params.to_vec(), instance.clone()))
            .collect()
    }

    fn reduce(&self, outcomes: &[EvalOutcome<f64>]) -> EvalOutcome<f64> {
        let mut total = 0.0;
        for outcome in outcomes {
            total += outcome.clone()?;
        }
        Ok(total)
    }
}

/// No split at all: one payload per point, its value taken as the objective.
pub struct SingleEval;

impl ObjectiveSplit for SingleEval {
    type Payload = Vec<f64>;

    fn expand(&self, params: &[f64]) -> Vec<Vec<f64>> {
        vec![params.to_vec()]
    }

    fn reduce(&self, outcomes: &[EvalOutcome<f64>]) -> EvalOutcome<f64> {
        match outcomes {
            [outcome] => outcome.clone(),
            _ => Err(FunctionError::objective(format!(
                "expected exactly one outcome, got {}",
                outcomes.len()
            ))),
        }
    }
}
