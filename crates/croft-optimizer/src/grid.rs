//! Exhaustive grid search over a cartesian product of parameter axes.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use croft_types::{EvalOutcome, FarmError, FarmResult};

use crate::optimizer::Optimizer;

/// The grid to sweep: one ordered list of values per parameter dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub axes: Vec<Vec<f64>>,
}

impl GridSpec {
    pub fn new() -> Self {
        Self { axes: Vec::new() }
    }

    /// Add a dimension with explicit grid points.
    pub fn add_axis(mut self, values: Vec<f64>) -> Self {
        self.axes.push(values);
        self
    }

    /// Add a dimension of `steps` evenly spaced points across [low, high].
    pub fn add_linspace(mut self, low: f64, high: f64, steps: usize) -> Self {
        let steps = steps.max(2);
        let values = (0..steps)
            .map(|i| {
                let t = i as f64 / (steps - 1) as f64;
                low + t * (high - low)
            })
            .collect();
        self.axes.push(values);
        self
    }

    pub fn validate(&self) -> FarmResult<()> {
        if self.axes.is_empty() {
            return Err(FarmError::Config("grid must have at least one axis".into()));
        }
        if self.axes.iter().any(|axis| axis.is_empty()) {
            return Err(FarmError::Config("grid axes must be non-empty".into()));
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.axes.iter().map(|axis| axis.len()).product()
    }

    /// Cartesian product of the axes, in row-major order.
    fn combos(&self) -> Vec<Vec<f64>> {
        let mut result: Vec<Vec<f64>> = vec![Vec::new()];
        for axis in &self.axes {
            let mut next = Vec::with_capacity(result.len() * axis.len());
            for existing in &result {
                for value in axis {
                    let mut combo = existing.clone();
                    combo.push(*value);
                    next.push(combo);
                }
            }
            result = next;
        }
        result
    }
}

impl Default for GridSpec {
    fn default() -> Self {
        Self::new()
    }
}

/// Grid search minimizer: proposes the grid in `batch_size` chunks and keeps
/// the best point seen. Points whose evaluation errored are skipped.
pub struct GridSearch {
    combos: Vec<Vec<f64>>,
    cursor: usize,
    batch_size: usize,
    observed: usize,
    best: Option<(Vec<f64>, f64)>,
}

impl GridSearch {
    pub fn new(spec: GridSpec, batch_size: usize) -> FarmResult<Self> {
        spec.validate()?;
        if batch_size == 0 {
            return Err(FarmError::Config("batch_size must be at least 1".into()));
        }
        let combos = spec.combos();
        debug!(points = combos.len(), batch_size, "grid search built");
        Ok(Self {
            combos,
            cursor: 0,
            batch_size,
            observed: 0,
            best: None,
        })
    }

    pub fn total_points(&self) -> usize {
        self.combos.len()
    }
}

impl Optimizer for GridSearch {
    fn propose(&mut self) -> Vec<Vec<f64>> {
        let end = (self.cursor + self.batch_size).min(self.combos.len());
        let batch = self.combos[self.cursor..end].to_vec();
        self.cursor = end;
        batch
    }

    fn observe(&mut self, proposals: &[Vec<f64>], objectives: &[EvalOutcome<f64>]) {
        for (params, objective) in proposals.iter().zip(objectives) {
            self.observed += 1;
            match objective {
                Ok(value) => {
                    if self.best.as_ref().map_or(true, |(_, b)| value < b) {
                        self.best = Some((params.clone(), *value));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "grid point evaluation failed; skipping");
                }
            }
        }
    }

    fn best(&self) -> Option<(Vec<f64>, f64)> {
        self.best.clone()
    }

    fn is_finished(&self) -> bool {
        self.cursor == self.combos.len() && self.observed >= self.combos.len()
    }

    fn name(&self) -> &str {
        "grid"
    }
}
