//! Simultaneous Perturbation Stochastic Approximation (Spall 1992).
//!
//! Each iteration evaluates the objective at exactly two points, `theta ±
//! c_k * delta` for a random Rademacher direction `delta`, and estimates the
//! full gradient from their difference. The two-point cost per step is
//! independent of the parameter dimension, which is what makes SPSA a good
//! fit for expensive farmed objectives.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use croft_types::{EvalOutcome, FarmError, FarmResult};

use crate::optimizer::Optimizer;

/// Tuning knobs for [`Spsa`]. The gain-sequence defaults follow Spall (2000):
/// `a_k = a / (k + 1 + A)^alpha`, `c_k = c / (k + 1)^gamma`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpsaConfig {
    /// Starting parameter vector.
    pub initial: Vec<f64>,
    /// Step-size numerator.
    pub a: f64,
    /// Perturbation-size numerator.
    pub c: f64,
    /// Step-size decay exponent.
    pub alpha: f64,
    /// Perturbation decay exponent.
    pub gamma: f64,
    /// Stability constant A. `None` defaults to `max_iter / 10`.
    pub big_a: Option<f64>,
    pub max_iter: usize,
    /// Stop once the relative parameter change drops below this.
    pub xtol: f64,
    /// Optional per-dimension (low, high) clipping bounds.
    pub bounds: Option<Vec<(f64, f64)>>,
    /// Optional cap on the objective difference, against exploding gradients.
    pub max_grad: Option<f64>,
    /// Seed for the perturbation directions. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl SpsaConfig {
    pub fn new(initial: Vec<f64>) -> Self {
        Self {
            initial,
            a: 1e-6,
            c: 0.01,
            alpha: 0.602,
            gamma: 0.101,
            big_a: None,
            max_iter: 1000,
            xtol: 1e-4,
            bounds: None,
            max_grad: None,
            seed: None,
        }
    }

    pub fn with_gains(mut self, a: f64, c: f64) -> Self {
        self.a = a;
        self.c = c;
        self
    }

    pub fn with_max_iter(mut self, n: usize) -> Self {
        self.max_iter = n;
        self
    }

    pub fn with_xtol(mut self, xtol: f64) -> Self {
        self.xtol = xtol;
        self
    }

    pub fn with_bounds(mut self, bounds: Vec<(f64, f64)>) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn with_max_grad(mut self, max_grad: f64) -> Self {
        self.max_grad = Some(max_grad);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> FarmResult<()> {
        if self.initial.is_empty() {
            return Err(FarmError::Config("initial point must be non-empty".into()));
        }
        if self.max_iter == 0 {
            return Err(FarmError::Config("max_iter must be at least 1".into()));
        }
        if self.xtol <= 0.0 {
            return Err(FarmError::Config("xtol must be positive".into()));
        }
        if self.a <= 0.0 || self.c <= 0.0 {
            return Err(FarmError::Config("gains a and c must be positive".into()));
        }
        if let Some(bounds) = &self.bounds {
            if bounds.len() != self.initial.len() {
                return Err(FarmError::Config(
                    "bounds length must match the parameter dimension".into(),
                ));
            }
            if bounds.iter().any(|(low, high)| high <= low) {
                return Err(FarmError::Config(
                    "upper bounds must be greater than lower".into(),
                ));
            }
        }
        if matches!(self.max_grad, Some(g) if g <= 0.0) {
            return Err(FarmError::Config("max_grad must be positive".into()));
        }
        Ok(())
    }
}

/// The two-sided evaluation issued by the current iteration, held until its
/// objectives come back through `observe`.
struct PendingStep {
    ak: f64,
    ck: f64,
    delta: Vec<f64>,
}

/// SPSA minimizer. Proposes two points per round.
pub struct Spsa {
    config: SpsaConfig,
    big_a: f64,
    theta: Vec<f64>,
    /// Theta as of the start of the last completed update, for the relative
    /// change stopping rule. Seeded far from theta so iteration 0 never
    /// reads as converged.
    prev_theta: Vec<f64>,
    pending: Option<PendingStep>,
    iteration: usize,
    converged: bool,
    best: Option<(Vec<f64>, f64)>,
    rng: StdRng,
}

impl Spsa {
    pub fn new(config: SpsaConfig) -> FarmResult<Self> {
        config.validate()?;
        let theta = config.initial.clone();
        let prev_theta = if theta.iter().all(|&x| x == 0.0) {
            vec![10.0; theta.len()]
        } else {
            theta.iter().map(|x| x * 100.0).collect()
        };
        let big_a = config.big_a.unwrap_or(config.max_iter as f64 / 10.0);
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config,
            big_a,
            theta,
            prev_theta,
            pending: None,
            iteration: 0,
            converged: false,
            best: None,
            rng,
        })
    }

    pub fn iterations(&self) -> usize {
        self.iteration
    }

    fn clip(&self, theta: &mut [f64]) {
        if let Some(bounds) = &self.config.bounds {
            for (x, (low, high)) in theta.iter_mut().zip(bounds) {
                *x = x.clamp(*low, *high);
            }
        }
    }

    fn relative_change(&self) -> f64 {
        let diff = norm_of_diff(&self.prev_theta, &self.theta);
        diff / norm(&self.prev_theta)
    }
}

impl Optimizer for Spsa {
    fn propose(&mut self) -> Vec<Vec<f64>> {
        if self.is_finished() {
            return Vec::new();
        }
        let k = self.iteration as f64;
        let ak = self.config.a / (k + 1.0 + self.big_a).powf(self.config.alpha);
        let ck = self.config.c / (k + 1.0).powf(self.config.gamma);
        let delta: Vec<f64> = (0..self.theta.len())
            .map(|_| f64::from(self.rng.gen_range(0..2i32) * 2 - 1))
            .collect();

        let mut plus: Vec<f64> = self
            .theta
            .iter()
            .zip(&delta)
            .map(|(t, d)| t + ck * d)
            .collect();
        let mut minus: Vec<f64> = self
            .theta
            .iter()
            .zip(&delta)
            .map(|(t, d)| t - ck * d)
            .collect();
        self.clip(&mut plus);
        self.clip(&mut minus);

        self.pending = Some(PendingStep { ak, ck, delta });
        vec![plus, minus]
    }

    fn observe(&mut self, _proposals: &[Vec<f64>], objectives: &[EvalOutcome<f64>]) {
        let Some(step) = self.pending.take() else {
            warn!("observe without a pending proposal; ignored");
            return;
        };
        let (y_plus, y_minus) = match objectives {
            [Ok(plus), Ok(minus)] => (*plus, *minus),
            _ => {
                // A failed evaluation contributes nothing; spend the
                // iteration and move on rather than update from bad data.
                warn!(
                    iteration = self.iteration,
                    "evaluation failed; skipping update"
                );
                self.iteration += 1;
                return;
            }
        };

        let mut y_diff = y_plus - y_minus;
        if let Some(max_grad) = self.config.max_grad {
            if y_diff.abs() > max_grad {
                y_diff *= max_grad / y_diff.abs();
            }
        }

        self.prev_theta.clone_from(&self.theta);
        for (x, d) in self.theta.iter_mut().zip(&step.delta) {
            let g_hat = y_diff / (2.0 * step.ck * d);
            *x -= step.ak * g_hat;
        }
        let mut theta = std::mem::take(&mut self.theta);
        self.clip(&mut theta);
        self.theta = theta;

        self.iteration += 1;
        let avg = (y_plus + y_minus) / 2.0;
        if self.best.as_ref().map_or(true, |(_, b)| avg < *b) {
            self.best = Some((self.theta.clone(), avg));
        }
        let change = self.relative_change();
        if change <= self.config.xtol {
            self.converged = true;
            debug!(
                iteration = self.iteration,
                change, "parameter change below tolerance; stopping"
            );
        }
    }

    fn best(&self) -> Option<(Vec<f64>, f64)> {
        self.best.clone()
    }

    fn is_finished(&self) -> bool {
        self.converged || self.iteration >= self.config.max_iter
    }

    fn name(&self) -> &str {
        "spsa"
    }
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn norm_of_diff(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use croft_types::FunctionError;

    fn quadratic(x: &[f64]) -> f64 {
        x.iter().map(|xi| (xi - 3.0).powi(2)).sum()
    }

    fn run_to_completion(mut spsa: Spsa, f: impl Fn(&[f64]) -> f64) -> Spsa {
        while !spsa.is_finished() {
            let proposals = spsa.propose();
            if proposals.is_empty() {
                break;
            }
            let objectives: Vec<EvalOutcome<f64>> =
                proposals.iter().map(|p| Ok(f(p))).collect();
            spsa.observe(&proposals, &objectives);
        }
        spsa
    }

    #[test]
    fn converges_on_a_quadratic() {
        // For a separable quadratic the two-point estimate recovers the true
        // gradient exactly, so convergence is deterministic.
        let config = SpsaConfig::new(vec![0.0, 0.0])
            .with_gains(0.2, 0.01)
            .with_max_iter(200)
            .with_xtol(1e-5)
            .with_seed(42);
        let spsa = run_to_completion(Spsa::new(config).unwrap(), quadratic);

        let (best, value) = spsa.best().unwrap();
        assert!((best[0] - 3.0).abs() < 0.1, "best[0] = {}", best[0]);
        assert!((best[1] - 3.0).abs() < 0.1, "best[1] = {}", best[1]);
        assert!(value < 0.1);
    }

    #[test]
    fn proposes_exactly_two_points_per_round() {
        let config = SpsaConfig::new(vec![1.0]).with_seed(0);
        let mut spsa = Spsa::new(config).unwrap();
        let proposals = spsa.propose();
        assert_eq!(proposals.len(), 2);
        // Symmetric around theta.
        assert!((proposals[0][0] + proposals[1][0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn bounds_clip_proposals_and_updates() {
        let config = SpsaConfig::new(vec![0.5])
            .with_gains(10.0, 0.3)
            .with_bounds(vec![(0.0, 1.0)])
            .with_max_iter(50)
            .with_seed(7);
        let mut spsa = Spsa::new(config).unwrap();
        for _ in 0..50 {
            let proposals = spsa.propose();
            if proposals.is_empty() {
                break;
            }
            for p in &proposals {
                assert!(p[0] >= 0.0 && p[0] <= 1.0, "proposal escaped bounds: {}", p[0]);
            }
            let objectives: Vec<EvalOutcome<f64>> =
                proposals.iter().map(|p| Ok(quadratic(p))).collect();
            spsa.observe(&proposals, &objectives);
            let (best, _) = spsa.best().unwrap();
            assert!(best[0] >= 0.0 && best[0] <= 1.0);
        }
    }

    #[test]
    fn failed_evaluation_skips_the_update() {
        let config = SpsaConfig::new(vec![5.0]).with_seed(1).with_max_iter(10);
        let mut spsa = Spsa::new(config).unwrap();
        let proposals = spsa.propose();
        let objectives = vec![
            Ok(1.0),
            Err(FunctionError::objective("simulation diverged")),
        ];
        spsa.observe(&proposals, &objectives);

        assert_eq!(spsa.theta, vec![5.0]);
        assert_eq!(spsa.iterations(), 1);
        assert!(!spsa.is_finished());
    }

    #[test]
    fn stops_at_max_iter() {
        let config = SpsaConfig::new(vec![0.0])
            .with_gains(1e-9, 0.01)
            .with_max_iter(3)
            .with_seed(3);
        let mut spsa = run_to_completion(Spsa::new(config).unwrap(), quadratic);
        assert_eq!(spsa.iterations(), 3);
        assert!(spsa.is_finished());
        assert!(spsa.propose().is_empty());
    }

    #[test]
    fn rejects_malformed_config() {
        assert!(Spsa::new(SpsaConfig::new(vec![])).is_err());
        assert!(Spsa::new(SpsaConfig::new(vec![1.0]).with_xtol(0.0)).is_err());
        assert!(Spsa::new(SpsaConfig::new(vec![1.0]).with_bounds(vec![(1.0, 0.0)])).is_err());
        assert!(Spsa::new(SpsaConfig::new(vec![1.0]).with_bounds(vec![(0.0, 1.0), (0.0, 1.0)])).is_err());
    }
}
