//! The loop tying an optimizer to the farm.
//!
//! Each optimization step proposes parameter vectors, expands every vector
//! into one farm batch via the [`ObjectiveSplit`], pipelines the batches up
//! to the farm's in-flight limit, reduces each completed batch to a scalar,
//! and feeds the round's objectives back to the optimizer.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use croft_engine::{AwaitError, TaskFarm};
use croft_types::{BatchId, EvalOutcome, Executor, FarmError};

use crate::objective::ObjectiveSplit;
use crate::optimizer::Optimizer;

/// Error from a driver run. Unlike a per-point objective error (which is fed
/// to the optimizer), these end the run.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Farm(#[from] FarmError),

    #[error("Timed out waiting for batch {batch_id}")]
    Timeout { batch_id: BatchId },
}

/// Why the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStop {
    /// The optimizer reported itself finished (converged or grid exhausted).
    OptimizerFinished,
    MaxSteps,
}

/// One optimization step: the proposals evaluated and what came back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    pub proposals: Vec<Vec<f64>>,
    pub objectives: Vec<EvalOutcome<f64>>,
    /// Best objective value known after this step.
    pub best_objective: Option<f64>,
}

/// Summary of a completed optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub optimizer: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
    /// Total farmed evaluations (payloads, not proposals).
    pub evaluations: usize,
    pub best_params: Option<Vec<f64>>,
    pub best_objective: Option<f64>,
    pub stopped: RunStop,
}

impl RunReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub struct OptimizationDriver<E, O, S>
where
    E: Executor<Value = f64>,
    O: Optimizer,
    S: ObjectiveSplit<Payload = E::Payload>,
{
    farm: TaskFarm<E>,
    optimizer: O,
    split: S,
    /// Per-batch await timeout; `None` uses the farm's default.
    batch_timeout: Option<Duration>,
}

impl<E, O, S> OptimizationDriver<E, O, S>
where
    E: Executor<Value = f64>,
    O: Optimizer,
    S: ObjectiveSplit<Payload = E::Payload>,
{
    pub fn new(farm: TaskFarm<E>, optimizer: O, split: S) -> Self {
        Self {
            farm,
            optimizer,
            split,
            batch_timeout: None,
        }
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = Some(timeout);
        self
    }

    /// Run up to `max_steps` optimization steps. The farm is shut down when
    /// the run ends, successfully or not.
    pub fn run(mut self, max_steps: usize) -> Result<RunReport, DriverError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, optimizer = self.optimizer.name(), max_steps, "optimization run started");

        let mut steps = Vec::new();
        let mut evaluations = 0usize;
        let mut ran_out_of_proposals = false;
        let max_in_flight = self.farm.config().max_in_flight_batches;

        for step in 0..max_steps {
            if self.optimizer.is_finished() {
                ran_out_of_proposals = true;
                break;
            }
            let proposals = self.optimizer.propose();
            if proposals.is_empty() {
                ran_out_of_proposals = true;
                break;
            }

            let mut outstanding: VecDeque<(usize, BatchId)> = VecDeque::new();
            let mut collected: Vec<Option<EvalOutcome<f64>>> = vec![None; proposals.len()];

            for (i, params) in proposals.iter().enumerate() {
                if outstanding.len() == max_in_flight {
                    self.collect_oldest(&mut outstanding, &mut collected)?;
                }
                let payloads = self.split.expand(params);
                evaluations += payloads.len();
                let batch_id = self.farm.submit(payloads)?;
                outstanding.push_back((i, batch_id));
            }
            while !outstanding.is_empty() {
                self.collect_oldest(&mut outstanding, &mut collected)?;
            }

            // Every proposal was submitted and awaited above.
            let objectives: Vec<EvalOutcome<f64>> = collected
                .into_iter()
                .map(|o| o.expect("proposal was never collected"))
                .collect();
            self.optimizer.observe(&proposals, &objectives);

            let best_objective = self.optimizer.best().map(|(_, value)| value);
            debug!(step, ?best_objective, "optimization step complete");
            steps.push(StepRecord {
                step,
                proposals,
                objectives,
                best_objective,
            });
        }

        let stopped = if ran_out_of_proposals || self.optimizer.is_finished() {
            RunStop::OptimizerFinished
        } else {
            RunStop::MaxSteps
        };
        let (best_params, best_objective) = match self.optimizer.best() {
            Some((params, value)) => (Some(params), Some(value)),
            None => (None, None),
        };
        info!(%run_id, evaluations, ?best_objective, ?stopped, "optimization run finished");
        Ok(RunReport {
            run_id,
            optimizer: self.optimizer.name().to_string(),
            started_at,
            finished_at: Utc::now(),
            steps,
            evaluations,
            best_params,
            best_objective,
            stopped,
        })
    }

    /// Await the oldest outstanding batch and reduce it into its proposal's
    /// objective slot.
    fn collect_oldest(
        &self,
        outstanding: &mut VecDeque<(usize, BatchId)>,
        collected: &mut [Option<EvalOutcome<f64>>],
    ) -> Result<(), DriverError> {
        let Some((index, batch_id)) = outstanding.pop_front() else {
            return Ok(());
        };
        match self.farm.await_completion(batch_id, self.batch_timeout) {
            Ok(outcomes) => {
                collected[index] = Some(self.split.reduce(&outcomes));
                Ok(())
            }
            Err(AwaitError::Timeout { batch_id, .. }) => Err(DriverError::Timeout { batch_id }),
            Err(AwaitError::Farm(e)) => Err(DriverError::Farm(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GridSearch, GridSpec};
    use crate::objective::{SingleEval, SummedObjective};
    use crate::spsa::{Spsa, SpsaConfig};
    use croft_types::{FarmConfig, FnExecutor, FunctionError};

    fn quad_farm(workers: usize, pipelining: usize) -> TaskFarm<
        FnExecutor<Vec<f64>, f64, fn(&Vec<f64>) -> Result<f64, FunctionError>>,
    > {
        fn quad(p: &Vec<f64>) -> Result<f64, FunctionError> {
            Ok((p[0] - 3.0).powi(2))
        }
        let config = FarmConfig::default()
            .with_workers(workers)
            .with_pipelining(pipelining)
            .with_default_timeout(Duration::from_secs(10));
        TaskFarm::new(
            FnExecutor::new(quad as fn(&Vec<f64>) -> Result<f64, FunctionError>),
            config,
        )
        .unwrap()
    }

    #[test]
    fn spsa_over_the_farm_approaches_the_minimum() {
        let farm = quad_farm(2, 2);
        let spsa = Spsa::new(
            SpsaConfig::new(vec![0.0])
                .with_gains(0.2, 0.01)
                .with_max_iter(80)
                .with_xtol(1e-6)
                .with_seed(11),
        )
        .unwrap();

        let report = OptimizationDriver::new(farm, spsa, SingleEval)
            .run(100)
            .unwrap();

        let best = report.best_params.unwrap();
        assert!((best[0] - 3.0).abs() < 0.5, "best = {best:?}");
        assert!(report.best_objective.unwrap() < 0.5);
        // Two proposals per step, one payload each.
        assert_eq!(report.evaluations, report.steps.len() * 2);
    }

    #[test]
    fn grid_with_summed_instances_finds_the_joint_minimum() {
        // Objective per instance: (x - offset)^2; summed over offsets 0 and 1
        // the minimum is at x = 0.5.
        fn instance_quad(payload: &(Vec<f64>, f64)) -> Result<f64, FunctionError> {
            let (params, offset) = payload;
            Ok((params[0] - offset).powi(2))
        }
        let config = FarmConfig::default()
            .with_workers(2)
            .with_pipelining(2)
            .with_default_timeout(Duration::from_secs(10));
        let farm = TaskFarm::new(
            FnExecutor::new(instance_quad as fn(&(Vec<f64>, f64)) -> Result<f64, FunctionError>),
            config,
        )
        .unwrap();

        let grid = GridSearch::new(GridSpec::new().add_linspace(0.0, 1.0, 5), 2).unwrap();
        let split = SummedObjective::new(vec![0.0, 1.0]);
        let report = OptimizationDriver::new(farm, grid, split).run(10).unwrap();

        assert_eq!(report.stopped, RunStop::OptimizerFinished);
        assert_eq!(report.best_params.unwrap(), vec![0.5]);
        // 5 grid points, 2 instances each.
        assert_eq!(report.evaluations, 10);
    }

    #[test]
    fn objective_errors_reach_the_optimizer_without_ending_the_run() {
        fn flaky(p: &Vec<f64>) -> Result<f64, FunctionError> {
            if p[0] < 0.0 {
                Err(FunctionError::objective("negative domain"))
            } else {
                Ok(p[0])
            }
        }
        let config = FarmConfig::default()
            .with_workers(2)
            .with_default_timeout(Duration::from_secs(10));
        let farm = TaskFarm::new(
            FnExecutor::new(flaky as fn(&Vec<f64>) -> Result<f64, FunctionError>),
            config,
        )
        .unwrap();

        let grid = GridSearch::new(GridSpec::new().add_axis(vec![-1.0, 1.0, 2.0]), 1).unwrap();
        let report = OptimizationDriver::new(farm, grid, SingleEval)
            .run(10)
            .unwrap();

        assert_eq!(report.best_params.unwrap(), vec![1.0]);
        let recorded_errors: usize = report
            .steps
            .iter()
            .flat_map(|s| &s.objectives)
            .filter(|o| o.is_err())
            .count();
        assert_eq!(recorded_errors, 1);
    }

    #[test]
    fn report_serializes() {
        let farm = quad_farm(1, 1);
        let grid = GridSearch::new(GridSpec::new().add_axis(vec![3.0]), 1).unwrap();
        let report = OptimizationDriver::new(farm, grid, SingleEval)
            .run(5)
            .unwrap();

        let json = report.to_json().unwrap();
        assert!(json.contains("\"optimizer\": \"grid\""));
        let back: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
