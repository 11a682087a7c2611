use std::time::Duration;

use croft_engine::TaskFarm;
use croft_optimizer::{OptimizationDriver, SingleEval, Spsa, SpsaConfig};
use croft_types::{FarmConfig, FnExecutor, FunctionError};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    println!("Croft SPSA example: minimizing (x - 3)^2 + (y + 1)^2");

    // The "expensive" objective, farmed out across worker threads.
    let executor = FnExecutor::new(|params: &Vec<f64>| -> Result<f64, FunctionError> {
        std::thread::sleep(Duration::from_millis(5)); // simulate real work
        Ok((params[0] - 3.0).powi(2) + (params[1] + 1.0).powi(2))
    });

    let farm_config = FarmConfig::default()
        .with_workers(4)
        .with_pipelining(2)
        .with_default_timeout(Duration::from_secs(30));
    let farm = TaskFarm::new(executor, farm_config)?;
    println!("Farm started with {} workers", farm.config().worker_count);

    let spsa = Spsa::new(
        SpsaConfig::new(vec![0.0, 0.0])
            .with_gains(0.2, 0.01)
            .with_max_iter(150)
            .with_xtol(1e-6),
    )?;

    let report = OptimizationDriver::new(farm, spsa, SingleEval).run(200)?;

    println!("Run {} finished: {:?}", report.run_id, report.stopped);
    println!(
        "{} steps, {} farmed evaluations",
        report.steps.len(),
        report.evaluations
    );
    if let (Some(params), Some(objective)) = (&report.best_params, report.best_objective) {
        println!("Best point: {params:?} (objective {objective:.6})");
        println!("Expected:   [3.0, -1.0]");
    }

    Ok(())
}
