//! Staged Search: three-fidelity optimization with a toy backtest engine
//!
//! Runs one phase end to end:
//! - Stage 1: analytic proxy on a rayon pool
//! - Stage 2/3: a synthetic backtest engine that reads the merged trial config
//! - Dry-run integration of the winner into a demo destination config
//!
//! Run with: cargo run --example staged_search -- [risk|strategy|ml] [--resume]
//!
//! Set `RUST_LOG=hybrid_optimizer=debug` for per-trial logs.

use std::sync::Arc;

use anyhow::Context;
use hybrid_optimizer::aggregator::ResultAggregator;
use hybrid_optimizer::dotted::flatten;
use hybrid_optimizer::evaluator::{
    BacktestEngine, BacktestEvaluator, BacktestReport, BacktestRequest, BacktestWindow,
    SimulationEvaluator,
};
use hybrid_optimizer::logging::init_tracing;
use hybrid_optimizer::{HybridOptimizer, OptimizerConfig, ParameterSchema, StageEvaluators};

/// Scores a config by its distance from the schema's reference vector,
/// trading roughly six times a day over the sampled window.
struct ToyEngine {
    schema: ParameterSchema,
}

impl BacktestEngine for ToyEngine {
    fn run(&self, request: &BacktestRequest) -> anyhow::Result<BacktestReport> {
        let text = std::fs::read_to_string(&request.config_path)
            .with_context(|| format!("reading {}", request.config_path.display()))?;
        let config = flatten(&serde_json::from_str(&text)?);

        let reference = self.schema.reference_vector();
        let mut distance = 0.0;
        for (key, target) in reference.iter() {
            if let (Some(x), Some(r)) = (config.get(key).and_then(serde_json::Value::as_f64), target.as_f64()) {
                distance += ((x - r) / r.abs().max(1.0)).powi(2);
            }
        }

        let days = request.window.lookback_days.map_or(365.0, f64::from);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let n_trades = (days * request.window.sample_ratio * 6.0) as u64;
        Ok(BacktestReport {
            sharpe_ratio: 2.5 - 4.0 * distance,
            total_return: 0.3 - distance,
            max_drawdown: (0.05 + distance).min(0.9),
            n_trades,
        })
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let mut args = std::env::args().skip(1);
    let schema: ParameterSchema = args.next().as_deref().unwrap_or("risk").parse()?;
    let resume = args.any(|a| a == "--resume");

    let root = std::env::temp_dir().join("hybrid-optimizer-demo");
    let config = OptimizerConfig::builder()
        .phase(schema)
        .trials(200, 12, 4)
        .seed(42)
        .stage1_workers(4)
        .checkpoint_dir(root.join("results"))
        .scratch_dir(root.join("scratch"))
        .resume(resume)
        .build()?;

    println!("=== Hybrid Optimizer: phase '{schema}' ===\n");
    println!("  Stage 1: {} proxy trials", config.stage1_trials);
    println!("  Stage 2: top {} on a lightweight backtest", config.stage2_top_k);
    println!("  Stage 3: top {} on the full backtest\n", config.stage3_top_k);

    let engine: Arc<dyn BacktestEngine> = Arc::new(ToyEngine { schema });
    let evaluators = StageEvaluators::new(
        Arc::new(SimulationEvaluator::for_schema(schema, 42)),
        Arc::new(BacktestEvaluator::lightweight(Arc::clone(&engine))),
        Arc::new(BacktestEvaluator::full(engine)),
    );
    let base = serde_json::json!({
        "exchange": "paper",
        "backtest": {"fees_bps": 7.5, "window_days": BacktestWindow::LIGHTWEIGHT.lookback_days},
    });

    let mut optimizer = HybridOptimizer::open(config, evaluators)?.with_base_config(base);
    let result = optimizer.run()?;

    println!("\n=== Winner (from Stage 3) ===");
    println!("  Score: {:.4}", result.best_value());
    for (key, value) in result.best_params().iter() {
        println!("  {key} = {value}");
    }
    if let Some(diagnostics) = result.diagnostics() {
        match diagnostics.rank_agreement {
            Some(rho) => println!("\n  Stage 1 / Stage 3 rank agreement: {rho:.3}"),
            None => println!("\n  Stage 1 / Stage 3 rank agreement: n/a"),
        }
    }

    let report = ResultAggregator::new(root.join("config.json"))
        .dry_run(true)
        .merge(std::slice::from_ref(&result))?;
    println!("\n=== Integration preview ({} changes) ===", report.changes.len());
    for change in &report.changes {
        println!("  {}: {:?} -> {:?}", change.key, change.before, change.after);
    }

    Ok(())
}
