//! Backtest-backed objectives (Stage 2 lightweight, Stage 3 full)
//!
//! The backtest itself is an external collaborator behind [`BacktestEngine`].
//! For every trial the evaluator:
//!
//! 1. merges the parameters into the base configuration (dotted keys expanded)
//! 2. writes the merged document to a per-trial file in the scratch directory
//! 3. holds the production-model slot while the engine runs; the trial
//!    clock is paused while queueing for it, and the wait is bounded by the
//!    trial budget
//! 4. converts the engine report into a risk-adjusted score
//!
//! The per-trial file is removed when the evaluation ends, whatever the outcome.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dotted;
use crate::error::EvaluationError;
use crate::params::ParameterVector;
use crate::trial::Stage;

use super::{EvalContext, Fidelity, ObjectiveEvaluator};

const SLOT_POLL: Duration = Duration::from_millis(5);

/// Data window handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BacktestWindow {
    /// Most recent days to replay (`None` = complete history)
    pub lookback_days: Option<u32>,
    /// Fraction of bars sampled, in `(0, 1]`
    pub sample_ratio: f64,
}

impl BacktestWindow {
    /// Short window on sampled data.
    pub const LIGHTWEIGHT: Self = Self {
        lookback_days: Some(30),
        sample_ratio: 0.25,
    };

    /// Complete history, every bar.
    pub const FULL: Self = Self {
        lookback_days: None,
        sample_ratio: 1.0,
    };
}

/// What the engine is asked to run.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestRequest {
    /// Merged configuration file for this trial
    pub config_path: PathBuf,
    /// Data window
    pub window: BacktestWindow,
    /// Stage requesting the run
    pub stage: Stage,
    /// Trial requesting the run
    pub trial_id: u64,
}

/// Engine output used for scoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    /// Annualized Sharpe ratio
    pub sharpe_ratio: f64,
    /// Total return as a fraction
    pub total_return: f64,
    /// Maximum drawdown as a fraction
    pub max_drawdown: f64,
    /// Trades executed
    pub n_trades: u64,
}

/// External backtest engine.
pub trait BacktestEngine: Send + Sync {
    /// Run one backtest.
    ///
    /// # Errors
    ///
    /// Any engine fault; recorded as a failed trial.
    fn run(&self, request: &BacktestRequest) -> anyhow::Result<BacktestReport>;
}

/// How a report becomes a score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringRules {
    /// Score lost per unit of drawdown
    pub drawdown_penalty: f64,
    /// Fewer trades than this is an evaluation error
    pub min_trades: u64,
}

impl Default for ScoringRules {
    fn default() -> Self {
        Self {
            drawdown_penalty: 2.0,
            min_trades: 10,
        }
    }
}

/// `sharpe - drawdown_penalty * |max_drawdown|`.
///
/// # Errors
///
/// - [`EvaluationError::InsufficientTrades`] below `rules.min_trades`
/// - [`EvaluationError::InvalidData`] when the report holds NaN or infinity
pub fn risk_adjusted_score(report: &BacktestReport, rules: &ScoringRules) -> Result<f64, EvaluationError> {
    if report.n_trades < rules.min_trades {
        return Err(EvaluationError::InsufficientTrades {
            trades: report.n_trades,
            required: rules.min_trades,
        });
    }
    if !report.sharpe_ratio.is_finite() || !report.max_drawdown.is_finite() {
        return Err(EvaluationError::InvalidData(format!(
            "non-finite report: sharpe={}, max_drawdown={}",
            report.sharpe_ratio, report.max_drawdown
        )));
    }
    Ok(report.sharpe_ratio - rules.drawdown_penalty * report.max_drawdown.abs())
}

/// Per-trial configuration file, removed on drop.
struct TrialConfigFile {
    path: PathBuf,
}

impl TrialConfigFile {
    fn write(dir: &Path, stage: Stage, trial_id: u64, config: &serde_json::Value) -> Result<Self, EvaluationError> {
        fs::create_dir_all(dir).map_err(EvaluationError::ConfigWrite)?;
        let path = dir.join(format!(
            "{stage}_trial_{trial_id:05}_{}.json",
            std::process::id()
        ));
        let bytes = serde_json::to_vec_pretty(config)
            .map_err(|e| EvaluationError::InvalidData(format!("config serialization: {e}")))?;
        fs::write(&path, bytes).map_err(EvaluationError::ConfigWrite)?;
        Ok(Self { path })
    }
}

impl Drop for TrialConfigFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "trial config cleanup failed");
        }
    }
}

/// Scores parameters by running the external backtest engine.
#[derive(Clone)]
pub struct BacktestEvaluator {
    engine: Arc<dyn BacktestEngine>,
    window: BacktestWindow,
    fidelity: Fidelity,
    rules: ScoringRules,
    model_slot: Arc<Mutex<()>>,
    slot_wait: Option<Duration>,
}

impl BacktestEvaluator {
    /// Stage 2 evaluator: [`BacktestWindow::LIGHTWEIGHT`].
    #[must_use]
    pub fn lightweight(engine: Arc<dyn BacktestEngine>) -> Self {
        Self::with_window(engine, BacktestWindow::LIGHTWEIGHT, Fidelity::Lightweight)
    }

    /// Stage 3 evaluator: [`BacktestWindow::FULL`].
    #[must_use]
    pub fn full(engine: Arc<dyn BacktestEngine>) -> Self {
        Self::with_window(engine, BacktestWindow::FULL, Fidelity::Full)
    }

    /// Evaluator with an explicit window.
    #[must_use]
    pub fn with_window(engine: Arc<dyn BacktestEngine>, window: BacktestWindow, fidelity: Fidelity) -> Self {
        Self {
            engine,
            window,
            fidelity,
            rules: ScoringRules::default(),
            model_slot: Arc::new(Mutex::new(())),
            slot_wait: None,
        }
    }

    /// Replace the scoring rules.
    #[must_use]
    pub const fn with_rules(mut self, rules: ScoringRules) -> Self {
        self.rules = rules;
        self
    }

    /// Share the production-model slot with other evaluators.
    ///
    /// Stage 2 and Stage 3 evaluators built over the same slot never run
    /// their engines at the same time.
    #[must_use]
    pub fn with_model_slot(mut self, slot: Arc<Mutex<()>>) -> Self {
        self.model_slot = slot;
        self
    }

    /// Bound the time a trial may queue for the model slot.
    ///
    /// Defaults to the trial budget from [`EvalContext::timeout`]; with
    /// neither set the trial waits until the slot is free.
    #[must_use]
    pub const fn with_slot_wait(mut self, wait: Duration) -> Self {
        self.slot_wait = Some(wait);
        self
    }

    /// Get the data window.
    #[must_use]
    pub const fn window(&self) -> BacktestWindow {
        self.window
    }

    fn acquire_slot(&self, ctx: &EvalContext) -> Result<MutexGuard<'_, ()>, EvaluationError> {
        ctx.clock.pause();
        let queued = Instant::now();
        loop {
            match self.model_slot.try_lock() {
                Ok(guard) => {
                    ctx.clock.resume();
                    return Ok(guard);
                }
                Err(TryLockError::Poisoned(poisoned)) => {
                    ctx.clock.resume();
                    return Ok(poisoned.into_inner());
                }
                Err(TryLockError::WouldBlock) => {}
            }
            if let Some(limit) = self.slot_wait.or(ctx.timeout) {
                if queued.elapsed() >= limit {
                    debug!(stage = %ctx.stage, trial_id = ctx.trial_id, "model slot still busy");
                    return Err(EvaluationError::Timeout(limit));
                }
            }
            thread::sleep(SLOT_POLL);
        }
    }
}

impl std::fmt::Debug for BacktestEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BacktestEvaluator")
            .field("window", &self.window)
            .field("fidelity", &self.fidelity)
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl ObjectiveEvaluator for BacktestEvaluator {
    fn evaluate(&self, params: &ParameterVector, ctx: &EvalContext) -> Result<f64, EvaluationError> {
        let merged = dotted::inject(&ctx.base_config, params)
            .map_err(|e| EvaluationError::InvalidData(e.to_string()))?;
        let config_file = TrialConfigFile::write(&ctx.scratch_dir, ctx.stage, ctx.trial_id, &merged)?;

        let request = BacktestRequest {
            config_path: config_file.path.clone(),
            window: self.window,
            stage: ctx.stage,
            trial_id: ctx.trial_id,
        };

        let report = {
            let _slot = self.acquire_slot(ctx)?;
            self.engine.run(&request)?
        };
        debug!(
            stage = %ctx.stage,
            trial_id = ctx.trial_id,
            sharpe = report.sharpe_ratio,
            max_drawdown = report.max_drawdown,
            trades = report.n_trades,
            "backtest finished"
        );

        risk_adjusted_score(&report, &self.rules)
    }

    fn fidelity(&self) -> Fidelity {
        self.fidelity
    }

    fn name(&self) -> &str {
        match self.fidelity {
            Fidelity::Full => "full_backtest",
            _ => "lightweight_backtest",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Reads the merged config back and reports `sharpe = risk.alpha`.
    struct EchoEngine;

    impl BacktestEngine for EchoEngine {
        fn run(&self, request: &BacktestRequest) -> anyhow::Result<BacktestReport> {
            let doc: serde_json::Value = serde_json::from_slice(&fs::read(&request.config_path)?)?;
            let alpha = doc["risk"]["alpha"]
                .as_f64()
                .ok_or_else(|| anyhow::anyhow!("risk.alpha missing"))?;
            Ok(BacktestReport {
                sharpe_ratio: alpha,
                total_return: 0.1,
                max_drawdown: 0.1,
                n_trades: 50,
            })
        }
    }

    struct FailingEngine;

    impl BacktestEngine for FailingEngine {
        fn run(&self, _request: &BacktestRequest) -> anyhow::Result<BacktestReport> {
            anyhow::bail!("data feed unavailable")
        }
    }

    fn ctx(dir: &Path) -> EvalContext {
        EvalContext::new(
            Arc::new(json!({"risk": {"alpha": 0.0, "beta": 1.0}})),
            dir,
            Stage::Stage2,
            3,
        )
    }

    #[test]
    fn test_params_reach_engine_and_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let eval = BacktestEvaluator::lightweight(Arc::new(EchoEngine));
        let score = eval
            .evaluate(&ParameterVector::new().with("risk.alpha", 1.5), &ctx(dir.path()))
            .unwrap();
        assert!((score - (1.5 - 0.2)).abs() < 1e-12);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_engine_error_becomes_evaluation_error() {
        let dir = tempfile::tempdir().unwrap();
        let eval = BacktestEvaluator::full(Arc::new(FailingEngine));
        let err = eval.evaluate(&ParameterVector::new(), &ctx(dir.path())).unwrap_err();
        assert!(matches!(err, EvaluationError::Engine(_)));
        assert!(err.to_string().contains("data feed unavailable"));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_too_few_trades() {
        let report = BacktestReport {
            sharpe_ratio: 3.0,
            total_return: 0.5,
            max_drawdown: 0.01,
            n_trades: 2,
        };
        let err = risk_adjusted_score(&report, &ScoringRules::default()).unwrap_err();
        assert!(matches!(err, EvaluationError::InsufficientTrades { trades: 2, required: 10 }));
    }

    #[test]
    fn test_windows() {
        let light = BacktestEvaluator::lightweight(Arc::new(EchoEngine));
        let full = BacktestEvaluator::full(Arc::new(EchoEngine));
        assert!(light.window().sample_ratio < full.window().sample_ratio);
        assert_eq!(full.fidelity(), Fidelity::Full);
    }
}
