//! Objective evaluators
//!
//! An [`ObjectiveEvaluator`] scores one parameter vector; higher is better.
//! Three fidelities share the interface:
//!
//! | Fidelity      | Evaluator                          | Cost         |
//! |---------------|------------------------------------|--------------|
//! | `Simulation`  | [`SimulationEvaluator`]            | microseconds |
//! | `Lightweight` | [`BacktestEvaluator::lightweight`] | seconds      |
//! | `Full`        | [`BacktestEvaluator::full`]        | minutes      |
//!
//! Evaluators receive everything they need through [`EvalContext`]; there is
//! no process-wide "current parameters" state. Errors are reported as
//! [`EvaluationError`] and absorbed by the stage runner.

mod backtest;
mod simulation;

pub use backtest::{
    risk_adjusted_score, BacktestEngine, BacktestEvaluator, BacktestReport, BacktestRequest,
    BacktestWindow, ScoringRules,
};
pub use simulation::SimulationEvaluator;

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::EvaluationError;
use crate::params::ParameterVector;
use crate::trial::Stage;

/// Cost/trust tier of an evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fidelity {
    /// Analytic proxy
    Simulation,
    /// Short-window backtest on sampled data
    Lightweight,
    /// Complete backtest
    Full,
}

impl fmt::Display for Fidelity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Simulation => "simulation",
            Self::Lightweight => "lightweight",
            Self::Full => "full",
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum ClockState {
    Running(Instant),
    Paused,
}

/// Measures the part of a trial that counts against its time budget.
///
/// The clock runs from creation. An evaluator that has to queue for a
/// shared resource pauses it while waiting and resumes it once the resource
/// is held; resuming restarts the budget. Clones share one clock.
#[derive(Debug, Clone)]
pub struct TrialClock {
    state: Arc<Mutex<ClockState>>,
}

impl TrialClock {
    /// A clock running from now.
    #[must_use]
    pub fn start() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState::Running(Instant::now()))),
        }
    }

    /// Stop counting until [`TrialClock::resume`].
    pub fn pause(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ClockState::Paused;
    }

    /// Restart the budget from now.
    pub fn resume(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ClockState::Running(Instant::now());
    }

    /// Budget used so far; `None` while paused.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        match *self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            ClockState::Running(since) => Some(since.elapsed()),
            ClockState::Paused => None,
        }
    }
}

impl Default for TrialClock {
    fn default() -> Self {
        Self::start()
    }
}

/// Per-trial evaluation context.
#[derive(Debug, Clone)]
pub struct EvalContext {
    /// Snapshot of the base configuration the parameters are merged into
    pub base_config: Arc<serde_json::Value>,
    /// Directory for per-trial scratch files
    pub scratch_dir: PathBuf,
    /// Stage being run
    pub stage: Stage,
    /// Trial being evaluated
    pub trial_id: u64,
    /// Per-trial budget enforced by the runner, if any
    pub timeout: Option<Duration>,
    /// Budget clock watched by the runner
    pub clock: TrialClock,
}

impl EvalContext {
    /// Create a context.
    #[must_use]
    pub fn new(
        base_config: Arc<serde_json::Value>,
        scratch_dir: impl Into<PathBuf>,
        stage: Stage,
        trial_id: u64,
    ) -> Self {
        Self {
            base_config,
            scratch_dir: scratch_dir.into(),
            stage,
            trial_id,
            timeout: None,
            clock: TrialClock::start(),
        }
    }

    /// Set the per-trial budget.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Same environment, different trial, fresh clock.
    #[must_use]
    pub fn for_trial(&self, trial_id: u64) -> Self {
        Self {
            trial_id,
            clock: TrialClock::start(),
            ..self.clone()
        }
    }
}

/// Scores a parameter vector.
pub trait ObjectiveEvaluator: Send + Sync {
    /// Score `params`; higher is better.
    ///
    /// # Errors
    ///
    /// Any [`EvaluationError`]; the caller records the trial as failed.
    fn evaluate(&self, params: &ParameterVector, ctx: &EvalContext)
        -> Result<f64, EvaluationError>;

    /// Tier of this evaluator.
    fn fidelity(&self) -> Fidelity;

    /// Short name for logs.
    fn name(&self) -> &str {
        "objective"
    }
}

type ObjectiveFn = dyn Fn(&ParameterVector, &EvalContext) -> Result<f64, EvaluationError> + Send + Sync;

/// Adapts a closure into an [`ObjectiveEvaluator`].
pub struct FnEvaluator {
    name: String,
    fidelity: Fidelity,
    func: Box<ObjectiveFn>,
}

impl FnEvaluator {
    /// Wrap `func`.
    pub fn new<F>(name: impl Into<String>, fidelity: Fidelity, func: F) -> Self
    where
        F: Fn(&ParameterVector, &EvalContext) -> Result<f64, EvaluationError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            fidelity,
            func: Box::new(func),
        }
    }
}

impl fmt::Debug for FnEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnEvaluator")
            .field("name", &self.name)
            .field("fidelity", &self.fidelity)
            .finish_non_exhaustive()
    }
}

impl ObjectiveEvaluator for FnEvaluator {
    fn evaluate(&self, params: &ParameterVector, ctx: &EvalContext) -> Result<f64, EvaluationError> {
        (self.func)(params, ctx)
    }

    fn fidelity(&self) -> Fidelity {
        self.fidelity
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_evaluator_delegates() {
        let eval = FnEvaluator::new("sum", Fidelity::Simulation, |p, _| {
            Ok(p.get_f64("a").unwrap_or(0.0) + p.get_f64("b").unwrap_or(0.0))
        });
        let ctx = EvalContext::new(Arc::new(serde_json::json!({})), "/tmp", Stage::Stage1, 0);
        let score = eval
            .evaluate(&ParameterVector::new().with("a", 1.0).with("b", 2.0), &ctx)
            .unwrap();
        assert!((score - 3.0).abs() < f64::EPSILON);
        assert_eq!(eval.name(), "sum");
        assert_eq!(ctx.for_trial(9).trial_id, 9);
    }

    #[test]
    fn test_clock_pause_and_resume() {
        let clock = TrialClock::start();
        std::thread::sleep(Duration::from_millis(20));
        assert!(clock.elapsed().unwrap() >= Duration::from_millis(20));

        let shared = clock.clone();
        shared.pause();
        assert_eq!(clock.elapsed(), None);
        shared.resume();
        assert!(clock.elapsed().unwrap() < Duration::from_millis(20));
    }
}
