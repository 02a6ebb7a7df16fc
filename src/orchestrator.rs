//! Hybrid optimizer orchestrator
//!
//! Sequences the three stages, checkpoints each one, resumes from the store
//! and produces the [`FinalResult`].
//!
//! ## State machine
//!
//! ```text
//! Init → Stage1Running → Stage1Done → Stage2Running → Stage2Done
//!      → Stage3Running → Stage3Done → Finalized
//!
//! any non-terminal state → Failed
//! any running state      → Cancelled
//! ```
//!
//! A stage starts only after the previous stage is checkpointed and its
//! candidates are selected. On resume, completed stages are replayed from
//! their checkpoints and the first incomplete stage continues from its
//! partial checkpoint if one exists.
//!
//! Toyota Way: Jidoka - a persistence fault stops the line. The orchestrator
//! enters `Failed`, makes one best-effort write of the in-memory stage and a
//! failure report, and never touches earlier checkpoints.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore};
use crate::config::OptimizerConfig;
use crate::evaluator::ObjectiveEvaluator;
use crate::outcome::{Diagnostics, FailureReport, FinalResult, RunSummary};
use crate::params::SearchSpace;
use crate::runner::StageRunner;
use crate::sampler::{CandidateReplay, TrialSampler};
use crate::selector::{select_top_k, CandidateSet};
use crate::trial::{Stage, StageResult};
use crate::validator::ParameterValidator;
use crate::{Error, Result};

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerState {
    /// Nothing started
    Init,
    /// Stage 1 running or being replayed
    Stage1Running,
    /// Stage 1 checkpointed
    Stage1Done,
    /// Stage 2 running or being replayed
    Stage2Running,
    /// Stage 2 checkpointed
    Stage2Done,
    /// Stage 3 running or being replayed
    Stage3Running,
    /// Stage 3 checkpointed
    Stage3Done,
    /// Final result persisted
    Finalized,
    /// Stopped by an error
    Failed,
    /// Stopped by cancellation; partial checkpoint saved
    Cancelled,
}

impl OptimizerState {
    /// Running state of `stage`.
    #[must_use]
    pub const fn running(stage: Stage) -> Self {
        match stage {
            Stage::Stage1 => Self::Stage1Running,
            Stage::Stage2 => Self::Stage2Running,
            Stage::Stage3 => Self::Stage3Running,
        }
    }

    /// Done state of `stage`.
    #[must_use]
    pub const fn done(stage: Stage) -> Self {
        match stage {
            Stage::Stage1 => Self::Stage1Done,
            Stage::Stage2 => Self::Stage2Done,
            Stage::Stage3 => Self::Stage3Done,
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Failed | Self::Cancelled)
    }

    /// Whether a stage is running.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(
            self,
            Self::Stage1Running | Self::Stage2Running | Self::Stage3Running
        )
    }

    /// Whether `self → next` is legal.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match next {
            Self::Failed => !self.is_terminal(),
            Self::Cancelled => self.is_running(),
            _ => matches!(
                (self, next),
                (Self::Init, Self::Stage1Running)
                    | (Self::Stage1Running, Self::Stage1Done)
                    | (Self::Stage1Done, Self::Stage2Running)
                    | (Self::Stage2Running, Self::Stage2Done)
                    | (Self::Stage2Done, Self::Stage3Running)
                    | (Self::Stage3Running, Self::Stage3Done)
                    | (Self::Stage3Done, Self::Finalized)
            ),
        }
    }

    /// Snake-case name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Stage1Running => "stage1_running",
            Self::Stage1Done => "stage1_done",
            Self::Stage2Running => "stage2_running",
            Self::Stage2Done => "stage2_done",
            Self::Stage3Running => "stage3_running",
            Self::Stage3Done => "stage3_done",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OptimizerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One objective per stage.
#[derive(Clone)]
pub struct StageEvaluators {
    /// Cheap proxy (replaceable)
    pub stage1: Arc<dyn ObjectiveEvaluator>,
    /// Lightweight backtest
    pub stage2: Arc<dyn ObjectiveEvaluator>,
    /// Full backtest
    pub stage3: Arc<dyn ObjectiveEvaluator>,
}

impl StageEvaluators {
    /// Bundle three evaluators.
    #[must_use]
    pub fn new(
        stage1: Arc<dyn ObjectiveEvaluator>,
        stage2: Arc<dyn ObjectiveEvaluator>,
        stage3: Arc<dyn ObjectiveEvaluator>,
    ) -> Self {
        Self {
            stage1,
            stage2,
            stage3,
        }
    }

    /// Evaluator for `stage`.
    #[must_use]
    pub fn for_stage(&self, stage: Stage) -> Arc<dyn ObjectiveEvaluator> {
        match stage {
            Stage::Stage1 => Arc::clone(&self.stage1),
            Stage::Stage2 => Arc::clone(&self.stage2),
            Stage::Stage3 => Arc::clone(&self.stage3),
        }
    }
}

impl fmt::Debug for StageEvaluators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageEvaluators")
            .field("stage1", &self.stage1.name())
            .field("stage2", &self.stage2.name())
            .field("stage3", &self.stage3.name())
            .finish()
    }
}

enum StageRun {
    Replayed(StageResult),
    Finished(StageResult),
    Interrupted(StageResult),
}

/// Staged multi-fidelity optimizer for one phase.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use hybrid_optimizer::checkpoint::MemoryCheckpointStore;
/// use hybrid_optimizer::config::OptimizerConfig;
/// use hybrid_optimizer::evaluator::SimulationEvaluator;
/// use hybrid_optimizer::orchestrator::{HybridOptimizer, OptimizerState, StageEvaluators};
/// use hybrid_optimizer::schema::ParameterSchema;
///
/// # fn main() -> hybrid_optimizer::Result<()> {
/// let config = OptimizerConfig::builder()
///     .phase(ParameterSchema::Risk)
///     .trials(30, 6, 2)
///     .build()?;
/// let proxy = Arc::new(SimulationEvaluator::for_schema(ParameterSchema::Risk, 1));
/// let evaluators = StageEvaluators::new(proxy.clone(), proxy.clone(), proxy);
///
/// let mut optimizer = HybridOptimizer::new(config, evaluators, Arc::new(MemoryCheckpointStore::new()))?;
/// let result = optimizer.run()?;
/// assert_eq!(optimizer.state(), OptimizerState::Finalized);
/// assert_eq!(result.phase(), "risk");
/// # Ok(())
/// # }
/// ```
pub struct HybridOptimizer {
    config: OptimizerConfig,
    evaluators: StageEvaluators,
    store: Arc<dyn CheckpointStore>,
    validator: ParameterValidator,
    space: SearchSpace,
    stage1_sampler: Option<Box<dyn TrialSampler>>,
    base_config: Arc<serde_json::Value>,
    cancel: CancellationToken,
    state: OptimizerState,
    history: Vec<OptimizerState>,
}

impl HybridOptimizer {
    /// Create an optimizer using the phase schema's search space and validator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(
        config: OptimizerConfig,
        evaluators: StageEvaluators,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            validator: config.phase.validator(),
            space: config.phase.search_space(),
            config,
            evaluators,
            store,
            stage1_sampler: None,
            base_config: Arc::new(serde_json::Value::Object(serde_json::Map::new())),
            cancel: CancellationToken::new(),
            state: OptimizerState::Init,
            history: vec![OptimizerState::Init],
        })
    }

    /// Optimizer storing checkpoints under `config.checkpoint_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn open(config: OptimizerConfig, evaluators: StageEvaluators) -> Result<Self> {
        let store = Arc::new(FileCheckpointStore::new(config.checkpoint_dir.clone()));
        Self::new(config, evaluators, store)
    }

    /// Observe an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Replace the validator.
    #[must_use]
    pub fn with_validator(mut self, validator: ParameterValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Replace the Stage 1 search space.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when a domain cannot be sampled.
    pub fn with_search_space(mut self, space: SearchSpace) -> Result<Self> {
        space.validate()?;
        self.space = space;
        Ok(self)
    }

    /// Use a custom Stage 1 sampler instead of the configured kind.
    #[must_use]
    pub fn with_stage1_sampler(mut self, sampler: Box<dyn TrialSampler>) -> Self {
        self.stage1_sampler = Some(sampler);
        self
    }

    /// Base configuration the backtest evaluators merge parameters into.
    #[must_use]
    pub fn with_base_config(mut self, base: serde_json::Value) -> Self {
        self.base_config = Arc::new(base);
        self
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> OptimizerState {
        self.state
    }

    /// Every state entered, oldest first.
    #[must_use]
    pub fn state_history(&self) -> &[OptimizerState] {
        &self.history
    }

    /// Token that cancels this run from another thread.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Phase name used for artifacts.
    #[must_use]
    pub const fn phase(&self) -> &'static str {
        self.config.phase.name()
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Run (or resume) all three stages.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTransition`] if the optimizer already ran
    /// - [`Error::Cancelled`] after cancellation; a partial checkpoint was saved
    /// - [`Error::StageFailed`] on persistence faults or when a stage yields
    ///   no viable trial; earlier checkpoints are intact
    pub fn run(&mut self) -> Result<FinalResult> {
        let phase = self.phase();
        info!(
            phase,
            stage1_trials = self.config.stage1_trials,
            stage2_top_k = self.config.stage2_top_k,
            stage3_top_k = self.config.stage3_top_k,
            seed = self.config.seed,
            resume = self.config.resume,
            "Optimization started"
        );

        let mut completed: Vec<Stage> = Vec::new();
        let mut results: Vec<StageResult> = Vec::with_capacity(Stage::ALL.len());
        let mut candidates: Option<CandidateSet> = None;
        let mut replayed_all = true;

        for stage in Stage::ALL {
            self.transition(OptimizerState::running(stage))?;
            if stage == Stage::Stage1 {
                if let Err(e) = self.discard_stale(phase) {
                    return Err(self.fail(stage, e, None, &completed));
                }
            }

            let result = match self.execute_stage(stage, candidates.as_ref()) {
                Ok(StageRun::Replayed(result)) => result,
                Ok(StageRun::Finished(result)) => {
                    replayed_all = false;
                    if let Err(e) = self.store.save(&Checkpoint::complete(phase, &result)) {
                        return Err(self.fail(stage, e, Some(&result), &completed));
                    }
                    result
                }
                Ok(StageRun::Interrupted(result)) => {
                    return Err(self.interrupt(stage, &result, &completed));
                }
                Err(e) => return Err(self.fail(stage, e, None, &completed)),
            };
            completed.push(stage);
            self.transition(OptimizerState::done(stage))?;

            if let Some(next) = stage.next() {
                let selected = select_top_k(&result, self.config.trials_for(next));
                if selected.is_empty() {
                    return Err(self.fail(stage, Error::NoViableTrials { stage }, None, &completed));
                }
                candidates = Some(selected);
            }
            results.push(result);
        }

        self.finalize(phase, &results, replayed_all, &completed)
    }

    fn transition(&mut self, next: OptimizerState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(phase = self.phase(), from = %self.state, to = %next, "State transition");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    fn discard_stale(&self, phase: &str) -> Result<()> {
        for stage in Stage::ALL.into_iter().filter(|s| !self.config.reuses(*s)) {
            self.store.discard(phase, stage)?;
        }
        Ok(())
    }

    fn execute_stage(&mut self, stage: Stage, candidates: Option<&CandidateSet>) -> Result<StageRun> {
        let phase = self.phase();
        let prior = self.store.load(phase, stage)?;
        if let Some(checkpoint) = &prior {
            if checkpoint.is_complete() {
                info!(
                    phase,
                    stage = %stage,
                    trials = checkpoint.trials().len(),
                    "Replaying completed stage from checkpoint"
                );
                return Ok(StageRun::Replayed(checkpoint.clone().into_result()));
            }
        }

        let (mut sampler, n_trials): (Box<dyn TrialSampler>, usize) = match (stage, candidates) {
            (Stage::Stage1, _) => {
                let sampler = match self.stage1_sampler.take() {
                    Some(sampler) => sampler,
                    None => self.config.sampler.build(self.space.clone(), self.config.seed),
                };
                (sampler, self.config.stage1_trials)
            }
            (_, Some(set)) => (Box::new(CandidateReplay::new(set)), set.len()),
            (_, None) => {
                return Err(Error::InvalidInput(format!(
                    "{stage} requires candidates promoted from the previous stage"
                )))
            }
        };

        let evaluator = self.evaluators.for_stage(stage);
        let runner = StageRunner::from_config(stage, &self.config)
            .with_cancellation(self.cancel.clone())
            .with_base_config(Arc::clone(&self.base_config));

        let outcome = match prior {
            Some(partial) => runner.resume_stage(
                partial.into_result(),
                n_trials,
                sampler.as_mut(),
                &evaluator,
                &self.validator,
            )?,
            None => runner.run_stage(n_trials, sampler.as_mut(), &evaluator, &self.validator)?,
        };

        Ok(if outcome.interrupted {
            StageRun::Interrupted(outcome.result)
        } else {
            StageRun::Finished(outcome.result)
        })
    }

    fn interrupt(&mut self, stage: Stage, partial: &StageResult, completed: &[Stage]) -> Error {
        let phase = self.phase();
        if let Err(e) = self.store.save(&Checkpoint::partial(phase, partial)) {
            return self.fail(stage, e, None, completed);
        }
        if let Err(e) = self.transition(OptimizerState::Cancelled) {
            error!(phase, error = %e, "Could not enter cancelled state");
        }
        let summary = RunSummary::new(phase, completed.to_vec(), Some(stage));
        warn!(
            phase,
            stage = %stage,
            recorded = partial.len(),
            abandoned = partial.summary().n_abandoned,
            "Run cancelled; partial checkpoint saved"
        );
        Error::Cancelled(summary)
    }

    fn fail(&mut self, stage: Stage, cause: Error, partial: Option<&StageResult>, completed: &[Stage]) -> Error {
        let phase = self.phase();
        let failed_in = self.state;
        error!(phase, stage = %stage, state = %failed_in, error = %cause, "Stage failed");
        if let Err(e) = self.transition(OptimizerState::Failed) {
            error!(phase, error = %e, "Could not enter failed state");
        }

        if let Some(partial) = partial {
            if let Err(e) = self.store.save(&Checkpoint::partial(phase, partial)) {
                warn!(phase, stage = %stage, error = %e, "Best-effort partial checkpoint failed");
            }
        }

        let summary = RunSummary::new(phase, completed.to_vec(), Some(stage));
        let report = FailureReport::new(
            summary.clone(),
            failed_in.name(),
            cause.to_string(),
            partial.map_or(0, StageResult::len),
        );
        if let Err(e) = self.store.save_failure(&report) {
            warn!(phase, error = %e, "Failure report could not be written");
        }

        Error::StageFailed {
            summary,
            source: Box::new(cause),
        }
    }

    fn finalize(
        &mut self,
        phase: &str,
        results: &[StageResult],
        replayed_all: bool,
        completed: &[Stage],
    ) -> Result<FinalResult> {
        if replayed_all {
            match self.store.load_final(phase) {
                Ok(Some(existing)) => {
                    info!(phase, "All stages already complete; returning stored final result");
                    self.transition(OptimizerState::Finalized)?;
                    return Ok(existing);
                }
                Ok(None) => {}
                Err(e) => warn!(phase, error = %e, "Stored final result unreadable; recomputing"),
            }
        }

        let Some(stage3) = results.last() else {
            let cause = Error::InvalidInput("no stage results to finalize".to_string());
            return Err(self.fail(Stage::Stage3, cause, None, completed));
        };
        let diagnostics = Diagnostics::from_stage3(
            stage3,
            self.config.divergence_threshold,
            self.evaluators.stage1.name(),
        );
        match diagnostics.rank_agreement {
            Some(rho) if diagnostics.diverged => warn!(
                phase,
                rho,
                threshold = diagnostics.divergence_threshold,
                compared = diagnostics.compared_trials,
                "Stage 1 ranking diverges from Stage 3; the proxy objective may be misleading"
            ),
            Some(rho) => info!(phase, rho, compared = diagnostics.compared_trials, "Stage 1/Stage 3 rank agreement"),
            None => debug!(phase, "Too few Stage 3 trials to measure rank agreement"),
        }

        let stages: Vec<&StageResult> = results.iter().collect();
        let final_result = match FinalResult::from_stages(phase, &stages, diagnostics) {
            Ok(result) => result,
            Err(e) => return Err(self.fail(Stage::Stage3, e, None, completed)),
        };
        if let Err(e) = self.store.save_final(&final_result) {
            return Err(self.fail(Stage::Stage3, e, None, completed));
        }
        self.transition(OptimizerState::Finalized)?;

        info!(
            phase,
            best_value = final_result.best_value(),
            total_duration_secs = final_result.total_duration_seconds(),
            "Optimization finalized"
        );
        Ok(final_result)
    }
}

impl fmt::Debug for HybridOptimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridOptimizer")
            .field("phase", &self.phase())
            .field("state", &self.state)
            .field("evaluators", &self.evaluators)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_transitions() {
        use OptimizerState::*;
        let chain = [
            Init,
            Stage1Running,
            Stage1Done,
            Stage2Running,
            Stage2Done,
            Stage3Running,
            Stage3Done,
            Finalized,
        ];
        for pair in chain.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!Init.can_transition_to(Stage2Running));
        assert!(!Stage1Done.can_transition_to(Stage1Running));
        assert!(!Finalized.can_transition_to(Stage1Running));
    }

    #[test]
    fn test_failed_and_cancelled_reachability() {
        use OptimizerState::*;
        assert!(Stage2Running.can_transition_to(Failed));
        assert!(Stage3Done.can_transition_to(Failed));
        assert!(!Finalized.can_transition_to(Failed));
        assert!(Stage1Running.can_transition_to(Cancelled));
        assert!(!Stage1Done.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Failed));
    }
}
