//! Stage runner
//!
//! Drives `n_trials` trials through sampler → validator → evaluator and
//! collects them into a [`StageResult`].
//!
//! Toyota Way Principles:
//! - **Jidoka**: a failing trial stops only itself. Validator rejections,
//!   evaluator errors, panics, non-finite scores and timeouts all become
//!   failed trials with the sentinel score; the stage carries on.
//! - **Heijunka**: Stage 1 evaluates in fixed-size batches on a bounded
//!   rayon pool; Stage 2/3 evaluate one trial at a time.
//!
//! ## Execution modes
//!
//! - [`ExecutionMode::Parallel`]: proposals for a batch are drawn
//!   sequentially, evaluated in parallel, and recorded in trial-id order.
//!   Cancellation is checked between batches.
//! - [`ExecutionMode::Sequential`]: each trial runs on a watched worker
//!   thread. The runner polls for completion, the per-trial timeout and
//!   cancellation. After cancellation the in-flight trial gets a grace period
//!   and is then abandoned: its id is consumed, nothing is recorded.
//!   A timed-out or abandoned worker thread is detached, never killed.
//!   The timeout counts [`TrialClock`](crate::evaluator::TrialClock) time,
//!   so a trial queued behind a detached worker is not charged for the wait.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::config::OptimizerConfig;
use crate::error::EvaluationError;
use crate::evaluator::{EvalContext, ObjectiveEvaluator};
use crate::params::ParameterVector;
use crate::sampler::{Proposal, TrialSampler};
use crate::trial::{
    FailureReason, LineageEntry, Stage, StageResult, StageResultBuilder, TrialRecord,
};
use crate::validator::ParameterValidator;
use crate::{Error, Result};

/// How trials of a stage are scheduled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExecutionMode {
    /// Batches of `workers` trials evaluated concurrently
    Parallel {
        /// Pool size (>= 1)
        workers: usize,
    },
    /// One trial at a time on a watched worker thread
    Sequential {
        /// Per-trial budget
        trial_timeout: Option<Duration>,
        /// Time an in-flight trial may keep running after cancellation
        cancel_grace: Duration,
        /// Wait granularity
        poll_interval: Duration,
    },
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Sequential {
            trial_timeout: None,
            cancel_grace: Duration::from_secs(30),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// When progress lines are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressPolicy {
    /// Log every N-th trial
    pub every: usize,
    /// Log each of the first N trials
    pub head: usize,
}

impl Default for ProgressPolicy {
    fn default() -> Self {
        Self { every: 50, head: 5 }
    }
}

/// Stage result plus whether the run stopped early on cancellation.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    /// Trials recorded so far (complete when `interrupted` is false)
    pub result: StageResult,
    /// Cancellation stopped the stage before `n_trials`
    pub interrupted: bool,
}

enum Watched {
    Finished(std::result::Result<f64, EvaluationError>, Duration),
    TimedOut(Duration),
    Abandoned,
}

struct ProgressTracker {
    policy: ProgressPolicy,
    stage: Stage,
    total: usize,
    done: usize,
    best: Option<(u64, f64)>,
}

impl ProgressTracker {
    /// Tracker that already counts the trials recovered from a checkpoint.
    fn new(policy: ProgressPolicy, stage: Stage, total: usize, prior: &[TrialRecord]) -> Self {
        let mut tracker = Self {
            policy,
            stage,
            total,
            done: prior.len(),
            best: None,
        };
        for record in prior {
            tracker.consider(record);
        }
        tracker
    }

    fn consider(&mut self, record: &TrialRecord) {
        if record.is_promotable() {
            let better = self.best.map_or(true, |(id, score)| {
                record.score() > score || (record.score() == score && record.trial_id() < id)
            });
            if better {
                self.best = Some((record.trial_id(), record.score()));
            }
        }
    }

    fn observe(&mut self, record: &TrialRecord) {
        self.done += 1;
        self.consider(record);
        if self.done <= self.policy.head || self.done % self.policy.every.max(1) == 0 {
            info!(
                stage = %self.stage,
                done = self.done,
                total = self.total,
                trial_id = record.trial_id(),
                score = record.score(),
                best = self.best.map(|(_, s)| s),
                best_trial = self.best.map(|(id, _)| id),
                "Progress"
            );
        }
    }
}

/// Runs the trials of one stage.
#[derive(Debug, Clone)]
pub struct StageRunner {
    stage: Stage,
    mode: ExecutionMode,
    progress: ProgressPolicy,
    cancel: CancellationToken,
    base_config: Arc<serde_json::Value>,
    scratch_dir: PathBuf,
}

impl StageRunner {
    /// Sequential runner with default settings.
    #[must_use]
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            mode: ExecutionMode::default(),
            progress: ProgressPolicy::default(),
            cancel: CancellationToken::new(),
            base_config: Arc::new(serde_json::Value::Object(serde_json::Map::new())),
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Runner configured for `stage`: parallel for Stage 1, sequential otherwise.
    #[must_use]
    pub fn from_config(stage: Stage, config: &OptimizerConfig) -> Self {
        let mode = match stage {
            Stage::Stage1 => ExecutionMode::Parallel {
                workers: config.stage1_workers,
            },
            Stage::Stage2 | Stage::Stage3 => ExecutionMode::Sequential {
                trial_timeout: config.trial_timeout(),
                cancel_grace: config.cancel_grace(),
                poll_interval: config.poll_interval(),
            },
        };
        Self::new(stage)
            .with_mode(mode)
            .with_progress(ProgressPolicy {
                every: config.progress_every,
                head: config.progress_head,
            })
            .with_scratch_dir(config.scratch_dir.clone())
    }

    /// Set the execution mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the progress policy.
    #[must_use]
    pub const fn with_progress(mut self, progress: ProgressPolicy) -> Self {
        self.progress = progress;
        self
    }

    /// Observe `token` for cancellation.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Base configuration handed to evaluators.
    #[must_use]
    pub fn with_base_config(mut self, base: Arc<serde_json::Value>) -> Self {
        self.base_config = base;
        self
    }

    /// Scratch directory handed to evaluators.
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Get the stage.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Run a fresh stage of up to `n_trials` recorded trials.
    ///
    /// Ends early when the sampler is exhausted or cancellation is requested.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Other`] if the Stage 1 thread pool cannot be created.
    /// Trial failures never surface here.
    pub fn run_stage(
        &self,
        n_trials: usize,
        sampler: &mut dyn TrialSampler,
        evaluator: &Arc<dyn ObjectiveEvaluator>,
        validator: &ParameterValidator,
    ) -> Result<StageOutcome> {
        self.drive(StageResult::builder(self.stage), n_trials, sampler, evaluator, validator)
    }

    /// Continue a partial stage: recorded trials are kept and new ids start
    /// at the partial result's `next_trial_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when `prior` belongs to another stage.
    pub fn resume_stage(
        &self,
        prior: StageResult,
        n_trials: usize,
        sampler: &mut dyn TrialSampler,
        evaluator: &Arc<dyn ObjectiveEvaluator>,
        validator: &ParameterValidator,
    ) -> Result<StageOutcome> {
        if prior.stage() != self.stage {
            return Err(Error::InvalidInput(format!(
                "cannot resume {} from a {} result",
                self.stage,
                prior.stage()
            )));
        }
        info!(
            stage = %self.stage,
            recorded = prior.len(),
            next_trial_id = prior.summary().next_trial_id,
            "Resuming partial stage"
        );
        let builder = StageResult::builder(self.stage).resume_from(prior);
        self.drive(builder, n_trials, sampler, evaluator, validator)
    }

    fn drive(
        &self,
        mut builder: StageResultBuilder,
        n_trials: usize,
        sampler: &mut dyn TrialSampler,
        evaluator: &Arc<dyn ObjectiveEvaluator>,
        validator: &ParameterValidator,
    ) -> Result<StageOutcome> {
        let session = Instant::now();
        let mut tracker = ProgressTracker::new(self.progress, self.stage, n_trials, builder.recorded());
        info!(
            stage = %self.stage,
            n_trials,
            sampler = sampler.name(),
            evaluator = evaluator.name(),
            fidelity = %evaluator.fidelity(),
            "Stage started"
        );

        let mut next_id = builder.implied_next_trial_id();
        let interrupted = match self.mode {
            ExecutionMode::Parallel { workers } => self.drive_parallel(
                &mut builder,
                &mut next_id,
                workers.max(1),
                n_trials,
                sampler,
                evaluator,
                validator,
                &mut tracker,
            )?,
            ExecutionMode::Sequential {
                trial_timeout,
                cancel_grace,
                poll_interval,
            } => {
                let mut interrupted = false;
                while builder.recorded().len() < n_trials {
                    if self.cancel.is_cancelled() {
                        interrupted = true;
                        break;
                    }
                    let trial_id = next_id;
                    let Some(proposal) = sampler.suggest(trial_id, builder.recorded()) else {
                        info!(stage = %self.stage, "Sampler exhausted");
                        break;
                    };
                    next_id += 1;

                    let Proposal { params, lineage } = proposal;
                    let started = Instant::now();
                    if let Some(rejected) = self.reject(trial_id, &params, &lineage, validator, started) {
                        tracker.observe(&rejected);
                        builder.push(rejected);
                        continue;
                    }

                    let record = match self.run_watched(
                        trial_id,
                        &params,
                        evaluator,
                        trial_timeout,
                        cancel_grace,
                        poll_interval,
                    ) {
                        Watched::Finished(outcome, elapsed) => {
                            self.finish(trial_id, params, lineage, outcome, elapsed)
                        }
                        Watched::TimedOut(limit) => {
                            warn!(stage = %self.stage, trial_id, ?limit, "Trial timed out");
                            TrialRecord::failed(
                                trial_id,
                                self.stage,
                                params,
                                FailureReason::Timeout {
                                    after_secs: limit.as_secs_f64(),
                                },
                                started.elapsed(),
                            )
                            .with_lineage(lineage)
                        }
                        Watched::Abandoned => {
                            builder.abandon();
                            interrupted = true;
                            break;
                        }
                    };
                    tracker.observe(&record);
                    builder.push(record);
                }
                interrupted
            }
        };

        let result = builder.next_trial_id(next_id).build(session.elapsed());
        let summary = result.summary();
        info!(
            stage = %self.stage,
            recorded = summary.n_trials,
            complete = summary.n_complete,
            failed = summary.n_failed,
            rejected = summary.n_rejected,
            abandoned = summary.n_abandoned,
            best = summary.best_score,
            elapsed_secs = summary.duration_secs,
            interrupted,
            "Stage finished"
        );
        Ok(StageOutcome {
            result,
            interrupted,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn drive_parallel(
        &self,
        builder: &mut StageResultBuilder,
        next_id: &mut u64,
        workers: usize,
        n_trials: usize,
        sampler: &mut dyn TrialSampler,
        evaluator: &Arc<dyn ObjectiveEvaluator>,
        validator: &ParameterValidator,
        tracker: &mut ProgressTracker,
    ) -> Result<bool> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("stage1-worker-{i}"))
            .build()
            .map_err(|e| Error::Other(format!("Failed to build Stage 1 thread pool: {e}")))?;

        loop {
            let recorded = builder.recorded().len();
            if recorded >= n_trials {
                return Ok(false);
            }
            if self.cancel.is_cancelled() {
                return Ok(true);
            }

            let batch_size = workers.min(n_trials - recorded);
            let mut batch = Vec::with_capacity(batch_size);
            let mut exhausted = false;
            for _ in 0..batch_size {
                let trial_id = *next_id;
                match sampler.suggest(trial_id, builder.recorded()) {
                    Some(proposal) => {
                        *next_id += 1;
                        batch.push((trial_id, proposal));
                    }
                    None => {
                        exhausted = true;
                        break;
                    }
                }
            }

            let records: Vec<TrialRecord> = pool.install(|| {
                batch
                    .into_par_iter()
                    .map(|(trial_id, proposal)| self.run_inline(trial_id, proposal, evaluator, validator))
                    .collect()
            });
            for record in records {
                tracker.observe(&record);
                builder.push(record);
            }

            if exhausted {
                info!(stage = %self.stage, "Sampler exhausted");
                return Ok(false);
            }
        }
    }

    fn context(&self, trial_id: u64) -> EvalContext {
        EvalContext::new(
            Arc::clone(&self.base_config),
            self.scratch_dir.clone(),
            self.stage,
            trial_id,
        )
    }

    fn reject(
        &self,
        trial_id: u64,
        params: &ParameterVector,
        lineage: &[LineageEntry],
        validator: &ParameterValidator,
        started: Instant,
    ) -> Option<TrialRecord> {
        let rejection = validator.check_all(params).err()?;
        Some(
            TrialRecord::failed(
                trial_id,
                self.stage,
                params.clone(),
                FailureReason::Rejected {
                    check: rejection.check,
                    reason: rejection.reason,
                },
                started.elapsed(),
            )
            .with_lineage(lineage.to_vec()),
        )
    }

    fn run_inline(
        &self,
        trial_id: u64,
        proposal: Proposal,
        evaluator: &Arc<dyn ObjectiveEvaluator>,
        validator: &ParameterValidator,
    ) -> TrialRecord {
        let Proposal { params, lineage } = proposal;
        let started = Instant::now();
        if let Some(rejected) = self.reject(trial_id, &params, &lineage, validator, started) {
            return rejected;
        }
        let ctx = self.context(trial_id);
        let outcome = catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(&params, &ctx)))
            .unwrap_or_else(|payload| Err(EvaluationError::Panicked(panic_message(payload.as_ref()))));
        self.finish(trial_id, params, lineage, outcome, started.elapsed())
    }

    fn run_watched(
        &self,
        trial_id: u64,
        params: &ParameterVector,
        evaluator: &Arc<dyn ObjectiveEvaluator>,
        trial_timeout: Option<Duration>,
        cancel_grace: Duration,
        poll_interval: Duration,
    ) -> Watched {
        let started = Instant::now();
        let (tx, rx) = mpsc::channel();
        let worker_params = params.clone();
        let ctx = self.context(trial_id).with_timeout(trial_timeout);
        let clock = ctx.clock.clone();
        let worker_eval = Arc::clone(evaluator);

        let spawned = thread::Builder::new()
            .name(format!("{}-trial-{trial_id}", self.stage))
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| worker_eval.evaluate(&worker_params, &ctx)))
                    .unwrap_or_else(|payload| Err(EvaluationError::Panicked(panic_message(payload.as_ref()))));
                // Receiver is gone if the trial was abandoned
                let _ = tx.send(outcome);
            });
        if let Err(e) = spawned {
            return Watched::Finished(Err(EvaluationError::Spawn(e.to_string())), started.elapsed());
        }

        let poll = poll_interval.max(Duration::from_millis(1));
        let mut cancelled_at: Option<Instant> = None;
        loop {
            match rx.recv_timeout(poll) {
                Ok(outcome) => return Watched::Finished(outcome, started.elapsed()),
                Err(RecvTimeoutError::Disconnected) => {
                    return Watched::Finished(
                        Err(EvaluationError::Panicked("worker exited without a result".to_string())),
                        started.elapsed(),
                    )
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            if let Some(limit) = trial_timeout {
                if clock.elapsed().is_some_and(|used| used >= limit) {
                    return Watched::TimedOut(limit);
                }
            }
            if cancelled_at.is_none() && self.cancel.is_cancelled() {
                info!(
                    stage = %self.stage,
                    trial_id,
                    grace_secs = cancel_grace.as_secs_f64(),
                    "Cancellation requested, waiting for in-flight trial"
                );
                cancelled_at = Some(Instant::now());
            }
            if let Some(since) = cancelled_at {
                if since.elapsed() >= cancel_grace {
                    warn!(stage = %self.stage, trial_id, "Abandoning in-flight trial after grace period");
                    return Watched::Abandoned;
                }
            }
        }
    }

    fn finish(
        &self,
        trial_id: u64,
        params: ParameterVector,
        lineage: Vec<LineageEntry>,
        outcome: std::result::Result<f64, EvaluationError>,
        elapsed: Duration,
    ) -> TrialRecord {
        let outcome = outcome.and_then(|score| {
            if score.is_finite() {
                Ok(score)
            } else {
                Err(EvaluationError::NonFiniteScore(score))
            }
        });
        let record = match outcome {
            Ok(score) => TrialRecord::complete(trial_id, self.stage, params, score, elapsed),
            Err(err) => {
                warn!(stage = %self.stage, trial_id, error = %err, "Trial failed");
                let reason = match err {
                    EvaluationError::Timeout(after) => FailureReason::Timeout {
                        after_secs: after.as_secs_f64(),
                    },
                    other => FailureReason::Evaluation {
                        message: other.to_string(),
                    },
                };
                TrialRecord::failed(trial_id, self.stage, params, reason, elapsed)
            }
        };
        record.with_lineage(lineage)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
