//! Stage Result - every trial of one stage plus summary metadata

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Stage, TrialRecord, TrialStatus};

/// Ranking used everywhere trials are ordered: score descending, then lowest
/// trial id first.
#[must_use]
pub fn rank_order(a: &TrialRecord, b: &TrialRecord) -> Ordering {
    b.score()
        .total_cmp(&a.score())
        .then_with(|| a.trial_id().cmp(&b.trial_id()))
}

/// Summary counters for a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    /// Stage these counters describe
    pub stage: Stage,
    /// Recorded trials
    pub n_trials: usize,
    /// Trials with a score
    pub n_complete: usize,
    /// Trials that failed (rejections included)
    pub n_failed: usize,
    /// Trials rejected by the validator
    pub n_rejected: usize,
    /// Trials abandoned on cancellation (ids consumed, not recorded)
    pub n_abandoned: usize,
    /// Best complete score, if any
    pub best_score: Option<f64>,
    /// Wall-clock time spent in the stage across all sessions
    pub duration_secs: f64,
    /// Next trial id to hand out when the stage is resumed
    pub next_trial_id: u64,
    /// When the stage first started
    pub started_at: DateTime<Utc>,
    /// When the stage last stopped
    pub finished_at: DateTime<Utc>,
}

/// Stage Result holds the trials of one stage sorted by score descending.
///
/// Built with [`StageResultBuilder`]; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    summary: StageSummary,
    trials: Vec<TrialRecord>,
}

impl StageResult {
    /// Create a builder for a stage.
    #[must_use]
    pub fn builder(stage: Stage) -> StageResultBuilder {
        StageResultBuilder::new(stage)
    }

    /// Rebuild from persisted parts, re-sorting defensively.
    #[must_use]
    pub fn from_parts(summary: StageSummary, mut trials: Vec<TrialRecord>) -> Self {
        trials.sort_by(rank_order);
        Self { summary, trials }
    }

    /// Get the stage.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.summary.stage
    }

    /// Get the summary.
    #[must_use]
    pub const fn summary(&self) -> &StageSummary {
        &self.summary
    }

    /// Get the trials, best first.
    #[must_use]
    pub fn trials(&self) -> &[TrialRecord] {
        &self.trials
    }

    /// Consume into the trials.
    #[must_use]
    pub fn into_trials(self) -> Vec<TrialRecord> {
        self.trials
    }

    /// Number of recorded trials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trials.len()
    }

    /// Whether no trial was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    /// Best promotable trial.
    #[must_use]
    pub fn best(&self) -> Option<&TrialRecord> {
        self.trials.iter().find(|t| t.is_promotable())
    }

    /// Look up a trial by id.
    #[must_use]
    pub fn trial(&self, trial_id: u64) -> Option<&TrialRecord> {
        self.trials.iter().find(|t| t.trial_id() == trial_id)
    }

    /// Wall-clock time spent in the stage.
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.summary.duration_secs.max(0.0))
    }
}

/// Builder for `StageResult`.
#[derive(Debug)]
pub struct StageResultBuilder {
    stage: Stage,
    trials: Vec<TrialRecord>,
    n_abandoned: usize,
    next_trial_id: Option<u64>,
    elapsed: Duration,
    started_at: DateTime<Utc>,
}

impl StageResultBuilder {
    /// Create a new builder with no trials.
    #[must_use]
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            trials: Vec::new(),
            n_abandoned: 0,
            next_trial_id: None,
            elapsed: Duration::ZERO,
            started_at: Utc::now(),
        }
    }

    /// Seed the builder from an earlier (partial) result of the same stage.
    #[must_use]
    pub fn resume_from(mut self, prior: StageResult) -> Self {
        self.n_abandoned = prior.summary.n_abandoned;
        self.next_trial_id = Some(prior.summary.next_trial_id);
        self.elapsed = prior.duration();
        self.started_at = prior.summary.started_at;
        self.trials = prior.trials;
        self
    }

    /// Add a finished trial.
    pub fn push(&mut self, record: TrialRecord) {
        self.trials.push(record);
    }

    /// Count one abandoned trial.
    pub fn abandon(&mut self) {
        self.n_abandoned += 1;
    }

    /// Set the next trial id explicitly.
    #[must_use]
    pub const fn next_trial_id(mut self, next: u64) -> Self {
        self.next_trial_id = Some(next);
        self
    }

    /// Set a custom start timestamp (useful for deserialization/testing).
    #[must_use]
    pub const fn started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    /// Trials recorded so far, in insertion order.
    #[must_use]
    pub fn recorded(&self) -> &[TrialRecord] {
        &self.trials
    }

    /// Time carried over from earlier sessions.
    #[must_use]
    pub const fn carried_elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Next id implied by what has been recorded or set.
    #[must_use]
    pub fn implied_next_trial_id(&self) -> u64 {
        let after_last = self
            .trials
            .iter()
            .map(|t| t.trial_id() + 1)
            .max()
            .unwrap_or(0);
        self.next_trial_id.map_or(after_last, |n| n.max(after_last))
    }

    /// Build the `StageResult`, adding `session` to the carried-over time.
    #[must_use]
    pub fn build(self, session: Duration) -> StageResult {
        let next_trial_id = self.implied_next_trial_id();
        let mut trials = self.trials;
        trials.sort_by(rank_order);

        let n_complete = trials
            .iter()
            .filter(|t| t.status() == TrialStatus::Complete)
            .count();
        let n_rejected = trials.iter().filter(|t| t.is_rejected()).count();
        let best_score = trials
            .iter()
            .find(|t| t.is_promotable())
            .map(TrialRecord::score);

        StageResult {
            summary: StageSummary {
                stage: self.stage,
                n_trials: trials.len(),
                n_complete,
                n_failed: trials.len() - n_complete,
                n_rejected,
                n_abandoned: self.n_abandoned,
                best_score,
                duration_secs: (self.elapsed + session).as_secs_f64(),
                next_trial_id,
                started_at: self.started_at,
                finished_at: Utc::now(),
            },
            trials,
        }
    }
}
