//! Trial Record - one evaluation of one parameter vector at one stage

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::params::ParameterVector;

/// Score assigned to rejected and failed trials.
///
/// Finite (unlike `f64::NEG_INFINITY`) so checkpoints stay valid JSON.
pub const SENTINEL_SCORE: f64 = -1.0e9;

/// Evaluation fidelity tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Cheap simulation proxy, hundreds of trials
    Stage1,
    /// Lightweight backtest, tens of trials
    Stage2,
    /// Full backtest, a handful of trials
    Stage3,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Self; 3] = [Self::Stage1, Self::Stage2, Self::Stage3];

    /// Artifact-friendly name (`stage1`, ...).
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Stage1 => "stage1",
            Self::Stage2 => "stage2",
            Self::Stage3 => "stage3",
        }
    }

    /// One-based ordinal.
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Stage1 => 1,
            Self::Stage2 => 2,
            Self::Stage3 => 3,
        }
    }

    /// The stage that follows this one.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Stage1 => Some(Self::Stage2),
            Self::Stage2 => Some(Self::Stage3),
            Self::Stage3 => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Final status of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    /// Evaluator returned a score
    Complete,
    /// Rejected by the validator or the evaluator failed
    Failed,
}

/// Why a trial ended as [`TrialStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// A validator check rejected the vector; the evaluator was not called
    Rejected {
        /// Name of the failing check
        check: String,
        /// Human-readable detail
        reason: String,
    },
    /// The evaluator returned an error or panicked
    Evaluation {
        /// Error message
        message: String,
    },
    /// The evaluator exceeded the per-trial time budget
    Timeout {
        /// Budget that was exceeded
        after_secs: f64,
    },
}

impl FailureReason {
    /// Whether this failure came from the validator.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Score a candidate earned at an earlier stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineageEntry {
    /// Stage that produced the score
    pub stage: Stage,
    /// Trial id within that stage
    pub trial_id: u64,
    /// Score at that stage
    pub score: f64,
}

/// Trial Record represents a single evaluated parameter vector.
///
/// ## Artifact Schema
///
/// Serialized with `trial_number` / `value` / `params` so checkpoint files
/// follow the usual study-export layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    #[serde(rename = "trial_number")]
    trial_id: u64,
    stage: Stage,
    params: ParameterVector,
    #[serde(rename = "value")]
    score: f64,
    status: TrialStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<FailureReason>,
    duration_secs: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    lineage: Vec<LineageEntry>,
}

impl TrialRecord {
    /// Record a successfully scored trial.
    #[must_use]
    pub fn complete(
        trial_id: u64,
        stage: Stage,
        params: ParameterVector,
        score: f64,
        duration: Duration,
    ) -> Self {
        Self {
            trial_id,
            stage,
            params,
            score,
            status: TrialStatus::Complete,
            failure: None,
            duration_secs: duration.as_secs_f64(),
            lineage: Vec::new(),
        }
    }

    /// Record a failed or rejected trial with the sentinel score.
    #[must_use]
    pub fn failed(
        trial_id: u64,
        stage: Stage,
        params: ParameterVector,
        reason: FailureReason,
        duration: Duration,
    ) -> Self {
        Self {
            trial_id,
            stage,
            params,
            score: SENTINEL_SCORE,
            status: TrialStatus::Failed,
            failure: Some(reason),
            duration_secs: duration.as_secs_f64(),
            lineage: Vec::new(),
        }
    }

    /// Attach prior-stage scores.
    #[must_use]
    pub fn with_lineage(mut self, lineage: Vec<LineageEntry>) -> Self {
        self.lineage = lineage;
        self
    }

    /// Get the trial id.
    #[must_use]
    pub const fn trial_id(&self) -> u64 {
        self.trial_id
    }

    /// Get the stage.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Get the evaluated parameters.
    #[must_use]
    pub const fn params(&self) -> &ParameterVector {
        &self.params
    }

    /// Get the score (sentinel for failed trials).
    #[must_use]
    pub const fn score(&self) -> f64 {
        self.score
    }

    /// Get the status.
    #[must_use]
    pub const fn status(&self) -> TrialStatus {
        self.status
    }

    /// Get the failure reason, if any.
    #[must_use]
    pub const fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    /// Get the wall-clock evaluation time.
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.duration_secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Get the prior-stage scores, oldest first.
    #[must_use]
    pub fn lineage(&self) -> &[LineageEntry] {
        &self.lineage
    }

    /// Score this candidate earned at `stage`, if it passed through it.
    #[must_use]
    pub fn score_at(&self, stage: Stage) -> Option<f64> {
        if stage == self.stage {
            return Some(self.score);
        }
        self.lineage
            .iter()
            .find(|entry| entry.stage == stage)
            .map(|entry| entry.score)
    }

    /// Whether the validator rejected this trial.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.failure.as_ref().is_some_and(FailureReason::is_rejection)
    }

    /// Whether this trial may be promoted to the next stage.
    #[must_use]
    pub fn is_promotable(&self) -> bool {
        self.status == TrialStatus::Complete && self.score > SENTINEL_SCORE
    }

    /// Lineage to hand to the next stage when this trial is promoted.
    #[must_use]
    pub fn promoted_lineage(&self) -> Vec<LineageEntry> {
        let mut lineage = self.lineage.clone();
        lineage.push(LineageEntry {
            stage: self.stage,
            trial_id: self.trial_id,
            score: self.score,
        });
        lineage
    }
}
