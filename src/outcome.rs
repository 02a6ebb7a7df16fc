//! Run outcomes: final result, diagnostics and failure summaries

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::params::ParameterVector;
use crate::trial::{LineageEntry, Stage, StageResult, StageSummary};
use crate::{Error, Result};

/// Per-stage counters carried into the final artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageBreakdown {
    /// Recorded trials
    pub n_trials: usize,
    /// Trials with a score
    pub n_complete: usize,
    /// Failed trials (rejections included)
    pub n_failed: usize,
    /// Validator rejections
    pub n_rejected: usize,
    /// Best score at this stage
    pub best_score: Option<f64>,
    /// Wall-clock seconds
    pub duration_secs: f64,
}

impl From<&StageSummary> for StageBreakdown {
    fn from(summary: &StageSummary) -> Self {
        Self {
            n_trials: summary.n_trials,
            n_complete: summary.n_complete,
            n_failed: summary.n_failed,
            n_rejected: summary.n_rejected,
            best_score: summary.best_score,
            duration_secs: summary.duration_secs,
        }
    }
}

/// How far the cheap proxy can be trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Spearman correlation between Stage 1 and Stage 3 scores of the
    /// Stage 3 trials (`None` with fewer than two comparable trials)
    pub rank_agreement: Option<f64>,
    /// Threshold below which the rankings count as diverged
    pub divergence_threshold: f64,
    /// `rank_agreement < divergence_threshold`
    pub diverged: bool,
    /// Trials entering the correlation
    pub compared_trials: usize,
    /// Name of the Stage 1 objective
    pub stage1_objective: String,
}

impl Diagnostics {
    /// Compare Stage 1 and Stage 3 scores of every complete Stage 3 trial.
    #[must_use]
    pub fn from_stage3(stage3: &StageResult, threshold: f64, stage1_objective: impl Into<String>) -> Self {
        let (proxy, truth): (Vec<f64>, Vec<f64>) = stage3
            .trials()
            .iter()
            .filter(|t| t.is_promotable())
            .filter_map(|t| t.score_at(Stage::Stage1).map(|s1| (s1, t.score())))
            .unzip();
        let rank_agreement = spearman(&proxy, &truth);
        Self {
            rank_agreement,
            divergence_threshold: threshold,
            diverged: rank_agreement.is_some_and(|rho| rho < threshold),
            compared_trials: proxy.len(),
            stage1_objective: stage1_objective.into(),
        }
    }
}

/// Spearman rank correlation with average ranks for ties.
///
/// Returns `None` for mismatched lengths, fewer than two points, or a
/// constant series.
#[must_use]
pub fn spearman(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let (ra, rb) = (average_ranks(a), average_ranks(b));
    #[allow(clippy::cast_precision_loss)]
    let n = ra.len() as f64;
    let (ma, mb) = (ra.iter().sum::<f64>() / n, rb.iter().sum::<f64>() / n);

    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for (x, y) in ra.iter().zip(&rb) {
        cov += (x - ma) * (y - mb);
        va += (x - ma).powi(2);
        vb += (y - mb).powi(2);
    }
    if va <= f64::EPSILON || vb <= f64::EPSILON {
        return None;
    }
    Some(cov / (va.sqrt() * vb.sqrt()))
}

#[allow(clippy::cast_precision_loss)]
fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&i, &j| values[i].total_cmp(&values[j]));

    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && values[order[end + 1]] == values[order[start]] {
            end += 1;
        }
        let rank = (start + end) as f64 / 2.0 + 1.0;
        for &idx in &order[start..=end] {
            ranks[idx] = rank;
        }
        start = end + 1;
    }
    ranks
}

/// Final Result - winner of a completed run.
///
/// Created once after Stage 3 and never mutated. The winner always comes
/// from Stage 3; earlier scores are kept in `best_lineage` for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    phase: String,
    created_at: DateTime<Utc>,
    best_params: ParameterVector,
    best_value: f64,
    #[serde(default)]
    best_lineage: Vec<LineageEntry>,
    stage_breakdown: BTreeMap<Stage, StageBreakdown>,
    total_duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    diagnostics: Option<Diagnostics>,
}

impl FinalResult {
    /// Minimal result with no stage breakdown.
    #[must_use]
    pub fn new(phase: impl Into<String>, best_params: ParameterVector, best_value: f64) -> Self {
        Self {
            phase: phase.into(),
            created_at: Utc::now(),
            best_params,
            best_value,
            best_lineage: Vec::new(),
            stage_breakdown: BTreeMap::new(),
            total_duration_seconds: 0.0,
            diagnostics: None,
        }
    }

    /// Assemble from the three stage results; the winner is Stage 3's best.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoViableTrials`] when the last stage has no
    /// promotable trial.
    pub fn from_stages(phase: impl Into<String>, stages: &[&StageResult], diagnostics: Diagnostics) -> Result<Self> {
        let last = stages
            .last()
            .ok_or_else(|| Error::InvalidInput("no stage results to finalize".to_string()))?;
        let winner = last
            .best()
            .ok_or(Error::NoViableTrials { stage: last.stage() })?;

        let stage_breakdown: BTreeMap<Stage, StageBreakdown> = stages
            .iter()
            .map(|s| (s.stage(), StageBreakdown::from(s.summary())))
            .collect();
        let total_duration_seconds = stages.iter().map(|s| s.summary().duration_secs).sum();

        Ok(Self {
            phase: phase.into(),
            created_at: Utc::now(),
            best_params: winner.params().clone(),
            best_value: winner.score(),
            best_lineage: winner.promoted_lineage(),
            stage_breakdown,
            total_duration_seconds,
            diagnostics: Some(diagnostics),
        })
    }

    /// Get the phase name.
    #[must_use]
    pub fn phase(&self) -> &str {
        &self.phase
    }

    /// Get the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Get the winning parameters (flat dotted keys).
    #[must_use]
    pub const fn best_params(&self) -> &ParameterVector {
        &self.best_params
    }

    /// Get the winning Stage 3 score.
    #[must_use]
    pub const fn best_value(&self) -> f64 {
        self.best_value
    }

    /// Get the winner's scores at every stage, Stage 1 first.
    #[must_use]
    pub fn best_lineage(&self) -> &[LineageEntry] {
        &self.best_lineage
    }

    /// Get per-stage counters.
    #[must_use]
    pub const fn stage_breakdown(&self) -> &BTreeMap<Stage, StageBreakdown> {
        &self.stage_breakdown
    }

    /// Get the summed stage durations.
    #[must_use]
    pub const fn total_duration_seconds(&self) -> f64 {
        self.total_duration_seconds
    }

    /// Get the rank diagnostics, if computed.
    #[must_use]
    pub const fn diagnostics(&self) -> Option<&Diagnostics> {
        self.diagnostics.as_ref()
    }
}

/// What the user needs to know after a run stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Phase name
    pub phase: String,
    /// Stages whose complete checkpoint exists
    pub completed_stages: Vec<Stage>,
    /// Stage that failed or was interrupted
    pub failed_stage: Option<Stage>,
    /// How to continue
    pub resume_hint: String,
}

impl RunSummary {
    /// Summary with the standard resume hint.
    #[must_use]
    pub fn new(phase: impl Into<String>, completed_stages: Vec<Stage>, failed_stage: Option<Stage>) -> Self {
        let phase = phase.into();
        let resume_hint = match failed_stage {
            Some(stage) => format!(
                "re-run phase '{phase}' with resume enabled; completed stages are skipped and {stage} continues from its last checkpoint"
            ),
            None => format!("re-run phase '{phase}' with resume enabled"),
        };
        Self {
            phase,
            completed_stages,
            failed_stage,
            resume_hint,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let completed: Vec<&str> = self.completed_stages.iter().map(|s| s.name()).collect();
        write!(f, "Phase '{}'", self.phase)?;
        if let Some(stage) = self.failed_stage {
            write!(f, " stopped in {stage}")?;
        }
        let completed = if completed.is_empty() {
            "none".to_string()
        } else {
            completed.join(", ")
        };
        write!(f, ". Completed stages: {completed}.\nResume: {}", self.resume_hint)
    }
}

/// Artifact written next to the checkpoints when a run fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    /// When the failure was recorded
    pub failed_at: DateTime<Utc>,
    /// Orchestrator state when the failure happened
    pub state: String,
    /// Error message
    pub error: String,
    /// Trials held in memory for the failed stage
    pub partial_trials: usize,
    /// Summary with resume instruction
    pub summary: RunSummary,
}

impl FailureReport {
    /// Report for `summary`, timestamped now.
    #[must_use]
    pub fn new(summary: RunSummary, state: impl Into<String>, error: impl Into<String>, partial_trials: usize) -> Self {
        Self {
            failed_at: Utc::now(),
            state: state.into(),
            error: error.into(),
            partial_trials,
            summary,
        }
    }

    /// Phase name.
    #[must_use]
    pub fn phase(&self) -> &str {
        &self.summary.phase
    }
}
