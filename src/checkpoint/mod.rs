//! Checkpoint persistence
//!
//! Durable snapshots of stage results keyed by `(phase, stage)`, plus the
//! per-phase final result and failure report.
//!
//! # Layout
//!
//! ```text
//! <root>/<phase>/stage1.json
//! <root>/<phase>/stage2.json
//! <root>/<phase>/stage3.json
//! <root>/<phase>/final.json
//! <root>/<phase>/failure.json
//! ```
//!
//! # Append-only
//!
//! A save must contain every trial of the checkpoint it overwrites, and a
//! complete checkpoint can only be overwritten through
//! [`CheckpointStore::replace`] or removed through
//! [`CheckpointStore::discard`]. Snapshots never include sampler state.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use hybrid_optimizer::checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore};
//! use hybrid_optimizer::trial::{Stage, StageResult};
//!
//! # fn main() -> hybrid_optimizer::Result<()> {
//! let store = MemoryCheckpointStore::new();
//! let result = StageResult::builder(Stage::Stage1).build(Duration::ZERO);
//! store.save(&Checkpoint::complete("risk", &result))?;
//! assert!(store.load("risk", Stage::Stage1)?.is_some_and(|c| c.is_complete()));
//! # Ok(())
//! # }
//! ```

mod file;
mod memory;

pub use file::{write_atomic, FileCheckpointStore};
pub use memory::MemoryCheckpointStore;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::outcome::{FailureReport, FinalResult};
use crate::trial::{Stage, StageResult, StageSummary, TrialRecord};
use crate::{Error, Result};

/// Whether a checkpoint covers the whole stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// Stage finished; skipped on resume
    Complete,
    /// Stage interrupted; continued on resume
    Partial,
}

/// Snapshot of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    phase: String,
    stage: Stage,
    status: CheckpointStatus,
    saved_at: DateTime<Utc>,
    summary: StageSummary,
    trials: Vec<TrialRecord>,
}

impl Checkpoint {
    fn snapshot(phase: impl Into<String>, result: &StageResult, status: CheckpointStatus) -> Self {
        Self {
            phase: phase.into(),
            stage: result.stage(),
            status,
            saved_at: Utc::now(),
            summary: result.summary().clone(),
            trials: result.trials().to_vec(),
        }
    }

    /// Snapshot of a finished stage.
    #[must_use]
    pub fn complete(phase: impl Into<String>, result: &StageResult) -> Self {
        Self::snapshot(phase, result, CheckpointStatus::Complete)
    }

    /// Snapshot of an interrupted stage.
    #[must_use]
    pub fn partial(phase: impl Into<String>, result: &StageResult) -> Self {
        Self::snapshot(phase, result, CheckpointStatus::Partial)
    }

    /// Get the phase.
    #[must_use]
    pub fn phase(&self) -> &str {
        &self.phase
    }

    /// Get the stage.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Get the status.
    #[must_use]
    pub const fn status(&self) -> CheckpointStatus {
        self.status
    }

    /// Whether the stage finished.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == CheckpointStatus::Complete
    }

    /// Get the save timestamp.
    #[must_use]
    pub const fn saved_at(&self) -> DateTime<Utc> {
        self.saved_at
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

    /// Rebuild the stage result.
    #[must_use]
    pub fn into_result(self) -> StageResult {
        StageResult::from_parts(self.summary, self.trials)
    }
}

/// Durable storage for checkpoints and run artifacts.
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint, enforcing append-only semantics.
    ///
    /// # Errors
    ///
    /// [`Error::CheckpointConflict`] if the save would drop or alter trials of
    /// the stored checkpoint or overwrite a complete one;
    /// [`Error::Persistence`] on IO failure.
    fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Persist a checkpoint unconditionally (forced re-run).
    ///
    /// # Errors
    ///
    /// [`Error::Persistence`] on IO failure.
    fn replace(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Load the checkpoint of `(phase, stage)`, if any.
    ///
    /// # Errors
    ///
    /// [`Error::Persistence`] when the artifact exists but cannot be read.
    fn load(&self, phase: &str, stage: Stage) -> Result<Option<Checkpoint>>;

    /// Remove the checkpoint of `(phase, stage)`; no-op when absent.
    ///
    /// # Errors
    ///
    /// [`Error::Persistence`] on IO failure.
    fn discard(&self, phase: &str, stage: Stage) -> Result<()>;

    /// Persist the final result of a phase.
    ///
    /// # Errors
    ///
    /// [`Error::Persistence`] on IO failure.
    fn save_final(&self, result: &FinalResult) -> Result<()>;

    /// Load the final result of a phase, if any.
    ///
    /// # Errors
    ///
    /// [`Error::Persistence`] when the artifact exists but cannot be read.
    fn load_final(&self, phase: &str) -> Result<Option<FinalResult>>;

    /// Persist a failure report for a phase.
    ///
    /// # Errors
    ///
    /// [`Error::Persistence`] on IO failure.
    fn save_failure(&self, report: &FailureReport) -> Result<()>;
}

/// Reject a save that would lose or rewrite recorded trials.
///
/// # Errors
///
/// Returns [`Error::CheckpointConflict`] describing the first violation.
pub fn check_append_only(existing: &Checkpoint, next: &Checkpoint) -> Result<()> {
    let conflict = |reason: String| {
        Err(Error::CheckpointConflict {
            phase: next.phase.clone(),
            stage: next.stage,
            reason,
        })
    };

    if existing.is_complete() && existing.trials != next.trials {
        return conflict("stage is already complete".to_string());
    }

    let incoming: BTreeMap<u64, &TrialRecord> = next.trials.iter().map(|t| (t.trial_id(), t)).collect();
    for trial in &existing.trials {
        match incoming.get(&trial.trial_id()) {
            None => return conflict(format!("trial {} would be dropped", trial.trial_id())),
            Some(other) if *other != trial => {
                return conflict(format!("trial {} would be rewritten", trial.trial_id()))
            }
            Some(_) => {}
        }
    }
    if next.summary.next_trial_id < existing.summary.next_trial_id {
        return conflict(format!(
            "next_trial_id would move back from {} to {}",
            existing.summary.next_trial_id, next.summary.next_trial_id
        ));
    }
    Ok(())
}

/// Phase names become directory names.
pub(crate) fn check_phase_name(phase: &str) -> Result<()> {
    let valid = !phase.is_empty()
        && phase
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "phase name '{phase}' may only contain ASCII letters, digits, '_' and '-'"
        )))
    }
}
