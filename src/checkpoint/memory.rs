//! In-memory checkpoint store using `DashMap`.
//!
//! Artifacts are held as serialized JSON so a load returns exactly what a
//! file store would. Data is lost on process exit; used for tests and dry runs.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{check_append_only, check_phase_name, Checkpoint, CheckpointStore};
use crate::outcome::{FailureReport, FinalResult};
use crate::trial::Stage;
use crate::Result;

/// Concurrent in-memory store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<(String, Stage), Vec<u8>>,
    finals: DashMap<String, Vec<u8>>,
    failures: DashMap<String, Vec<u8>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stage checkpoints held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    /// Whether no stage checkpoint is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Failure report of `phase`, if one was saved.
    ///
    /// # Errors
    ///
    /// JSON error if the stored bytes cannot be decoded.
    pub fn failure(&self, phase: &str) -> Result<Option<FailureReport>> {
        self.failures.get(phase).map(|bytes| decode(bytes.value())).transpose()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        check_phase_name(checkpoint.phase())?;
        let bytes = encode(checkpoint)?;
        match self
            .checkpoints
            .entry((checkpoint.phase().to_string(), checkpoint.stage()))
        {
            Entry::Occupied(mut slot) => {
                let existing: Checkpoint = decode(slot.get())?;
                check_append_only(&existing, checkpoint)?;
                slot.insert(bytes);
            }
            Entry::Vacant(slot) => {
                slot.insert(bytes);
            }
        }
        Ok(())
    }

    fn replace(&self, checkpoint: &Checkpoint) -> Result<()> {
        check_phase_name(checkpoint.phase())?;
        self.checkpoints.insert(
            (checkpoint.phase().to_string(), checkpoint.stage()),
            encode(checkpoint)?,
        );
        Ok(())
    }

    fn load(&self, phase: &str, stage: Stage) -> Result<Option<Checkpoint>> {
        self.checkpoints
            .get(&(phase.to_string(), stage))
            .map(|bytes| decode(bytes.value()))
            .transpose()
    }

    fn discard(&self, phase: &str, stage: Stage) -> Result<()> {
        self.checkpoints.remove(&(phase.to_string(), stage));
        Ok(())
    }

    fn save_final(&self, result: &FinalResult) -> Result<()> {
        check_phase_name(result.phase())?;
        self.finals.insert(result.phase().to_string(), encode(result)?);
        Ok(())
    }

    fn load_final(&self, phase: &str) -> Result<Option<FinalResult>> {
        self.finals.get(phase).map(|bytes| decode(bytes.value())).transpose()
    }

    fn save_failure(&self, report: &FailureReport) -> Result<()> {
        check_phase_name(report.phase())?;
        self.failures.insert(report.phase().to_string(), encode(report)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterVector;
    use crate::trial::{StageResult, TrialRecord};
    use std::time::Duration;

    #[test]
    fn test_round_trip_and_discard() {
        let store = MemoryCheckpointStore::new();
        let mut builder = StageResult::builder(Stage::Stage2);
        builder.push(TrialRecord::complete(0, Stage::Stage2, ParameterVector::new().with("x", 1.0), 0.5, Duration::ZERO));
        let checkpoint = Checkpoint::complete("strategy", &builder.build(Duration::ZERO));

        store.save(&checkpoint).unwrap();
        assert_eq!(store.load("strategy", Stage::Stage2).unwrap(), Some(checkpoint));
        assert_eq!(store.len(), 1);

        store.discard("strategy", Stage::Stage2).unwrap();
        assert!(store.is_empty());
    }
}
