//! Candidate replay for the re-validation stages

use crate::selector::CandidateSet;
use crate::trial::{Stage, TrialRecord};

use super::{Proposal, TrialSampler};

/// Replays promoted candidates in rank order, one per trial.
///
/// Candidates already evaluated in the current stage (found in `history` by
/// lineage) are skipped, so a resumed stage picks up where it stopped.
/// Exhausted once every candidate has been proposed.
#[derive(Debug, Clone)]
pub struct CandidateReplay {
    candidates: Vec<TrialRecord>,
    cursor: usize,
}

impl CandidateReplay {
    /// Replay the records of a candidate set.
    #[must_use]
    pub fn new(candidates: &CandidateSet) -> Self {
        Self::from_records(candidates.records().to_vec())
    }

    /// Replay an explicit list of records.
    #[must_use]
    pub const fn from_records(candidates: Vec<TrialRecord>) -> Self {
        Self {
            candidates,
            cursor: 0,
        }
    }

    /// Candidates not yet proposed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.candidates.len().saturating_sub(self.cursor)
    }

    fn already_evaluated(source: (Stage, u64), history: &[TrialRecord]) -> bool {
        history.iter().any(|t| {
            t.lineage()
                .last()
                .is_some_and(|entry| (entry.stage, entry.trial_id) == source)
        })
    }
}

impl TrialSampler for CandidateReplay {
    fn suggest(&mut self, _trial_id: u64, history: &[TrialRecord]) -> Option<Proposal> {
        while let Some(candidate) = self.candidates.get(self.cursor) {
            self.cursor += 1;
            let source = (candidate.stage(), candidate.trial_id());
            if Self::already_evaluated(source, history) {
                continue;
            }
            return Some(
                Proposal::new(candidate.params().clone())
                    .with_lineage(candidate.promoted_lineage()),
            );
        }
        None
    }

    fn name(&self) -> &str {
        "candidate_replay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterVector;
    use std::time::Duration;

    fn candidate(id: u64, score: f64) -> TrialRecord {
        TrialRecord::complete(
            id,
            Stage::Stage1,
            ParameterVector::new().with("x", score),
            score,
            Duration::ZERO,
        )
    }

    #[test]
    fn test_replays_in_order_then_exhausts() {
        let mut replay = CandidateReplay::from_records(vec![candidate(7, 0.9), candidate(2, 0.8)]);
        let first = replay.suggest(0, &[]).unwrap();
        assert_eq!(first.lineage.len(), 1);
        assert_eq!(first.lineage[0].trial_id, 7);
        let second = replay.suggest(1, &[]).unwrap();
        assert_eq!(second.lineage[0].trial_id, 2);
        assert!(replay.suggest(2, &[]).is_none());
    }

    #[test]
    fn test_skips_candidates_already_in_history() {
        let mut replay = CandidateReplay::from_records(vec![candidate(7, 0.9), candidate(2, 0.8)]);
        let done = TrialRecord::complete(0, Stage::Stage2, ParameterVector::new().with("x", 0.9), 0.5, Duration::ZERO)
            .with_lineage(candidate(7, 0.9).promoted_lineage());

        let next = replay.suggest(1, &[done]).unwrap();
        assert_eq!(next.lineage[0].trial_id, 2);
        assert_eq!(replay.remaining(), 0);
    }
}
