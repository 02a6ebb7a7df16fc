//! Candidate selection between stages
//!
//! **Problem**: promoting the best K of N trials by full sort is O(N log N).
//!
//! **Solution**: bounded heap holding the current worst of the best K at the
//! top, O(N log K).
//!
//! Toyota Way Principles:
//! - **Jidoka**: failed and rejected trials are never eligible, so an invalid
//!   vector cannot reach an expensive stage
//! - **Muda elimination**: avoid the full sort
//!
//! Ordering matches [`rank_order`]: score descending, lowest trial id first on
//! ties. Selection is pure and idempotent.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tracing::info;

use crate::trial::{rank_order, Stage, StageResult, TrialRecord};

/// Trials promoted from one stage to the next, best first.
///
/// Each record keeps its own lineage, so prior-stage scores remain reachable
/// through [`TrialRecord::promoted_lineage`].
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSet {
    source_stage: Stage,
    records: Vec<TrialRecord>,
}

impl CandidateSet {
    /// Stage the candidates were selected from.
    #[must_use]
    pub const fn source_stage(&self) -> Stage {
        self.source_stage
    }

    /// Promoted records, best first.
    #[must_use]
    pub fn records(&self) -> &[TrialRecord] {
        &self.records
    }

    /// Number of candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was promoted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate best first.
    pub fn iter(&self) -> std::slice::Iter<'_, TrialRecord> {
        self.records.iter()
    }

    /// Source trial ids, best first.
    #[must_use]
    pub fn trial_ids(&self) -> Vec<u64> {
        self.records.iter().map(TrialRecord::trial_id).collect()
    }
}

impl<'a> IntoIterator for &'a CandidateSet {
    type Item = &'a TrialRecord;
    type IntoIter = std::slice::Iter<'a, TrialRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

// Heap item ordered so that the worst-ranked trial sits at the top of the
// max-heap and is evicted first.
struct Ranked<'a>(&'a TrialRecord);

impl PartialEq for Ranked<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked<'_> {}

impl Ord for Ranked<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        rank_order(self.0, other.0)
    }
}

impl PartialOrd for Ranked<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Promote the best `k` trials of a stage.
///
/// Only complete trials with a non-sentinel score are eligible. Returns
/// `min(k, eligible)` records sorted by score descending, ties broken by the
/// lowest trial id.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use hybrid_optimizer::params::ParameterVector;
/// use hybrid_optimizer::selector::select_top_k;
/// use hybrid_optimizer::trial::{Stage, StageResult, TrialRecord};
///
/// let mut builder = StageResult::builder(Stage::Stage1);
/// for (id, score) in [(0, 0.2), (1, 0.9), (2, 0.5)] {
///     builder.push(TrialRecord::complete(id, Stage::Stage1, ParameterVector::new(), score, Duration::ZERO));
/// }
/// let top = select_top_k(&builder.build(Duration::ZERO), 2);
/// assert_eq!(top.trial_ids(), vec![1, 2]);
/// ```
#[must_use]
pub fn select_top_k(result: &StageResult, k: usize) -> CandidateSet {
    let mut heap: BinaryHeap<Ranked<'_>> = BinaryHeap::with_capacity(k.saturating_add(1));
    let mut eligible = 0_usize;

    if k > 0 {
        for trial in result.trials().iter().filter(|t| t.is_promotable()) {
            eligible += 1;
            heap.push(Ranked(trial));
            if heap.len() > k {
                heap.pop();
            }
        }
    }

    // into_sorted_vec is ascending by Ord, i.e. best rank first
    let records: Vec<TrialRecord> = heap
        .into_sorted_vec()
        .into_iter()
        .map(|ranked| ranked.0.clone())
        .collect();

    info!(
        stage = %result.stage(),
        requested = k,
        eligible,
        promoted = records.len(),
        best = records.first().map(TrialRecord::score),
        "Selected candidates"
    );

    CandidateSet {
        source_stage: result.stage(),
        records,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterVector;
    use crate::trial::FailureReason;
    use std::time::Duration;

    fn stage_with(scores: &[(u64, f64)]) -> StageResult {
        let mut builder = StageResult::builder(Stage::Stage1);
        for &(id, score) in scores {
            builder.push(TrialRecord::complete(
                id,
                Stage::Stage1,
                ParameterVector::new(),
                score,
                Duration::ZERO,
            ));
        }
        builder.build(Duration::ZERO)
    }

    #[test]
    fn test_k_larger_than_eligible_returns_all() {
        let result = stage_with(&[(0, 0.1), (1, 0.3)]);
        assert_eq!(select_top_k(&result, 10).len(), 2);
    }

    #[test]
    fn test_k_zero_returns_empty() {
        let result = stage_with(&[(0, 0.1)]);
        assert!(select_top_k(&result, 0).is_empty());
    }

    #[test]
    fn test_failed_trials_are_never_promoted() {
        let mut builder = StageResult::builder(Stage::Stage1);
        builder.push(TrialRecord::complete(0, Stage::Stage1, ParameterVector::new(), 0.1, Duration::ZERO));
        builder.push(TrialRecord::failed(
            1,
            Stage::Stage1,
            ParameterVector::new(),
            FailureReason::Evaluation {
                message: "boom".to_string(),
            },
            Duration::ZERO,
        ));
        let top = select_top_k(&builder.build(Duration::ZERO), 5);
        assert_eq!(top.trial_ids(), vec![0]);
    }

    #[test]
    fn test_ties_prefer_lowest_trial_id() {
        let result = stage_with(&[(5, 1.0), (2, 1.0), (9, 1.0), (1, 0.5)]);
        assert_eq!(select_top_k(&result, 2).trial_ids(), vec![2, 5]);
    }
}
