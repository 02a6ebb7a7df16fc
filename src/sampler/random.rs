//! Uniform random search

use crate::params::SearchSpace;
use crate::trial::TrialRecord;

use super::{trial_rng, Proposal, TrialSampler};

/// Random search sampler - draws each trial independently.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    space: SearchSpace,
    seed: u64,
}

impl RandomSampler {
    /// Create a sampler over `space`.
    #[must_use]
    pub const fn new(space: SearchSpace, seed: u64) -> Self {
        Self { space, seed }
    }
}

impl TrialSampler for RandomSampler {
    fn suggest(&mut self, trial_id: u64, _history: &[TrialRecord]) -> Option<Proposal> {
        if self.space.is_empty() {
            return None;
        }
        let mut rng = trial_rng(self.seed, trial_id);
        Some(Proposal::new(self.space.sample(&mut rng)))
    }

    fn name(&self) -> &str {
        "random"
    }
}
