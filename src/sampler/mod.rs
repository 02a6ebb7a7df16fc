//! Trial samplers
//!
//! The engine treats proposal strategy as a black box behind [`TrialSampler`].
//! Three implementations ship with the crate:
//!
//! - [`RandomSampler`]: uniform draws, one PCG64 stream per trial id
//! - [`TpeSampler`]: Tree-structured Parzen Estimator over completed history
//! - [`CandidateReplay`]: replays promoted candidates for Stage 2 and Stage 3
//!
//! Every sampler derives its randomness from `(seed, trial_id)` instead of a
//! long-lived generator, so a stage resumed from a checkpoint proposes exactly
//! what the uninterrupted run would have proposed.
//!
//! # References
//!
//! \[1\] Bergstra et al. (2011) - Algorithms for Hyper-Parameter Optimization (TPE)

mod random;
mod replay;
mod tpe;

pub use random::RandomSampler;
pub use replay::CandidateReplay;
pub use tpe::TpeSampler;

use rand::SeedableRng;
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};

use crate::params::{ParameterVector, SearchSpace};
use crate::trial::{LineageEntry, TrialRecord};

/// A proposed parameter vector plus the lineage it carries into the stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    /// Parameters to evaluate
    pub params: ParameterVector,
    /// Prior-stage scores (empty for fresh samples)
    pub lineage: Vec<LineageEntry>,
}

impl Proposal {
    /// Fresh proposal without lineage.
    #[must_use]
    pub const fn new(params: ParameterVector) -> Self {
        Self {
            params,
            lineage: Vec::new(),
        }
    }

    /// Attach lineage.
    #[must_use]
    pub fn with_lineage(mut self, lineage: Vec<LineageEntry>) -> Self {
        self.lineage = lineage;
        self
    }
}

/// Proposes the next parameter vector from trial history.
pub trait TrialSampler: Send {
    /// Propose parameters for `trial_id`.
    ///
    /// `history` holds every trial recorded so far in the current stage.
    /// Returns `None` when the sampler has nothing left to propose.
    fn suggest(&mut self, trial_id: u64, history: &[TrialRecord]) -> Option<Proposal>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

/// Which Stage-1 sampler to build from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    /// Uniform random search
    Random,
    /// Tree-structured Parzen Estimator
    #[default]
    Tpe,
}

impl SamplerKind {
    /// Build the sampler over `space`.
    #[must_use]
    pub fn build(self, space: SearchSpace, seed: u64) -> Box<dyn TrialSampler> {
        match self {
            Self::Random => Box::new(RandomSampler::new(space, seed)),
            Self::Tpe => Box::new(TpeSampler::new(space, seed)),
        }
    }
}

/// Generator dedicated to one trial.
pub(crate) fn trial_rng(seed: u64, trial_id: u64) -> Pcg64 {
    Pcg64::seed_from_u64(seed ^ trial_id.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}
