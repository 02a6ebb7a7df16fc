//! Stage 1 analytic proxy objective

use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64;

use crate::error::EvaluationError;
use crate::params::{ParameterVector, SearchSpace};
use crate::schema::ParameterSchema;

use super::{EvalContext, Fidelity, ObjectiveEvaluator};

/// Penalty for each categorical or boolean field that differs from the reference.
const MISMATCH_PENALTY: f64 = 0.25;

/// Distance-from-reference proxy with bounded deterministic noise.
///
/// `score = min(peak, peak - scale * Σ((x - ref) / span)² - mismatches + noise)`
///
/// Noise is drawn from `N(0, σ)` clamped to `±3σ`, seeded by the parameter
/// fingerprint, so the same vector always scores the same. The score never
/// exceeds `peak`, which is reached only at the reference vector.
#[derive(Debug, Clone)]
pub struct SimulationEvaluator {
    reference: ParameterVector,
    space: SearchSpace,
    peak: f64,
    scale: f64,
    noise_sigma: f64,
    seed: u64,
}

impl SimulationEvaluator {
    /// Create a proxy centred on `reference`; spans come from `space`.
    #[must_use]
    pub const fn new(reference: ParameterVector, space: SearchSpace) -> Self {
        Self {
            reference,
            space,
            peak: 1.0,
            scale: 1.0,
            noise_sigma: 0.05,
            seed: 0,
        }
    }

    /// Proxy for one of the built-in schemas.
    #[must_use]
    pub fn for_schema(schema: ParameterSchema, seed: u64) -> Self {
        Self::new(schema.reference_vector(), schema.search_space()).with_seed(seed)
    }

    /// Set the noise standard deviation (0 disables noise).
    #[must_use]
    pub fn with_noise(mut self, sigma: f64) -> Self {
        self.noise_sigma = sigma.max(0.0);
        self
    }

    /// Set the score reached at the reference vector.
    #[must_use]
    pub const fn with_peak(mut self, peak: f64) -> Self {
        self.peak = peak;
        self
    }

    /// Set the distance penalty multiplier.
    #[must_use]
    pub const fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Set the noise seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Score at the reference vector.
    #[must_use]
    pub const fn peak(&self) -> f64 {
        self.peak
    }

    fn distance(&self, params: &ParameterVector) -> Result<f64, EvaluationError> {
        let mut penalty = 0.0;
        for (name, range) in self.space.iter() {
            let Some(reference) = self.reference.get(name) else {
                continue;
            };
            let value = params
                .get(name)
                .ok_or_else(|| EvaluationError::InvalidData(format!("{name} is missing")))?;

            match range.bounds() {
                Some((low, high)) => {
                    let span = if high > low { high - low } else { 1.0 };
                    let (x, r) = match (value.as_f64(), reference.as_f64()) {
                        (Some(x), Some(r)) => (x, r),
                        _ => {
                            return Err(EvaluationError::InvalidData(format!(
                                "{name}={value} is not numeric"
                            )))
                        }
                    };
                    penalty += ((x - r) / span).powi(2);
                }
                None => {
                    if value != reference {
                        penalty += MISMATCH_PENALTY;
                    }
                }
            }
        }
        Ok(penalty)
    }

    fn noise(&self, params: &ParameterVector) -> Result<f64, EvaluationError> {
        if self.noise_sigma <= 0.0 {
            return Ok(0.0);
        }
        let normal = Normal::new(0.0, self.noise_sigma)
            .map_err(|e| EvaluationError::InvalidData(format!("noise distribution: {e}")))?;
        let mut rng = Pcg64::seed_from_u64(params.fingerprint() ^ self.seed);
        let bound = 3.0 * self.noise_sigma;
        Ok(normal.sample(&mut rng).clamp(-bound, bound))
    }
}

impl ObjectiveEvaluator for SimulationEvaluator {
    fn evaluate(&self, params: &ParameterVector, _ctx: &EvalContext) -> Result<f64, EvaluationError> {
        let penalty = self.distance(params)?;
        let noise = self.noise(params)?;
        Ok((self.peak - self.scale * penalty + noise).min(self.peak))
    }

    fn fidelity(&self) -> Fidelity {
        Fidelity::Simulation
    }

    fn name(&self) -> &str {
        "simulation"
    }
}
