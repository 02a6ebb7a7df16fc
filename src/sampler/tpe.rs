//! Tree-structured Parzen Estimator sampler
//!
//! # Toyota Way: Kaizen
//!
//! Uses accumulated trial history to make increasingly better suggestions.
//! Completed trials are split by a score quantile into "good" and "bad"
//! groups; each parameter is drawn where the good-group density `l(x)` is
//! high relative to the bad-group density `g(x)`.

use std::collections::BTreeMap;

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand_distr::Normal;

use crate::params::{ParamRange, ParamValue, SearchSpace};
use crate::trial::{rank_order, TrialRecord};

use super::{trial_rng, Proposal, TrialSampler};

/// Bayesian sampler using Tree-structured Parzen Estimators.
#[derive(Debug, Clone)]
pub struct TpeSampler {
    space: SearchSpace,
    seed: u64,
    n_startup: usize,
    gamma: f64,
    n_candidates: usize,
}

impl TpeSampler {
    /// Create a TPE sampler with 10 random startup trials and a 20% good quantile.
    #[must_use]
    pub const fn new(space: SearchSpace, seed: u64) -> Self {
        Self {
            space,
            seed,
            n_startup: 10,
            gamma: 0.2,
            n_candidates: 24,
        }
    }

    /// Set the number of random startup trials.
    #[must_use]
    pub fn with_startup(mut self, n: usize) -> Self {
        self.n_startup = n.max(2);
        self
    }

    /// Set the good-group quantile.
    #[must_use]
    pub fn with_gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma.clamp(0.01, 0.99);
        self
    }

    /// Set the number of candidates drawn per numeric parameter.
    #[must_use]
    pub fn with_candidates(mut self, n: usize) -> Self {
        self.n_candidates = n.max(1);
        self
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn split<'a>(&self, history: &'a [TrialRecord]) -> Option<(Vec<&'a TrialRecord>, Vec<&'a TrialRecord>)> {
        let mut completed: Vec<&TrialRecord> = history.iter().filter(|t| t.is_promotable()).collect();
        if completed.len() < self.n_startup.max(2) {
            return None;
        }
        completed.sort_by(|a, b| rank_order(a, b));

        let n_good = ((completed.len() as f64) * self.gamma).ceil() as usize;
        let n_good = n_good.clamp(1, completed.len() - 1);
        let bad = completed.split_off(n_good);
        Some((completed, bad))
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn sample_numerical<R: Rng>(
        &self,
        name: &str,
        range: &ParamRange,
        good: &[&TrialRecord],
        bad: &[&TrialRecord],
        rng: &mut R,
    ) -> Option<ParamValue> {
        let (low, high, log_scale) = match range {
            ParamRange::Float {
                low,
                high,
                log_scale,
            } => (*low, *high, *log_scale),
            ParamRange::Int { low, high, .. } => (*low as f64, *high as f64, false),
            _ => return range.sample(rng),
        };
        if log_scale && low <= 0.0 {
            return range.sample(rng);
        }
        let to_axis = |v: f64| if log_scale { v.max(f64::MIN_POSITIVE).ln() } else { v };
        let (lo, hi) = (to_axis(low), to_axis(high));

        let good_vals: Vec<f64> = values_of(name, good).map(to_axis).collect();
        let bad_vals: Vec<f64> = values_of(name, bad).map(to_axis).collect();
        if good_vals.is_empty() || hi <= lo || !(lo.is_finite() && hi.is_finite()) {
            return range.sample(rng);
        }

        // Bandwidth heuristic: a tenth of the axis span
        let sigma = 0.1 * (hi - lo);
        let Ok(kernel) = Normal::new(0.0, sigma) else {
            return range.sample(rng);
        };

        let mut best = (good_vals[0], f64::NEG_INFINITY);
        for _ in 0..self.n_candidates {
            let base = good_vals[rng.gen_range(0..good_vals.len())];
            let candidate = (base + kernel.sample(rng)).clamp(lo, hi);
            let lx = mean_pdf(candidate, &good_vals, sigma);
            let gx = mean_pdf(candidate, &bad_vals, sigma);
            let ratio = lx / (gx + 1e-12);
            if ratio > best.1 {
                best = (candidate, ratio);
            }
        }

        let value = if log_scale { best.0.exp() } else { best.0 };
        Some(match range {
            ParamRange::Int { low, high, step } => {
                let step = (*step).max(1);
                let top = low + (high.checked_sub(*low)?.max(0) / step) * step;
                let slot = ((value - *low as f64) / step as f64).round() as i64;
                ParamValue::Int(low.saturating_add(slot.saturating_mul(step)).clamp(*low, top))
            }
            _ => ParamValue::Float(value.clamp(low, high)),
        })
    }

    fn sample_categorical<R: Rng>(
        name: &str,
        options: &[ParamValue],
        good: &[&TrialRecord],
        bad: &[&TrialRecord],
        rng: &mut R,
    ) -> Option<ParamValue> {
        if options.is_empty() {
            return None;
        }
        let count = |group: &[&TrialRecord], option: &ParamValue| {
            group
                .iter()
                .filter(|t| t.params().get(name) == Some(option))
                .count()
        };

        // l(x) / g(x) with Laplace smoothing
        #[allow(clippy::cast_precision_loss)]
        let weights: Vec<f64> = options
            .iter()
            .map(|o| (count(good, o) + 1) as f64 / (count(bad, o) + 1) as f64)
            .collect();

        let idx = match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(rng),
            Err(_) => rng.gen_range(0..options.len()),
        };
        Some(options[idx].clone())
    }
}

fn values_of<'a>(name: &'a str, group: &'a [&'a TrialRecord]) -> impl Iterator<Item = f64> + 'a {
    group.iter().filter_map(move |t| t.params().get_f64(name))
}

#[allow(clippy::cast_precision_loss)]
fn mean_pdf(x: f64, centers: &[f64], sigma: f64) -> f64 {
    if centers.is_empty() {
        return 0.0;
    }
    let norm = 1.0 / (sigma * (2.0 * std::f64::consts::PI).sqrt());
    let total: f64 = centers
        .iter()
        .map(|c| norm * (-0.5 * ((x - c) / sigma).powi(2)).exp())
        .sum();
    total / centers.len() as f64
}

impl TrialSampler for TpeSampler {
    fn suggest(&mut self, trial_id: u64, history: &[TrialRecord]) -> Option<Proposal> {
        if self.space.is_empty() {
            return None;
        }
        let mut rng = trial_rng(self.seed, trial_id);

        let Some((good, bad)) = self.split(history) else {
            return Some(Proposal::new(self.space.sample(&mut rng)));
        };

        let mut values = BTreeMap::new();
        for (name, range) in self.space.iter() {
            let value = match range {
                ParamRange::Float { .. } | ParamRange::Int { .. } => {
                    self.sample_numerical(name, range, &good, &bad, &mut rng)
                }
                ParamRange::Categorical { choices } => {
                    let options: Vec<ParamValue> =
                        choices.iter().cloned().map(ParamValue::Str).collect();
                    Self::sample_categorical(name, &options, &good, &bad, &mut rng)
                }
                ParamRange::Bool => Self::sample_categorical(
                    name,
                    &[ParamValue::Bool(false), ParamValue::Bool(true)],
                    &good,
                    &bad,
                    &mut rng,
                ),
                ParamRange::Complement { .. } => None,
            };
            if let Some(value) = value {
                values.insert(name.clone(), value);
            }
        }

        Some(Proposal::new(self.space.resolve_complements(values)))
    }

    fn name(&self) -> &str {
        "tpe"
    }
}
