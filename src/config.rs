//! Optimizer configuration
//!
//! Loaded from JSON or YAML (chosen by file extension) or assembled with
//! [`OptimizerConfigBuilder`]. Every entry point calls
//! [`OptimizerConfig::validate`] before a run starts.
//!
//! ```yaml
//! phase: strategy
//! stage1_trials: 300
//! stage2_top_k: 15
//! stage3_top_k: 3
//! sampler: tpe
//! checkpoint_dir: optimization_results
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sampler::SamplerKind;
use crate::schema::ParameterSchema;
use crate::trial::Stage;
use crate::{Error, Result};

/// Knobs for one optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerConfig {
    /// Parameter family being optimized; also the artifact phase name
    pub phase: ParameterSchema,
    /// Stage 1 trial count (N₁)
    pub stage1_trials: usize,
    /// Candidates promoted to Stage 2 (K₁)
    pub stage2_top_k: usize,
    /// Candidates promoted to Stage 3 (K₂)
    pub stage3_top_k: usize,
    /// Master seed for samplers and simulation noise
    pub seed: u64,
    /// Stage 1 sampler
    pub sampler: SamplerKind,
    /// Stage 1 evaluation threads
    pub stage1_workers: usize,
    /// Per-trial time budget for Stage 2/3 (`None` = unlimited)
    pub trial_timeout_secs: Option<f64>,
    /// Grace period for an in-flight trial after cancellation
    pub cancel_grace_secs: f64,
    /// How often a waiting runner checks for cancellation
    pub poll_interval_ms: u64,
    /// Log progress every N trials
    pub progress_every: usize,
    /// Additionally log each of the first N trials
    pub progress_head: usize,
    /// Warn when Stage 1/Stage 3 rank correlation drops below this
    pub divergence_threshold: f64,
    /// Root directory for checkpoints and final results
    pub checkpoint_dir: PathBuf,
    /// Directory for per-trial configuration files
    pub scratch_dir: PathBuf,
    /// Reuse checkpoints from an earlier run
    pub resume: bool,
    /// Discard checkpoints from this stage onward and re-run
    pub force_rerun_from: Option<Stage>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            phase: ParameterSchema::Risk,
            stage1_trials: 500,
            stage2_top_k: 20,
            stage3_top_k: 5,
            seed: 42,
            sampler: SamplerKind::Tpe,
            stage1_workers: 4,
            trial_timeout_secs: None,
            cancel_grace_secs: 30.0,
            poll_interval_ms: 200,
            progress_every: 50,
            progress_head: 5,
            divergence_threshold: 0.3,
            checkpoint_dir: PathBuf::from("optimization_results"),
            scratch_dir: PathBuf::from("optimization_results/scratch"),
            resume: true,
            force_rerun_from: None,
        }
    }
}

impl OptimizerConfig {
    /// Start from defaults.
    #[must_use]
    pub fn builder() -> OptimizerConfigBuilder {
        OptimizerConfigBuilder::default()
    }

    /// Load from a `.json`, `.yaml` or `.yml` file and validate.
    ///
    /// # Errors
    ///
    /// IO or parse errors, an unknown extension, or a failed [`validate`](Self::validate).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            Some("yaml" | "yml") => serde_yaml::from_str(&text)?,
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "{} must end in .json, .yaml or .yml",
                    path.display()
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first inconsistent field.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::InvalidConfig(msg));

        if self.stage1_trials == 0 || self.stage2_top_k == 0 || self.stage3_top_k == 0 {
            return fail("trial counts must be positive".to_string());
        }
        if self.stage2_top_k > self.stage1_trials {
            return fail(format!(
                "stage2_top_k ({}) exceeds stage1_trials ({})",
                self.stage2_top_k, self.stage1_trials
            ));
        }
        if self.stage3_top_k > self.stage2_top_k {
            return fail(format!(
                "stage3_top_k ({}) exceeds stage2_top_k ({})",
                self.stage3_top_k, self.stage2_top_k
            ));
        }
        if self.stage1_workers == 0 {
            return fail("stage1_workers must be at least 1".to_string());
        }
        if let Some(timeout) = self.trial_timeout_secs {
            if !(timeout > 0.0 && Duration::try_from_secs_f64(timeout).is_ok()) {
                return fail(format!(
                    "trial_timeout_secs must be a positive, representable duration, got {timeout}"
                ));
            }
        }
        if Duration::try_from_secs_f64(self.cancel_grace_secs).is_err() {
            return fail(format!(
                "cancel_grace_secs must be a non-negative, representable duration, got {}",
                self.cancel_grace_secs
            ));
        }
        if self.poll_interval_ms == 0 {
            return fail("poll_interval_ms must be positive".to_string());
        }
        if self.progress_every == 0 {
            return fail("progress_every must be positive".to_string());
        }
        if !(-1.0..=1.0).contains(&self.divergence_threshold) {
            return fail(format!(
                "divergence_threshold must lie in [-1, 1], got {}",
                self.divergence_threshold
            ));
        }
        Ok(())
    }

    /// Trials to run in `stage`.
    #[must_use]
    pub const fn trials_for(&self, stage: Stage) -> usize {
        match stage {
            Stage::Stage1 => self.stage1_trials,
            Stage::Stage2 => self.stage2_top_k,
            Stage::Stage3 => self.stage3_top_k,
        }
    }

    /// Per-trial time budget.
    #[must_use]
    pub fn trial_timeout(&self) -> Option<Duration> {
        self.trial_timeout_secs
            .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }

    /// Cancellation grace period.
    #[must_use]
    pub fn cancel_grace(&self) -> Duration {
        Duration::try_from_secs_f64(self.cancel_grace_secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Cancellation poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Whether a completed checkpoint of `stage` may be reused.
    #[must_use]
    pub fn reuses(&self, stage: Stage) -> bool {
        self.resume && self.force_rerun_from.map_or(true, |from| stage < from)
    }
}

/// Builder for `OptimizerConfig`.
#[derive(Debug, Default)]
pub struct OptimizerConfigBuilder {
    config: OptimizerConfig,
}

impl OptimizerConfigBuilder {
    /// Set the phase.
    #[must_use]
    pub const fn phase(mut self, phase: ParameterSchema) -> Self {
        self.config.phase = phase;
        self
    }

    /// Set N₁, K₁ and K₂.
    #[must_use]
    pub const fn trials(mut self, stage1: usize, stage2_top_k: usize, stage3_top_k: usize) -> Self {
        self.config.stage1_trials = stage1;
        self.config.stage2_top_k = stage2_top_k;
        self.config.stage3_top_k = stage3_top_k;
        self
    }

    /// Set the master seed.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Set the Stage 1 sampler.
    #[must_use]
    pub const fn sampler(mut self, sampler: SamplerKind) -> Self {
        self.config.sampler = sampler;
        self
    }

    /// Set the Stage 1 worker count.
    #[must_use]
    pub const fn stage1_workers(mut self, workers: usize) -> Self {
        self.config.stage1_workers = workers;
        self
    }

    /// Set the per-trial timeout.
    #[must_use]
    pub fn trial_timeout(mut self, timeout: Duration) -> Self {
        self.config.trial_timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    /// Set the cancellation grace period.
    #[must_use]
    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.config.cancel_grace_secs = grace.as_secs_f64();
        self
    }

    /// Set the cancellation poll interval.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX).max(1);
        self
    }

    /// Set the progress logging cadence.
    #[must_use]
    pub const fn progress(mut self, every: usize, head: usize) -> Self {
        self.config.progress_every = every;
        self.config.progress_head = head;
        self
    }

    /// Set the rank divergence warning threshold.
    #[must_use]
    pub const fn divergence_threshold(mut self, threshold: f64) -> Self {
        self.config.divergence_threshold = threshold;
        self
    }

    /// Set the checkpoint root.
    #[must_use]
    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_dir = dir.into();
        self
    }

    /// Set the scratch directory.
    #[must_use]
    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_dir = dir.into();
        self
    }

    /// Enable or disable resume.
    #[must_use]
    pub const fn resume(mut self, resume: bool) -> Self {
        self.config.resume = resume;
        self
    }

    /// Force re-running from `stage` onward.
    #[must_use]
    pub const fn force_rerun_from(mut self, stage: Stage) -> Self {
        self.config.force_rerun_from = Some(stage);
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// See [`OptimizerConfig::validate`].
    pub fn build(self) -> Result<OptimizerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
