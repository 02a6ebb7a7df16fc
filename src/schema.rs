//! Parameter schemas sharing one search engine
//!
//! Three independent schemas (risk, strategy, ML hyperparameters) are searched
//! by the same staged engine. Each variant statically knows its search space,
//! its validator, and a known-good reference vector used by the simulation
//! objective.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::params::{ParamRange, ParamValue, ParameterVector, SearchSpace};
use crate::validator::{Check, ParameterValidator};
use crate::Error;

/// Tolerance for sum-to-one weight pairs.
pub const WEIGHT_EPSILON: f64 = 1e-6;

/// Which parameter family a phase optimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterSchema {
    /// Position sizing, volatility regimes, drawdown limits
    #[default]
    Risk,
    /// Signal thresholds, indicator bands, blending weights
    Strategy,
    /// Model training hyperparameters
    MlHyperparams,
}

impl ParameterSchema {
    /// All schemas.
    pub const ALL: [Self; 3] = [Self::Risk, Self::Strategy, Self::MlHyperparams];

    /// Phase name used for artifacts.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Risk => "risk",
            Self::Strategy => "strategy",
            Self::MlHyperparams => "ml_hyperparams",
        }
    }

    /// Top-level key every parameter of this schema lives under.
    #[must_use]
    pub const fn key_prefix(self) -> &'static str {
        match self {
            Self::Risk => "risk",
            Self::Strategy => "strategy",
            Self::MlHyperparams => "ml",
        }
    }

    /// Fully qualified dotted key for a schema-relative name.
    #[must_use]
    pub fn key(self, name: &str) -> String {
        format!("{}.{name}", self.key_prefix())
    }

    /// Search space sampled in Stage 1.
    #[must_use]
    pub fn search_space(self) -> SearchSpace {
        let k = |name: &str| self.key(name);
        match self {
            Self::Risk => SearchSpace::new()
                .with(k("kelly.fraction"), ParamRange::float(0.1, 1.0))
                .with(k("kelly.max_position_size"), ParamRange::float(0.01, 0.25))
                .with(k("volatility.low_threshold"), ParamRange::float(0.005, 0.03))
                .with(k("volatility.normal_threshold"), ParamRange::float(0.01, 0.05))
                .with(k("volatility.high_threshold"), ParamRange::float(0.02, 0.10))
                .with(k("drawdown.daily_loss_limit"), ParamRange::float(0.01, 0.10))
                .with(k("drawdown.max_drawdown"), ParamRange::float(0.05, 0.30))
                .with(k("stop_loss.atr_multiplier"), ParamRange::float(1.0, 4.0)),
            Self::Strategy => SearchSpace::new()
                .with(k("signal.buy_threshold"), ParamRange::float(0.5, 0.9))
                .with(k("signal.sell_threshold"), ParamRange::float(0.1, 0.5))
                .with(k("rsi.oversold"), ParamRange::int(15, 40))
                .with(k("rsi.overbought"), ParamRange::int(60, 85))
                .with(k("weights.technical"), ParamRange::float(0.2, 0.8))
                .with(k("weights.ml"), ParamRange::complement(k("weights.technical")))
                .with(k("trailing_stop.enabled"), ParamRange::Bool)
                .with(k("trailing_stop.distance"), ParamRange::float(0.005, 0.05))
                .with(k("position.timeframe"), ParamRange::categorical(&["1h", "4h", "1d"])),
            Self::MlHyperparams => SearchSpace::new()
                .with(k("lgbm.learning_rate"), ParamRange::log_float(1e-3, 0.3))
                .with(k("lgbm.max_depth"), ParamRange::int(3, 12))
                .with(k("lgbm.num_leaves"), ParamRange::Int { low: 8, high: 256, step: 8 })
                .with(k("lgbm.feature_fraction"), ParamRange::float(0.5, 1.0))
                .with(k("ensemble.lgbm_weight"), ParamRange::float(0.3, 0.9))
                .with(k("ensemble.xgb_weight"), ParamRange::complement(k("ensemble.lgbm_weight")))
                .with(k("early_stopping.enabled"), ParamRange::Bool)
                .with(k("early_stopping.patience"), ParamRange::int(10, 200))
                .with(k("model.kind"), ParamRange::categorical(&["lgbm", "xgb", "ensemble"])),
        }
    }

    /// Cross-field validator for this schema.
    #[must_use]
    pub fn validator(self) -> ParameterValidator {
        let k = |name: &str| self.key(name);
        match self {
            Self::Risk => ParameterValidator::new()
                .range("kelly_fraction_range", &k("kelly.fraction"), 0.0, 1.0)
                .range("position_size_range", &k("kelly.max_position_size"), 0.0, 0.5)
                .ordering(
                    "volatility_regime_order",
                    &[
                        &k("volatility.low_threshold"),
                        &k("volatility.normal_threshold"),
                        &k("volatility.high_threshold"),
                    ],
                )
                .ordering(
                    "daily_loss_below_max_drawdown",
                    &[&k("drawdown.daily_loss_limit"), &k("drawdown.max_drawdown")],
                )
                .range("atr_multiplier_range", &k("stop_loss.atr_multiplier"), 0.5, 10.0),
            Self::Strategy => ParameterValidator::new()
                .ordering(
                    "sell_below_buy",
                    &[&k("signal.sell_threshold"), &k("signal.buy_threshold")],
                )
                .ordering("rsi_band_order", &[&k("rsi.oversold"), &k("rsi.overbought")])
                .sum_to_one(
                    "signal_weights_sum",
                    &[&k("weights.technical"), &k("weights.ml")],
                    WEIGHT_EPSILON,
                )
                .conditional(
                    "trailing_distance_when_enabled",
                    &k("trailing_stop.enabled"),
                    true,
                    Check::Range {
                        field: k("trailing_stop.distance"),
                        min: 0.001,
                        max: 0.10,
                    },
                ),
            Self::MlHyperparams => ParameterValidator::new()
                .range("learning_rate_range", &k("lgbm.learning_rate"), 1e-4, 1.0)
                .range("feature_fraction_range", &k("lgbm.feature_fraction"), 0.1, 1.0)
                .custom(
                    "leaves_fit_depth",
                    "ml.lgbm.num_leaves must not exceed 2^ml.lgbm.max_depth",
                    leaves_fit_depth,
                )
                .sum_to_one(
                    "ensemble_weights_sum",
                    &[&k("ensemble.lgbm_weight"), &k("ensemble.xgb_weight")],
                    WEIGHT_EPSILON,
                )
                .conditional(
                    "patience_when_early_stopping",
                    &k("early_stopping.enabled"),
                    true,
                    Check::Range {
                        field: k("early_stopping.patience"),
                        min: 5.0,
                        max: 500.0,
                    },
                ),
        }
    }

    /// Known-good configuration the simulation objective scores against.
    #[must_use]
    pub fn reference_vector(self) -> ParameterVector {
        let k = |name: &str| self.key(name);
        match self {
            Self::Risk => ParameterVector::new()
                .with(k("kelly.fraction"), 0.5)
                .with(k("kelly.max_position_size"), 0.1)
                .with(k("volatility.low_threshold"), 0.015)
                .with(k("volatility.normal_threshold"), 0.03)
                .with(k("volatility.high_threshold"), 0.06)
                .with(k("drawdown.daily_loss_limit"), 0.03)
                .with(k("drawdown.max_drawdown"), 0.15)
                .with(k("stop_loss.atr_multiplier"), 2.0),
            Self::Strategy => ParameterVector::new()
                .with(k("signal.buy_threshold"), 0.7)
                .with(k("signal.sell_threshold"), 0.3)
                .with(k("rsi.oversold"), 30_i64)
                .with(k("rsi.overbought"), 70_i64)
                .with(k("weights.technical"), 0.6)
                .with(k("weights.ml"), 0.4)
                .with(k("trailing_stop.enabled"), true)
                .with(k("trailing_stop.distance"), 0.02)
                .with(k("position.timeframe"), "4h"),
            Self::MlHyperparams => ParameterVector::new()
                .with(k("lgbm.learning_rate"), 0.05)
                .with(k("lgbm.max_depth"), 6_i64)
                .with(k("lgbm.num_leaves"), 32_i64)
                .with(k("lgbm.feature_fraction"), 0.8)
                .with(k("ensemble.lgbm_weight"), 0.6)
                .with(k("ensemble.xgb_weight"), 0.4)
                .with(k("early_stopping.enabled"), true)
                .with(k("early_stopping.patience"), 50_i64)
                .with(k("model.kind"), "ensemble"),
        }
    }
}

fn leaves_fit_depth(params: &ParameterVector) -> bool {
    let leaves = params.get("ml.lgbm.num_leaves").and_then(ParamValue::as_i64);
    let depth = params.get("ml.lgbm.max_depth").and_then(ParamValue::as_i64);
    match (leaves, depth) {
        (Some(leaves), Some(depth)) if (0..63).contains(&depth) => leaves <= 1_i64 << depth,
        _ => false,
    }
}

impl fmt::Display for ParameterSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ParameterSchema {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "risk" => Ok(Self::Risk),
            "strategy" => Ok(Self::Strategy),
            "ml" | "ml_hyperparams" => Ok(Self::MlHyperparams),
            other => Err(Error::InvalidInput(format!(
                "Unknown parameter schema '{other}' (expected risk, strategy or ml_hyperparams)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_spaces_are_sampleable() {
        for schema in ParameterSchema::ALL {
            assert!(schema.search_space().validate().is_ok(), "{schema}");
        }
    }

    #[test]
    fn test_reference_vectors_pass_their_validators() {
        for schema in ParameterSchema::ALL {
            let validator = schema.validator();
            let reference = schema.reference_vector();
            assert!(
                validator.check_all(&reference).is_ok(),
                "{schema} reference rejected: {:?}",
                validator.check_all(&reference)
            );
        }
    }

    #[test]
    fn test_reference_vectors_cover_search_space() {
        for schema in ParameterSchema::ALL {
            let reference = schema.reference_vector();
            for (name, range) in schema.search_space().iter() {
                let value = reference.get(name).unwrap_or_else(|| panic!("{name} missing"));
                assert!(range.contains(value), "{name}={value} outside its range");
            }
        }
    }

    #[test]
    fn test_keys_carry_schema_prefix() {
        for schema in ParameterSchema::ALL {
            let prefix = format!("{}.", schema.key_prefix());
            assert!(schema.search_space().iter().all(|(k, _)| k.starts_with(&prefix)));
        }
    }

    #[test]
    fn test_parse_schema_names() {
        assert_eq!("risk".parse::<ParameterSchema>().unwrap(), ParameterSchema::Risk);
        assert_eq!("ml".parse::<ParameterSchema>().unwrap(), ParameterSchema::MlHyperparams);
        assert!("nope".parse::<ParameterSchema>().is_err());
    }

    #[test]
    fn test_leaves_fit_depth() {
        let v = ParameterVector::new()
            .with("ml.lgbm.num_leaves", 128_i64)
            .with("ml.lgbm.max_depth", 6_i64);
        assert!(!leaves_fit_depth(&v));
        let v = v.with("ml.lgbm.max_depth", 7_i64);
        assert!(leaves_fit_depth(&v));
    }
}
