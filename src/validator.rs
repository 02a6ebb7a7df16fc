//! Cross-field parameter validation
//!
//! Poka-Yoke: reject impossible parameter combinations before they reach an
//! expensive evaluator.
//!
//! A [`ParameterValidator`] is an ordered list of named checks evaluated with
//! short-circuit. Failing is an ordinary outcome ([`Rejection`]), not an error.
//!
//! ```rust
//! use hybrid_optimizer::params::ParameterVector;
//! use hybrid_optimizer::validator::ParameterValidator;
//!
//! let validator = ParameterValidator::new().ordering("a_below_b", &["a", "b"]);
//! let params = ParameterVector::new().with("a", 2.0).with("b", 1.0);
//! assert!(!validator.validate(&params));
//! ```

use std::fmt;

use tracing::debug;

use crate::params::{ParamValue, ParameterVector};

/// Pure predicate over a whole vector, for constraints the built-in checks
/// cannot express.
pub type Predicate = fn(&ParameterVector) -> bool;

/// One constraint.
#[derive(Debug, Clone)]
pub enum Check {
    /// Field must be present
    Required {
        /// Field key
        field: String,
    },
    /// Numeric field must lie in `[min, max]`
    Range {
        /// Field key
        field: String,
        /// Inclusive lower bound
        min: f64,
        /// Inclusive upper bound
        max: f64,
    },
    /// Numeric fields must be strictly increasing in the listed order
    Ordering {
        /// Field keys, lowest first
        fields: Vec<String>,
    },
    /// Numeric fields must sum to one within `epsilon`
    SumToOne {
        /// Field keys
        fields: Vec<String>,
        /// Tolerance
        epsilon: f64,
    },
    /// `then` applies only when `field` equals `equals`
    Conditional {
        /// Gate field
        field: String,
        /// Gate value
        equals: ParamValue,
        /// Check applied when the gate holds
        then: Box<Check>,
    },
    /// Arbitrary pure predicate
    Custom {
        /// Description used in rejection messages
        description: String,
        /// Predicate returning `true` when the vector is acceptable
        predicate: Predicate,
    },
}

impl Check {
    fn evaluate(&self, params: &ParameterVector) -> Result<(), String> {
        match self {
            Self::Required { field } => {
                if params.contains(field) {
                    Ok(())
                } else {
                    Err(format!("{field} is missing"))
                }
            }
            Self::Range { field, min, max } => {
                let value = numeric(params, field)?;
                if value >= *min && value <= *max {
                    Ok(())
                } else {
                    Err(format!("{field}={value} outside [{min}, {max}]"))
                }
            }
            Self::Ordering { fields } => {
                let values = fields
                    .iter()
                    .map(|f| numeric(params, f))
                    .collect::<Result<Vec<_>, _>>()?;
                for (i, pair) in values.windows(2).enumerate() {
                    if pair[0] >= pair[1] {
                        return Err(format!(
                            "{}={} must be below {}={}",
                            fields[i],
                            pair[0],
                            fields[i + 1],
                            pair[1]
                        ));
                    }
                }
                Ok(())
            }
            Self::SumToOne { fields, epsilon } => {
                let mut sum = 0.0;
                for field in fields {
                    sum += numeric(params, field)?;
                }
                if (sum - 1.0).abs() <= *epsilon {
                    Ok(())
                } else {
                    Err(format!("{} sum to {sum}, expected 1 ± {epsilon}", fields.join(" + ")))
                }
            }
            Self::Conditional {
                field,
                equals,
                then,
            } => {
                if params.get(field) == Some(equals) {
                    then.evaluate(params)
                        .map_err(|reason| format!("when {field}={equals}: {reason}"))
                } else {
                    Ok(())
                }
            }
            Self::Custom {
                description,
                predicate,
            } => {
                if predicate(params) {
                    Ok(())
                } else {
                    Err(description.clone())
                }
            }
        }
    }
}

fn numeric(params: &ParameterVector, field: &str) -> Result<f64, String> {
    match params.get(field) {
        None => Err(format!("{field} is missing")),
        Some(value) => match value.as_f64() {
            Some(v) if v.is_finite() => Ok(v),
            Some(v) => Err(format!("{field}={v} is not finite")),
            None => Err(format!("{field}={value} is not numeric")),
        },
    }
}

/// A named check failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Name of the first failing check
    pub check: String,
    /// Human-readable detail
    pub reason: String,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "check '{}' failed: {}", self.check, self.reason)
    }
}

#[derive(Debug, Clone)]
struct NamedCheck {
    name: String,
    check: Check,
}

/// Ordered set of named checks.
#[derive(Debug, Clone, Default)]
pub struct ParameterValidator {
    checks: Vec<NamedCheck>,
}

impl ParameterValidator {
    /// Create a validator that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named check.
    #[must_use]
    pub fn check(mut self, name: impl Into<String>, check: Check) -> Self {
        self.checks.push(NamedCheck {
            name: name.into(),
            check,
        });
        self
    }

    /// Require a field to be present.
    #[must_use]
    pub fn required(self, field: &str) -> Self {
        self.check(
            format!("required:{field}"),
            Check::Required {
                field: field.to_string(),
            },
        )
    }

    /// Require `field` to lie in `[min, max]`.
    #[must_use]
    pub fn range(self, name: &str, field: &str, min: f64, max: f64) -> Self {
        self.check(
            name,
            Check::Range {
                field: field.to_string(),
                min,
                max,
            },
        )
    }

    /// Require `fields` to be strictly increasing.
    #[must_use]
    pub fn ordering(self, name: &str, fields: &[&str]) -> Self {
        self.check(
            name,
            Check::Ordering {
                fields: fields.iter().map(|f| (*f).to_string()).collect(),
            },
        )
    }

    /// Require `fields` to sum to one within `epsilon`.
    #[must_use]
    pub fn sum_to_one(self, name: &str, fields: &[&str], epsilon: f64) -> Self {
        self.check(
            name,
            Check::SumToOne {
                fields: fields.iter().map(|f| (*f).to_string()).collect(),
                epsilon,
            },
        )
    }

    /// Apply `then` only while `field == equals`.
    #[must_use]
    pub fn conditional(
        self,
        name: &str,
        field: &str,
        equals: impl Into<ParamValue>,
        then: Check,
    ) -> Self {
        self.check(
            name,
            Check::Conditional {
                field: field.to_string(),
                equals: equals.into(),
                then: Box::new(then),
            },
        )
    }

    /// Append a custom predicate.
    #[must_use]
    pub fn custom(self, name: &str, description: &str, predicate: Predicate) -> Self {
        self.check(
            name,
            Check::Custom {
                description: description.to_string(),
                predicate,
            },
        )
    }

    /// Run every check in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] of the first failing check.
    pub fn check_all(&self, params: &ParameterVector) -> Result<(), Rejection> {
        for named in &self.checks {
            if let Err(reason) = named.check.evaluate(params) {
                debug!(check = %named.name, %reason, "parameter vector rejected");
                return Err(Rejection {
                    check: named.name.clone(),
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Boolean form of [`check_all`](Self::check_all).
    #[must_use]
    pub fn validate(&self, params: &ParameterVector) -> bool {
        self.check_all(params).is_ok()
    }

    /// Names of the checks, in evaluation order.
    #[must_use]
    pub fn check_names(&self) -> Vec<&str> {
        self.checks.iter().map(|c| c.name.as_str()).collect()
    }

    /// Number of checks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    /// Whether the validator has no checks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_rejects_inverted_pair() {
        let validator = ParameterValidator::new().ordering("a_below_b", &["a", "b"]);
        let bad = ParameterVector::new().with("a", 2.0).with("b", 1.0);
        let good = ParameterVector::new().with("a", 1.0).with("b", 2.0);

        let rejection = validator.check_all(&bad).unwrap_err();
        assert_eq!(rejection.check, "a_below_b");
        assert!(validator.validate(&good));
    }

    #[test]
    fn test_ordering_rejects_equal_values() {
        let validator = ParameterValidator::new().ordering("lnh", &["low", "normal", "high"]);
        let v = ParameterVector::new()
            .with("low", 1.0)
            .with("normal", 1.0)
            .with("high", 3.0);
        assert!(!validator.validate(&v));
    }

    #[test]
    fn test_short_circuit_reports_first_failure() {
        let validator = ParameterValidator::new()
            .range("first", "x", 0.0, 1.0)
            .range("second", "y", 0.0, 1.0);
        let v = ParameterVector::new().with("x", 5.0).with("y", 5.0);
        assert_eq!(validator.check_all(&v).unwrap_err().check, "first");
    }

    #[test]
    fn test_sum_to_one_epsilon() {
        let validator = ParameterValidator::new().sum_to_one("weights", &["w1", "w2"], 1e-6);
        let ok = ParameterVector::new().with("w1", 0.3).with("w2", 0.7);
        let bad = ParameterVector::new().with("w1", 0.3).with("w2", 0.6);
        assert!(validator.validate(&ok));
        assert!(!validator.validate(&bad));
    }

    #[test]
    fn test_conditional_only_applies_when_gate_holds() {
        let validator = ParameterValidator::new().conditional(
            "trail_distance",
            "trail.enabled",
            true,
            Check::Range {
                field: "trail.distance".to_string(),
                min: 0.01,
                max: 0.05,
            },
        );
        let off = ParameterVector::new()
            .with("trail.enabled", false)
            .with("trail.distance", 9.0);
        let on_bad = ParameterVector::new()
            .with("trail.enabled", true)
            .with("trail.distance", 9.0);
        assert!(validator.validate(&off));
        assert!(!validator.validate(&on_bad));
    }

    #[test]
    fn test_non_numeric_and_missing_fail_numeric_checks() {
        let validator = ParameterValidator::new().range("r", "x", 0.0, 1.0);
        assert!(!validator.validate(&ParameterVector::new()));
        assert!(!validator.validate(&ParameterVector::new().with("x", "high")));
        assert!(!validator.validate(&ParameterVector::new().with("x", f64::NAN)));
    }

    #[test]
    fn test_custom_predicate() {
        fn even_leaves(p: &ParameterVector) -> bool {
            p.get("leaves").and_then(ParamValue::as_i64).is_some_and(|v| v % 2 == 0)
        }
        let validator = ParameterValidator::new().custom("even", "leaves must be even", even_leaves);
        assert!(validator.validate(&ParameterVector::new().with("leaves", 4_i64)));
        assert!(!validator.validate(&ParameterVector::new().with("leaves", 5_i64)));
    }
}
