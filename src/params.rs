//! Parameter vectors and search spaces
//!
//! A [`ParameterVector`] is an ordered, immutable mapping from dotted key
//! (`"risk.kelly.max_position_size"`) to a scalar value. A [`SearchSpace`]
//! describes where samplers may draw those vectors from.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;

use rand::Rng;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A single sampled parameter value.
///
/// Serialized untagged so checkpoints and configs carry plain scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean flag
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// Categorical choice
    Str(String),
}

impl ParamValue {
    /// Numeric view (integers widen to float).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Bool(_) | Self::Str(_) => None,
        }
    }

    /// Integer view (floats are not truncated).
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean view.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// String view.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to a JSON value for config injection.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(v) => serde_json::Value::Bool(*v),
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Str(s) => serde_json::Value::String(s.clone()),
        }
    }

    fn hash_into(&self, hasher: &mut FxHasher) {
        match self {
            Self::Bool(v) => {
                hasher.write_u8(0);
                hasher.write_u8(u8::from(*v));
            }
            Self::Int(v) => {
                hasher.write_u8(1);
                hasher.write_i64(*v);
            }
            Self::Float(v) => {
                hasher.write_u8(2);
                hasher.write_u64(v.to_bits());
            }
            Self::Str(s) => {
                hasher.write_u8(3);
                hasher.write(s.as_bytes());
            }
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Ordered mapping from dotted parameter key to value.
///
/// Immutable once built: there is no in-place mutation API. [`with`](Self::with)
/// consumes the vector and returns a new one, for assembling fixtures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterVector(BTreeMap<String, ParamValue>);

impl ParameterVector {
    /// Create an empty vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy of this vector with `key` set to `value`.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Look up a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    /// Numeric lookup.
    #[must_use]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(ParamValue::as_f64)
    }

    /// Boolean lookup.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(ParamValue::as_bool)
    }

    /// String lookup.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(ParamValue::as_str)
    }

    /// Whether the key is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the vector has no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    /// Borrow the underlying map.
    #[must_use]
    pub const fn as_map(&self) -> &BTreeMap<String, ParamValue> {
        &self.0
    }

    /// Consume into the underlying map.
    #[must_use]
    pub fn into_map(self) -> BTreeMap<String, ParamValue> {
        self.0
    }

    /// Stable 64-bit fingerprint of the vector contents.
    ///
    /// FxHash is deterministic across runs and platforms, so the fingerprint
    /// can seed per-vector noise reproducibly.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = FxHasher::default();
        for (key, value) in &self.0 {
            hasher.write(key.as_bytes());
            hasher.write_u8(0xff);
            value.hash_into(&mut hasher);
        }
        hasher.finish()
    }
}

impl FromIterator<(String, ParamValue)> for ParameterVector {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ParameterVector {
    type Item = (&'a String, &'a ParamValue);
    type IntoIter = std::collections::btree_map::Iter<'a, String, ParamValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Legal domain for one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamRange {
    /// Continuous range `[low, high]`, optionally sampled in log space
    Float {
        /// Lower bound
        low: f64,
        /// Upper bound
        high: f64,
        /// Sample uniformly in `ln` space
        #[serde(default)]
        log_scale: bool,
    },
    /// Integer range `[low, high]` on a `step` grid anchored at `low`
    Int {
        /// Lower bound
        low: i64,
        /// Upper bound
        high: i64,
        /// Grid step (>= 1)
        step: i64,
    },
    /// One of a fixed set of strings
    Categorical {
        /// Allowed choices
        choices: Vec<String>,
    },
    /// `true` or `false`
    Bool,
    /// Derived as `1 - of`; never sampled directly
    Complement {
        /// Key of the sampled partner
        of: String,
    },
}

impl ParamRange {
    /// Continuous range shorthand.
    #[must_use]
    pub const fn float(low: f64, high: f64) -> Self {
        Self::Float {
            low,
            high,
            log_scale: false,
        }
    }

    /// Log-scaled continuous range shorthand.
    #[must_use]
    pub const fn log_float(low: f64, high: f64) -> Self {
        Self::Float {
            low,
            high,
            log_scale: true,
        }
    }

    /// Integer range with unit step.
    #[must_use]
    pub const fn int(low: i64, high: i64) -> Self {
        Self::Int { low, high, step: 1 }
    }

    /// Categorical shorthand.
    #[must_use]
    pub fn categorical(choices: &[&str]) -> Self {
        Self::Categorical {
            choices: choices.iter().map(|c| (*c).to_string()).collect(),
        }
    }

    /// Complement-of shorthand.
    #[must_use]
    pub fn complement(of: impl Into<String>) -> Self {
        Self::Complement { of: of.into() }
    }

    /// Check that the domain can be sampled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for non-finite or inverted float
    /// bounds, log-scaled ranges that are not strictly positive, integer
    /// ranges whose span overflows `i64` or whose step is below 1, and
    /// empty categoricals.
    pub fn validate(&self) -> Result<()> {
        self.problem().map_or(Ok(()), |msg| Err(Error::InvalidInput(msg)))
    }

    fn problem(&self) -> Option<String> {
        match self {
            Self::Float {
                low,
                high,
                log_scale,
            } => {
                if !(low.is_finite() && high.is_finite()) || high < low {
                    return Some(format!("float range [{low}, {high}] is not a finite interval"));
                }
                if *log_scale && !(*low > 0.0 && low < high) {
                    return Some(format!("log-scaled range [{low}, {high}] needs 0 < low < high"));
                }
                None
            }
            Self::Int { low, high, step } => {
                if *step < 1 {
                    Some(format!("integer step must be at least 1, got {step}"))
                } else if high < low {
                    Some(format!("integer range [{low}, {high}] is inverted"))
                } else if high.checked_sub(*low).is_none() {
                    Some(format!("integer range [{low}, {high}] is too wide"))
                } else {
                    None
                }
            }
            Self::Categorical { choices } if choices.is_empty() => {
                Some("categorical range has no choices".to_string())
            }
            Self::Categorical { .. } | Self::Bool | Self::Complement { .. } => None,
        }
    }

    /// Draw a value. Returns `None` for derived ranges and for domains that
    /// fail [`ParamRange::validate`].
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<ParamValue> {
        match self {
            Self::Float {
                low,
                high,
                log_scale,
            } => {
                if !(low.is_finite() && high.is_finite()) || (*log_scale && *low <= 0.0) {
                    return None;
                }
                if high <= low {
                    return Some(ParamValue::Float(*low));
                }
                let value = if *log_scale {
                    rng.gen_range(low.ln()..high.ln()).exp()
                } else {
                    rng.gen_range(*low..*high)
                };
                Some(ParamValue::Float(value.clamp(*low, *high)))
            }
            Self::Int { low, high, step } => {
                let step = (*step).max(1);
                let slots = high.checked_sub(*low)?.max(0) / step;
                let slot = rng.gen_range(0..=slots);
                Some(ParamValue::Int(low + slot * step))
            }
            Self::Categorical { choices } => {
                if choices.is_empty() {
                    return None;
                }
                let idx = rng.gen_range(0..choices.len());
                Some(ParamValue::Str(choices[idx].clone()))
            }
            Self::Bool => Some(ParamValue::Bool(rng.gen_bool(0.5))),
            Self::Complement { .. } => None,
        }
    }

    /// Whether a value lies in this domain.
    #[must_use]
    pub fn contains(&self, value: &ParamValue) -> bool {
        match (self, value) {
            (Self::Float { low, high, .. }, v) => {
                v.as_f64().is_some_and(|x| x >= *low && x <= *high)
            }
            (Self::Int { low, high, .. }, ParamValue::Int(v)) => v >= low && v <= high,
            (Self::Categorical { choices }, ParamValue::Str(s)) => choices.contains(s),
            (Self::Bool, ParamValue::Bool(_)) => true,
            (Self::Complement { .. }, v) => v.as_f64().is_some_and(|x| (0.0..=1.0).contains(&x)),
            _ => false,
        }
    }

    /// Numeric bounds, when the domain is numeric.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn bounds(&self) -> Option<(f64, f64)> {
        match self {
            Self::Float { low, high, .. } => Some((*low, *high)),
            Self::Int { low, high, .. } => Some((*low as f64, *high as f64)),
            Self::Complement { .. } => Some((0.0, 1.0)),
            Self::Categorical { .. } | Self::Bool => None,
        }
    }
}

/// Named collection of parameter domains.
///
/// Keys are kept in sorted order so that seeded sampling is reproducible.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    params: BTreeMap<String, ParamRange>,
}

impl SearchSpace {
    /// Create an empty search space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fixed, known-good domain (builder style).
    ///
    /// The range is not checked; use [`SearchSpace::try_with`] for domains
    /// that come from user input.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, range: ParamRange) -> Self {
        self.params.insert(name.into(), range);
        self
    }

    /// Add a parameter after checking its domain (builder style).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when the range cannot be sampled.
    pub fn try_with(mut self, name: impl Into<String>, range: ParamRange) -> Result<Self> {
        self.insert(name, range)?;
        Ok(self)
    }

    /// Add a parameter in place after checking its domain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when the range cannot be sampled.
    pub fn insert(&mut self, name: impl Into<String>, range: ParamRange) -> Result<()> {
        let name = name.into();
        if let Some(msg) = range.problem() {
            return Err(Error::InvalidInput(format!("parameter '{name}': {msg}")));
        }
        self.params.insert(name, range);
        Ok(())
    }

    /// Check every domain, e.g. after deserializing a space.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the first unsampleable parameter.
    pub fn validate(&self) -> Result<()> {
        for (name, range) in &self.params {
            if let Some(msg) = range.problem() {
                return Err(Error::InvalidInput(format!("parameter '{name}': {msg}")));
            }
        }
        Ok(())
    }

    /// Look up a domain.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamRange> {
        self.params.get(name)
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether no parameters are defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Iterate in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamRange)> {
        self.params.iter()
    }

    /// Draw a full vector uniformly, then resolve complements.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterVector {
        let drawn: BTreeMap<String, ParamValue> = self
            .params
            .iter()
            .filter_map(|(name, range)| range.sample(rng).map(|v| (name.clone(), v)))
            .collect();
        self.resolve_complements(drawn)
    }

    /// Fill in every [`ParamRange::Complement`] from its partner.
    #[must_use]
    pub fn resolve_complements(&self, mut values: BTreeMap<String, ParamValue>) -> ParameterVector {
        for (name, range) in &self.params {
            if let ParamRange::Complement { of } = range {
                if let Some(partner) = values.get(of).and_then(ParamValue::as_f64) {
                    values.insert(name.clone(), ParamValue::Float(1.0 - partner));
                }
            }
        }
        ParameterVector(values)
    }
}
