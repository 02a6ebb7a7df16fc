//! Dotted-key helpers for hierarchical configuration documents
//!
//! Parameter vectors use flat dotted keys (`risk.kelly.fraction`); base and
//! destination configurations are nested JSON/YAML documents. These pure
//! functions convert between the two forms.
//!
//! ```rust
//! use serde_json::json;
//! use hybrid_optimizer::dotted::{deep_merge, flatten, unflatten};
//!
//! let mut base = json!({"risk": {"kelly": {"fraction": 0.25, "cap": 0.1}}});
//! let flat = [("risk.kelly.fraction".to_string(), json!(0.5))].into_iter().collect();
//! deep_merge(&mut base, unflatten(&flat).unwrap());
//! assert_eq!(flatten(&base)["risk.kelly.fraction"], json!(0.5));
//! assert_eq!(flatten(&base)["risk.kelly.cap"], json!(0.1));
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::params::ParameterVector;
use crate::{Error, Result};

/// Collapse a nested document into dotted leaf keys.
///
/// Scalars, arrays and empty objects are leaves. A non-object root yields a
/// single entry under the empty key.
#[must_use]
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into(String::new(), value, &mut out);
    out
}

fn flatten_into(prefix: String, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(path, child, out);
            }
        }
        leaf => {
            out.insert(prefix, leaf.clone());
        }
    }
}

/// Expand dotted keys into a nested object.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] when a key is empty, has an empty segment,
/// or is both a leaf and a prefix of another key (`a` and `a.b`).
pub fn unflatten(flat: &BTreeMap<String, Value>) -> Result<Value> {
    let mut root = Map::new();
    for (key, value) in flat {
        let segments: Vec<&str> = key.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(Error::InvalidInput(format!("Malformed dotted key '{key}'")));
        }
        let (leaf, parents) = segments
            .split_last()
            .ok_or_else(|| Error::InvalidInput("Empty dotted key".to_string()))?;

        let mut node = &mut root;
        for (depth, segment) in parents.iter().enumerate() {
            let child = node
                .entry((*segment).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            node = child.as_object_mut().ok_or_else(|| {
                Error::InvalidInput(format!(
                    "Key '{key}' conflicts with leaf '{}'",
                    segments[..=depth].join(".")
                ))
            })?;
        }
        if node.get(*leaf).is_some_and(Value::is_object) {
            return Err(Error::InvalidInput(format!(
                "Key '{key}' is also a prefix of other keys"
            )));
        }
        node.insert((*leaf).to_string(), value.clone());
    }
    Ok(Value::Object(root))
}

/// Merge `overlay` into `base`. Objects merge key by key; any other overlay
/// value replaces what was there.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// One leaf that differs between two documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyChange {
    /// Dotted key
    pub key: String,
    /// Value before (`None` if added)
    pub before: Option<Value>,
    /// Value after (`None` if removed)
    pub after: Option<Value>,
}

/// Leaf-level differences, sorted by key.
#[must_use]
pub fn diff(before: &Value, after: &Value) -> Vec<KeyChange> {
    let old = flatten(before);
    let new = flatten(after);

    let mut keys: Vec<&String> = old.keys().chain(new.keys()).collect();
    keys.sort();
    keys.dedup();

    keys.into_iter()
        .filter_map(|key| {
            let (b, a) = (old.get(key), new.get(key));
            (b != a).then(|| KeyChange {
                key: key.clone(),
                before: b.cloned(),
                after: a.cloned(),
            })
        })
        .collect()
}

/// Return a copy of `base` with `params` merged in.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] when the parameter keys conflict.
pub fn inject(base: &Value, params: &ParameterVector) -> Result<Value> {
    let flat: BTreeMap<String, Value> = params
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    let mut merged = base.clone();
    deep_merge(&mut merged, unflatten(&flat)?);
    Ok(merged)
}
