//! Final configuration integration
//!
//! Merges the best parameters of one or more phases into a destination
//! JSON or YAML document.
//!
//! ## Write protocol
//!
//! 1. Collect dotted overrides; later phases win on conflicting keys
//! 2. Expand into nested form and deep-merge onto the destination
//! 3. Validate the whole merged document in memory
//! 4. Back up the destination, then write it atomically
//!
//! Any failure before the rename leaves the destination untouched and
//! reports which keys were not applied.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::checkpoint::write_atomic;
use crate::dotted::{deep_merge, diff, flatten, unflatten, KeyChange};
use crate::outcome::FinalResult;
use crate::{Error, Result};

/// Destination document syntax, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    /// `.json`
    Json,
    /// `.yaml` / `.yml`
    Yaml,
}

impl DocumentFormat {
    /// Format of `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for any other extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(Self::Json),
            Some("yaml" | "yml") => Ok(Self::Yaml),
            _ => Err(Error::InvalidInput(format!(
                "destination {} must end in .json, .yaml or .yml",
                path.display()
            ))),
        }
    }

    fn parse(self, text: &str) -> std::result::Result<Value, String> {
        if text.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        match self {
            Self::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
            Self::Yaml => serde_yaml::from_str(text).map_err(|e| e.to_string()),
        }
    }

    fn render(self, doc: &Value) -> std::result::Result<String, String> {
        match self {
            Self::Json => serde_json::to_string_pretty(doc)
                .map(|mut s| {
                    s.push('\n');
                    s
                })
                .map_err(|e| e.to_string()),
            Self::Yaml => serde_yaml::to_string(doc).map_err(|e| e.to_string()),
        }
    }
}

/// A key set by more than one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyConflict {
    /// Dotted key
    pub key: String,
    /// Phase whose value was discarded
    pub overridden_phase: String,
    /// Discarded value
    pub overridden_value: Value,
    /// Phase whose value was applied
    pub winning_phase: String,
    /// Applied value
    pub winning_value: Value,
}

/// Outcome of [`ResultAggregator::merge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationReport {
    /// Destination document
    pub destination: PathBuf,
    /// Whether this was a dry run
    pub dry_run: bool,
    /// Phases merged, in order
    pub phases: Vec<String>,
    /// Dotted overrides applied
    pub applied: BTreeMap<String, Value>,
    /// Leaf-level changes to the destination
    pub changes: Vec<KeyChange>,
    /// Keys set by more than one phase
    pub conflicts: Vec<KeyConflict>,
    /// Backup of the previous destination, if one was taken
    pub backup: Option<PathBuf>,
    /// Whether the destination was rewritten
    pub written: bool,
}

impl IntegrationReport {
    /// Whether merging changes nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Merges [`FinalResult`]s into a destination configuration.
///
/// # Examples
///
/// ```rust
/// use hybrid_optimizer::aggregator::ResultAggregator;
/// use hybrid_optimizer::outcome::FinalResult;
/// use hybrid_optimizer::params::ParameterVector;
///
/// # fn main() -> hybrid_optimizer::Result<()> {
/// let dir = std::env::temp_dir().join("hybrid-optimizer-doc");
/// let best = ParameterVector::new().with("risk.kelly.fraction", 0.3);
/// let report = ResultAggregator::new(dir.join("config.json"))
///     .dry_run(true)
///     .merge(&[FinalResult::new("risk", best, 1.2)])?;
/// assert!(!report.written);
/// assert_eq!(report.changes.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    destination: PathBuf,
    dry_run: bool,
    backup_dir: Option<PathBuf>,
}

impl ResultAggregator {
    /// Aggregator writing to `destination`.
    #[must_use]
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            dry_run: false,
            backup_dir: None,
        }
    }

    /// Produce the report without writing.
    #[must_use]
    pub const fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Directory for backups (default: next to the destination).
    #[must_use]
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    /// Get the destination.
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Merge `results` (earliest phase first) into the destination.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for an empty input or unknown extension
    /// - [`Error::Integration`] when reading, merging, validating, backing up
    ///   or writing fails; the destination is untouched
    pub fn merge(&self, results: &[FinalResult]) -> Result<IntegrationReport> {
        if results.is_empty() {
            return Err(Error::InvalidInput("no final results to integrate".to_string()));
        }
        let format = DocumentFormat::from_path(&self.destination)?;
        let (applied, conflicts) = collect_overrides(results);
        let unapplied: Vec<String> = applied.keys().cloned().collect();
        let fail = |reason: String| Error::Integration {
            reason,
            unapplied: unapplied.clone(),
        };

        let before = self.read_destination(format).map_err(&fail)?;
        let patch = unflatten(&applied).map_err(|e| fail(e.to_string()))?;
        let mut merged = before.clone();
        deep_merge(&mut merged, patch);

        let rendered = validate(format, &merged, &applied).map_err(&fail)?;
        let changes = diff(&before, &merged);

        let mut report = IntegrationReport {
            destination: self.destination.clone(),
            dry_run: self.dry_run,
            phases: results.iter().map(|r| r.phase().to_string()).collect(),
            applied,
            changes,
            conflicts,
            backup: None,
            written: false,
        };

        if self.dry_run {
            info!(
                destination = %self.destination.display(),
                changes = report.changes.len(),
                conflicts = report.conflicts.len(),
                "Dry run: destination not written"
            );
            return Ok(report);
        }
        if report.is_noop() {
            info!(destination = %self.destination.display(), "Destination already up to date");
            return Ok(report);
        }

        report.backup = self
            .backup()
            .map_err(|e| fail(format!("backup failed: {e}")))?;
        write_atomic(&self.destination, rendered.as_bytes())
            .map_err(|e| fail(format!("write failed: {e}")))?;
        report.written = true;

        info!(
            destination = %self.destination.display(),
            changes = report.changes.len(),
            phases = ?report.phases,
            "Configuration integrated"
        );
        Ok(report)
    }

    fn read_destination(&self, format: DocumentFormat) -> std::result::Result<Value, String> {
        let text = match fs::read_to_string(&self.destination) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(destination = %self.destination.display(), "Destination missing; starting from an empty document");
                String::new()
            }
            Err(e) => return Err(format!("cannot read {}: {e}", self.destination.display())),
        };
        let doc = format.parse(&text)?;
        if doc.is_object() {
            Ok(doc)
        } else {
            Err("destination root must be a mapping".to_string())
        }
    }

    fn backup(&self) -> io::Result<Option<PathBuf>> {
        if !self.destination.exists() {
            return Ok(None);
        }
        let file_name = self
            .destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = match &self.backup_dir {
            Some(dir) => dir.clone(),
            None => self
                .destination
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
        };
        fs::create_dir_all(&dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6f");
        let path = dir.join(format!("{file_name}.bak.{stamp}"));
        fs::copy(&self.destination, &path)?;
        debug!(backup = %path.display(), "Destination backed up");
        Ok(Some(path))
    }
}

fn collect_overrides(results: &[FinalResult]) -> (BTreeMap<String, Value>, Vec<KeyConflict>) {
    let mut owners: BTreeMap<String, (String, Value)> = BTreeMap::new();
    let mut conflicts = Vec::new();

    for result in results {
        for (key, value) in result.best_params().iter() {
            let value = value.to_json();
            if let Some((phase, previous)) = owners.get(key) {
                if phase != result.phase() && *previous != value {
                    warn!(
                        key = %key,
                        overridden = %phase,
                        winner = result.phase(),
                        "Conflicting parameter across phases; later phase wins"
                    );
                    conflicts.push(KeyConflict {
                        key: key.clone(),
                        overridden_phase: phase.clone(),
                        overridden_value: previous.clone(),
                        winning_phase: result.phase().to_string(),
                        winning_value: value.clone(),
                    });
                }
            }
            owners.insert(key.clone(), (result.phase().to_string(), value));
        }
    }

    let applied = owners.into_iter().map(|(k, (_, v))| (k, v)).collect();
    (applied, conflicts)
}

/// Render the merged document and check it parses back to itself with every
/// override in place.
fn validate(
    format: DocumentFormat,
    merged: &Value,
    applied: &BTreeMap<String, Value>,
) -> std::result::Result<String, String> {
    let flat = flatten(merged);
    let missing: Vec<&String> = applied
        .iter()
        .filter(|(key, value)| flat.get(*key) != Some(value))
        .map(|(key, _)| key)
        .collect();
    if !missing.is_empty() {
        return Err(format!("merged document does not carry {missing:?}"));
    }

    let rendered = format.render(merged)?;
    let reparsed = format.parse(&rendered)?;
    if reparsed != *merged {
        return Err("merged document does not survive serialization".to_string());
    }
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterVector;
    use serde_json::json;

    fn result(phase: &str, params: ParameterVector) -> FinalResult {
        FinalResult::new(phase, params, 1.0)
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(DocumentFormat::from_path(Path::new("a.json")).unwrap(), DocumentFormat::Json);
        assert_eq!(DocumentFormat::from_path(Path::new("a.yml")).unwrap(), DocumentFormat::Yaml);
        assert!(DocumentFormat::from_path(Path::new("a.toml")).is_err());
    }

    #[test]
    fn test_later_phase_wins() {
        let (applied, conflicts) = collect_overrides(&[
            result("risk", ParameterVector::new().with("shared.x", 1.0)),
            result("strategy", ParameterVector::new().with("shared.x", 2.0)),
        ]);
        assert_eq!(applied["shared.x"], json!(2.0));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].overridden_phase, "risk");
        assert_eq!(conflicts[0].winning_phase, "strategy");
    }

    #[test]
    fn test_equal_values_are_not_conflicts() {
        let (_, conflicts) = collect_overrides(&[
            result("risk", ParameterVector::new().with("shared.x", 1.0)),
            result("strategy", ParameterVector::new().with("shared.x", 1.0)),
        ]);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_validate_detects_missing_override() {
        let applied: BTreeMap<String, Value> = [("a.b".to_string(), json!(1))].into_iter().collect();
        assert!(validate(DocumentFormat::Json, &json!({"a": {"b": 2}}), &applied).is_err());
        assert!(validate(DocumentFormat::Yaml, &json!({"a": {"b": 1}}), &applied).is_ok());
    }
}
