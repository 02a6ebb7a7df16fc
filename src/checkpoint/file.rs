//! Filesystem checkpoint store

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::{check_append_only, check_phase_name, Checkpoint, CheckpointStore};
use crate::outcome::{FailureReport, FinalResult};
use crate::trial::Stage;
use crate::{Error, Result};

/// Write `bytes` to `path` atomically: uniquely named temp file in the same
/// directory, fsync, rename. On failure the temp file is removed and `path`
/// is untouched. Concurrent writers of one artifact never share a temp file;
/// the last rename wins.
///
/// # Errors
///
/// Any IO error from directory creation, writing, syncing or renaming.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map_or_else(|| "artifact".to_string(), |n| n.to_string_lossy().into_owned());
    let mut temp = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(".tmp")
        .tempfile_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// One JSON file per artifact under a root directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    /// Store rooted at `root` (created lazily).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the checkpoint of `(phase, stage)`.
    #[must_use]
    pub fn checkpoint_path(&self, phase: &str, stage: Stage) -> PathBuf {
        self.root.join(phase).join(format!("{}.json", stage.name()))
    }

    /// Path of the final result of `phase`.
    #[must_use]
    pub fn final_path(&self, phase: &str) -> PathBuf {
        self.root.join(phase).join("final.json")
    }

    /// Path of the failure report of `phase`.
    #[must_use]
    pub fn failure_path(&self, phase: &str) -> PathBuf {
        self.root.join(phase).join("failure.json")
    }

    fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        write_atomic(path, &bytes).map_err(|source| Error::Persistence {
            path: path.to_path_buf(),
            source,
        })
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(Error::Persistence {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::Persistence {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidData, e),
            })
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        check_phase_name(checkpoint.phase())?;
        if let Some(existing) = self.load(checkpoint.phase(), checkpoint.stage())? {
            check_append_only(&existing, checkpoint)?;
        }
        self.replace(checkpoint)
    }

    fn replace(&self, checkpoint: &Checkpoint) -> Result<()> {
        check_phase_name(checkpoint.phase())?;
        let path = self.checkpoint_path(checkpoint.phase(), checkpoint.stage());
        Self::write_json(&path, checkpoint)?;
        info!(
            phase = checkpoint.phase(),
            stage = %checkpoint.stage(),
            status = ?checkpoint.status(),
            trials = checkpoint.trials().len(),
            path = %path.display(),
            "Checkpoint saved"
        );
        Ok(())
    }

    fn load(&self, phase: &str, stage: Stage) -> Result<Option<Checkpoint>> {
        check_phase_name(phase)?;
        let loaded: Option<Checkpoint> = Self::read_json(&self.checkpoint_path(phase, stage))?;
        if let Some(checkpoint) = &loaded {
            debug!(phase, stage = %stage, status = ?checkpoint.status(), "Checkpoint loaded");
        }
        Ok(loaded)
    }

    fn discard(&self, phase: &str, stage: Stage) -> Result<()> {
        check_phase_name(phase)?;
        let path = self.checkpoint_path(phase, stage);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(phase, stage = %stage, "Checkpoint discarded");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::Persistence { path, source }),
        }
    }

    fn save_final(&self, result: &FinalResult) -> Result<()> {
        check_phase_name(result.phase())?;
        let path = self.final_path(result.phase());
        Self::write_json(&path, result)?;
        info!(phase = result.phase(), path = %path.display(), "Final result saved");
        Ok(())
    }

    fn load_final(&self, phase: &str) -> Result<Option<FinalResult>> {
        check_phase_name(phase)?;
        Self::read_json(&self.final_path(phase))
    }

    fn save_failure(&self, report: &FailureReport) -> Result<()> {
        check_phase_name(report.phase())?;
        Self::write_json(&self.failure_path(report.phase()), report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("a.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert_eq!(entries(&dir.path().join("nested")), vec!["a.json"]);
    }

    #[test]
    fn test_write_atomic_failure_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.json");
        fs::create_dir(&path).unwrap();
        assert!(write_atomic(&path, b"data").is_err());
        assert_eq!(entries(dir.path()), vec!["target.json"]);
    }

    #[test]
    fn test_concurrent_writers_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("final.json");
        let payloads: Vec<Vec<u8>> = (0..8).map(|i| format!("{{\"writer\": {i}}}").into_bytes()).collect();

        std::thread::scope(|scope| {
            let handles: Vec<_> = payloads
                .iter()
                .map(|bytes| {
                    let path = &path;
                    scope.spawn(move || write_atomic(path, bytes))
                })
                .collect();
            for handle in handles {
                assert!(handle.join().unwrap().is_ok());
            }
        });

        let written = fs::read(&path).unwrap();
        assert!(payloads.contains(&written));
        assert_eq!(entries(dir.path()), vec!["final.json"]);
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_corrupt_checkpoint_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let path = store.checkpoint_path("risk", Stage::Stage1);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(store.load("risk", Stage::Stage1), Err(Error::Persistence { .. })));
    }
}
