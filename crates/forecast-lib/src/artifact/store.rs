//! On-disk artifact store
//!
//! ```text
//! <root>/
//!   CURRENT                      run id of the active pair
//!   runs/<run_id>/regressor.json
//!   runs/<run_id>/classifier.json
//!   runs/<run_id>/checksums.json sha256 of both artifact files
//! ```
//!
//! Every file is written to a temp path, synced and renamed into place. A
//! run directory is complete before `CURRENT` is repointed at it, so a
//! reader that follows `CURRENT` sees either the old pair or the new one.

use super::{ArtifactPair, ModelArtifact};
use crate::error::{ForecastError, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CURRENT_FILE: &str = "CURRENT";
const RUNS_DIR: &str = "runs";
const REGRESSOR_FILE: &str = "regressor.json";
const CLASSIFIER_FILE: &str = "classifier.json";
const CHECKSUMS_FILE: &str = "checksums.json";

/// A stored training run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInfo {
    pub run_id: String,
    pub path: PathBuf,
    pub is_current: bool,
}

/// Versioned directory of artifact pairs
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    versions_to_keep: usize,
}

impl ArtifactStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// `versions_to_keep` counts runs retained besides the current one.
    pub fn open(root: impl Into<PathBuf>, versions_to_keep: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(RUNS_DIR))?;
        Ok(Self {
            root,
            versions_to_keep,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(RUNS_DIR).join(run_id)
    }

    /// Persist a pair and make it current
    pub fn save(&self, pair: &ArtifactPair) -> Result<PathBuf> {
        let run_id = pair.run_id();
        validate_run_id(run_id)?;
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir)?;

        let mut checksums = BTreeMap::new();
        for (file, artifact) in [
            (REGRESSOR_FILE, pair.regressor()),
            (CLASSIFIER_FILE, pair.classifier()),
        ] {
            let bytes = artifact.to_json()?;
            checksums.insert(file.to_string(), compute_checksum(&bytes));
            write_atomic(&dir.join(file), &bytes)?;
        }
        write_atomic(
            &dir.join(CHECKSUMS_FILE),
            &serde_json::to_vec_pretty(&checksums)?,
        )?;

        write_atomic(&self.root.join(CURRENT_FILE), run_id.as_bytes())?;

        info!(
            run_id = %run_id,
            path = %dir.display(),
            "Artifact pair saved and marked current"
        );

        self.prune()?;
        Ok(dir)
    }

    /// Run id `CURRENT` points at, if any
    pub fn current_run(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.root.join(CURRENT_FILE)) {
            Ok(content) => {
                let run_id = content.trim().to_string();
                Ok(if run_id.is_empty() { None } else { Some(run_id) })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load and verify the current pair
    pub fn load_current(&self) -> Result<ArtifactPair> {
        let run_id = self
            .current_run()?
            .ok_or_else(|| ForecastError::ArtifactNotFound(self.root.clone()))?;
        self.load_run(&run_id)
    }

    /// Load and verify a specific run
    pub fn load_run(&self, run_id: &str) -> Result<ArtifactPair> {
        validate_run_id(run_id)?;
        let dir = self.run_dir(run_id);
        if !dir.is_dir() {
            return Err(ForecastError::ArtifactNotFound(dir));
        }

        let checksums: BTreeMap<String, String> =
            serde_json::from_slice(&fs::read(dir.join(CHECKSUMS_FILE))?)?;

        let read_verified = |file: &str| -> Result<ModelArtifact> {
            let path = dir.join(file);
            let bytes = fs::read(&path)?;
            let actual = compute_checksum(&bytes);
            let expected = checksums.get(file).cloned().unwrap_or_default();
            if actual != expected {
                return Err(ForecastError::ChecksumMismatch {
                    path,
                    expected,
                    actual,
                });
            }
            ModelArtifact::from_json(&bytes)
        };

        let pair = ArtifactPair::new(
            read_verified(REGRESSOR_FILE)?,
            read_verified(CLASSIFIER_FILE)?,
        )?;

        debug!(run_id = %run_id, "Loaded artifact pair");
        Ok(pair)
    }

    /// Stored runs, oldest first
    pub fn list_runs(&self) -> Result<Vec<RunInfo>> {
        let current = self.current_run()?;
        let mut runs = Vec::new();
        for entry in fs::read_dir(self.root.join(RUNS_DIR))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let run_id = entry.file_name().to_string_lossy().into_owned();
            runs.push(RunInfo {
                is_current: current.as_deref() == Some(run_id.as_str()),
                path: entry.path(),
                run_id,
            });
        }
        // run ids lead with a UTC timestamp, so lexical order is chronological
        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(runs)
    }

    /// Repoint `CURRENT` at the run before it and discard the current run.
    ///
    /// Returns the run id now current, or `None` when there is nothing older.
    pub fn rollback(&self) -> Result<Option<String>> {
        let Some(current) = self.current_run()? else {
            warn!("No current artifact pair to roll back from");
            return Ok(None);
        };
        let runs = self.list_runs()?;
        let previous = runs
            .iter()
            .rev()
            .find(|r| r.run_id < current)
            .map(|r| r.run_id.clone());

        let Some(previous) = previous else {
            warn!(run_id = %current, "No previous artifact pair available for rollback");
            return Ok(None);
        };

        // refuse to point at a run that does not load cleanly
        self.load_run(&previous)?;
        write_atomic(&self.root.join(CURRENT_FILE), previous.as_bytes())?;

        if let Err(e) = fs::remove_dir_all(self.run_dir(&current)) {
            warn!(
                run_id = %current,
                error = %e,
                "Failed to remove rolled-back run"
            );
        }

        info!(from = %current, to = %previous, "Rolled back to previous artifact pair");
        Ok(Some(previous))
    }

    /// Delete the oldest runs beyond `versions_to_keep`, never the current one
    pub fn prune(&self) -> Result<usize> {
        let runs = self.list_runs()?;
        let older: Vec<&RunInfo> = runs.iter().filter(|r| !r.is_current).collect();
        let excess = older.len().saturating_sub(self.versions_to_keep);

        let mut removed = 0;
        for run in older.into_iter().take(excess) {
            match fs::remove_dir_all(&run.path) {
                Ok(()) => {
                    debug!(run_id = %run.run_id, "Pruned old artifact run");
                    removed += 1;
                }
                Err(e) => warn!(
                    run_id = %run.run_id,
                    error = %e,
                    "Failed to prune old artifact run"
                ),
            }
        }
        Ok(removed)
    }
}

/// SHA-256 of `data`, lowercase hex
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn validate_run_id(run_id: &str) -> Result<()> {
    let valid = !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ForecastError::InvalidRunId(run_id.to_string()))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}
