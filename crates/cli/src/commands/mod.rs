//! Command implementations

pub mod data;
pub mod predict;
pub mod report;

use crate::output::OutputFormat;
use anyhow::{Context, Result};
use forecast_lib::{ArtifactStore, PredictionService};
use std::path::PathBuf;

/// Settings resolved from flags, environment and the config file
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub artifact_dir: PathBuf,
    pub versions_to_keep: usize,
    pub format: OutputFormat,
}

impl CommandContext {
    pub fn store(&self) -> Result<ArtifactStore> {
        ArtifactStore::open(&self.artifact_dir, self.versions_to_keep).with_context(|| {
            format!(
                "Failed to open artifact store {}",
                self.artifact_dir.display()
            )
        })
    }

    /// Prediction service over the store's current pair
    pub fn service(&self) -> Result<PredictionService> {
        let pair = self.store()?.load_current().with_context(|| {
            format!(
                "No usable model in {}; run `aqf train` first",
                self.artifact_dir.display()
            )
        })?;
        Ok(PredictionService::new(pair))
    }
}
