//! Configuration management for the CLI

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// User configuration, read from `~/.config/pm25/config.json`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Artifact store used when `--artifacts` is not given
    pub artifact_dir: Option<PathBuf>,
    /// Default output format (`table` or `json`)
    pub default_format: Option<String>,
    /// Older runs kept in the store after training
    pub versions_to_keep: Option<usize>,
}

impl Config {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        serde_json::from_str(&content).context("Failed to parse config file")
    }

    /// Artifact directory: explicit flag, then config, then `models`
    pub fn artifact_dir(&self, flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| self.artifact_dir.clone())
            .unwrap_or_else(|| PathBuf::from("models"))
    }

    pub fn versions_to_keep(&self) -> usize {
        self.versions_to_keep.unwrap_or(5)
    }

    /// Get the configuration file path
    fn config_path() -> Option<PathBuf> {
        dirs_next::home_dir().map(|home| home.join(".config").join("pm25").join("config.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert!(config.artifact_dir.is_none());
        assert_eq!(config.versions_to_keep(), 5);
        assert_eq!(config.artifact_dir(None), PathBuf::from("models"));
    }

    #[test]
    fn test_flag_beats_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"artifact_dir": "/srv/pm25/models", "default_format": "json"}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.artifact_dir(None), PathBuf::from("/srv/pm25/models"));
        assert_eq!(
            config.artifact_dir(Some(PathBuf::from("local"))),
            PathBuf::from("local")
        );
        assert_eq!(config.default_format.as_deref(), Some("json"));
    }
}
