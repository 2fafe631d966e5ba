//! Server configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Server configuration, read from `PM25_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Name reported in structured log events
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Port for the prediction, health and metrics API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Root of the artifact store
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Older runs kept next to the current one
    #[serde(default = "default_versions_to_keep")]
    pub versions_to_keep: usize,
}

fn default_service_name() -> String {
    "pm25-server".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_versions_to_keep() -> usize {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            api_port: default_api_port(),
            artifact_dir: default_artifact_dir(),
            versions_to_keep: default_versions_to_keep(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("PM25").try_parsing(true))
            .build()
            .context("reading PM25_* environment")?;

        config
            .try_deserialize()
            .context("invalid server configuration")
    }
}
