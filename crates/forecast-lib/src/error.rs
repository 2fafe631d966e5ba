//! Error types for the forecasting core

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the forecasting pipeline
#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("no observations available to build features from")]
    DataUnavailable,

    #[error("invalid observation at {timestamp}: {reason}")]
    InvalidObservation {
        timestamp: DateTime<Utc>,
        reason: String,
    },

    #[error("insufficient history at {timestamp}: {reason}")]
    InsufficientHistory {
        timestamp: DateTime<Utc>,
        reason: String,
    },

    #[error("schema mismatch for {role}: {detail}")]
    SchemaMismatch { role: String, detail: String },

    #[error("invalid override for '{feature}' ({value}): {reason}")]
    InvalidOverride {
        feature: String,
        value: f64,
        reason: String,
    },

    #[error("feature '{feature}' at {location} is not finite ({value})")]
    NonFiniteFeature {
        feature: String,
        location: String,
        value: f64,
    },

    #[error("insufficient training data: {rows} rows, need at least {required}")]
    InsufficientTrainingData { rows: usize, required: usize },

    #[error("incompatible artifacts: {0}")]
    IncompatibleArtifacts(String),

    #[error("unsupported artifact format version {found}, expected {expected}")]
    UnsupportedFormat { found: u32, expected: u32 },

    #[error("checksum mismatch for {path:?}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("no artifacts found in {0:?}")]
    ArtifactNotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid run id '{0}'")]
    InvalidRunId(String),

    #[error("malformed input: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl ForecastError {
    /// Stable machine-readable kind, used in API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            ForecastError::DataUnavailable => "data_unavailable",
            ForecastError::InvalidObservation { .. } => "invalid_observation",
            ForecastError::InsufficientHistory { .. } => "insufficient_history",
            ForecastError::SchemaMismatch { .. } => "schema_mismatch",
            ForecastError::InvalidOverride { .. } => "invalid_override",
            ForecastError::NonFiniteFeature { .. } => "non_finite_feature",
            ForecastError::InsufficientTrainingData { .. } => "insufficient_training_data",
            ForecastError::IncompatibleArtifacts(_) => "incompatible_artifacts",
            ForecastError::UnsupportedFormat { .. } => "unsupported_format",
            ForecastError::ChecksumMismatch { .. } => "checksum_mismatch",
            ForecastError::ArtifactNotFound(_) => "artifact_not_found",
            ForecastError::InvalidConfig(_) => "invalid_config",
            ForecastError::InvalidRunId(_) => "invalid_run_id",
            ForecastError::Parse(_) => "parse_error",
            ForecastError::Io(_) => "io_error",
            ForecastError::Serialization(_) => "serialization_error",
            ForecastError::Csv(_) => "csv_error",
        }
    }

    /// True for errors caused by the caller's input rather than the service
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ForecastError::SchemaMismatch { .. }
                | ForecastError::InvalidOverride { .. }
                | ForecastError::NonFiniteFeature { .. }
                | ForecastError::InsufficientHistory { .. }
                | ForecastError::InvalidObservation { .. }
                | ForecastError::Parse(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ForecastError>;
