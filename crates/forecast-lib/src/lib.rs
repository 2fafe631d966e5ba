//! Core library for next-hour PM2.5 forecasting
//!
//! This crate provides:
//! - Feature generation from hourly PM2.5 series
//! - Gradient-boosted regressor and violation classifier training
//! - Versioned, checksummed artifact storage
//! - Scenario resolution and prediction serving
//! - Health checks and observability

pub mod artifact;
pub mod error;
pub mod features;
pub mod health;
pub mod models;
pub mod observability;
pub mod predictor;
pub mod store;
pub mod trainer;

#[cfg(test)]
mod test_support;

pub use artifact::{
    ArtifactPair, ArtifactStore, DefaultFillTable, EvaluationMetrics, ModelArtifact,
};
pub use error::{ForecastError, Result};
pub use features::{FeatureBuilder, FeatureSchema, FeatureTable, FeatureVector};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ForecastMetrics, StructuredLogger};
pub use predictor::{
    BatchSummary, PredictionService, ScenarioOverrides, ScoringSession, ServiceInfo,
};
pub use store::SeriesStore;
pub use trainer::{ModelTrainer, TrainerConfig, TrainingOutcome, TrainingReport};
