//! Prediction engine
//!
//! [`PredictionService`] scores feature vectors with the current artifact
//! pair. The pair sits behind one lock as a single `Arc`; each request takes
//! one clone of it up front, so a concurrent [`PredictionService::swap`]
//! can never hand a request the regressor of one run and the classifier of
//! another. A [`ScoringSession`] extends that pin across several calls.

mod output;
mod scenario;

pub use output::{BatchSummary, ServiceInfo};
pub use scenario::{
    canonical_name, documented_scenarios, NamedScenario, ScenarioOverrides, ScenarioResolver,
    FEATURE_ALIASES,
};

use crate::artifact::ArtifactPair;
use crate::error::{ForecastError, Result};
use crate::features::{FeatureSchema, FeatureTable, FeatureVector};
use crate::models::PredictionResult;
use crate::observability::ForecastMetrics;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, warn};

/// Scoring slower than this is logged
const SLOW_PREDICTION_MS: u128 = 5;

/// Serves predictions from an atomically swappable artifact pair
pub struct PredictionService {
    artifacts: RwLock<Arc<ArtifactPair>>,
    metrics: ForecastMetrics,
    prediction_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl PredictionService {
    pub fn new(pair: ArtifactPair) -> Self {
        let metrics = ForecastMetrics::new();
        metrics.set_model_info(pair.run_id());
        Self {
            artifacts: RwLock::new(Arc::new(pair)),
            metrics,
            prediction_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
        }
    }

    /// The pair in use right now
    pub fn current(&self) -> Arc<ArtifactPair> {
        // a poisoned lock still guards a complete pair
        let guard = self.artifacts.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the whole pair; returns the previous one
    pub fn swap(&self, pair: ArtifactPair) -> Arc<ArtifactPair> {
        let new_run_id = pair.run_id().to_string();
        let next = Arc::new(pair);
        let previous = {
            let mut guard = self.artifacts.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *guard, next)
        };
        self.metrics.set_model_info(&new_run_id);
        debug!(from = %previous.run_id(), to = %new_run_id, "Swapped artifact pair");
        previous
    }

    /// Pin the current pair for a sequence of predictions. Results and
    /// [`ScoringSession::run_id`] always refer to the same run, even if the
    /// service is swapped meanwhile.
    pub fn session(&self) -> ScoringSession<'_> {
        ScoringSession {
            service: self,
            pair: self.current(),
        }
    }

    /// Score one vector
    pub fn predict(&self, vector: &FeatureVector) -> Result<PredictionResult> {
        self.session().predict(vector)
    }

    /// Score every row of a table, in row order
    pub fn predict_batch(&self, table: &FeatureTable) -> Result<Vec<PredictionResult>> {
        self.session().predict_batch(table)
    }

    /// Resolve a partial scenario against the current pair and score it
    pub fn predict_quick(&self, overrides: &ScenarioOverrides) -> Result<PredictionResult> {
        self.session().predict_quick(overrides)
    }

    pub fn info(&self) -> ServiceInfo {
        ServiceInfo::from(self.current().as_ref())
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            predictions: self.prediction_count.load(Ordering::Relaxed),
            rejected: self.rejected_count.load(Ordering::Relaxed),
        }
    }

    /// Both artifacts must accept the schema; nothing is reordered
    fn check_schema(&self, pair: &ArtifactPair, schema: &FeatureSchema) -> Result<()> {
        pair.regressor()
            .check_schema(schema)
            .and_then(|_| pair.classifier().check_schema(schema))
            .map_err(|e| self.record_rejection(e))
    }

    fn check_values(&self, schema: &FeatureSchema, values: &[f64], location: &str) -> Result<()> {
        let checked = if values.len() == schema.len() {
            schema.ensure_finite(values, location)
        } else {
            Err(ForecastError::SchemaMismatch {
                role: "feature_vector".to_string(),
                detail: format!("{} values for {} features", values.len(), schema.len()),
            })
        };
        checked.map_err(|e| self.record_rejection(e))
    }

    fn record_rejection(&self, error: ForecastError) -> ForecastError {
        self.rejected_count.fetch_add(1, Ordering::Relaxed);
        match &error {
            ForecastError::SchemaMismatch { .. } => self.metrics.inc_schema_mismatches(),
            ForecastError::InvalidOverride { .. } => self.metrics.inc_invalid_overrides(),
            _ => {}
        }
        warn!(kind = error.kind(), error = %error, "Prediction request rejected");
        error
    }

    fn score(
        &self,
        pair: &ArtifactPair,
        timestamp: Option<DateTime<Utc>>,
        values: &[f64],
    ) -> PredictionResult {
        let start = Instant::now();
        let constants = pair.constants();

        let pm25_estimate = pair.regressor().score(values).max(0.0);
        let probability = pair.classifier().score(values).clamp(0.0, 1.0);
        let violation_flag = constants.decide(probability);
        let confidence = probability.max(1.0 - probability);

        let elapsed = start.elapsed();
        self.prediction_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.observe_prediction(elapsed.as_secs_f64(), violation_flag);
        if elapsed.as_millis() > SLOW_PREDICTION_MS {
            warn!(
                elapsed_ms = elapsed.as_millis(),
                "Prediction exceeded {}ms target", SLOW_PREDICTION_MS
            );
        }

        PredictionResult {
            timestamp,
            pm25_estimate,
            violation_flag,
            violation_probability: probability,
            confidence,
        }
    }
}

/// Predictions against one pinned artifact pair
pub struct ScoringSession<'a> {
    service: &'a PredictionService,
    pair: Arc<ArtifactPair>,
}

impl ScoringSession<'_> {
    /// Run that scores every prediction of this session
    pub fn run_id(&self) -> &str {
        self.pair.run_id()
    }

    pub fn pair(&self) -> &Arc<ArtifactPair> {
        &self.pair
    }

    pub fn predict(&self, vector: &FeatureVector) -> Result<PredictionResult> {
        let location = vector
            .timestamp
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "vector".to_string());
        self.service.check_schema(&self.pair, &vector.schema)?;
        self.service.check_values(&vector.schema, &vector.values, &location)?;
        Ok(self.service.score(&self.pair, vector.timestamp, &vector.values))
    }

    /// The schema is checked once for the whole batch. Row widths and
    /// finiteness are guaranteed by [`FeatureTable::new`].
    pub fn predict_batch(&self, table: &FeatureTable) -> Result<Vec<PredictionResult>> {
        self.service.check_schema(&self.pair, table.schema())?;

        let results: Vec<PredictionResult> = table
            .rows()
            .iter()
            .map(|row| self.service.score(&self.pair, Some(row.timestamp), &row.values))
            .collect();

        debug!(
            rows = results.len(),
            run_id = %self.run_id(),
            "Scored prediction batch"
        );
        Ok(results)
    }

    pub fn predict_quick(&self, overrides: &ScenarioOverrides) -> Result<PredictionResult> {
        let vector = ScenarioResolver::from_pair(&self.pair)
            .resolve(overrides)
            .map_err(|e| self.service.record_rejection(e))?;
        self.predict(&vector)
    }
}

/// Prediction counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStats {
    pub predictions: u64,
    pub rejected: u64,
}
