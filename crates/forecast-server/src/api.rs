//! HTTP API for predictions, model management, health checks and metrics

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use forecast_lib::{
    features::FeatureRow,
    health::{ComponentStatus, HealthRegistry},
    models::{ConfidenceBand, PredictionResult},
    observability::{ForecastMetrics, StructuredLogger},
    predictor::{BatchSummary, PredictionService, ScenarioOverrides, ServiceInfo},
    ArtifactStore, FeatureSchema, FeatureTable, ForecastError,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

/// Shared application state
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: ForecastMetrics,
    pub logger: StructuredLogger,
    store: ArtifactStore,
    service: RwLock<Option<Arc<PredictionService>>>,
}

impl AppState {
    pub fn new(
        store: ArtifactStore,
        health_registry: HealthRegistry,
        metrics: ForecastMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            logger,
            store,
            service: RwLock::new(None),
        }
    }

    /// Load the store's current pair and swap it in. On failure the pair
    /// already serving, if any, stays in place.
    pub async fn reload(&self) -> Result<ReloadResponse, ForecastError> {
        let previous_run_id = self.health_registry.loaded_run().await;
        let old = previous_run_id.as_deref().unwrap_or("none");

        let pair = match self.store.load_current() {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "Failed to load artifact pair");
                self.logger.log_artifact_swap(old, "unknown", false);
                self.health_registry.artifacts_failed(e.to_string()).await;
                return Err(e);
            }
        };
        let run_id = pair.run_id().to_string();

        {
            let mut service = self.service.write().await;
            match service.as_ref() {
                Some(existing) => {
                    existing.swap(pair);
                }
                None => *service = Some(Arc::new(PredictionService::new(pair))),
            }
        }

        self.health_registry.artifacts_loaded(&run_id).await;
        self.logger.log_artifact_swap(old, &run_id, true);

        Ok(ReloadResponse {
            previous_run_id,
            run_id,
        })
    }

    /// The prediction service, once a pair has been loaded
    pub async fn service(&self) -> Result<Arc<PredictionService>, ForecastError> {
        self.service
            .read()
            .await
            .clone()
            .ok_or_else(|| ForecastError::ArtifactNotFound(self.store.root().to_path_buf()))
    }
}

/// Error body: `{ "error": ..., "kind": ... }`
pub struct ApiError(ForecastError);

impl From<ForecastError> for ApiError {
    fn from(error: ForecastError) -> Self {
        Self(error)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            e if e.is_client_error() => StatusCode::UNPROCESSABLE_ENTITY,
            ForecastError::ArtifactNotFound(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct PredictRow {
    pub timestamp: DateTime<Utc>,
    pub values: Vec<f64>,
}

/// Batch request: rows are scored against `feature_names` as given
#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub feature_names: Vec<String>,
    pub rows: Vec<PredictRow>,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub run_id: String,
    pub predictions: Vec<PredictionResult>,
    pub summary: BatchSummary,
}

#[derive(Debug, Default, Deserialize)]
pub struct QuickRequest {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub overrides: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize)]
pub struct QuickResponse {
    pub run_id: String,
    #[serde(flatten)]
    pub result: PredictionResult,
    pub band: ConfidenceBand,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub previous_run_id: Option<String>,
    pub run_id: String,
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still serving
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 once an artifact pair is loaded
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn model_info(State(state): State<Arc<AppState>>) -> Result<Json<ServiceInfo>, ApiError> {
    Ok(Json(state.service().await?.info()))
}

async fn reload_model(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReloadResponse>, ApiError> {
    Ok(Json(state.reload().await?))
}

async fn predict(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<PredictResponse>, ApiError> {
    let service = state.service().await?;

    let schema = Arc::new(FeatureSchema::new(request.feature_names));
    let rows = request
        .rows
        .into_iter()
        .map(|row| FeatureRow {
            timestamp: row.timestamp,
            values: row.values,
            labels: None,
        })
        .collect();
    let table = FeatureTable::new(schema, rows).map_err(|e| {
        if matches!(e, ForecastError::SchemaMismatch { .. }) {
            state.metrics.inc_schema_mismatches();
        }
        e
    })?;

    let session = service.session();
    let predictions = session.predict_batch(&table)?;
    let summary = BatchSummary::from_results(&predictions);
    info!(
        rows = summary.count,
        violations = summary.violations,
        "Served batch prediction"
    );

    Ok(Json(PredictResponse {
        run_id: session.run_id().to_string(),
        predictions,
        summary,
    }))
}

async fn predict_quick(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QuickRequest>,
) -> Result<Json<QuickResponse>, ApiError> {
    let service = state.service().await?;
    let session = service.session();

    let overrides = ScenarioOverrides {
        timestamp: request.timestamp,
        values: request.overrides,
    };
    let result = session.predict_quick(&overrides)?;
    state.logger.log_prediction(
        "quick",
        result.pm25_estimate,
        result.violation_flag,
        result.confidence,
        session.run_id(),
    );

    Ok(Json(QuickResponse {
        run_id: session.run_id().to_string(),
        band: result.band(),
        result,
    }))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/model", get(model_info))
        .route("/v1/model/reload", post(reload_model))
        .route("/v1/predict", post(predict))
        .route("/v1/predict/quick", post(predict_quick))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
