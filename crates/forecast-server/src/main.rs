//! PM2.5 forecast server
//!
//! Serves next-hour estimates and violation verdicts from the artifact
//! pair currently published in the store.

use anyhow::{Context, Result};
use forecast_lib::{
    health::{components, HealthRegistry},
    observability::{ForecastMetrics, StructuredLogger},
    ArtifactStore,
};
use pm25_server::{api, config::ServerConfig};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting pm25-server");

    let config = ServerConfig::load()?;
    info!(
        artifact_dir = %config.artifact_dir.display(),
        port = config.api_port,
        "Server configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::ARTIFACTS).await;
    health_registry.register(components::PREDICTOR).await;

    let metrics = ForecastMetrics::new();
    let logger = StructuredLogger::new(&config.service_name);

    let store = ArtifactStore::open(&config.artifact_dir, config.versions_to_keep)
        .with_context(|| format!("opening artifact store {}", config.artifact_dir.display()))?;

    let app_state = Arc::new(api::AppState::new(
        store,
        health_registry.clone(),
        metrics,
        logger.clone(),
    ));

    // Start without a pair if none is published yet; /v1/model/reload picks it up later
    let run_id = match app_state.reload().await {
        Ok(loaded) => Some(loaded.run_id),
        Err(e) => {
            warn!(error = %e, "No artifact pair loaded at startup");
            None
        }
    };
    logger.log_startup(SERVER_VERSION, run_id.as_deref());

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        result = api_handle => {
            result.context("API server task panicked")??;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            logger.log_shutdown("SIGINT received");
        }
    }

    info!("Shutting down");
    Ok(())
}
