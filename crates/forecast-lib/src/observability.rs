//! Observability infrastructure for the forecaster
//!
//! Provides:
//! - Prometheus metrics (feature build time, training time, prediction latency, verdict counts)
//! - Structured logging of lifecycle events with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, GaugeVec, Histogram, IntCounter,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for per-request latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5,
];

/// Histogram buckets for batch jobs (in seconds)
const JOB_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ForecastMetricsInner> = OnceLock::new();

struct ForecastMetricsInner {
    feature_build_seconds: Histogram,
    training_duration_seconds: Histogram,
    prediction_latency_seconds: Histogram,
    predictions_total: IntCounter,
    violations_predicted_total: IntCounter,
    schema_mismatches_total: IntCounter,
    invalid_overrides_total: IntCounter,
    rows_excluded_total: IntCounter,
    model_info: GaugeVec,
}

impl ForecastMetricsInner {
    fn new() -> Self {
        Self {
            feature_build_seconds: register_histogram!(
                "pm25_feature_build_seconds",
                "Time spent building a feature table from observations",
                JOB_BUCKETS.to_vec()
            )
            .expect("Failed to register feature_build_seconds"),

            training_duration_seconds: register_histogram!(
                "pm25_training_duration_seconds",
                "Time spent fitting the regressor and classifier",
                JOB_BUCKETS.to_vec()
            )
            .expect("Failed to register training_duration_seconds"),

            prediction_latency_seconds: register_histogram!(
                "pm25_prediction_latency_seconds",
                "Time spent scoring one feature vector with both models",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register prediction_latency_seconds"),

            predictions_total: register_int_counter!(
                "pm25_predictions_total",
                "Total number of predictions produced"
            )
            .expect("Failed to register predictions_total"),

            violations_predicted_total: register_int_counter!(
                "pm25_violations_predicted_total",
                "Total number of predictions flagged as WHO violations"
            )
            .expect("Failed to register violations_predicted_total"),

            schema_mismatches_total: register_int_counter!(
                "pm25_schema_mismatches_total",
                "Total number of requests rejected for a feature schema mismatch"
            )
            .expect("Failed to register schema_mismatches_total"),

            invalid_overrides_total: register_int_counter!(
                "pm25_invalid_overrides_total",
                "Total number of scenario requests rejected for out-of-domain overrides"
            )
            .expect("Failed to register invalid_overrides_total"),

            rows_excluded_total: register_int_counter!(
                "pm25_rows_excluded_total",
                "Total number of timestamps excluded for missing lookback or lookahead"
            )
            .expect("Failed to register rows_excluded_total"),

            model_info: register_gauge_vec!(
                "pm25_model_info",
                "Information about the currently loaded artifact pair",
                &["run_id"]
            )
            .expect("Failed to register model_info"),
        }
    }
}

/// Forecaster metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct ForecastMetrics {
    _private: (),
}

impl Default for ForecastMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ForecastMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ForecastMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ForecastMetricsInner {
        GLOBAL_METRICS.get_or_init(ForecastMetricsInner::new)
    }

    pub fn observe_feature_build(&self, duration_secs: f64, rows_excluded: usize) {
        self.inner().feature_build_seconds.observe(duration_secs);
        self.inner().rows_excluded_total.inc_by(rows_excluded as u64);
    }

    pub fn observe_training(&self, duration_secs: f64) {
        self.inner().training_duration_seconds.observe(duration_secs);
    }

    /// Record one produced prediction
    pub fn observe_prediction(&self, duration_secs: f64, violation: bool) {
        self.inner().prediction_latency_seconds.observe(duration_secs);
        self.inner().predictions_total.inc();
        if violation {
            self.inner().violations_predicted_total.inc();
        }
    }

    pub fn inc_schema_mismatches(&self) {
        self.inner().schema_mismatches_total.inc();
    }

    pub fn inc_invalid_overrides(&self) {
        self.inner().invalid_overrides_total.inc();
    }

    /// Mark `run_id` as the loaded artifact pair
    pub fn set_model_info(&self, run_id: &str) {
        self.inner().model_info.reset();
        self.inner().model_info.with_label_values(&[run_id]).set(1.0);
    }
}

/// Structured logger for forecaster lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    service_name: String,
}

impl StructuredLogger {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn log_startup(&self, version: &str, run_id: Option<&str>) {
        info!(
            event = "service_started",
            service = %self.service_name,
            version = %version,
            run_id = %run_id.unwrap_or("none"),
            "PM2.5 forecaster started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "service_shutdown",
            service = %self.service_name,
            reason = %reason,
            "PM2.5 forecaster shutting down"
        );
    }

    /// Log a completed training run
    pub fn log_training(
        &self,
        run_id: &str,
        train_rows: usize,
        test_rows: usize,
        mae: f64,
        f1: f64,
    ) {
        info!(
            event = "training_completed",
            service = %self.service_name,
            run_id = %run_id,
            train_rows = train_rows,
            test_rows = test_rows,
            mae = mae,
            f1 = f1,
            "Trained regressor and classifier"
        );
    }

    /// Log an artifact pair swap
    pub fn log_artifact_swap(&self, old_run_id: &str, new_run_id: &str, success: bool) {
        if success {
            info!(
                event = "artifacts_swapped",
                service = %self.service_name,
                old_run_id = %old_run_id,
                new_run_id = %new_run_id,
                "Artifact pair swapped"
            );
        } else {
            warn!(
                event = "artifact_swap_failed",
                service = %self.service_name,
                old_run_id = %old_run_id,
                new_run_id = %new_run_id,
                "Artifact reload failed, keeping previous pair"
            );
        }
    }

    pub fn log_prediction(
        &self,
        mode: &str,
        pm25_estimate: f64,
        violation_flag: bool,
        confidence: f64,
        run_id: &str,
    ) {
        info!(
            event = "prediction_generated",
            service = %self.service_name,
            mode = %mode,
            pm25_estimate = pm25_estimate,
            violation_flag = violation_flag,
            confidence = confidence,
            run_id = %run_id,
            "Generated PM2.5 prediction"
        );
    }
}
