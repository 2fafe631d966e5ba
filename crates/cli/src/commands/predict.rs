//! Prediction and model inspection commands

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use forecast_lib::{
    models::ConfidenceBand,
    observability::StructuredLogger,
    predictor::BatchSummary,
    store::parse_timestamp,
    trainer::{mean_absolute_error, ClassificationMetrics},
    FeatureTable, PredictionResult, ScenarioOverrides, SeriesStore,
};
use serde::Serialize;
use std::path::Path;

use super::CommandContext;
use crate::output::{
    color_alert, color_confidence, field, format_percent, format_pm25, format_range, print_info,
    print_json, print_success, print_table, print_warning, OutputFormat,
};

/// Scenario flags for `aqf quick`; anything left out takes the model's defaults
#[derive(Debug, Clone, Default, Args)]
pub struct QuickArgs {
    /// Hour of day (0-23)
    #[arg(long)]
    pub hour: Option<u32>,

    /// Day of week (0 = Monday)
    #[arg(long)]
    pub day_of_week: Option<u32>,

    /// Mean PM2.5 over the last 24 hours
    #[arg(long)]
    pub rolling_24h: Option<f64>,

    /// PM2.5 one hour ago
    #[arg(long)]
    pub lag_1: Option<f64>,

    /// PM2.5 24 hours ago
    #[arg(long)]
    pub lag_24: Option<f64>,

    /// Mean PM2.5 over the last 24 hours; takes precedence over --rolling-24h
    #[arg(long)]
    pub rolling_mean_24: Option<f64>,

    /// Any feature by name, e.g. --set ema_7d=12.5 (repeatable)
    #[arg(long = "set", value_name = "NAME=VALUE", value_parser = parse_assignment)]
    pub set: Vec<(String, f64)>,

    /// Derive calendar fields from this time (RFC 3339)
    #[arg(long, value_parser = parse_timestamp)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl QuickArgs {
    pub fn overrides(&self) -> ScenarioOverrides {
        let mut overrides = ScenarioOverrides {
            timestamp: self.timestamp,
            ..Default::default()
        };
        let flags = [
            ("hour", self.hour.map(f64::from)),
            ("day_of_week", self.day_of_week.map(f64::from)),
            ("rolling_24h", self.rolling_24h),
            ("lag_1", self.lag_1),
            ("lag_24", self.lag_24),
            ("rolling_mean_24h", self.rolling_mean_24),
        ];
        for (name, value) in flags {
            if let Some(value) = value {
                overrides.set(name, value);
            }
        }
        for (name, value) in &self.set {
            overrides.set(name.clone(), *value);
        }
        overrides
    }
}

fn parse_assignment(raw: &str) -> std::result::Result<(String, f64), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", raw))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid value for '{}': {}", name, e))?;
    Ok((name.trim().to_string(), value))
}

#[derive(Serialize)]
struct QuickOutput<'a> {
    run_id: &'a str,
    #[serde(flatten)]
    result: &'a PredictionResult,
    band: ConfidenceBand,
}

/// Score a single partial scenario
pub fn quick(ctx: &CommandContext, args: &QuickArgs) -> Result<()> {
    let service = ctx.service()?;
    let session = service.session();
    let run_id = session.run_id();
    let result = session
        .predict_quick(&args.overrides())
        .context("Scenario rejected")?;

    StructuredLogger::new("aqf").log_prediction(
        "quick",
        result.pm25_estimate,
        result.violation_flag,
        result.confidence,
        run_id,
    );

    match ctx.format {
        OutputFormat::Json => print_json(&QuickOutput {
            run_id,
            result: &result,
            band: result.band(),
        })?,
        OutputFormat::Table => {
            print_success(&format!(
                "PM2.5: {} | Violation: {}",
                format_pm25(result.pm25_estimate),
                color_alert(result.violation_flag)
            ));
            print_info(&format!(
                "Confidence: {} | Violation probability: {}",
                color_confidence(result.confidence),
                format_percent(result.violation_probability)
            ));
        }
    }

    Ok(())
}

/// Agreement with labels, when the feature file carries them
#[derive(Debug, Serialize)]
struct LabelledScore {
    rows: usize,
    mae: f64,
    classification: ClassificationMetrics,
}

fn score_against_labels(
    table: &FeatureTable,
    results: &[PredictionResult],
) -> Option<LabelledScore> {
    let mut actual_pm25 = Vec::new();
    let mut predicted_pm25 = Vec::new();
    let mut actual_flags = Vec::new();
    let mut predicted_flags = Vec::new();

    for (row, result) in table.rows().iter().zip(results) {
        if let Some(labels) = row.labels {
            actual_pm25.push(labels.target_pm25);
            predicted_pm25.push(result.pm25_estimate);
            actual_flags.push(labels.target_violation);
            predicted_flags.push(result.violation_flag);
        }
    }

    if actual_pm25.is_empty() {
        return None;
    }
    Some(LabelledScore {
        rows: actual_pm25.len(),
        mae: mean_absolute_error(&actual_pm25, &predicted_pm25),
        classification: ClassificationMetrics::from_decisions(&actual_flags, &predicted_flags),
    })
}

#[derive(Serialize)]
struct BatchOutput<'a> {
    run_id: &'a str,
    output: &'a Path,
    summary: &'a BatchSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    labelled: Option<&'a LabelledScore>,
}

/// Score a feature file and write the predictions CSV
pub fn predict_batch(ctx: &CommandContext, features: &Path, output: &Path) -> Result<()> {
    let service = ctx.service()?;
    let session = service.session();
    let run_id = session.run_id();
    let table = SeriesStore::read_feature_table(features)
        .with_context(|| format!("Failed to read features {}", features.display()))?;

    let results = session
        .predict_batch(&table)
        .context("Feature file does not match the model")?;
    SeriesStore::write_predictions(output, &table, &results)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    let summary = BatchSummary::from_results(&results);
    let labelled = score_against_labels(&table, &results);

    match ctx.format {
        OutputFormat::Json => print_json(&BatchOutput {
            run_id,
            output,
            summary: &summary,
            labelled: labelled.as_ref(),
        })?,
        OutputFormat::Table => {
            let mut rows = vec![
                field("Run", run_id),
                field("Rows", summary.count),
                field("PM2.5 range", format_range(summary.pm25_min, summary.pm25_max)),
                field(
                    "Violations",
                    format!(
                        "{}/{} ({})",
                        summary.violations,
                        summary.count,
                        format_percent(summary.violation_share)
                    ),
                ),
            ];
            if let Some(score) = &labelled {
                rows.push(field("MAE vs labels", format_pm25(score.mae)));
                rows.push(field(
                    "F1 vs labels",
                    format!("{:.3}", score.classification.f1),
                ));
            }
            print_table(&rows);
            print_success(&format!("Predictions saved: {}", output.display()));
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct ModelOutput {
    #[serde(flatten)]
    info: forecast_lib::ServiceInfo,
    runs: Vec<String>,
}

/// Load the current pair and show what it expects
pub fn test_models(ctx: &CommandContext) -> Result<()> {
    let service = ctx.service()?;
    let info = service.info();
    let runs: Vec<String> = ctx
        .store()?
        .list_runs()?
        .into_iter()
        .map(|r| r.run_id)
        .collect();

    match ctx.format {
        OutputFormat::Json => print_json(&ModelOutput { info, runs })?,
        OutputFormat::Table => {
            print_success("Regressor and classifier loaded");
            print_table(&[
                field("Run", &info.run_id),
                field("Trained at", info.trained_at),
                field("Features", info.feature_schema.join(", ")),
                field(
                    "WHO threshold",
                    format_pm25(info.constants.who_threshold),
                ),
                field(
                    "Classification cutoff",
                    info.constants.classification_cutoff,
                ),
                field("Test MAE", format_pm25(info.metrics.mae)),
                field("Test F1", format!("{:.3}", info.metrics.classification.f1)),
                field("Stored runs", runs.len()),
            ]);
        }
    }

    Ok(())
}

/// Point the store back at the previous run
pub fn rollback(ctx: &CommandContext) -> Result<()> {
    match ctx.store()?.rollback().context("Rollback failed")? {
        Some(run_id) => print_success(&format!("Current run is now {}", run_id)),
        None => print_warning("No previous run to roll back to"),
    }
    Ok(())
}
