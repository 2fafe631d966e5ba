//! Feature generation and training commands

use anyhow::{Context, Result};
use forecast_lib::{
    features::{BuildReport, TableSummary},
    observability::StructuredLogger,
    trainer::{BoostingParams, TrainingReport},
    DecisionConstants, FeatureBuilder, FeatureTable, ModelTrainer, SeriesStore, TrainerConfig,
};
use serde::Serialize;
use std::path::Path;

use super::CommandContext;
use crate::output::{
    field, format_percent, format_pm25, format_range, print_json, print_success, print_table,
    FieldRow, OutputFormat,
};

#[derive(Serialize)]
struct FeaturesOutput<'a> {
    output: &'a Path,
    build: &'a BuildReport,
    summary: &'a TableSummary,
}

fn load_features(input: &Path) -> Result<(FeatureTable, BuildReport)> {
    let observations = SeriesStore::load_csv(input)
        .with_context(|| format!("Failed to read series {}", input.display()))?;
    let built = FeatureBuilder::new(DecisionConstants::default())
        .build(&observations)
        .context("Feature generation failed")?;
    Ok(built)
}

/// Build the feature table from a raw series and write it as CSV
pub fn build_features(input: &Path, output: &Path, format: OutputFormat) -> Result<()> {
    let (table, report) = load_features(input)?;
    SeriesStore::write_feature_table(output, &table)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    let summary = table.summary();

    match format {
        OutputFormat::Json => print_json(&FeaturesOutput {
            output,
            build: &report,
            summary: &summary,
        })?,
        OutputFormat::Table => {
            print_table(&[
                field("Observations", report.observations),
                field("Feature rows", report.rows),
                field("Excluded rows", report.excluded_rows),
                field("Gaps", report.gaps),
                field("Features", summary.features),
                field("Violation rate", format_percent(summary.violation_rate)),
                field(
                    "Target range",
                    format_range(summary.pm25_min, summary.pm25_max),
                ),
            ]);
            print_success(&format!("Features saved: {}", output.display()));
        }
    }

    Ok(())
}

/// Optional overrides of the default training configuration
#[derive(Debug, Clone, Default)]
pub struct TrainOptions {
    pub train_fraction: Option<f64>,
    pub n_estimators: Option<usize>,
}

impl TrainOptions {
    fn config(&self) -> TrainerConfig {
        let defaults = TrainerConfig::default();
        let trees = |params: BoostingParams| BoostingParams {
            n_estimators: self.n_estimators.unwrap_or(params.n_estimators),
            ..params
        };
        TrainerConfig {
            train_fraction: self.train_fraction.unwrap_or(defaults.train_fraction),
            regressor: trees(defaults.regressor.clone()),
            classifier: trees(defaults.classifier.clone()),
            ..defaults
        }
    }
}

/// Build features, train both models and publish them to the store
pub fn train(ctx: &CommandContext, input: &Path, options: &TrainOptions) -> Result<()> {
    let (table, _) = load_features(input)?;
    let trainer = ModelTrainer::new(options.config(), DecisionConstants::default());
    let outcome = trainer.train(&table).context("Training failed")?;

    let store = ctx.store()?;
    let path = store
        .save(&outcome.artifacts)
        .context("Failed to save artifacts")?;

    let report = &outcome.report;
    StructuredLogger::new("aqf").log_training(
        &report.run_id,
        report.metrics.train_rows,
        report.metrics.test_rows,
        report.metrics.mae,
        report.metrics.classification.f1,
    );

    match ctx.format {
        OutputFormat::Json => print_json(report)?,
        OutputFormat::Table => {
            print_table(&training_rows(report));
            print_success(&format!("Models saved: {}", path.display()));
        }
    }

    Ok(())
}

fn training_rows(report: &TrainingReport) -> Vec<FieldRow> {
    let m = &report.metrics;
    vec![
        field("Run", &report.run_id),
        field("Train rows", m.train_rows),
        field(
            "Train span",
            format!("{} .. {}", report.train_start, report.train_end),
        ),
        field("Test rows", m.test_rows),
        field(
            "Test span",
            format!("{} .. {}", report.test_start, report.test_end),
        ),
        field("Violation rate", format_percent(m.violation_rate)),
        field("Regressor MAE", format_pm25(m.mae)),
        field("Classifier F1", format!("{:.3}", m.classification.f1)),
        field("Precision", format!("{:.3}", m.classification.precision)),
        field("Recall", format!("{:.3}", m.classification.recall)),
        field("Accuracy", format_percent(m.classification.accuracy)),
        field("Duration", format!("{:.2}s", report.duration_secs)),
    ]
}
