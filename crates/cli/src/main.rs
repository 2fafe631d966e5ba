//! PM2.5 forecaster CLI
//!
//! Builds features from a raw hourly series, trains and publishes the
//! regressor/classifier pair, and scores feature files or single scenarios
//! against the published pair.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{data, predict, report, CommandContext};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PM2.5 next-hour forecaster
#[derive(Parser)]
#[command(name = "aqf")]
#[command(author, version, about = "CLI for the PM2.5 next-hour forecaster", long_about = None)]
pub struct Cli {
    /// Artifact store directory (can also be set via PM25_ARTIFACT_DIR env var)
    #[arg(long, global = true, env = "PM25_ARTIFACT_DIR")]
    pub artifacts: Option<PathBuf>,

    /// Output format
    #[arg(long, short, global = true)]
    pub format: Option<output::OutputFormat>,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build the feature table from a raw PM2.5 series
    Features {
        /// Raw series CSV (date, pm25)
        #[arg(long, short, default_value = "data/raw/pm25.csv")]
        input: PathBuf,

        /// Feature table CSV to write
        #[arg(long, short, default_value = "data/processed/features.csv")]
        output: PathBuf,
    },

    /// Train the regressor and classifier and publish them
    Train {
        /// Raw series CSV (date, pm25)
        #[arg(long, short, default_value = "data/raw/pm25.csv")]
        input: PathBuf,

        /// Leading share of rows used for fitting
        #[arg(long)]
        train_fraction: Option<f64>,

        /// Boosting rounds for both models
        #[arg(long)]
        n_estimators: Option<usize>,
    },

    /// Score a feature table and write predictions
    Predict {
        /// Feature table CSV
        #[arg(long, default_value = "data/processed/features.csv")]
        features: PathBuf,

        /// Predictions CSV to write
        #[arg(long, short, default_value = "data/processed/predictions.csv")]
        output: PathBuf,
    },

    /// Score a single scenario, filling unset features from training medians
    Quick(predict::QuickArgs),

    /// Load the published models and show what they expect
    Test,

    /// Make the previous run current again
    Rollback,

    /// Write a Markdown report of the documented scenarios
    Report {
        /// Report file to write
        #[arg(long, short, default_value = "reports/demo_report.md")]
        output: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let user_config = match config::Config::load() {
        Ok(config) => config,
        Err(e) => {
            output::print_warning(&format!("Ignoring config file: {:#}", e));
            config::Config::default()
        }
    };
    let format = cli
        .format
        .or_else(|| {
            user_config
                .default_format
                .as_deref()
                .and_then(output::OutputFormat::from_name)
        })
        .unwrap_or_default();
    let ctx = CommandContext {
        artifact_dir: user_config.artifact_dir(cli.artifacts),
        versions_to_keep: user_config.versions_to_keep(),
        format,
    };
    debug!(
        artifact_dir = %ctx.artifact_dir.display(),
        format = ?ctx.format,
        "Resolved CLI settings"
    );

    let result = match cli.command {
        Commands::Features { input, output } => data::build_features(&input, &output, format),
        Commands::Train {
            input,
            train_fraction,
            n_estimators,
        } => data::train(
            &ctx,
            &input,
            &data::TrainOptions {
                train_fraction,
                n_estimators,
            },
        ),
        Commands::Predict { features, output } => {
            predict::predict_batch(&ctx, &features, &output)
        }
        Commands::Quick(args) => predict::quick(&ctx, &args),
        Commands::Test => predict::test_models(&ctx),
        Commands::Rollback => predict::rollback(&ctx),
        Commands::Report { output } => report::write_report(&ctx, &output),
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
    Ok(())
}
