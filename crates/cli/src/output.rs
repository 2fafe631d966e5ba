//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use forecast_lib::models::ConfidenceBand;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

impl OutputFormat {
    /// Parse a format name from the config file, ignoring case
    pub fn from_name(name: &str) -> Option<Self> {
        <Self as ValueEnum>::from_str(name, true).ok()
    }
}

/// Row for key/value tables
#[derive(Tabled)]
pub struct FieldRow {
    #[tabled(rename = "Field")]
    pub field: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

pub fn field(name: &str, value: impl ToString) -> FieldRow {
    FieldRow {
        field: name.to_string(),
        value: value.to_string(),
    }
}

/// Print a table of rows
pub fn print_table<T: Tabled>(items: &[T]) {
    if items.is_empty() {
        println!("{}", "No items found".yellow());
        return;
    }
    let table = Table::new(items).with(Style::rounded()).to_string();
    println!("{}", table);
}

/// Print any serializable value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format a concentration in µg/m³
pub fn format_pm25(value: f64) -> String {
    format!("{:.1} µg/m³", value)
}

/// Format a concentration range, `-` when there is nothing to span
pub fn format_range(min: Option<f64>, max: Option<f64>) -> String {
    match (min, max) {
        (Some(min), Some(max)) => format!("{} - {}", format_pm25(min), format_pm25(max)),
        _ => "-".to_string(),
    }
}

/// Format a fraction as percentage
pub fn format_percent(fraction: f64) -> String {
    format!("{:.1}%", fraction * 100.0)
}

/// Plain alert label for a verdict
pub fn alert_label(violation: bool) -> &'static str {
    if violation {
        "WHO VIOLATION"
    } else {
        "Safe"
    }
}

/// Color the alert label
pub fn color_alert(violation: bool) -> String {
    if violation {
        alert_label(violation).red().bold().to_string()
    } else {
        alert_label(violation).green().to_string()
    }
}

/// Color confidence by band
pub fn color_confidence(confidence: f64) -> String {
    let band = ConfidenceBand::from_confidence(confidence);
    let formatted = format!("{} ({})", format_percent(confidence), band.as_str());
    match band {
        ConfidenceBand::High => formatted.green().to_string(),
        ConfidenceBand::Medium => formatted.yellow().to_string(),
        ConfidenceBand::Low => formatted.red().to_string(),
    }
}
