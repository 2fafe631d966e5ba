//! Markdown demo report over the documented scenarios

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use forecast_lib::{
    predictor::{documented_scenarios, NamedScenario},
    store::write_text,
    PredictionResult, ServiceInfo,
};
use std::fmt::Write as _;
use std::path::Path;

use super::CommandContext;
use crate::output::{
    alert_label, format_percent, format_pm25, print_json, print_success, OutputFormat,
};

/// Run both documented scenarios and write the Markdown report
pub fn write_report(ctx: &CommandContext, output: &Path) -> Result<()> {
    let service = ctx.service()?;
    let session = service.session();
    let info = ServiceInfo::from(session.pair().as_ref());

    let mut outcomes = Vec::new();
    for scenario in documented_scenarios() {
        let result = session
            .predict_quick(&scenario.overrides)
            .with_context(|| format!("Scenario {} failed", scenario.name))?;
        outcomes.push((scenario, result));
    }

    let markdown = render_report(&info, &outcomes, Utc::now())?;
    write_text(output, &markdown)
        .with_context(|| format!("Failed to write report {}", output.display()))?;

    match ctx.format {
        OutputFormat::Json => {
            let results: Vec<_> = outcomes
                .iter()
                .map(|(s, r)| serde_json::json!({ "scenario": s.name, "result": r }))
                .collect();
            print_json(&serde_json::json!({
                "report": output,
                "run_id": info.run_id,
                "scenarios": results,
            }))?
        }
        OutputFormat::Table => print_success(&format!("Demo saved: {}", output.display())),
    }

    Ok(())
}

/// Markdown for one set of scenario outcomes
pub fn render_report(
    info: &ServiceInfo,
    outcomes: &[(NamedScenario, PredictionResult)],
    generated_at: DateTime<Utc>,
) -> Result<String> {
    let mut md = String::new();
    let metrics = &info.metrics;

    writeln!(md, "# PM2.5 Next-Hour Forecast Demo\n")?;
    writeln!(md, "Generated: {}  ", generated_at.format("%Y-%m-%d %H:%M UTC"))?;
    writeln!(md, "Model run: `{}` (trained {})\n", info.run_id, info.trained_at)?;
    writeln!(
        md,
        "Regressor MAE: {} | Classifier F1: {:.3} | WHO threshold: {}\n",
        format_pm25(metrics.mae),
        metrics.classification.f1,
        format_pm25(info.constants.who_threshold)
    )?;

    for (scenario, result) in outcomes {
        writeln!(md, "## {}\n", scenario.name)?;
        writeln!(md, "{}\n", scenario.description)?;
        writeln!(md, "| Input | Value |")?;
        writeln!(md, "|---|---|")?;
        for (name, value) in &scenario.overrides.values {
            writeln!(md, "| {} | {} |", name, value)?;
        }
        writeln!(md)?;
        writeln!(
            md,
            "- PM2.5: **{}** | Violation: **{}**",
            format_pm25(result.pm25_estimate),
            alert_label(result.violation_flag)
        )?;
        writeln!(
            md,
            "- Violation probability: {} | Confidence: {} ({})\n",
            format_percent(result.violation_probability),
            format_percent(result.confidence),
            result.band().as_str()
        )?;
    }

    Ok(md)
}
