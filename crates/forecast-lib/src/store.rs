//! CSV persistence for raw series, feature tables and predictions
//!
//! Raw series files carry a `date` (or `timestamp`) column and a `pm25`
//! column; comma and pipe delimiters are both accepted. Timestamps are
//! RFC 3339 or naive `YYYY-MM-DD[T ]HH:MM[:SS]`, read as UTC.

use crate::error::{ForecastError, Result};
use crate::features::{FeatureRow, FeatureSchema, FeatureTable};
use crate::models::{Labels, Observation, PredictionResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord, Writer};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const TIMESTAMP_COLUMNS: [&str; 3] = ["date", "timestamp", "time"];
const PM25_COLUMNS: [&str; 3] = ["pm25", "pm2_5", "pm2.5"];
const TARGET_PM25: &str = "target_pm25";
const TARGET_VIOLATION: &str = "target_violation";

/// File-backed access to series, feature and prediction tables
pub struct SeriesStore;

impl SeriesStore {
    /// Load an hourly series: rows with a missing concentration are
    /// dropped, the rest sorted by time with duplicate timestamps removed
    /// (first occurrence wins).
    pub fn load_csv(path: &Path) -> Result<Vec<Observation>> {
        let mut reader = BufReader::new(File::open(path)?);
        let delimiter = sniff_delimiter(&mut reader)?;
        let observations = Self::read_observations(reader, delimiter)?;
        info!(
            path = %path.display(),
            observations = observations.len(),
            "Loaded raw series"
        );
        Ok(observations)
    }

    pub fn read_observations<R: Read>(reader: R, delimiter: u8) -> Result<Vec<Observation>> {
        let mut csv = ReaderBuilder::new()
            .delimiter(delimiter)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = csv.headers()?.clone();
        let ts_col = find_column(&headers, &TIMESTAMP_COLUMNS)?;
        let pm_col = find_column(&headers, &PM25_COLUMNS)?;

        let mut observations = Vec::new();
        let mut dropped = 0usize;
        for (line, record) in csv.records().enumerate() {
            let record = record?;
            let raw_pm = record.get(pm_col).unwrap_or("");
            if raw_pm.is_empty() || raw_pm.eq_ignore_ascii_case("nan") {
                dropped += 1;
                continue;
            }
            let timestamp = parse_timestamp(record.get(ts_col).unwrap_or(""))
                .map_err(|e| ForecastError::Parse(format!("row {}: {}", line + 2, e)))?;
            let pm25: f64 = raw_pm.parse().map_err(|_| {
                ForecastError::Parse(format!("row {}: invalid pm25 '{}'", line + 2, raw_pm))
            })?;
            observations.push(Observation::new(timestamp, pm25));
        }

        if dropped > 0 {
            warn!(dropped, "Dropped rows without a PM2.5 reading");
        }

        observations.sort_by_key(|o| o.timestamp);
        let before = observations.len();
        observations.dedup_by_key(|o| o.timestamp);
        if observations.len() < before {
            warn!(
                duplicates = before - observations.len(),
                "Removed duplicate timestamps"
            );
        }

        Ok(observations)
    }

    pub fn write_observations(path: &Path, observations: &[Observation]) -> Result<()> {
        let mut writer = create_writer(path)?;
        writer.write_record(["date", "pm25"])?;
        for obs in observations {
            writer.write_record([obs.timestamp.to_rfc3339(), obs.pm25.to_string()])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Columns: `timestamp`, the schema in order, then labels when present
    pub fn write_feature_table(path: &Path, table: &FeatureTable) -> Result<()> {
        let mut writer = create_writer(path)?;
        let labelled = table.rows().iter().any(|r| r.labels.is_some());

        let mut header = vec!["timestamp".to_string()];
        header.extend(table.schema().names().iter().cloned());
        if labelled {
            header.push(TARGET_PM25.to_string());
            header.push(TARGET_VIOLATION.to_string());
        }
        writer.write_record(&header)?;

        for row in table.rows() {
            let mut record = vec![row.timestamp.to_rfc3339()];
            record.extend(row.values.iter().map(|v| v.to_string()));
            if labelled {
                match row.labels {
                    Some(labels) => {
                        record.push(labels.target_pm25.to_string());
                        record.push((labels.target_violation as u8).to_string());
                    }
                    None => record.extend([String::new(), String::new()]),
                }
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;

        debug!(path = %path.display(), rows = table.len(), "Wrote feature table");
        Ok(())
    }

    /// Read a feature table back; the header (minus timestamp and label
    /// columns) becomes the schema, in file order.
    pub fn read_feature_table(path: &Path) -> Result<FeatureTable> {
        let mut csv = ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(File::open(path)?);
        let headers = csv.headers()?.clone();

        let ts_col = find_column(&headers, &TIMESTAMP_COLUMNS)?;
        let target_pm25 = headers.iter().position(|h| h == TARGET_PM25);
        let target_violation = headers.iter().position(|h| h == TARGET_VIOLATION);
        let feature_cols: Vec<usize> = (0..headers.len())
            .filter(|&i| i != ts_col && Some(i) != target_pm25 && Some(i) != target_violation)
            .collect();
        let schema = Arc::new(FeatureSchema::new(
            feature_cols.iter().map(|&i| headers[i].to_string()).collect(),
        ));

        let mut rows = Vec::new();
        for (line, record) in csv.records().enumerate() {
            let record = record?;
            let row_no = line + 2;
            let timestamp = parse_timestamp(record.get(ts_col).unwrap_or(""))
                .map_err(|e| ForecastError::Parse(format!("row {}: {}", row_no, e)))?;
            let values = feature_cols
                .iter()
                .map(|&i| parse_value(&record, i, &headers, row_no))
                .collect::<Result<Vec<f64>>>()?;

            let labels = match (target_pm25, target_violation) {
                (Some(p), Some(v)) if !record.get(p).unwrap_or("").is_empty() => Some(Labels {
                    target_pm25: parse_value(&record, p, &headers, row_no)?,
                    target_violation: parse_flag(record.get(v).unwrap_or(""), row_no)?,
                }),
                _ => None,
            };

            rows.push(FeatureRow {
                timestamp,
                values,
                labels,
            });
        }

        FeatureTable::new(schema, rows)
    }

    /// Feature columns followed by both model outputs and an alert column
    pub fn write_predictions(
        path: &Path,
        table: &FeatureTable,
        results: &[PredictionResult],
    ) -> Result<()> {
        if table.len() != results.len() {
            return Err(ForecastError::Parse(format!(
                "{} feature rows but {} predictions",
                table.len(),
                results.len()
            )));
        }

        let mut writer = create_writer(path)?;
        let mut header = vec!["timestamp".to_string()];
        header.extend(table.schema().names().iter().cloned());
        header.extend(
            [
                "predicted_pm25",
                "violation_probability",
                "predicted_violation",
                "confidence",
                "alert",
            ]
            .map(String::from),
        );
        writer.write_record(&header)?;

        for (row, result) in table.rows().iter().zip(results) {
            let mut record = vec![row.timestamp.to_rfc3339()];
            record.extend(row.values.iter().map(|v| v.to_string()));
            record.push(format!("{:.3}", result.pm25_estimate));
            record.push(format!("{:.4}", result.violation_probability));
            record.push((result.violation_flag as u8).to_string());
            record.push(format!("{:.4}", result.confidence));
            record.push(if result.violation_flag { "VIOLATION" } else { "SAFE" }.to_string());
            writer.write_record(&record)?;
        }
        writer.flush()?;

        debug!(path = %path.display(), rows = results.len(), "Wrote predictions");
        Ok(())
    }
}

/// Parse an RFC 3339 or naive (UTC) timestamp
pub fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%:z") {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(format!("invalid timestamp '{}'", raw))
}

fn sniff_delimiter<R: BufRead>(reader: &mut R) -> Result<u8> {
    let header = reader.fill_buf()?;
    let first_line = header.split(|&b| b == b'\n').next().unwrap_or(&[]);
    let pipes = first_line.iter().filter(|&&b| b == b'|').count();
    let commas = first_line.iter().filter(|&&b| b == b',').count();
    Ok(if pipes > commas { b'|' } else { b',' })
}

fn find_column(headers: &StringRecord, candidates: &[&str]) -> Result<usize> {
    headers
        .iter()
        .position(|h| candidates.iter().any(|c| h.eq_ignore_ascii_case(c)))
        .ok_or_else(|| {
            ForecastError::Parse(format!(
                "missing column, expected one of {:?} in {:?}",
                candidates,
                headers.iter().collect::<Vec<_>>()
            ))
        })
}

fn parse_value(record: &StringRecord, col: usize, headers: &StringRecord, row: usize) -> Result<f64> {
    let raw = record.get(col).unwrap_or("");
    raw.parse().map_err(|_| {
        ForecastError::Parse(format!(
            "row {}: invalid value '{}' for {}",
            row,
            raw,
            headers.get(col).unwrap_or("?")
        ))
    })
}

fn parse_flag(raw: &str, row: usize) -> Result<bool> {
    match raw {
        "1" | "true" | "True" => Ok(true),
        "0" | "false" | "False" => Ok(false),
        other => Err(ForecastError::Parse(format!(
            "row {}: invalid violation flag '{}'",
            row, other
        ))),
    }
}

fn create_writer(path: &Path) -> Result<Writer<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    Ok(Writer::from_writer(file))
}

/// Write `content` to `path`, creating parent directories
pub fn write_text(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureBuilder;
    use crate::test_support::regime_series;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_read_observations_cleans_input() {
        let csv = "date,pm25\n\
                   2024-01-01T02:00,7.5\n\
                   2024-01-01T00:00,5.0\n\
                   2024-01-01T01:00,\n\
                   2024-01-01T00:00,9.9\n\
                   2024-01-01T03:00,NaN\n";
        let obs = SeriesStore::read_observations(csv.as_bytes(), b',').unwrap();
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0].timestamp, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(obs[0].pm25, 5.0);
        assert_eq!(obs[1].pm25, 7.5);
    }

    #[test]
    fn test_pipe_delimited_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raw.csv");
        fs::write(
            &path,
            "date|pm25|city\n2024-01-01 00:00:00|4.0|Frankfurt\n2024-01-01 01:00:00|6.0|Frankfurt\n",
        )
        .unwrap();
        let obs = SeriesStore::load_csv(&path).unwrap();
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[1].pm25, 6.0);
    }

    #[test]
    fn test_missing_column_is_parse_error() {
        let err = SeriesStore::read_observations("date,no2\n2024-01-01T00:00,1\n".as_bytes(), b',')
            .unwrap_err();
        assert!(matches!(err, ForecastError::Parse(_)));
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 6, 7, 0, 0).unwrap();
        for raw in [
            "2024-05-06T07:00:00Z",
            "2024-05-06T09:00:00+02:00",
            "2024-05-06 07:00:00+00:00",
            "2024-05-06T07:00",
            "2024-05-06 07:00:00",
        ] {
            assert_eq!(parse_timestamp(raw).unwrap(), expected, "{}", raw);
        }
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_feature_table_file_keeps_schema_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("features.csv");
        let (table, _) = FeatureBuilder::default().build(&regime_series(200)).unwrap();

        SeriesStore::write_feature_table(&path, &table).unwrap();
        let read = SeriesStore::read_feature_table(&path).unwrap();

        assert_eq!(read.schema().names(), table.schema().names());
        assert_eq!(read, table);
    }

    #[test]
    fn test_unlabelled_feature_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("features.csv");
        fs::write(&path, "timestamp,hour,lag_1h\n2024-01-01T00:00:00Z,0,4.5\n").unwrap();
        let table = SeriesStore::read_feature_table(&path).unwrap();
        assert_eq!(table.schema().names(), ["hour", "lag_1h"]);
        assert_eq!(table.rows()[0].labels, None);
    }

    #[test]
    fn test_non_finite_feature_cell_rejected() {
        let dir = TempDir::new().unwrap();
        for cell in ["NaN", "inf", "-inf"] {
            let path = dir.path().join("features.csv");
            fs::write(
                &path,
                format!(
                    "timestamp,hour,lag_1h\n2024-01-01T00:00:00Z,0,4.5\n2024-01-01T01:00:00Z,1,{}\n",
                    cell
                ),
            )
            .unwrap();
            match SeriesStore::read_feature_table(&path).unwrap_err() {
                ForecastError::NonFiniteFeature {
                    feature, location, ..
                } => {
                    assert_eq!(feature, "lag_1h");
                    assert!(location.starts_with("2024-01-01T01:00:00"), "{location}");
                }
                other => panic!("unexpected error for {cell}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_predictions_length_must_match() {
        let dir = TempDir::new().unwrap();
        let (table, _) = FeatureBuilder::default().build(&regime_series(200)).unwrap();
        let err = SeriesStore::write_predictions(&dir.path().join("p.csv"), &table, &[]).unwrap_err();
        assert!(matches!(err, ForecastError::Parse(_)));
    }
}
