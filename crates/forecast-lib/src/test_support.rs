//! Shared fixtures for unit tests

use crate::models::Observation;
use chrono::{DateTime, Duration, TimeZone, Utc};

/// Monday 2024-01-01 00:00 UTC
pub fn series_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Hourly series alternating 72h blocks of clean (~5) and polluted (~30)
/// air with a small deterministic wobble.
pub fn regime_series(hours: usize) -> Vec<Observation> {
    (0..hours)
        .map(|i| {
            let base = if (i / 72) % 2 == 0 { 5.0 } else { 30.0 };
            let wobble = ((i * 7) % 5) as f64 * 0.3;
            Observation::new(series_start() + Duration::hours(i as i64), base + wobble)
        })
        .collect()
}
