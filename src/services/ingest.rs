use crate::db::models::{DailyAverage, LatestClassification, LatestReading, NewReading, Reading};
use crate::db::store::{Store, StoreError};
use crate::models::reading::ReadingInput;
use crate::quality::classify::classify_reading;
use core::fmt;
use log::{debug, error, warn};
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io::{BufRead, Write};

#[derive(Debug)]
pub enum IngestError {
    /// No device is registered under the key; nothing was written.
    InvalidApiKey(String),
    Store(StoreError),
}

impl IngestError {
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::InvalidApiKey(_) => false,
            IngestError::Store(e) => e.is_retryable(),
        }
    }
}

impl Display for IngestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::InvalidApiKey(key) => write!(f, "invalid api key: {}", key),
            IngestError::Store(e) => write!(f, "ingest failed: {}", e),
        }
    }
}

impl Error for IngestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            IngestError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for IngestError {
    fn from(value: StoreError) -> Self {
        IngestError::Store(value)
    }
}

/// Record one reading and refresh the device's projections.
///
/// Inside one unit of work for the device: insert the raw reading, upsert the
/// latest classification and latest reading snapshots, then recompute the
/// mean of every metric over the reading's UTC day and upsert that day's
/// average. Either every write lands or none does.
pub fn ingest<S: Store>(store: &S, input: &ReadingInput) -> Result<Reading, IngestError> {
    let api_key = input.api_key.as_str();
    let result: Result<Reading, IngestError> = store.in_device_unit(api_key, |unit| {
        if unit.find_device(api_key)?.is_none() {
            return Err(IngestError::InvalidApiKey(api_key.to_string()));
        }

        let reading = unit.insert_reading(&NewReading::from(input))?;
        let verdicts = classify_reading(&reading.metrics());
        unit.upsert_latest_classification(&LatestClassification::from_verdicts(&reading, &verdicts))?;
        unit.upsert_latest_reading(&LatestReading::from_reading(&reading))?;

        let day = reading.day();
        let means = unit.day_means(api_key, day)?;
        unit.upsert_daily_average(&DailyAverage::from_means(api_key, day, &means))?;
        Ok(reading)
    });

    match &result {
        Ok(reading) => debug!(
            "Ingested reading {} for {} at {}",
            reading.id, reading.api_key, reading.timestamp
        ),
        Err(IngestError::InvalidApiKey(key)) => warn!("Rejected reading for unknown api key {}", key),
        Err(IngestError::Store(_)) => {}
    }
    result
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub accepted: usize,
    /// Well-formed readings for unknown API keys.
    pub rejected: usize,
    /// Lines that did not parse as a reading.
    pub invalid: usize,
    pub failed: usize,
}

fn error_line(kind: &str, detail: &str, retryable: bool) -> serde_json::Value {
    serde_json::json!({ "error": kind, "detail": detail, "retryable": retryable })
}

/// Ingest newline-delimited JSON readings from `input`, writing one JSON
/// result per non-blank line to `output`. A bad line does not stop the
/// stream; only I/O failures do.
pub fn ingest_ndjson<S, R, W>(store: &S, input: R, mut output: W) -> Result<IngestSummary, String>
where
    S: Store,
    R: BufRead,
    W: Write,
{
    let mut summary = IngestSummary::default();
    for (index, line) in input.lines().enumerate() {
        let line = line.map_err(|e| format!("failed to read input line {}: {}", index + 1, e))?;
        if line.trim().is_empty() {
            continue;
        }

        let result = match ReadingInput::from_json(&line) {
            Err(e) => {
                summary.invalid += 1;
                warn!("Skipping input line {}: {}", index + 1, e);
                error_line("invalid_input", &e, false)
            }
            Ok(reading) => match ingest(store, &reading) {
                Ok(row) => {
                    summary.accepted += 1;
                    serde_json::to_value(&row).map_err(|e| format!("serialize reading failed: {}", e))?
                }
                Err(e @ IngestError::InvalidApiKey(_)) => {
                    summary.rejected += 1;
                    error_line("invalid_api_key", &e.to_string(), false)
                }
                Err(e) => {
                    summary.failed += 1;
                    error!("Reading on input line {} failed: {}", index + 1, e);
                    error_line("store", &e.to_string(), e.is_retryable())
                }
            },
        };
        writeln!(output, "{}", result).map_err(|e| format!("failed to write result: {}", e))?;
    }
    output.flush().map_err(|e| format!("failed to flush results: {}", e))?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::quality::thresholds::Tier;
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn input(key: &str, pm2_5: f64, timestamp: DateTime<Utc>) -> ReadingInput {
        ReadingInput {
            api_key: key.to_string(),
            pm2_5: Some(pm2_5),
            pm10: Some(20.0),
            co2: Some(600.0),
            tvoc: Some(100.0),
            humidity: Some(55.0),
            temperature: Some(25.0),
            timestamp,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    #[test]
    fn unknown_key_writes_nothing() {
        let store = MemoryStore::with_devices(&["dev-a"]);
        let err = ingest(&store, &input("nope", 10.0, at(8, 0))).unwrap_err();
        assert!(matches!(err, IngestError::InvalidApiKey(ref k) if k == "nope"));
        assert!(!err.is_retryable());
        assert_eq!(store.counts_for("nope"), Default::default());
        assert!(store.latest_classifications().unwrap().is_empty());
    }

    #[test]
    fn daily_average_tracks_every_reading() {
        let store = MemoryStore::with_devices(&["dev-a"]);
        for (i, v) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            ingest(&store, &input("dev-a", v, at(8 + i as u32, 0))).unwrap();
        }
        let rows = store.daily_averages("dev-a").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].avg_pm2_5, 20.0);
        assert_eq!(rows[0].avg_co2, 600.0);

        ingest(&store, &input("dev-a", 40.0, at(12, 0))).unwrap();
        let rows = store.daily_averages("dev-a").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].avg_pm2_5, 25.0);
    }

    #[test]
    fn days_are_partitioned_in_utc() {
        let store = MemoryStore::with_devices(&["dev-a"]);
        let late = Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 59).unwrap();
        ingest(&store, &input("dev-a", 10.0, late)).unwrap();
        ingest(&store, &input("dev-a", 30.0, late + Duration::seconds(1))).unwrap();

        let rows = store.daily_averages("dev-a").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].day, rows[0].avg_pm2_5), (day(1), 10.0));
        assert_eq!((rows[1].day, rows[1].avg_pm2_5), (day(2), 30.0));
    }

    #[test]
    fn snapshots_follow_the_latest_ingest() {
        let store = MemoryStore::with_devices(&["dev-a"]);
        ingest(&store, &input("dev-a", 10.0, at(8, 0))).unwrap();
        let second = ingest(&store, &input("dev-a", 40.0, at(9, 0))).unwrap();

        let latest = store.latest_reading("dev-a").unwrap().unwrap();
        assert_eq!(latest.pm2_5, Some(40.0));
        assert_eq!(latest.timestamp, second.timestamp);

        let class = store.latest_classification("dev-a").unwrap().unwrap();
        assert_eq!(class.pm2_5_tier, Tier::Hazardous.label());
        assert_eq!(class.pm10_tier, Tier::Good.label());
        assert_eq!(store.counts_for("dev-a").latest_readings, 1);
    }

    #[test]
    fn nulls_are_unknown_and_skipped_by_the_mean() {
        let store = MemoryStore::with_devices(&["dev-a"]);
        let mut first = input("dev-a", 10.0, at(8, 0));
        first.tvoc = None;
        ingest(&store, &first).unwrap();

        let class = store.latest_classification("dev-a").unwrap().unwrap();
        assert_eq!(class.tvoc_tier, "unknown");
        assert_eq!(class.tvoc_advice, None);
        assert_eq!(store.daily_averages("dev-a").unwrap()[0].avg_tvoc, 0.0);

        ingest(&store, &input("dev-a", 10.0, at(9, 0))).unwrap();
        assert_eq!(store.daily_averages("dev-a").unwrap()[0].avg_tvoc, 100.0);
        assert_eq!(store.latest_reading("dev-a").unwrap().unwrap().tvoc, Some(100.0));
    }

    #[test]
    fn omitted_metrics_are_stored_as_zero() {
        let store = MemoryStore::with_devices(&["dev-a"]);
        let parsed =
            ReadingInput::from_json(r#"{"api_key":"dev-a","pm2_5":12,"timestamp":"2024-05-01T08:00:00Z"}"#).unwrap();
        let reading = ingest(&store, &parsed).unwrap();
        assert_eq!(reading.co2, Some(0.0));
        let class = store.latest_classification("dev-a").unwrap().unwrap();
        assert_eq!(class.co2_tier, "good");
        // 0 is below every comfort band
        assert_eq!(class.temperature_tier, "hazardous");
    }

    #[test]
    fn failed_unit_leaves_nothing_behind() {
        let store = MemoryStore::with_devices(&["dev-a"]);
        ingest(&store, &input("dev-a", 10.0, at(8, 0))).unwrap();

        store.fail_daily_upserts(true);
        let err = ingest(&store, &input("dev-a", 90.0, at(9, 0))).unwrap_err();
        assert!(matches!(err, IngestError::Store(StoreError::Database(_))));

        let counts = store.counts_for("dev-a");
        assert_eq!(counts.readings, 1);
        let latest = store.latest_reading("dev-a").unwrap().unwrap();
        assert_eq!(latest.pm2_5, Some(10.0));
        let class = store.latest_classification("dev-a").unwrap().unwrap();
        assert_eq!(class.pm2_5_tier, "good");
        assert_eq!(store.daily_averages("dev-a").unwrap()[0].avg_pm2_5, 10.0);

        store.fail_daily_upserts(false);
        ingest(&store, &input("dev-a", 30.0, at(10, 0))).unwrap();
        assert_eq!(store.daily_averages("dev-a").unwrap()[0].avg_pm2_5, 20.0);
    }

    #[test]
    fn concurrent_ingests_for_one_device_serialize() {
        let store = Arc::new(MemoryStore::with_devices(&["dev-a"]));
        let workers = 16;
        let barrier = Arc::new(Barrier::new(workers));

        let handles: Vec<_> = (0..workers)
            .map(|i| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ingest(store.as_ref(), &input("dev-a", i as f64, at(8, i as u32))).unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let readings = store.readings_for("dev-a");
        assert_eq!(readings.len(), workers);
        let last = readings.iter().max_by_key(|r| r.id).unwrap();

        let counts = store.counts_for("dev-a");
        assert_eq!(counts.latest_readings, 1);
        assert_eq!(counts.latest_classifications, 1);
        assert_eq!(counts.daily_averages, 1);

        let latest = store.latest_reading("dev-a").unwrap().unwrap();
        assert_eq!(latest.pm2_5, last.pm2_5);
        assert_eq!(latest.timestamp, last.timestamp);
        let class = store.latest_classification("dev-a").unwrap().unwrap();
        assert_eq!(class.timestamp, last.timestamp);

        // mean of 0..16
        assert_eq!(store.daily_averages("dev-a").unwrap()[0].avg_pm2_5, 7.5);
    }

    #[test]
    fn distinct_devices_ingest_in_parallel() {
        let keys = ["dev-a", "dev-b", "dev-c", "dev-d"];
        let store = Arc::new(MemoryStore::with_devices(&keys));
        let barrier = Arc::new(Barrier::new(keys.len()));

        let handles: Vec<_> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                let key = key.to_string();
                thread::spawn(move || {
                    barrier.wait();
                    for n in 0..5 {
                        ingest(store.as_ref(), &input(&key, (i * 10 + n) as f64, at(8, n as u32))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for (i, key) in keys.iter().enumerate() {
            assert_eq!(store.readings_for(key).len(), 5);
            let avg = store.daily_averages(key).unwrap()[0].avg_pm2_5;
            assert_eq!(avg, (i * 10 + 2) as f64);
            assert_eq!(store.latest_reading(key).unwrap().unwrap().pm2_5, Some((i * 10 + 4) as f64));
        }
    }

    #[test]
    fn ndjson_reports_every_line() {
        let store = MemoryStore::with_devices(&["dev-a"]);
        let lines = [
            r#"{"api_key":"dev-a","pm2_5":10,"timestamp":"2024-05-01T08:00:00Z"}"#,
            "",
            r#"{"api_key":"ghost","pm2_5":10,"timestamp":"2024-05-01T08:00:00Z"}"#,
            r#"{"api_key":"dev-a","pm2_5":"lots","timestamp":"2024-05-01T08:00:00Z"}"#,
            r#"{"api_key":"dev-a","pm2_5":30,"timestamp":"2024-05-01T09:00:00Z"}"#,
        ]
        .join("\n");

        let mut out = Vec::new();
        let summary = ingest_ndjson(&store, std::io::Cursor::new(lines), &mut out).unwrap();
        assert_eq!(
            summary,
            IngestSummary {
                accepted: 2,
                rejected: 1,
                invalid: 1,
                failed: 0
            }
        );

        let results: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(results.len(), 4);
        assert_eq!(results[0]["api_key"], "dev-a");
        assert_eq!(results[1]["error"], "invalid_api_key");
        assert_eq!(results[2]["error"], "invalid_input");
        assert_eq!(results[2]["retryable"], false);
        assert_eq!(results[3]["pm2_5"], 30.0);
        assert_eq!(store.daily_averages("dev-a").unwrap()[0].avg_pm2_5, 20.0);
    }
}
