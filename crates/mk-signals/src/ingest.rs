//! JSON Lines telemetry ingestion.
//!
//! Malformed records never fail a run: each is dropped and counted under the
//! reason it was rejected for, so the evaluation can report how noisy its
//! input was.

use std::collections::BTreeSet;
use std::io::BufRead;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::sample::TelemetrySample;

/// Epoch values above this are already milliseconds.
const EPOCH_MS_THRESHOLD: f64 = 1e11;

/// Counters for records dropped during ingestion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    /// Non-empty lines read.
    pub rows_read: u64,
    /// Lines that were not valid JSON.
    pub dropped_invalid_json: u64,
    /// JSON values that were not objects.
    pub dropped_invalid_shape: u64,
    /// Objects without a usable timestamp.
    pub dropped_missing_fields: u64,
    /// Records repeating an already ingested timestamp.
    pub dropped_duplicate: u64,
}

impl IngestStats {
    /// Sum of every drop counter.
    #[inline]
    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.dropped_invalid_json
            + self.dropped_invalid_shape
            + self.dropped_missing_fields
            + self.dropped_duplicate
    }
}

/// Result of ingesting a telemetry stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ingested {
    /// Samples sorted by timestamp, duplicates removed.
    pub samples: Vec<TelemetrySample>,
    /// Drop counters.
    pub stats: IngestStats,
}

/// Why a single record was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordRejection {
    /// Not parseable as JSON.
    InvalidJson,
    /// Parsed, but not a JSON object.
    InvalidShape,
    /// Missing or unparseable `ts`.
    MissingFields,
}

/// Parse JSON Lines text into a sorted, de-duplicated sample window.
#[must_use]
pub fn ingest_str(text: &str) -> Ingested {
    let mut collector = Collector::default();
    for line in text.lines() {
        collector.push_line(line);
    }
    collector.finish()
}

/// Parse JSON Lines from a reader.
///
/// I/O errors end ingestion early; lines read so far are kept.
pub fn ingest_reader<R: BufRead>(reader: R) -> Ingested {
    let mut collector = Collector::default();
    for line in reader.lines() {
        match line {
            Ok(line) => collector.push_line(&line),
            Err(err) => {
                warn!(error = %err, "telemetry read stopped early");
                break;
            }
        }
    }
    collector.finish()
}

/// Sort by timestamp and drop repeated timestamps, keeping the first record.
pub fn normalize_window(samples: Vec<TelemetrySample>, stats: &mut IngestStats) -> Vec<TelemetrySample> {
    let mut samples = samples;
    samples.sort_by_key(|s| s.ts_ms);
    let before = samples.len();
    samples.dedup_by_key(|s| s.ts_ms);
    stats.dropped_duplicate += (before - samples.len()) as u64;
    samples
}

#[derive(Default)]
struct Collector {
    samples: Vec<TelemetrySample>,
    stats: IngestStats,
}

impl Collector {
    fn push_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        self.stats.rows_read += 1;
        match parse_record(line) {
            Ok(sample) => self.samples.push(sample),
            Err(RecordRejection::InvalidJson) => self.stats.dropped_invalid_json += 1,
            Err(RecordRejection::InvalidShape) => self.stats.dropped_invalid_shape += 1,
            Err(RecordRejection::MissingFields) => self.stats.dropped_missing_fields += 1,
        }
    }

    fn finish(self) -> Ingested {
        let mut stats = self.stats;
        let samples = normalize_window(self.samples, &mut stats);
        if stats.dropped_total() > 0 {
            debug!(
                rows = stats.rows_read,
                dropped = stats.dropped_total(),
                "telemetry records dropped"
            );
        }
        Ingested { samples, stats }
    }
}

/// Parse one JSON Lines record.
pub fn parse_record(line: &str) -> Result<TelemetrySample, RecordRejection> {
    let value: Value = serde_json::from_str(line).map_err(|_| RecordRejection::InvalidJson)?;
    let Value::Object(record) = value else {
        return Err(RecordRejection::InvalidShape);
    };
    record_to_sample(&record)
}

/// Map a JSON object with tolerant field aliases onto a sample.
pub fn record_to_sample(record: &Map<String, Value>) -> Result<TelemetrySample, RecordRejection> {
    let ts_ms = match record.get("ts_ms").and_then(Value::as_i64) {
        Some(ms) => ms,
        None => pick(record, &["ts", "timestamp"])
            .and_then(parse_ts_ms)
            .ok_or(RecordRejection::MissingFields)?,
    };

    let latency_ms = pick(record, &["latency_ms", "step_time_ms"]).and_then(to_f64);
    let worker_latencies_ms = record.get("worker_latencies_ms").and_then(parse_worker_latencies);

    let mut gpu_mem_util_pct = pick(record, &["gpu_mem_util_pct", "gpu_mem_util", "gpu_mem_pct"]).and_then(to_f64);
    if gpu_mem_util_pct.is_none() {
        let used = pick(record, &["gpu_mem_used_mb", "gpu_mem_used", "gpu_mem_used_mib"]).and_then(to_f64);
        let total = pick(record, &["gpu_mem_total_mb", "gpu_mem_total", "gpu_mem_total_mib"]).and_then(to_f64);
        if let (Some(used), Some(total)) = (used, total) {
            if total > 0.0 {
                gpu_mem_util_pct = Some(used / total * 100.0);
            }
        }
    }

    Ok(TelemetrySample {
        ts_ms,
        latency_ms,
        loss: record.get("loss").and_then(to_f64),
        throughput: record.get("throughput").and_then(to_f64),
        gpu_util_pct: pick(record, &["gpu_util_pct", "gpu_util", "gpu_usage_pct", "gpu_usage"]).and_then(to_f64),
        gpu_mem_util_pct,
        worker_latencies_ms,
        node: pick(record, &["node", "node_name"]).and_then(to_text),
        gpu_model: pick(record, &["gpu_model", "gpu_name"]).and_then(to_text),
    })
}

/// Parse a timestamp as epoch seconds, epoch milliseconds or RFC 3339.
///
/// Naive datetimes are taken as UTC.
#[must_use]
pub fn parse_ts_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_f64().and_then(epoch_to_ms),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Ok(v) = s.parse::<f64>() {
                return epoch_to_ms(v);
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc).timestamp_millis());
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc().timestamp_millis())
        }
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn epoch_to_ms(v: f64) -> Option<i64> {
    if !v.is_finite() {
        return None;
    }
    if v > EPOCH_MS_THRESHOLD {
        Some(v as i64)
    } else {
        Some((v * 1000.0) as i64)
    }
}

fn pick<'a>(record: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| record.get(*k))
        .find(|v| !v.is_null() && v.as_str().map_or(true, |s| !s.trim().is_empty()))
}

/// Numbers, or numeric strings with an optional `%` / `MiB` / `MB` suffix.
fn to_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            let s = ["%", "MiB", "MB", "mib", "mb"]
                .iter()
                .find_map(|suffix| s.strip_suffix(suffix))
                .unwrap_or(s)
                .trim();
            s.parse::<f64>().ok()
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn to_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Accepts a JSON array or a string holding one.
fn parse_worker_latencies(value: &Value) -> Option<Vec<f64>> {
    let parsed;
    let items = match value {
        Value::Array(items) => items,
        Value::String(s) => {
            let s = s.trim();
            if !(s.starts_with('[') && s.ends_with(']')) {
                return None;
            }
            parsed = serde_json::from_str::<Value>(s).ok()?;
            parsed.as_array()?
        }
        _ => return None,
    };
    let values: Vec<f64> = items.iter().filter_map(to_f64).collect();
    (!values.is_empty()).then_some(values)
}

/// Distinct trimmed values, sorted.
pub(crate) fn distinct_sorted<'a, I>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a Option<String>>,
{
    values
        .into_iter()
        .flatten()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
