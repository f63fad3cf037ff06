//! Normalized telemetry sample.

use serde::{Deserialize, Serialize};

/// One normalized telemetry record.
///
/// Only `ts_ms` is mandatory. Every other field degrades independently: the
/// analyzer skips a metric when it is absent rather than failing the window.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Epoch milliseconds.
    pub ts_ms: i64,
    /// Step time / request latency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    /// Training loss.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    /// Samples or requests per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput: Option<f64>,
    /// GPU compute utilization, percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_util_pct: Option<f64>,
    /// GPU memory utilization, percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_mem_util_pct: Option<f64>,
    /// Per-worker step times for the same step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_latencies_ms: Option<Vec<f64>>,
    /// Node the sample was taken on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// GPU model reported by the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_model: Option<String>,
}

impl TelemetrySample {
    /// Sample carrying only a timestamp and a latency.
    #[must_use]
    pub fn with_latency(ts_ms: i64, latency_ms: f64) -> Self {
        Self {
            ts_ms,
            latency_ms: Some(latency_ms),
            ..Self::default()
        }
    }

    /// Worker latencies, falling back to the single `latency_ms` value.
    #[must_use]
    pub fn worker_latencies(&self) -> Option<Vec<f64>> {
        match &self.worker_latencies_ms {
            Some(values) if !values.is_empty() => Some(values.clone()),
            _ => self.latency_ms.map(|v| vec![v]),
        }
    }
}
