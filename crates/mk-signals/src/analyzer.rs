//! Signal analysis over a telemetry window.
//!
//! The analyzer is a pure function of its configuration and the samples it is
//! handed. It never fails: missing metrics switch off the signals that depend
//! on them and a window that is too short reports `stable`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ingest::distinct_sorted;
use crate::sample::TelemetrySample;

/// Thresholds for signal detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Recent-quarter mean step time over baseline-quarter mean that counts as drift.
    pub drift_ratio: f64,
    /// Peak step time over median that counts as a burst.
    pub burst_ratio: f64,
    /// Mean worker max over mean worker median that counts as a straggler.
    pub straggler_threshold: f64,
    /// GPU compute or memory utilization ceiling, percent.
    pub gpu_ceiling_pct: f64,
    /// Late-quarter mean loss over early-quarter mean loss that counts as drift.
    pub loss_drift_ratio: f64,
    /// Windows shorter than this are reported stable.
    pub min_window: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            drift_ratio: 1.2,
            burst_ratio: 1.5,
            straggler_threshold: 1.6,
            gpu_ceiling_pct: 90.0,
            loss_drift_ratio: 1.15,
            min_window: 4,
        }
    }
}

impl AnalyzerConfig {
    /// Set the step-time drift ratio.
    #[must_use]
    pub fn with_drift_ratio(mut self, ratio: f64) -> Self {
        self.drift_ratio = ratio;
        self
    }

    /// Set the burst ratio.
    #[must_use]
    pub fn with_burst_ratio(mut self, ratio: f64) -> Self {
        self.burst_ratio = ratio;
        self
    }

    /// Set the straggler threshold.
    #[must_use]
    pub fn with_straggler_threshold(mut self, threshold: f64) -> Self {
        self.straggler_threshold = threshold;
        self
    }

    /// Set the GPU utilization ceiling.
    #[must_use]
    pub fn with_gpu_ceiling_pct(mut self, pct: f64) -> Self {
        self.gpu_ceiling_pct = pct;
        self
    }

    /// Set the minimum window length.
    #[must_use]
    pub fn with_min_window(mut self, samples: usize) -> Self {
        self.min_window = samples;
        self
    }
}

/// Scalar evidence behind the boolean flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Samples in the window after de-duplication.
    pub sample_count: usize,
    /// Median step time.
    pub latency_p50_ms: Option<f64>,
    /// 95th percentile step time.
    pub latency_p95_ms: Option<f64>,
    /// 99th percentile step time.
    pub latency_p99_ms: Option<f64>,
    /// Mean step time over the first quarter of the window.
    pub baseline_latency_ms: Option<f64>,
    /// Mean step time over the last quarter of the window.
    pub recent_latency_ms: Option<f64>,
    /// Mean worker max over mean worker median.
    pub straggler_score: Option<f64>,
    /// Highest GPU compute utilization seen.
    pub gpu_util_max_pct: Option<f64>,
    /// Highest GPU memory utilization seen.
    pub gpu_mem_util_max_pct: Option<f64>,
}

/// Distinct nodes and GPU models seen in a window.
///
/// `unstable` is advisory and never blocks anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentFingerprint {
    /// Sorted distinct node names.
    pub nodes_seen: Vec<String>,
    /// Sorted distinct GPU models.
    pub gpu_models_seen: Vec<String>,
    /// More than one node or GPU model appeared.
    pub unstable: bool,
    /// `multiple_nodes_seen` / `multiple_gpu_models_seen`.
    pub notes: Vec<String>,
}

impl EnvironmentFingerprint {
    /// Build the fingerprint of a window.
    #[must_use]
    pub fn from_samples(samples: &[TelemetrySample]) -> Self {
        let nodes_seen = distinct_sorted(samples.iter().map(|s| &s.node));
        let gpu_models_seen = distinct_sorted(samples.iter().map(|s| &s.gpu_model));
        let mut notes = Vec::new();
        if nodes_seen.len() > 1 {
            notes.push("multiple_nodes_seen".to_string());
        }
        if gpu_models_seen.len() > 1 {
            notes.push("multiple_gpu_models_seen".to_string());
        }
        Self {
            unstable: !notes.is_empty(),
            nodes_seen,
            gpu_models_seen,
            notes,
        }
    }
}

/// Derived per-window signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSet {
    /// Sustained step-time or loss increase.
    pub drift: bool,
    /// Transient tail spike in step time.
    pub burst: bool,
    /// High dispersion across workers.
    pub straggler: bool,
    /// GPU compute or memory above the ceiling.
    pub gpu_saturated: bool,
    /// Any of the incident flags holds.
    pub incident: bool,
    /// No incident flag holds.
    pub stable: bool,
    /// Ordered diagnostic notes.
    pub notes: Vec<String>,
    /// Numbers behind the flags.
    pub evidence: Evidence,
    /// Node / GPU heterogeneity.
    pub environment: EnvironmentFingerprint,
}

impl SignalSet {
    /// A window with nothing to report.
    #[must_use]
    pub fn stable_with_note(note: &str) -> Self {
        Self {
            drift: false,
            burst: false,
            straggler: false,
            gpu_saturated: false,
            incident: false,
            stable: true,
            notes: vec![note.to_string()],
            evidence: Evidence::default(),
            environment: EnvironmentFingerprint::default(),
        }
    }

    /// Whether a named signal holds.
    ///
    /// Unknown names never hold.
    #[must_use]
    pub fn holds(&self, signal: &str) -> bool {
        match signal {
            "drift" => self.drift,
            "burst" => self.burst,
            "straggler" => self.straggler,
            "gpu_saturated" => self.gpu_saturated,
            "incident" => self.incident,
            "stable" => self.stable,
            _ => false,
        }
    }
}

/// Computes a [`SignalSet`] from a sample window.
#[derive(Debug, Clone, Default)]
pub struct SignalAnalyzer {
    config: AnalyzerConfig,
}

impl SignalAnalyzer {
    /// Create an analyzer.
    #[must_use]
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Thresholds in use.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Analyze a window. Input order does not matter; repeated timestamps
    /// count once.
    #[must_use]
    pub fn analyze(&self, samples: &[TelemetrySample]) -> SignalSet {
        let window = ordered_window(samples);
        if window.is_empty() {
            return SignalSet::stable_with_note("no_samples");
        }

        let environment = EnvironmentFingerprint::from_samples(&window);
        let latencies: Vec<f64> = window.iter().filter_map(|s| s.latency_ms).collect();
        let mut evidence = Evidence {
            sample_count: window.len(),
            latency_p50_ms: percentile(&latencies, 50.0),
            latency_p95_ms: percentile(&latencies, 95.0),
            latency_p99_ms: percentile(&latencies, 99.0),
            gpu_util_max_pct: max_of(window.iter().filter_map(|s| s.gpu_util_pct)),
            gpu_mem_util_max_pct: max_of(window.iter().filter_map(|s| s.gpu_mem_util_pct)),
            ..Evidence::default()
        };

        if window.len() < self.config.min_window.max(1) {
            let mut signals = SignalSet::stable_with_note("insufficient_samples");
            signals.evidence = evidence;
            signals.environment = environment;
            return signals;
        }

        let cfg = &self.config;
        let mut notes = Vec::new();

        let losses: Vec<f64> = window.iter().filter_map(|s| s.loss).collect();
        let loss_drift = match quarter_means(&losses) {
            Some((start, end)) => end > start * cfg.loss_drift_ratio,
            None => false,
        };

        let (step_drift, spike) = match quarter_means(&latencies) {
            Some((baseline, recent)) => {
                evidence.baseline_latency_ms = Some(baseline);
                evidence.recent_latency_ms = Some(recent);
                let sustained = recent > baseline * cfg.drift_ratio;
                let q = quarter(latencies.len());
                let tail = &latencies[latencies.len() - q..];
                let tail_settled = match (max_of(tail.iter().copied()), median(tail)) {
                    (Some(max), Some(med)) => max <= med * cfg.burst_ratio,
                    _ => false,
                };
                let spike = match (max_of(latencies.iter().copied()), median(&latencies)) {
                    (Some(max), Some(med)) => max > med * cfg.burst_ratio,
                    _ => false,
                };
                (sustained && tail_settled, spike)
            }
            None => (false, false),
        };

        let drift = loss_drift || step_drift;
        let burst = spike && !step_drift;

        let mut worker_max = Vec::new();
        let mut worker_med = Vec::new();
        for sample in &window {
            if let Some(workers) = sample.worker_latencies() {
                if let (Some(max), Some(med)) = (max_of(workers.iter().copied()), median(&workers)) {
                    worker_max.push(max);
                    worker_med.push(med);
                }
            }
        }
        evidence.straggler_score = match (mean(&worker_max), mean(&worker_med)) {
            (Some(max), Some(med)) if med > 0.0 => Some(max / med),
            _ => None,
        };
        let straggler = evidence
            .straggler_score
            .is_some_and(|score| score > cfg.straggler_threshold);

        let gpu_saturated = evidence
            .gpu_util_max_pct
            .is_some_and(|v| v >= cfg.gpu_ceiling_pct)
            || evidence
                .gpu_mem_util_max_pct
                .is_some_and(|v| v >= cfg.gpu_ceiling_pct);

        if loss_drift {
            notes.push("loss_drift".to_string());
        } else if losses.is_empty() {
            notes.push("loss_missing".to_string());
        }
        if step_drift {
            notes.push("step_time_drift".to_string());
        }
        if burst {
            notes.push("latency_burst".to_string());
        }
        if straggler {
            notes.push("straggler_detected".to_string());
        }
        if gpu_saturated {
            notes.push("gpu_saturated".to_string());
        }

        let incident = drift || burst || straggler || gpu_saturated;
        debug!(
            samples = window.len(),
            drift,
            burst,
            straggler,
            gpu_saturated,
            "signals computed"
        );

        SignalSet {
            drift,
            burst,
            straggler,
            gpu_saturated,
            incident,
            stable: !incident,
            notes,
            evidence,
            environment,
        }
    }
}

fn ordered_window(samples: &[TelemetrySample]) -> Vec<TelemetrySample> {
    let mut window = samples.to_vec();
    window.sort_by_key(|s| s.ts_ms);
    window.dedup_by_key(|s| s.ts_ms);
    window
}

fn quarter(len: usize) -> usize {
    (len / 4).max(1)
}

/// Means of the first and last quarter.
fn quarter_means(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let q = quarter(values.len());
    Some((mean(&values[..q])?, mean(&values[values.len() - q..])?))
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Nearest-rank percentile.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

fn max_of<I: IntoIterator<Item = f64>>(values: I) -> Option<f64> {
    values.into_iter().reduce(f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(latencies: &[f64]) -> Vec<TelemetrySample> {
        latencies
            .iter()
            .enumerate()
            .map(|(i, &v)| TelemetrySample::with_latency(i as i64 * 1000, v))
            .collect()
    }

    #[test]
    fn test_empty_and_short_windows_are_stable() {
        let analyzer = SignalAnalyzer::default();
        let empty = analyzer.analyze(&[]);
        assert!(empty.stable);
        assert_eq!(empty.notes, vec!["no_samples"]);

        let short = analyzer.analyze(&window(&[100.0, 900.0]));
        assert!(short.stable);
        assert!(!short.burst);
        assert_eq!(short.notes, vec!["insufficient_samples"]);
        assert_eq!(short.evidence.sample_count, 2);
    }

    #[test]
    fn test_constant_step_time_is_stable() {
        let signals = SignalAnalyzer::default().analyze(&window(&[100.0; 12]));
        assert!(signals.stable);
        assert!(!signals.incident);
        assert_eq!(signals.evidence.straggler_score, Some(1.0));
    }

    #[test]
    fn test_sustained_increase_is_drift_not_burst() {
        let mut values = vec![100.0; 4];
        values.extend([200.0; 8]);
        let signals = SignalAnalyzer::default().analyze(&window(&values));
        assert!(signals.drift);
        assert!(!signals.burst);
        assert!(signals.notes.contains(&"step_time_drift".to_string()));
    }

    #[test]
    fn test_transient_spike_is_burst() {
        let mut values = vec![100.0; 12];
        values[6] = 400.0;
        let signals = SignalAnalyzer::default().analyze(&window(&values));
        assert!(signals.burst);
        assert!(!signals.drift);
        assert_eq!(signals.evidence.latency_p99_ms, Some(400.0));
    }

    #[test]
    fn test_trailing_spike_is_burst() {
        let mut values = vec![100.0; 12];
        values.push(300.0);
        let signals = SignalAnalyzer::default().analyze(&window(&values));
        assert!(signals.burst);
        assert!(!signals.drift);
    }

    #[test]
    fn test_worker_dispersion_is_straggler() {
        let samples: Vec<_> = (0..8)
            .map(|i| TelemetrySample {
                ts_ms: i * 1000,
                latency_ms: Some(100.0),
                worker_latencies_ms: Some(vec![100.0, 100.0, 100.0, 250.0]),
                ..TelemetrySample::default()
            })
            .collect();
        let signals = SignalAnalyzer::default().analyze(&samples);
        assert!(signals.straggler);
        assert_eq!(signals.evidence.straggler_score, Some(2.5));
    }

    #[test]
    fn test_gpu_ceiling_is_inclusive() {
        let samples: Vec<_> = (0..4)
            .map(|i| TelemetrySample {
                ts_ms: i,
                gpu_mem_util_pct: Some(90.0),
                ..TelemetrySample::default()
            })
            .collect();
        let signals = SignalAnalyzer::default().analyze(&samples);
        assert!(signals.gpu_saturated);
        assert!(signals.incident);
    }

    #[test]
    fn test_missing_fields_degrade_quietly() {
        let samples: Vec<_> = (0..6).map(|i| TelemetrySample { ts_ms: i, ..TelemetrySample::default() }).collect();
        let signals = SignalAnalyzer::default().analyze(&samples);
        assert!(signals.stable);
        assert_eq!(signals.evidence.latency_p50_ms, None);
        assert_eq!(signals.notes, vec!["loss_missing"]);
    }

    #[test]
    fn test_loss_drift() {
        let samples: Vec<_> = (0..8)
            .map(|i| TelemetrySample {
                ts_ms: i,
                latency_ms: Some(100.0),
                loss: Some(if i < 4 { 1.0 } else { 1.5 }),
                ..TelemetrySample::default()
            })
            .collect();
        let signals = SignalAnalyzer::default().analyze(&samples);
        assert!(signals.drift);
        assert_eq!(signals.notes[0], "loss_drift");
    }

    #[test]
    fn test_fingerprint_is_advisory() {
        let samples: Vec<_> = ["a", "b", "a", "c"]
            .iter()
            .enumerate()
            .map(|(i, node)| TelemetrySample {
                ts_ms: i as i64,
                latency_ms: Some(100.0),
                node: Some((*node).to_string()),
                gpu_model: Some("H100".to_string()),
                ..TelemetrySample::default()
            })
            .collect();
        let signals = SignalAnalyzer::default().analyze(&samples);
        assert!(signals.environment.unstable);
        assert_eq!(signals.environment.nodes_seen, vec!["a", "b", "c"]);
        assert_eq!(signals.environment.notes, vec!["multiple_nodes_seen"]);
        assert!(signals.stable);
    }
}
