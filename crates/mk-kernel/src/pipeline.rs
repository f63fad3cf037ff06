//! Read-only decision path.
//!
//! `samples → signals → mode → chord → actions → gate decisions`, with no
//! cluster access. The only state carried between windows lives in
//! [`DecisionState`], owned by the caller.

use mk_catalog::ChordCatalog;
use mk_policy::{KnobState, Policy, PolicyInput, PolicyStrategy, ProposedAction};
use mk_signals::{Mode, ModeStateMachine, ModeTransition, SignalAnalyzer, SignalSet, TelemetrySample};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::error::Result;
use crate::gate::{CooldownStore, GateConfig, GateDecision, SafetyGate};

/// State carried from one window to the next.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionState {
    /// Hysteresis tracker.
    pub modes: ModeStateMachine,
    /// Chord cooldowns.
    pub cooldowns: CooldownStore,
    /// Workload knob values.
    pub knobs: KnobState,
}

impl DecisionState {
    /// Fresh state for a configuration.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        Ok(Self {
            modes: ModeStateMachine::new(config.mode.clone()),
            cooldowns: CooldownStore::new(),
            knobs: config.initial_knobs()?,
        })
    }

    /// Current mode.
    #[inline]
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.modes.mode()
    }
}

/// Result of evaluating one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Signals of the window.
    pub signals: SignalSet,
    /// Mode change bookkeeping.
    pub transition: ModeTransition,
    /// Chord chosen for the tick, if any.
    pub chord: Option<String>,
    /// Proposed actions.
    pub actions: Vec<ProposedAction>,
    /// One decision per proposed action.
    pub gate_decisions: Vec<GateDecision>,
}

impl Evaluation {
    /// Mode after the window.
    #[inline]
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.transition.to
    }

    /// Actions the safety gate let through.
    pub fn allowed_actions(&self) -> impl Iterator<Item = &ProposedAction> {
        self.gate_decisions.iter().filter(|d| d.allowed).map(|d| &d.action)
    }
}

/// Signal analyzer, catalog, policy and safety gate wired together.
#[derive(Debug, Clone)]
pub struct Evaluator {
    analyzer: SignalAnalyzer,
    catalog: ChordCatalog,
    policy: Policy,
    gate: GateConfig,
}

impl Evaluator {
    /// Create from a validated catalog and configuration.
    pub fn new(catalog: ChordCatalog, config: &AgentConfig) -> Result<Self> {
        Ok(Self {
            analyzer: SignalAnalyzer::new(config.analyzer.clone()),
            catalog,
            policy: Policy::from_config(&config.policy)?,
            gate: config.gate.clone(),
        })
    }

    /// Create, loading the configured catalog (or the builtin one).
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let catalog = match &config.catalog_path {
            Some(path) => ChordCatalog::load_file(path)?,
            None => ChordCatalog::builtin_v1()?,
        };
        Self::new(catalog, config)
    }

    /// Chord catalog in use.
    #[inline]
    #[must_use]
    pub fn catalog(&self) -> &ChordCatalog {
        &self.catalog
    }

    /// Policy in use.
    #[inline]
    #[must_use]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Evaluate one window.
    ///
    /// `now_ms` is the tick clock used for cooldowns. Identical state,
    /// samples and clock always give an identical [`Evaluation`].
    pub fn evaluate(&self, state: &mut DecisionState, samples: &[TelemetrySample], now_ms: i64) -> Evaluation {
        let signals = self.analyzer.analyze(samples);
        let transition = state.modes.observe(&signals);
        if transition.switched {
            info!(from = %transition.from, to = %transition.to, "mode changed");
        } else if transition.candidate != transition.to {
            debug!(
                candidate = %transition.candidate,
                confirmations = transition.confirmations,
                "mode change pending"
            );
        }

        let mode = transition.to;
        if mode == Mode::Normal && signals.stable {
            state.knobs.capture_stable_profile();
        }

        let input = PolicyInput {
            mode,
            signals: &signals,
            catalog: &self.catalog,
            knobs: &state.knobs,
        };
        let chord = match &self.policy {
            Policy::Chord(policy) => policy.select(&input).map(|c| c.id.clone()),
            Policy::Scalar(_) => None,
        };
        let actions = self.policy.propose(&input);
        let chord = chord.or_else(|| actions.iter().find_map(|a| a.chord_id.clone()));
        debug!(
            policy = self.policy.name(),
            chord = chord.as_deref().unwrap_or("none"),
            actions = actions.len(),
            "policy proposed"
        );

        let gate = SafetyGate::new(&self.catalog, self.gate.clone());
        let cooldowns = std::mem::take(&mut state.cooldowns);
        let outcome = gate.evaluate(&actions, &state.knobs, cooldowns, now_ms);
        state.cooldowns = outcome.cooldowns;

        Evaluation {
            signals,
            transition,
            chord,
            actions,
            gate_decisions: outcome.decisions,
        }
    }

    /// Evaluate windows in order against one state.
    pub fn replay<'s, I>(&self, state: &mut DecisionState, windows: I) -> Vec<Evaluation>
    where
        I: IntoIterator<Item = &'s [TelemetrySample]>,
    {
        let mut clock = 0;
        windows
            .into_iter()
            .map(|window| {
                clock = window_clock(window, clock);
                self.evaluate(state, window, clock)
            })
            .collect()
    }
}

/// Tick clock for a window: its newest timestamp, else the previous clock.
#[must_use]
pub fn window_clock(window: &[TelemetrySample], previous_ms: i64) -> i64 {
    window.iter().map(|s| s.ts_ms).max().unwrap_or(previous_ms).max(previous_ms)
}

/// Split samples into windows of `size`, starting every `stride` samples.
///
/// A trailing partial window is kept, but never an empty one. With
/// `stride > size` the samples between windows are skipped.
#[must_use]
pub fn sliding_windows(samples: &[TelemetrySample], size: usize, stride: usize) -> Vec<&[TelemetrySample]> {
    let size = size.max(1);
    let stride = stride.max(1);
    if samples.len() <= size {
        return vec![samples];
    }
    let mut windows = Vec::new();
    let mut start = 0;
    while start < samples.len() {
        let end = (start + size).min(samples.len());
        windows.push(&samples[start..end]);
        if end == samples.len() {
            break;
        }
        start += stride;
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(latencies: &[f64]) -> Vec<TelemetrySample> {
        latencies
            .iter()
            .enumerate()
            .map(|(i, &v)| TelemetrySample::with_latency(i as i64 * 1000, v))
            .collect()
    }

    #[test]
    fn test_sliding_windows() {
        let s = samples(&[1.0; 10]);
        let w = sliding_windows(&s, 4, 4);
        assert_eq!(w.iter().map(|w| w.len()).collect::<Vec<_>>(), vec![4, 4, 2]);
        let w = sliding_windows(&s, 4, 2);
        assert_eq!(w.len(), 4);
        assert_eq!(sliding_windows(&s, 20, 5).len(), 1);
    }

    #[test]
    fn test_sliding_windows_stride_past_end() {
        let s = samples(&[1.0; 10]);
        let w = sliding_windows(&s, 4, 20);
        assert_eq!(w.iter().map(|w| w.len()).collect::<Vec<_>>(), vec![4]);
        let w = sliding_windows(&s, 4, 6);
        assert_eq!(w.iter().map(|w| w.len()).collect::<Vec<_>>(), vec![4, 4]);
    }

    #[test]
    fn test_sliding_windows_never_empty() {
        let s = samples(&[1.0; 10]);
        let w = sliding_windows(&s, 4, 5);
        assert_eq!(w.iter().map(|w| w.len()).collect::<Vec<_>>(), vec![4, 4]);
        for (size, stride) in [(3, 1), (3, 2), (4, 3), (4, 5), (2, 7), (9, 9)] {
            let w = sliding_windows(&s, size, stride);
            assert!(!w.is_empty());
            assert!(w.iter().all(|w| !w.is_empty()), "size={size} stride={stride}");
        }
    }

    #[test]
    fn test_window_clock_never_goes_back() {
        let s = samples(&[1.0, 1.0, 1.0]);
        assert_eq!(window_clock(&s, 0), 2000);
        assert_eq!(window_clock(&s, 5000), 5000);
        assert_eq!(window_clock(&[], 7), 7);
    }

    #[test]
    fn test_stable_window_holds() {
        let config = AgentConfig::default();
        let evaluator = Evaluator::from_config(&config).unwrap();
        let mut state = DecisionState::from_config(&config).unwrap();
        let s = samples(&[100.0; 16]);
        let eval = evaluator.evaluate(&mut state, &s, 15_000);
        assert_eq!(eval.mode(), Mode::Normal);
        assert_eq!(eval.chord.as_deref(), Some("NORMAL-HOLD"));
        assert!(eval.actions.is_empty());
        assert!(eval.gate_decisions.is_empty());
    }
}
