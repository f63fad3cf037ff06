//! Catalog-driven chord policy.
//!
//! The confirmed mode picks which signals may trigger a chord. Among the
//! chords whose required signals all hold, safe chords win over advanced
//! ones and earlier declarations win over later ones. The chosen chord's
//! knobs are then expanded into concrete targets.

use mk_catalog::{ChordDefinition, RiskTier};
use mk_signals::{Mode, SignalSet};
use tracing::debug;

use crate::action::ProposedAction;
use crate::invariant::BatchInvariant;
use crate::knobs::KnobState;
use crate::strategy::{PolicyInput, PolicyStrategy};

/// Holds while the confirmed mode is `RECOVER`.
pub const RECOVER_SIGNAL: &str = "recover";

/// Signals that may trigger a chord in a given mode.
#[must_use]
pub fn trigger_signals(mode: Mode) -> &'static [&'static str] {
    match mode {
        Mode::Normal => &["stable"],
        Mode::Drift => &["drift"],
        Mode::Burst => &["burst", "gpu_saturated"],
        Mode::Straggler => &["straggler"],
        Mode::Recover => &[RECOVER_SIGNAL],
    }
}

/// Whether a signal holds, including the mode-derived `recover`.
#[must_use]
pub fn signal_holds(signal: &str, mode: Mode, signals: &SignalSet) -> bool {
    if signal == RECOVER_SIGNAL {
        mode == Mode::Recover
    } else {
        signals.holds(signal)
    }
}

/// Picks one chord per tick and expands it into knob targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChordPolicy {
    invariant: BatchInvariant,
}

impl ChordPolicy {
    /// Create with a batch invariant.
    #[must_use]
    pub fn new(invariant: BatchInvariant) -> Self {
        Self { invariant }
    }

    /// Chord for this tick, if any applies.
    #[must_use]
    pub fn select<'c>(&self, input: &PolicyInput<'c>) -> Option<&'c ChordDefinition> {
        let triggers = trigger_signals(input.mode);
        input
            .catalog
            .iter()
            .enumerate()
            .filter(|(_, chord)| {
                chord.required_signals.iter().any(|s| triggers.contains(&s.as_str()))
                    && chord
                        .required_signals
                        .iter()
                        .all(|s| signal_holds(s, input.mode, input.signals))
            })
            .min_by_key(|(position, chord)| (chord.risk_tier != RiskTier::Safe, *position))
            .map(|(_, chord)| chord)
    }

    /// Expand a chord into actions that actually change something.
    #[must_use]
    pub fn expand(&self, chord: &ChordDefinition, input: &PolicyInput<'_>) -> Vec<ProposedAction> {
        let triggers = trigger_signals(input.mode);
        let Some(trigger) = chord
            .required_signals
            .iter()
            .map(String::as_str)
            .find(|s| triggers.contains(s))
        else {
            return Vec::new();
        };
        let knobs = input.knobs;

        let pair = match trigger {
            "drift" | "gpu_saturated"
                if chord.touches("grad_accum_steps") && chord.touches("microbatch_size") =>
            {
                self.invariant.shift_to_accumulation(knobs)
            }
            _ => None,
        };
        let relock_pair_ok = trigger != RECOVER_SIGNAL || self.relock_keeps_batch(knobs);

        let mut actions = Vec::new();
        for knob in &chord.knobs_touched {
            let Some(current) = knobs.value(knob) else {
                continue;
            };
            let target = match (trigger, knob.as_str()) {
                (_, "grad_accum_steps") if pair.is_some() => pair.map(|p| p.grad_accum_steps),
                (_, "microbatch_size") if pair.is_some() => pair.map(|p| p.microbatch_size),
                ("drift" | "gpu_saturated", "grad_accum_steps" | "microbatch_size") => None,
                (RECOVER_SIGNAL, "grad_accum_steps" | "microbatch_size") if !relock_pair_ok => None,
                (RECOVER_SIGNAL, _) => knobs.stable_value(knob),
                (trigger, knob) => nudge(trigger, knob, current),
            };
            let Some(target) = target.and_then(|t| knobs.clamp(knob, t)) else {
                continue;
            };
            if target != current {
                actions.push(ProposedAction::new(
                    knob.clone(),
                    target,
                    reason_for(trigger),
                    chord.id.clone(),
                ));
            }
        }
        actions
    }

    /// Restoring both batch knobs must not move the global batch.
    fn relock_keeps_batch(&self, knobs: &KnobState) -> bool {
        let current = knobs.value("grad_accum_steps").zip(knobs.value("microbatch_size"));
        let stable = knobs
            .stable_value("grad_accum_steps")
            .zip(knobs.stable_value("microbatch_size"));
        match (current, stable) {
            (Some((a, m)), Some((sa, sm))) => self.invariant.holds(a * m, sa * sm),
            _ => false,
        }
    }
}

/// Relative adjustment for single-knob chords.
fn nudge(trigger: &str, knob: &str, current: i64) -> Option<i64> {
    match (trigger, knob) {
        ("burst", "dataloader_prefetch_factor") => Some(current + 1),
        ("burst", "concurrency") => Some(current / 2),
        ("burst" | "straggler", "comm_bucket_mb") => Some(current / 2),
        ("straggler", "dataloader_num_workers") => Some(current + 2),
        ("straggler", "timeout_ms") => Some(current.saturating_mul(3)),
        _ => None,
    }
}

fn reason_for(trigger: &str) -> &'static str {
    match trigger {
        "drift" => "drift_detected",
        "burst" => "latency_burst",
        "straggler" => "straggler_detected",
        "gpu_saturated" => "gpu_saturated",
        RECOVER_SIGNAL => "recover_relock",
        _ => "hold",
    }
}

impl PolicyStrategy for ChordPolicy {
    fn propose(&self, input: &PolicyInput<'_>) -> Vec<ProposedAction> {
        let Some(chord) = self.select(input) else {
            debug!(mode = %input.mode, "no chord applies");
            return Vec::new();
        };
        let actions = self.expand(chord, input);
        debug!(
            mode = %input.mode,
            chord = %chord.id,
            actions = actions.len(),
            "chord selected"
        );
        actions
    }

    fn name(&self) -> &'static str {
        "chord"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mk_catalog::ChordCatalog;

    fn signals(flags: &[&str]) -> SignalSet {
        let mut s = SignalSet::stable_with_note("test");
        for flag in flags {
            match *flag {
                "drift" => s.drift = true,
                "burst" => s.burst = true,
                "straggler" => s.straggler = true,
                "gpu_saturated" => s.gpu_saturated = true,
                _ => {}
            }
        }
        s.incident = s.drift || s.burst || s.straggler || s.gpu_saturated;
        s.stable = !s.incident;
        s
    }

    fn run(mode: Mode, flags: &[&str], knobs: &KnobState) -> (Option<String>, Vec<ProposedAction>) {
        let catalog = ChordCatalog::builtin_v1().unwrap();
        let signals = signals(flags);
        let input = PolicyInput {
            mode,
            signals: &signals,
            catalog: &catalog,
            knobs,
        };
        let policy = ChordPolicy::default();
        let chord = policy.select(&input).map(|c| c.id.clone());
        (chord, policy.propose(&input))
    }

    #[test]
    fn test_normal_holds() {
        let (chord, actions) = run(Mode::Normal, &[], &KnobState::default());
        assert_eq!(chord.as_deref(), Some("NORMAL-HOLD"));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_drift_retune_pair() {
        let (chord, actions) = run(Mode::Drift, &["drift"], &KnobState::default());
        assert_eq!(chord.as_deref(), Some("DRIFT-RETUNE"));
        assert_eq!(
            actions,
            vec![
                ProposedAction::new("grad_accum_steps", 8, "drift_detected", "DRIFT-RETUNE"),
                ProposedAction::new("microbatch_size", 16, "drift_detected", "DRIFT-RETUNE"),
            ]
        );
    }

    #[test]
    fn test_unconfirmed_signal_selects_nothing() {
        let (chord, actions) = run(Mode::Normal, &["drift"], &KnobState::default());
        assert_eq!(chord, None);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_straggler_prefers_safe_chord() {
        let (chord, actions) = run(Mode::Straggler, &["straggler"], &KnobState::default());
        assert_eq!(chord.as_deref(), Some("INPUT-STRAGGLER"));
        assert_eq!(
            actions,
            vec![ProposedAction::new("dataloader_num_workers", 6, "straggler_detected", "INPUT-STRAGGLER")]
        );
    }

    #[test]
    fn test_gpu_saturation_alone_selects_advanced_chord() {
        let (chord, actions) = run(Mode::Burst, &["gpu_saturated"], &KnobState::default());
        assert_eq!(chord.as_deref(), Some("MEMORY-HEADROOM"));
        let knobs: Vec<_> = actions.iter().map(|a| (a.knob.as_str(), a.target)).collect();
        assert_eq!(knobs, vec![("microbatch_size", 16), ("grad_accum_steps", 8)]);
    }

    #[test]
    fn test_burst_absorb() {
        let (chord, actions) = run(Mode::Burst, &["burst", "straggler"], &KnobState::default());
        assert_eq!(chord.as_deref(), Some("BURST-ABSORB"));
        let knobs: Vec<_> = actions.iter().map(|a| (a.knob.as_str(), a.target)).collect();
        assert_eq!(knobs, vec![("dataloader_prefetch_factor", 3), ("concurrency", 4)]);
    }

    #[test]
    fn test_recover_restores_stable_profile() {
        let mut knobs = KnobState::default();
        knobs.set("grad_accum_steps", 8).unwrap();
        knobs.set("microbatch_size", 16).unwrap();
        knobs.set("dataloader_num_workers", 6).unwrap();
        let (chord, actions) = run(Mode::Recover, &[], &knobs);
        assert_eq!(chord.as_deref(), Some("RECOVER-RELOCK"));
        let targets: Vec<_> = actions.iter().map(|a| (a.knob.as_str(), a.target)).collect();
        assert_eq!(
            targets,
            vec![("grad_accum_steps", 4), ("microbatch_size", 32), ("dataloader_num_workers", 4)]
        );
        assert!(actions.iter().all(|a| a.reason == "recover_relock"));
    }
}
