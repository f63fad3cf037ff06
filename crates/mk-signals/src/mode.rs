//! Operating mode state machine with hysteresis.
//!
//! A candidate mode is derived from each window's signals and must be
//! confirmed by consecutive windows before the machine switches. Incident
//! modes only return to `NORMAL` through `RECOVER`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::analyzer::SignalSet;

/// Operating mode of the observed workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    /// Nothing to correct.
    #[default]
    Normal,
    /// Sustained degradation.
    Drift,
    /// Transient tail spike.
    Burst,
    /// Slow workers holding back the step.
    Straggler,
    /// Incident cleared, waiting for stability.
    Recover,
}

impl Mode {
    /// Every mode, in declaration order.
    pub const ALL: [Mode; 5] = [
        Mode::Normal,
        Mode::Drift,
        Mode::Burst,
        Mode::Straggler,
        Mode::Recover,
    ];

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Mode::Normal => "NORMAL",
            Mode::Drift => "DRIFT",
            Mode::Burst => "BURST",
            Mode::Straggler => "STRAGGLER",
            Mode::Recover => "RECOVER",
        }
    }

    /// DRIFT, BURST or STRAGGLER.
    #[inline]
    #[must_use]
    pub const fn is_incident(self) -> bool {
        matches!(self, Mode::Drift | Mode::Burst | Mode::Straggler)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateMachineError {
    /// The edge is not in the transition table.
    #[error("illegal mode transition {from} -> {to}")]
    IllegalTransition {
        /// Current mode.
        from: Mode,
        /// Requested mode.
        to: Mode,
    },
}

/// Legal successor modes.
#[must_use]
pub fn allowed_transitions(from: Mode) -> Vec<Mode> {
    use Mode::{Burst, Drift, Normal, Recover, Straggler};
    match from {
        Normal => vec![Drift, Burst, Straggler],
        Drift => vec![Burst, Straggler, Recover],
        Burst => vec![Drift, Straggler, Recover],
        Straggler => vec![Drift, Burst, Recover],
        Recover => vec![Normal, Drift, Burst, Straggler],
    }
}

/// Check a mode change against the transition table.
pub fn validate_transition(from: Mode, to: Mode) -> Result<(), StateMachineError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

/// Mode the signals point at, before hysteresis.
///
/// Priority is burst, straggler, drift, then GPU saturation (handled as a
/// burst). A stable window moves incident modes toward `RECOVER` and
/// `RECOVER` toward `NORMAL`.
#[must_use]
pub fn candidate_mode(current: Mode, signals: &SignalSet) -> Mode {
    if signals.burst {
        Mode::Burst
    } else if signals.straggler {
        Mode::Straggler
    } else if signals.drift {
        Mode::Drift
    } else if signals.gpu_saturated {
        Mode::Burst
    } else if current.is_incident() {
        Mode::Recover
    } else {
        Mode::Normal
    }
}

/// Hysteresis settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    /// Consecutive windows confirming a candidate before switching.
    pub confirm_windows: u32,
    /// Consecutive stable windows in `RECOVER` before returning to `NORMAL`.
    pub recover_windows: u32,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            confirm_windows: 2,
            recover_windows: 2,
        }
    }
}

impl ModeConfig {
    /// Set the confirmation window count.
    #[must_use]
    pub fn with_confirm_windows(mut self, windows: u32) -> Self {
        self.confirm_windows = windows;
        self
    }

    /// Set the recovery window count.
    #[must_use]
    pub fn with_recover_windows(mut self, windows: u32) -> Self {
        self.recover_windows = windows;
        self
    }
}

/// Outcome of observing one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeTransition {
    /// Mode before the window.
    pub from: Mode,
    /// Mode after the window.
    pub to: Mode,
    /// Mode the window pointed at.
    pub candidate: Mode,
    /// Consecutive windows confirming `candidate`, including this one.
    pub confirmations: u32,
    /// Whether the mode changed.
    pub switched: bool,
}

/// Mode tracker carried across the ticks of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeStateMachine {
    config: ModeConfig,
    mode: Mode,
    pending: Option<(Mode, u32)>,
}

impl Default for ModeStateMachine {
    fn default() -> Self {
        Self::new(ModeConfig::default())
    }
}

impl ModeStateMachine {
    /// Start in `NORMAL`.
    #[must_use]
    pub fn new(config: ModeConfig) -> Self {
        Self {
            config,
            mode: Mode::Normal,
            pending: None,
        }
    }

    /// Current mode.
    #[inline]
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Candidate awaiting confirmation and its count.
    #[inline]
    #[must_use]
    pub fn pending(&self) -> Option<(Mode, u32)> {
        self.pending
    }

    /// Feed one window's signals.
    pub fn observe(&mut self, signals: &SignalSet) -> ModeTransition {
        let from = self.mode;
        let candidate = candidate_mode(from, signals);

        if candidate == from {
            self.pending = None;
            return ModeTransition {
                from,
                to: from,
                candidate,
                confirmations: 0,
                switched: false,
            };
        }

        let confirmations = match self.pending {
            Some((pending, count)) if pending == candidate => count.saturating_add(1),
            _ => 1,
        };
        let required = if from == Mode::Recover && candidate == Mode::Normal {
            self.config.recover_windows
        } else {
            self.config.confirm_windows
        }
        .max(1);

        if confirmations < required {
            self.pending = Some((candidate, confirmations));
            return ModeTransition {
                from,
                to: from,
                candidate,
                confirmations,
                switched: false,
            };
        }

        self.pending = None;
        if let Err(err) = validate_transition(from, candidate) {
            warn!(error = %err, "mode change refused");
            return ModeTransition {
                from,
                to: from,
                candidate,
                confirmations,
                switched: false,
            };
        }

        self.mode = candidate;
        info!(from = %from, to = %candidate, confirmations, "mode transition");
        ModeTransition {
            from,
            to: candidate,
            candidate,
            confirmations,
            switched: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(flag: &str) -> SignalSet {
        let mut s = SignalSet::stable_with_note("test");
        match flag {
            "drift" => s.drift = true,
            "burst" => s.burst = true,
            "straggler" => s.straggler = true,
            "gpu_saturated" => s.gpu_saturated = true,
            _ => return s,
        }
        s.incident = true;
        s.stable = false;
        s
    }

    #[test]
    fn test_candidate_priority() {
        let mut s = signals("drift");
        s.burst = true;
        s.straggler = true;
        assert_eq!(candidate_mode(Mode::Normal, &s), Mode::Burst);
        s.burst = false;
        assert_eq!(candidate_mode(Mode::Normal, &s), Mode::Straggler);
        assert_eq!(candidate_mode(Mode::Normal, &signals("gpu_saturated")), Mode::Burst);
        assert_eq!(candidate_mode(Mode::Drift, &signals("stable")), Mode::Recover);
        assert_eq!(candidate_mode(Mode::Recover, &signals("stable")), Mode::Normal);
    }

    #[test]
    fn test_single_window_does_not_flip() {
        let mut sm = ModeStateMachine::default();
        let t = sm.observe(&signals("burst"));
        assert!(!t.switched);
        assert_eq!(t.confirmations, 1);
        sm.observe(&signals("stable"));
        assert_eq!(sm.mode(), Mode::Normal);
        assert_eq!(sm.pending(), None);
    }

    #[test]
    fn test_full_incident_cycle_passes_through_recover() {
        let mut sm = ModeStateMachine::default();
        let mut seen = Vec::new();
        for flag in ["drift", "drift", "stable", "stable", "stable", "stable"] {
            seen.push(sm.observe(&signals(flag)).to);
        }
        assert_eq!(
            seen,
            vec![
                Mode::Normal,
                Mode::Drift,
                Mode::Drift,
                Mode::Recover,
                Mode::Recover,
                Mode::Normal
            ]
        );
    }

    #[test]
    fn test_recover_window_count_is_separate() {
        let mut sm = ModeStateMachine::new(ModeConfig::default().with_confirm_windows(1).with_recover_windows(3));
        sm.observe(&signals("straggler"));
        sm.observe(&signals("stable"));
        assert_eq!(sm.mode(), Mode::Recover);
        sm.observe(&signals("stable"));
        sm.observe(&signals("stable"));
        assert_eq!(sm.mode(), Mode::Recover);
        sm.observe(&signals("stable"));
        assert_eq!(sm.mode(), Mode::Normal);
    }

    #[test]
    fn test_normal_cannot_skip_to_recover() {
        assert!(validate_transition(Mode::Normal, Mode::Recover).is_err());
        assert!(validate_transition(Mode::Drift, Mode::Normal).is_err());
        assert!(validate_transition(Mode::Recover, Mode::Normal).is_ok());
    }

    #[test]
    fn test_mode_wire_names() {
        assert_eq!(serde_json::to_string(&Mode::Straggler).unwrap(), "\"STRAGGLER\"");
        assert_eq!(Mode::Recover.to_string(), "RECOVER");
    }
}
