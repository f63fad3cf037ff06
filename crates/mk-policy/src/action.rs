//! Proposed knob changes.

use serde::{Deserialize, Serialize};

/// One knob change proposed by a policy for the current tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedAction {
    /// Knob name, e.g. `grad_accum_steps`.
    pub knob: String,
    /// Absolute target value, already clamped to the knob's bounds.
    pub target: i64,
    /// Short machine-readable cause, e.g. `drift_detected`.
    pub reason: String,
    /// Chord the change belongs to.
    pub chord_id: Option<String>,
}

impl ProposedAction {
    /// Create an action tagged with a chord.
    #[must_use]
    pub fn new(knob: impl Into<String>, target: i64, reason: impl Into<String>, chord_id: impl Into<String>) -> Self {
        Self {
            knob: knob.into(),
            target,
            reason: reason.into(),
            chord_id: Some(chord_id.into()),
        }
    }

    /// Create an action with no chord.
    #[must_use]
    pub fn untagged(knob: impl Into<String>, target: i64, reason: impl Into<String>) -> Self {
        Self {
            knob: knob.into(),
            target,
            reason: reason.into(),
            chord_id: None,
        }
    }
}
