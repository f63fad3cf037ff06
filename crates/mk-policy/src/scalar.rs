//! Scalar baseline policy.
//!
//! Collapses the signals into one pressure level in `[0, 1]` and sheds
//! concurrency in proportion. It exists to compare chord decisions against,
//! so its action is tagged with a chord id the catalog never contains.

use mk_signals::SignalSet;

use crate::action::ProposedAction;
use crate::strategy::{PolicyInput, PolicyStrategy};

/// Chord tag carried by scalar actions.
pub const SCALAR_CHORD_ID: &str = "SCALAR";

const SCALAR_KNOB: &str = "concurrency";

/// Single-knob comparison baseline.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarPolicy;

impl ScalarPolicy {
    /// Create the policy.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Pressure level for a window, in `[0, 1]`.
    #[must_use]
    pub fn level(signals: &SignalSet) -> f64 {
        let mut level: f64 = 0.0;
        if signals.incident || signals.drift {
            level = level.max(0.5);
        }
        if signals.burst {
            level = level.max(0.75);
        }
        if signals.straggler || signals.gpu_saturated {
            level = level.max(1.0);
        }
        level.clamp(0.0, 1.0)
    }
}

impl PolicyStrategy for ScalarPolicy {
    #[allow(clippy::cast_possible_truncation)]
    fn propose(&self, input: &PolicyInput<'_>) -> Vec<ProposedAction> {
        let level = Self::level(input.signals);
        if level <= 0.0 {
            return Vec::new();
        }
        let (Some(current), Some(spec)) = (
            input.knobs.value(SCALAR_KNOB),
            input.knobs.spec(SCALAR_KNOB),
        ) else {
            return Vec::new();
        };
        let steps = ((level * 4.0).round() as i64).max(1);
        let target = spec.clamp(current - steps * spec.step);
        if target == current {
            return Vec::new();
        }
        vec![ProposedAction::new(
            SCALAR_KNOB,
            target,
            format!("scalar_level={level:.2}"),
            SCALAR_CHORD_ID,
        )]
    }

    fn name(&self) -> &'static str {
        "scalar"
    }
}
