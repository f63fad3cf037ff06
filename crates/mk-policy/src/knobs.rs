//! Knob registry and workload knob state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::action::ProposedAction;
use crate::error::PolicyError;

/// Bounds and granularity of one knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnobSpec {
    /// Lowest allowed value.
    pub min: i64,
    /// Highest allowed value.
    pub max: i64,
    /// Values snap to `min + k * step`.
    pub step: i64,
    /// Value assumed when nothing else is known.
    pub default: i64,
}

impl KnobSpec {
    /// Create a spec.
    #[must_use]
    pub const fn new(min: i64, max: i64, step: i64, default: i64) -> Self {
        Self {
            min,
            max,
            step,
            default,
        }
    }

    /// Snap to the step grid and clamp into bounds.
    #[must_use]
    pub fn clamp(&self, target: i64) -> i64 {
        let step = self.step.max(1);
        let offset = target.saturating_sub(self.min);
        let snapped = self
            .min
            .saturating_add(offset.saturating_add(step / 2).div_euclid(step).saturating_mul(step));
        snapped.clamp(self.min, self.max)
    }
}

/// The knobs ModeKeeper knows how to tune.
#[must_use]
pub fn default_registry() -> BTreeMap<String, KnobSpec> {
    [
        ("dataloader_num_workers", KnobSpec::new(1, 16, 1, 4)),
        ("dataloader_prefetch_factor", KnobSpec::new(1, 8, 1, 2)),
        ("grad_accum_steps", KnobSpec::new(1, 64, 1, 4)),
        ("microbatch_size", KnobSpec::new(1, 256, 1, 32)),
        ("comm_bucket_mb", KnobSpec::new(16, 512, 16, 128)),
        ("timeout_ms", KnobSpec::new(1000, 60000, 500, 5000)),
        ("concurrency", KnobSpec::new(1, 64, 1, 8)),
    ]
    .into_iter()
    .map(|(name, spec)| (name.to_string(), spec))
    .collect()
}

/// Current knob values of the workload plus the last stable profile.
///
/// The policies read this; only the session mutates it, after an apply
/// succeeded or a stable window was seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnobState {
    specs: BTreeMap<String, KnobSpec>,
    values: BTreeMap<String, i64>,
    stable_profile: BTreeMap<String, i64>,
    world_size: i64,
}

impl Default for KnobState {
    fn default() -> Self {
        let specs = default_registry();
        let values: BTreeMap<String, i64> =
            specs.iter().map(|(k, s)| (k.clone(), s.default)).collect();
        Self {
            stable_profile: values.clone(),
            values,
            specs,
            world_size: 1,
        }
    }
}

impl KnobState {
    /// Set one knob, clamped. Also becomes part of the stable profile.
    pub fn with_value(mut self, knob: &str, value: i64) -> Result<Self, PolicyError> {
        self.set(knob, value)?;
        self.capture_stable_profile();
        Ok(self)
    }

    /// Set the data-parallel world size.
    #[must_use]
    pub fn with_world_size(mut self, world_size: i64) -> Self {
        self.world_size = world_size.max(1);
        self
    }

    /// Current value of a knob.
    #[inline]
    #[must_use]
    pub fn value(&self, knob: &str) -> Option<i64> {
        self.values.get(knob).copied()
    }

    /// Spec of a knob.
    #[inline]
    #[must_use]
    pub fn spec(&self, knob: &str) -> Option<&KnobSpec> {
        self.specs.get(knob)
    }

    /// Clamp a target for a knob.
    #[must_use]
    pub fn clamp(&self, knob: &str, target: i64) -> Option<i64> {
        self.specs.get(knob).map(|s| s.clamp(target))
    }

    /// Set a knob, clamped into its bounds. Returns the stored value.
    pub fn set(&mut self, knob: &str, value: i64) -> Result<i64, PolicyError> {
        let spec = self
            .specs
            .get(knob)
            .ok_or_else(|| PolicyError::UnknownKnob(knob.to_string()))?;
        let clamped = spec.clamp(value);
        self.values.insert(knob.to_string(), clamped);
        Ok(clamped)
    }

    /// Record applied actions. Unknown knobs are skipped with a warning.
    pub fn apply_actions<'a, I>(&mut self, actions: I)
    where
        I: IntoIterator<Item = &'a ProposedAction>,
    {
        for action in actions {
            if let Err(err) = self.set(&action.knob, action.target) {
                warn!(knob = %action.knob, target = action.target, error = %err, "applied knob not recorded");
            }
        }
    }

    /// Remember the current values as the profile to relock to.
    pub fn capture_stable_profile(&mut self) {
        self.stable_profile = self.values.clone();
    }

    /// Value of a knob in the last stable profile.
    #[inline]
    #[must_use]
    pub fn stable_value(&self, knob: &str) -> Option<i64> {
        self.stable_profile.get(knob).copied()
    }

    /// Data-parallel world size.
    #[inline]
    #[must_use]
    pub fn world_size(&self) -> i64 {
        self.world_size
    }

    /// `microbatch_size * grad_accum_steps * world_size`.
    #[must_use]
    pub fn global_batch(&self) -> Option<i64> {
        Some(self.value("microbatch_size")? * self.value("grad_accum_steps")? * self.world_size)
    }

    /// All current values.
    #[inline]
    #[must_use]
    pub fn values(&self) -> &BTreeMap<String, i64> {
        &self.values
    }
}
