//! `global_batch ≈ microbatch_size × grad_accum_steps × world_size`.

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;
use crate::knobs::KnobState;

/// Accum / microbatch pair after rebalancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPair {
    /// New `grad_accum_steps`.
    pub grad_accum_steps: i64,
    /// New `microbatch_size`.
    pub microbatch_size: i64,
}

/// Keeps the global batch within a relative tolerance band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchInvariant {
    tolerance: f64,
}

impl Default for BatchInvariant {
    fn default() -> Self {
        Self { tolerance: 0.05 }
    }
}

impl BatchInvariant {
    /// Create with a relative tolerance in `[0, 1)`.
    pub fn new(tolerance: f64) -> Result<Self, PolicyError> {
        if !(0.0..1.0).contains(&tolerance) {
            return Err(PolicyError::InvalidTolerance(tolerance.to_string()));
        }
        Ok(Self { tolerance })
    }

    /// Relative tolerance.
    #[inline]
    #[must_use]
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Whether `new` stays within tolerance of `old`.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn holds(&self, old_product: i64, new_product: i64) -> bool {
        let old = old_product as f64;
        ((new_product - old_product).abs() as f64) <= old.abs() * self.tolerance
    }

    /// Move work from microbatch size into gradient accumulation.
    ///
    /// Tries doubling the accumulation first, then each larger value in
    /// ascending order, and returns the first pair whose product stays within
    /// tolerance with a strictly smaller microbatch. `None` when no such pair
    /// exists inside the knob bounds.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation
    )]
    #[must_use]
    pub fn shift_to_accumulation(&self, knobs: &KnobState) -> Option<BatchPair> {
        let accum = knobs.value("grad_accum_steps")?;
        let micro = knobs.value("microbatch_size")?;
        let accum_spec = knobs.spec("grad_accum_steps")?;
        let micro_spec = knobs.spec("microbatch_size")?;
        let product = accum * micro;

        let doubled = accum.saturating_mul(2);
        let candidates = std::iter::once(doubled)
            .chain((accum + 1)..=accum_spec.max)
            .filter(|&a| a > accum && a <= accum_spec.max);

        for new_accum in candidates {
            let new_micro = micro_spec.clamp((product as f64 / new_accum as f64).round() as i64);
            if new_micro < micro && self.holds(product, new_accum * new_micro) {
                return Some(BatchPair {
                    grad_accum_steps: new_accum,
                    microbatch_size: new_micro,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pair_doubles_accum() {
        let pair = BatchInvariant::default()
            .shift_to_accumulation(&KnobState::default())
            .unwrap();
        assert_eq!(pair, BatchPair { grad_accum_steps: 8, microbatch_size: 16 });
    }

    #[test]
    fn test_falls_back_to_ascending_search() {
        // 7 * 9 = 63. Doubling gives 14 * 5 = 70, outside 5%; 8 * 8 = 64 fits.
        let knobs = KnobState::default()
            .with_value("grad_accum_steps", 7)
            .unwrap()
            .with_value("microbatch_size", 9)
            .unwrap();
        let pair = BatchInvariant::default().shift_to_accumulation(&knobs).unwrap();
        assert_eq!(pair, BatchPair { grad_accum_steps: 8, microbatch_size: 8 });
    }

    #[test]
    fn test_no_pair_at_minimum_microbatch() {
        let knobs = KnobState::default().with_value("microbatch_size", 1).unwrap();
        assert_eq!(BatchInvariant::default().shift_to_accumulation(&knobs), None);
    }

    #[test]
    fn test_tolerance_bounds() {
        assert!(BatchInvariant::new(1.0).is_err());
        assert!(BatchInvariant::new(-0.1).is_err());
        let inv = BatchInvariant::new(0.1).unwrap();
        assert!(inv.holds(100, 110));
        assert!(!inv.holds(100, 111));
    }
}
