//! Chord definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Chord ids allowed to carry the `safe` tier in `chord_catalog.v1`.
pub const SAFE_CHORD_IDS_V1: [&str; 5] = [
    "NORMAL-HOLD",
    "DRIFT-RETUNE",
    "BURST-ABSORB",
    "INPUT-STRAGGLER",
    "RECOVER-RELOCK",
];

/// Whether an id belongs to the v1 safe set.
#[inline]
#[must_use]
pub fn is_safe_chord_id(id: &str) -> bool {
    SAFE_CHORD_IDS_V1.contains(&id)
}

/// Approval tier of a chord.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// Executable without operator approval.
    Safe,
    /// Requires the advanced-approval flag.
    Advanced,
}

impl RiskTier {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            RiskTier::Safe => "safe",
            RiskTier::Advanced => "advanced",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "safe" => Ok(RiskTier::Safe),
            "advanced" => Ok(RiskTier::Advanced),
            other => Err(format!("unknown risk tier '{other}'")),
        }
    }
}

/// One catalog entry.
///
/// A chord names the knobs it may touch and under which tier. It carries no
/// target values; those come from the policy at proposal time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChordDefinition {
    /// Unique id, e.g. `DRIFT-RETUNE`.
    pub id: String,
    /// Human description of what the chord is for.
    pub intent: String,
    /// Approval tier.
    pub risk_tier: RiskTier,
    /// Signals that must all hold for the chord to apply.
    pub required_signals: Vec<String>,
    /// Invariants the expansion must keep.
    pub invariants: Vec<String>,
    /// Knobs the chord may change.
    pub knobs_touched: Vec<String>,
    /// Minimum time between successful applications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_ms: Option<u64>,
    /// Free-form rate budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<Map<String, Value>>,
}

impl ChordDefinition {
    /// Whether the chord runs without approval.
    #[inline]
    #[must_use]
    pub fn is_safe(&self) -> bool {
        self.risk_tier == RiskTier::Safe
    }

    /// Whether the chord may change a knob.
    #[inline]
    #[must_use]
    pub fn touches(&self, knob: &str) -> bool {
        self.knobs_touched.iter().any(|k| k == knob)
    }

    /// Whether the chord declares an invariant.
    #[inline]
    #[must_use]
    pub fn has_invariant(&self, invariant: &str) -> bool {
        self.invariants.iter().any(|i| i == invariant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_fields_rejected() {
        let raw = r#"{"id":"X","intent":"i","risk_tier":"safe","required_signals":[],
                      "invariants":["a"],"knobs_touched":["b"],"target":4}"#;
        assert!(serde_json::from_str::<ChordDefinition>(raw).is_err());
    }

    #[test]
    fn test_risk_tier_parse() {
        assert_eq!("advanced".parse::<RiskTier>(), Ok(RiskTier::Advanced));
        assert!("SAFE".parse::<RiskTier>().is_err());
        assert!(is_safe_chord_id("DRIFT-RETUNE"));
        assert!(!is_safe_chord_id("TIMEOUT-GUARD"));
    }
}
