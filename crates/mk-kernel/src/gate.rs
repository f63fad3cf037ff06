//! Safety & governance gate.
//!
//! Every proposed action gets exactly one [`GateDecision`], in proposal
//! order. Checks run in a fixed order and the first failing one is the
//! reported reason:
//!
//! 1. `unknown_chord`: no chord id, or an id the catalog does not define
//! 2. `approval_required`: advanced tier without `approve_advanced`
//! 3. `cooldown_active`: the chord was applied too recently
//! 4. `max_delta_exceeded`: the knob would move by more than one step allows

use std::collections::BTreeMap;
use std::fmt;

use mk_catalog::{ChordCatalog, RiskTier};
use mk_license::LicenseReason;
use mk_policy::{KnobState, ProposedAction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Closed vocabulary of block codes across the safety gate and the apply
/// gate chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// Action has no chord, or the chord is not in the catalog.
    UnknownChord,
    /// Advanced chord without explicit approval.
    ApprovalRequired,
    /// Chord cooldown has not elapsed.
    CooldownActive,
    /// Knob delta above the per-step limit.
    MaxDeltaExceeded,
    /// Operator kill switch is set.
    KillSwitchActive,
    /// No license document.
    LicenseMissing,
    /// License malformed or badly signed.
    LicenseInvalid,
    /// License past its expiry.
    LicenseExpired,
    /// License lacks the apply entitlement.
    EntitlementMissing,
    /// License bound to another environment.
    BindingMismatch,
    /// No verify report was supplied.
    VerifyMissing,
    /// Verification ran and did not pass.
    VerifyFailed,
}

impl BlockReason {
    /// Wire code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            BlockReason::UnknownChord => "unknown_chord",
            BlockReason::ApprovalRequired => "approval_required",
            BlockReason::CooldownActive => "cooldown_active",
            BlockReason::MaxDeltaExceeded => "max_delta_exceeded",
            BlockReason::KillSwitchActive => "kill_switch_active",
            BlockReason::LicenseMissing => "license_missing",
            BlockReason::LicenseInvalid => "license_invalid",
            BlockReason::LicenseExpired => "license_expired",
            BlockReason::EntitlementMissing => "entitlement_missing",
            BlockReason::BindingMismatch => "binding_mismatch",
            BlockReason::VerifyMissing => "verify_missing",
            BlockReason::VerifyFailed => "verify_failed",
        }
    }

    /// Block code for a license outcome. `None` when the license is ok.
    #[must_use]
    pub const fn from_license(reason: LicenseReason) -> Option<Self> {
        match reason {
            LicenseReason::Ok => None,
            LicenseReason::LicenseMissing => Some(BlockReason::LicenseMissing),
            LicenseReason::LicenseInvalid => Some(BlockReason::LicenseInvalid),
            LicenseReason::LicenseExpired => Some(BlockReason::LicenseExpired),
            LicenseReason::EntitlementMissing => Some(BlockReason::EntitlementMissing),
            LicenseReason::BindingMismatch => Some(BlockReason::BindingMismatch),
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Let advanced-tier chords through.
    pub approve_advanced: bool,
    /// Largest absolute knob change per tick. `0` disables the check.
    pub max_delta_per_step: i64,
    /// Cooldown for chords that do not declare one.
    pub default_cooldown_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            approve_advanced: false,
            max_delta_per_step: 0,
            default_cooldown_ms: 30_000,
        }
    }
}

impl GateConfig {
    /// Set advanced approval.
    #[must_use]
    pub fn with_approve_advanced(mut self, approve: bool) -> Self {
        self.approve_advanced = approve;
        self
    }

    /// Set the per-step delta limit.
    #[must_use]
    pub fn with_max_delta_per_step(mut self, max_delta: i64) -> Self {
        self.max_delta_per_step = max_delta;
        self
    }

    /// Set the fallback cooldown.
    #[must_use]
    pub fn with_default_cooldown_ms(mut self, cooldown_ms: u64) -> Self {
        self.default_cooldown_ms = cooldown_ms;
        self
    }
}

/// Last successful application time of each chord.
///
/// Owned by the watch session and threaded through every gate call; there
/// is no process-wide cooldown state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownStore {
    last_applied_ms: BTreeMap<String, i64>,
}

impl CooldownStore {
    /// Empty store.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a chord was applied at `now_ms`.
    pub fn record_applied(&mut self, chord_id: &str, now_ms: i64) {
        self.last_applied_ms.insert(chord_id.to_string(), now_ms);
    }

    /// When a chord was last applied.
    #[inline]
    #[must_use]
    pub fn last_applied(&self, chord_id: &str) -> Option<i64> {
        self.last_applied_ms.get(chord_id).copied()
    }

    /// Whether `cooldown_ms` has not yet elapsed for a chord.
    #[must_use]
    pub fn is_cooling(&self, chord_id: &str, cooldown_ms: u64, now_ms: i64) -> bool {
        self.last_applied(chord_id).is_some_and(|last| {
            let elapsed = now_ms.saturating_sub(last);
            elapsed < i64::try_from(cooldown_ms).unwrap_or(i64::MAX)
        })
    }
}

/// Verdict for one proposed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    /// The action as proposed.
    pub action: ProposedAction,
    /// Whether the action passed every check.
    pub allowed: bool,
    /// First failing check, if any.
    pub reason_code: Option<BlockReason>,
}

impl GateDecision {
    fn allowed(action: ProposedAction) -> Self {
        Self {
            action,
            allowed: true,
            reason_code: None,
        }
    }

    fn blocked(action: ProposedAction, reason: BlockReason) -> Self {
        Self {
            action,
            allowed: false,
            reason_code: Some(reason),
        }
    }
}

/// Decisions for one tick plus the cooldown store to carry forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    /// One decision per proposed action, in proposal order.
    pub decisions: Vec<GateDecision>,
    /// Cooldown state after this call.
    pub cooldowns: CooldownStore,
}

/// Safety & governance gate over a validated catalog.
#[derive(Debug, Clone)]
pub struct SafetyGate<'a> {
    catalog: &'a ChordCatalog,
    config: GateConfig,
}

impl<'a> SafetyGate<'a> {
    /// Create a gate.
    #[must_use]
    pub fn new(catalog: &'a ChordCatalog, config: GateConfig) -> Self {
        Self { catalog, config }
    }

    /// Gate settings.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Evaluate a tick's proposals.
    ///
    /// The store is only read here. Successful applications are recorded
    /// by the caller with [`CooldownStore::record_applied`].
    #[must_use]
    pub fn evaluate(
        &self,
        actions: &[ProposedAction],
        knobs: &KnobState,
        cooldowns: CooldownStore,
        now_ms: i64,
    ) -> GateOutcome {
        let decisions: Vec<GateDecision> = actions
            .iter()
            .map(|action| match self.check(action, knobs, &cooldowns, now_ms) {
                None => GateDecision::allowed(action.clone()),
                Some(reason) => {
                    info!(
                        knob = %action.knob,
                        chord = action.chord_id.as_deref().unwrap_or("none"),
                        reason = %reason,
                        "action blocked"
                    );
                    GateDecision::blocked(action.clone(), reason)
                }
            })
            .collect();
        debug!(
            proposed = actions.len(),
            allowed = decisions.iter().filter(|d| d.allowed).count(),
            "safety gate evaluated"
        );
        GateOutcome {
            decisions,
            cooldowns,
        }
    }

    fn check(
        &self,
        action: &ProposedAction,
        knobs: &KnobState,
        cooldowns: &CooldownStore,
        now_ms: i64,
    ) -> Option<BlockReason> {
        let Some(chord) = action
            .chord_id
            .as_deref()
            .map(str::trim)
            .and_then(|id| self.catalog.get(id))
        else {
            return Some(BlockReason::UnknownChord);
        };

        if chord.risk_tier == RiskTier::Advanced && !self.config.approve_advanced {
            return Some(BlockReason::ApprovalRequired);
        }

        let cooldown_ms = chord.cooldown_ms.unwrap_or(self.config.default_cooldown_ms);
        if cooldowns.is_cooling(&chord.id, cooldown_ms, now_ms) {
            return Some(BlockReason::CooldownActive);
        }

        if self.config.max_delta_per_step > 0 {
            let current = knobs.value(&action.knob).unwrap_or(action.target);
            let target = knobs.clamp(&action.knob, action.target).unwrap_or(action.target);
            if target.saturating_sub(current).saturating_abs() > self.config.max_delta_per_step {
                return Some(BlockReason::MaxDeltaExceeded);
            }
        }

        None
    }
}
