//! Apply gate chain.
//!
//! Decides whether a tick's allowed actions may be written to the cluster.
//! Gates run in a fixed order and the first failure is the reported
//! blocker:
//!
//! 1. kill switch: absolute, nothing overrides it
//! 2. license: must verify with the apply entitlement
//! 3. verify: a passing verify report must be present
//!
//! The chain only reads verification results; it never calls the cluster.

use std::env;
use std::ffi::OsString;

use mk_license::{LicenseReason, LicenseVerification};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::gate::{BlockReason, GateDecision};
use crate::k8s::{ApplyReport, VerifyReport};

/// Environment variable whose presence activates the kill switch.
pub const KILL_SWITCH_ENV: &str = "MODEKEEPER_KILL_SWITCH";

/// Operator kill switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitch {
    active: bool,
}

impl KillSwitch {
    /// Switch in a known state.
    #[inline]
    #[must_use]
    pub const fn new(active: bool) -> Self {
        Self { active }
    }

    /// Read [`KILL_SWITCH_ENV`] from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_env_value(env::var_os(KILL_SWITCH_ENV))
    }

    /// Interpret a raw environment value.
    ///
    /// Any value, including an empty or non-UTF-8 one, activates the switch.
    #[must_use]
    pub fn from_env_value(value: Option<OsString>) -> Self {
        let active = match value {
            None => false,
            Some(raw) => {
                if raw.to_str().is_none() {
                    warn!("{KILL_SWITCH_ENV} is not valid UTF-8, treating as active");
                }
                true
            }
        };
        Self { active }
    }

    /// Whether mutations are blocked.
    #[inline]
    #[must_use]
    pub const fn is_active(self) -> bool {
        self.active
    }
}

/// Verdict of the apply gate chain for one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyDecision {
    /// Kill switch was set.
    pub kill_switch_active: bool,
    /// License verified with the required entitlement.
    pub license_ok: bool,
    /// License outcome code.
    pub license_reason: LicenseReason,
    /// A verify report was present and passed.
    pub verify_ok: bool,
    /// Actions the safety gate let through.
    pub allowed_actions: usize,
    /// The mutation call was issued.
    pub apply_attempted: bool,
    /// Every patched object succeeded. `None` when nothing was attempted.
    pub apply_ok: Option<bool>,
    /// First failing gate.
    pub block_reason: Option<BlockReason>,
}

impl ApplyDecision {
    /// Whether the mutation call may run.
    #[inline]
    #[must_use]
    pub fn permits_apply(&self) -> bool {
        self.block_reason.is_none() && self.allowed_actions > 0
    }

    /// Record the outcome of the mutation call.
    pub fn record_apply(&mut self, report: &ApplyReport) {
        self.apply_attempted = true;
        self.apply_ok = Some(report.ok);
    }
}

/// The kill switch → license → verify chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyGate;

impl ApplyGate {
    /// Evaluate the chain for a tick's safety gate decisions.
    ///
    /// `verify` is `None` when no verification pass ran for this plan.
    #[must_use]
    pub fn evaluate(
        decisions: &[GateDecision],
        kill_switch: KillSwitch,
        license: &LicenseVerification,
        verify: Option<&VerifyReport>,
    ) -> ApplyDecision {
        let allowed = decisions.iter().filter(|d| d.allowed).count();
        Self::evaluate_allowed(allowed, kill_switch, license, verify)
    }

    /// Evaluate the chain for `allowed_actions` already-approved changes,
    /// e.g. the items of a stored plan.
    #[must_use]
    pub fn evaluate_allowed(
        allowed_actions: usize,
        kill_switch: KillSwitch,
        license: &LicenseVerification,
        verify: Option<&VerifyReport>,
    ) -> ApplyDecision {
        let verify_ok = verify.is_some_and(|r| r.ok);
        let block_reason = if kill_switch.is_active() {
            Some(BlockReason::KillSwitchActive)
        } else if let Some(reason) = BlockReason::from_license(license.reason) {
            Some(reason)
        } else {
            match verify {
                None => Some(BlockReason::VerifyMissing),
                Some(report) if !report.ok => Some(BlockReason::VerifyFailed),
                Some(_) => None,
            }
        };

        let decision = ApplyDecision {
            kill_switch_active: kill_switch.is_active(),
            license_ok: license.ok,
            license_reason: license.reason,
            verify_ok,
            allowed_actions,
            apply_attempted: false,
            apply_ok: None,
            block_reason,
        };
        match decision.block_reason {
            Some(reason) => info!(blocker = %reason, "apply blocked"),
            None => info!(allowed = decision.allowed_actions, "apply gates passed"),
        }
        decision
    }
}
