use std::sync::Arc;

use mk_catalog::ChordCatalog;
use mk_kernel::k8s::{VerifyReport, VERIFY_SCHEMA_VERSION};
use mk_kernel::{
    ApplyContext, ApplyGate, BlockReason, CooldownStore, GateConfig, GateDecision, KillSwitch, LicenseConfig,
    PlanTarget, SafetyGate,
};
use mk_license::{LicenseReason, LicenseVerification};
use mk_policy::{KnobState, ProposedAction};
use mk_test_utils::{signed_license, signing_key, write_license_files, ScriptedCluster};
use proptest::prelude::*;

fn license(reason: LicenseReason) -> LicenseVerification {
    let mut verification = LicenseVerification::missing();
    verification.reason = reason;
    verification.ok = reason == LicenseReason::Ok;
    verification
}

fn verify_report(ok: bool) -> VerifyReport {
    VerifyReport {
        schema_version: VERIFY_SCHEMA_VERSION.to_string(),
        ok,
        kubectl_present: true,
        objects: Vec::new(),
        blocker: None,
    }
}

fn allowed_decision() -> GateDecision {
    GateDecision {
        action: ProposedAction::new("dataloader_num_workers", 6, "straggler_detected", "INPUT-STRAGGLER"),
        allowed: true,
        reason_code: None,
    }
}

fn license_reason() -> impl Strategy<Value = LicenseReason> {
    prop_oneof![
        Just(LicenseReason::Ok),
        Just(LicenseReason::LicenseMissing),
        Just(LicenseReason::LicenseInvalid),
        Just(LicenseReason::LicenseExpired),
        Just(LicenseReason::EntitlementMissing),
        Just(LicenseReason::BindingMismatch),
    ]
}

proptest! {
    #[test]
    fn prop_gate_precedence(
        kill in any::<bool>(),
        reason in license_reason(),
        verify in prop::option::of(any::<bool>()),
    ) {
        let report = verify.map(verify_report);
        let decision = ApplyGate::evaluate(
            &[allowed_decision()],
            KillSwitch::new(kill),
            &license(reason),
            report.as_ref(),
        );

        let expected = if kill {
            Some(BlockReason::KillSwitchActive)
        } else if reason != LicenseReason::Ok {
            BlockReason::from_license(reason)
        } else {
            match verify {
                None => Some(BlockReason::VerifyMissing),
                Some(false) => Some(BlockReason::VerifyFailed),
                Some(true) => None,
            }
        };
        prop_assert_eq!(decision.block_reason, expected);
        prop_assert_eq!(decision.permits_apply(), expected.is_none());
        prop_assert!(!decision.apply_attempted);
    }

    #[test]
    fn prop_one_decision_per_action(
        picks in prop::collection::vec((0usize..4, 0usize..4, -10i64..200), 0..12),
        approve in any::<bool>(),
        max_delta in 0i64..8,
    ) {
        let knobs = ["grad_accum_steps", "microbatch_size", "timeout_ms", "dataloader_num_workers"];
        let chords = [Some("DRIFT-RETUNE"), Some("TIMEOUT-GUARD"), Some("NOT-A-CHORD"), None];
        let actions: Vec<ProposedAction> = picks
            .iter()
            .map(|&(k, c, target)| ProposedAction {
                knob: knobs[k].to_string(),
                target,
                reason: "test".to_string(),
                chord_id: chords[c].map(str::to_string),
            })
            .collect();

        let catalog = ChordCatalog::builtin_v1().unwrap();
        let config = GateConfig::default()
            .with_approve_advanced(approve)
            .with_max_delta_per_step(max_delta);
        let outcome = SafetyGate::new(&catalog, config).evaluate(
            &actions,
            &KnobState::default(),
            CooldownStore::new(),
            1_000,
        );

        prop_assert_eq!(outcome.decisions.len(), actions.len());
        for (decision, action) in outcome.decisions.iter().zip(&actions) {
            prop_assert_eq!(&decision.action, action);
            prop_assert_eq!(decision.allowed, decision.reason_code.is_none());
            if action.chord_id.as_deref() != Some("DRIFT-RETUNE") && action.chord_id.as_deref() != Some("TIMEOUT-GUARD") {
                prop_assert_eq!(decision.reason_code, Some(BlockReason::UnknownChord));
            }
        }
    }
}

#[test]
fn test_kill_switch_beats_valid_license_and_verify() {
    let decision = ApplyGate::evaluate(
        &[allowed_decision()],
        KillSwitch::new(true),
        &license(LicenseReason::Ok),
        Some(&verify_report(true)),
    );
    assert_eq!(decision.block_reason, Some(BlockReason::KillSwitchActive));
    assert!(decision.kill_switch_active);
    assert!(decision.license_ok);
    assert!(decision.verify_ok);
}

#[tokio::test]
async fn test_kill_switch_makes_no_mutation_call() {
    let signer = signing_key(3);
    let files = write_license_files(&signed_license(&signer, "k1"), &signer, "k1");
    let config = LicenseConfig::default()
        .with_license_path(&files.license)
        .with_public_keys_path(&files.keys);
    let cluster = Arc::new(ScriptedCluster::new());
    let context = ApplyContext::new(
        cluster.clone(),
        config.build_verifier().unwrap(),
        config,
        PlanTarget::new("default", "trainer"),
    )
    .with_kill_switch(KillSwitch::new(true));

    let outcome = context.execute(&[allowed_decision()]).await.unwrap();
    assert!(outcome.license.ok);
    assert_eq!(outcome.decision.block_reason, Some(BlockReason::KillSwitchActive));
    assert!(!outcome.decision.apply_attempted);
    assert!(outcome.report.is_none());
    assert_eq!(cluster.mutation_calls(), 0);
}

#[tokio::test]
async fn test_unknown_kid_blocks_as_license_invalid() {
    let signer = signing_key(4);
    // Signed by a trusted key, but naming a kid the keyring does not hold.
    let files = write_license_files(&signed_license(&signer, "rotated-away"), &signer, "k1");
    let config = LicenseConfig::default()
        .with_license_path(&files.license)
        .with_public_keys_path(&files.keys);
    let cluster = Arc::new(ScriptedCluster::new());
    let context = ApplyContext::new(
        cluster.clone(),
        config.build_verifier().unwrap(),
        config,
        PlanTarget::new("default", "trainer"),
    )
    .with_kill_switch(KillSwitch::new(false));

    let outcome = context.execute(&[allowed_decision()]).await.unwrap();
    assert_eq!(outcome.license.reason, LicenseReason::LicenseInvalid);
    assert_eq!(outcome.decision.block_reason, Some(BlockReason::LicenseInvalid));
    assert!(outcome.verify.is_none());
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn test_all_gates_pass_and_apply_runs() {
    let signer = signing_key(5);
    let files = write_license_files(&signed_license(&signer, "k1"), &signer, "k1");
    let config = LicenseConfig::default()
        .with_license_path(&files.license)
        .with_public_keys_path(&files.keys);
    let cluster = Arc::new(ScriptedCluster::new());
    let context = ApplyContext::new(
        cluster.clone(),
        config.build_verifier().unwrap(),
        config,
        PlanTarget::new("default", "trainer"),
    )
    .with_kill_switch(KillSwitch::new(false));

    let outcome = context.execute(&[allowed_decision()]).await.unwrap();
    assert_eq!(outcome.decision.block_reason, None);
    assert!(outcome.verify.as_ref().is_some_and(|v| v.ok));
    assert!(outcome.applied());
    assert_eq!(cluster.dry_run_calls(), 1);
    assert_eq!(cluster.mutation_calls(), 1);
}

#[tokio::test]
async fn test_nothing_allowed_means_no_mutation() {
    let signer = signing_key(6);
    let files = write_license_files(&signed_license(&signer, "k1"), &signer, "k1");
    let config = LicenseConfig::default()
        .with_license_path(&files.license)
        .with_public_keys_path(&files.keys);
    let cluster = Arc::new(ScriptedCluster::new());
    let context = ApplyContext::new(
        cluster.clone(),
        config.build_verifier().unwrap(),
        config,
        PlanTarget::new("default", "trainer"),
    )
    .with_kill_switch(KillSwitch::new(false));

    let mut blocked = allowed_decision();
    blocked.allowed = false;
    blocked.reason_code = Some(BlockReason::CooldownActive);
    let outcome = context.execute(&[blocked]).await.unwrap();
    assert!(outcome.plan.is_empty());
    assert_eq!(outcome.decision.allowed_actions, 0);
    assert!(!outcome.decision.permits_apply());
    assert_eq!(cluster.mutation_calls(), 0);
}
