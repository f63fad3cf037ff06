use mk_catalog::ChordCatalog;
use mk_policy::{
    BatchInvariant, ChordPolicy, KnobState, Policy, PolicyConfig, PolicyInput, PolicyKind,
    PolicyStrategy,
};
use mk_signals::{Mode, SignalSet};
use proptest::prelude::*;

fn signals(drift: bool, burst: bool, straggler: bool, gpu: bool) -> SignalSet {
    let mut s = SignalSet::stable_with_note("synthetic");
    s.drift = drift;
    s.burst = burst;
    s.straggler = straggler;
    s.gpu_saturated = gpu;
    s.incident = drift || burst || straggler || gpu;
    s.stable = !s.incident;
    s
}

fn any_mode() -> impl Strategy<Value = Mode> {
    prop_oneof![
        Just(Mode::Normal),
        Just(Mode::Drift),
        Just(Mode::Burst),
        Just(Mode::Straggler),
        Just(Mode::Recover),
    ]
}

#[test]
fn test_every_chord_action_is_catalog_backed() {
    let catalog = ChordCatalog::builtin_v1().unwrap();
    let knobs = KnobState::default();
    let policy = Policy::default();
    for mode in Mode::ALL {
        for flags in 0u8..16 {
            let s = signals(flags & 1 != 0, flags & 2 != 0, flags & 4 != 0, flags & 8 != 0);
            let input = PolicyInput { mode, signals: &s, catalog: &catalog, knobs: &knobs };
            for action in policy.propose(&input) {
                let id = action.chord_id.as_deref().unwrap();
                let chord = catalog.get(id).unwrap();
                assert!(chord.touches(&action.knob), "{id} does not declare {}", action.knob);
            }
        }
    }
}

#[test]
fn test_scalar_policy_is_selectable() {
    let catalog = ChordCatalog::builtin_v1().unwrap();
    let knobs = KnobState::default();
    let s = signals(false, false, true, false);
    let input = PolicyInput { mode: Mode::Straggler, signals: &s, catalog: &catalog, knobs: &knobs };
    let policy = Policy::from_config(&PolicyConfig::default().with_kind(PolicyKind::Scalar)).unwrap();
    let actions = policy.propose(&input);
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].target, 4);
    assert!(!catalog.contains(actions[0].chord_id.as_deref().unwrap()));
}

proptest! {
    #[test]
    fn prop_batch_pairs_stay_in_tolerance(
        accum in 1i64..=64,
        micro in 1i64..=256,
        tolerance in 0.0f64..0.2,
        gpu in any::<bool>(),
    ) {
        let catalog = ChordCatalog::builtin_v1().unwrap();
        let knobs = KnobState::default()
            .with_value("grad_accum_steps", accum).unwrap()
            .with_value("microbatch_size", micro).unwrap();
        let s = signals(!gpu, false, false, gpu);
        let mode = if gpu { Mode::Burst } else { Mode::Drift };
        let input = PolicyInput { mode, signals: &s, catalog: &catalog, knobs: &knobs };
        let invariant = BatchInvariant::new(tolerance).unwrap();
        let actions = ChordPolicy::new(invariant).propose(&input);

        let new_accum = actions.iter().find(|a| a.knob == "grad_accum_steps").map(|a| a.target);
        let new_micro = actions.iter().find(|a| a.knob == "microbatch_size").map(|a| a.target);
        prop_assert_eq!(new_accum.is_some(), new_micro.is_some());
        if let (Some(a), Some(m)) = (new_accum, new_micro) {
            prop_assert!(a > accum);
            prop_assert!(m < micro);
            prop_assert!(invariant.holds(accum * micro, a * m));
        }
    }

    #[test]
    fn prop_proposals_are_deterministic(
        mode in any_mode(),
        flags in any::<(bool, bool, bool, bool)>(),
        workers in 1i64..=16,
        scalar in any::<bool>(),
    ) {
        let catalog = ChordCatalog::builtin_v1().unwrap();
        let knobs = KnobState::default().with_value("dataloader_num_workers", workers).unwrap();
        let s = signals(flags.0, flags.1, flags.2, flags.3);
        let input = PolicyInput { mode, signals: &s, catalog: &catalog, knobs: &knobs };
        let kind = if scalar { PolicyKind::Scalar } else { PolicyKind::Chord };
        let policy = Policy::from_config(&PolicyConfig::default().with_kind(kind)).unwrap();
        prop_assert_eq!(policy.propose(&input), policy.propose(&input));
    }

    #[test]
    fn prop_targets_respect_knob_bounds(
        mode in any_mode(),
        flags in any::<(bool, bool, bool, bool)>(),
    ) {
        let catalog = ChordCatalog::builtin_v1().unwrap();
        let knobs = KnobState::default();
        let s = signals(flags.0, flags.1, flags.2, flags.3);
        let input = PolicyInput { mode, signals: &s, catalog: &catalog, knobs: &knobs };
        for action in Policy::default().propose(&input) {
            let spec = knobs.spec(&action.knob).unwrap();
            prop_assert!(action.target >= spec.min && action.target <= spec.max);
        }
    }
}
