use mk_signals::{
    allowed_transitions, validate_transition, Mode, ModeConfig, ModeStateMachine, SignalSet,
};
use proptest::prelude::*;

fn window(flags: (bool, bool, bool, bool)) -> SignalSet {
    let (drift, burst, straggler, gpu_saturated) = flags;
    let mut s = SignalSet::stable_with_note("synthetic");
    s.drift = drift;
    s.burst = burst;
    s.straggler = straggler;
    s.gpu_saturated = gpu_saturated;
    s.incident = drift || burst || straggler || gpu_saturated;
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
fn test_incident_modes_exit_through_recover() {
    for mode in [Mode::Drift, Mode::Burst, Mode::Straggler] {
        let allowed = allowed_transitions(mode);
        assert!(allowed.contains(&Mode::Recover));
        assert!(!allowed.contains(&Mode::Normal));
    }
}

#[test]
fn test_ten_stable_windows_stay_normal() {
    let mut sm = ModeStateMachine::default();
    for _ in 0..10 {
        let t = sm.observe(&window((false, false, false, false)));
        assert!(!t.switched);
    }
    assert_eq!(sm.mode(), Mode::Normal);
}

#[test]
fn test_alternating_noise_never_confirms() {
    let mut sm = ModeStateMachine::new(ModeConfig::default().with_confirm_windows(3));
    for i in 0..20 {
        let flags = if i % 2 == 0 {
            (false, true, false, false)
        } else {
            (false, false, true, false)
        };
        sm.observe(&window(flags));
    }
    assert_eq!(sm.mode(), Mode::Normal);
}

proptest! {
    #[test]
    fn prop_validate_matches_table(from in any_mode(), to in any_mode()) {
        let ok = validate_transition(from, to).is_ok();
        prop_assert_eq!(ok, allowed_transitions(from).contains(&to));
    }

    #[test]
    fn prop_every_switch_is_a_legal_edge(
        windows in proptest::collection::vec(any::<(bool, bool, bool, bool)>(), 0..60),
        confirm in 1u32..4,
        recover in 1u32..4,
    ) {
        let mut sm = ModeStateMachine::new(
            ModeConfig::default().with_confirm_windows(confirm).with_recover_windows(recover),
        );
        for flags in windows {
            let t = sm.observe(&window(flags));
            if t.switched {
                prop_assert!(validate_transition(t.from, t.to).is_ok());
                prop_assert!(t.confirmations >= 1);
            } else {
                prop_assert_eq!(t.from, t.to);
            }
        }
    }

    #[test]
    fn prop_fewer_than_confirm_windows_never_switch(
        flags in any::<(bool, bool, bool, bool)>(),
        confirm in 2u32..6,
    ) {
        let mut sm = ModeStateMachine::new(ModeConfig::default().with_confirm_windows(confirm));
        for _ in 0..(confirm - 1) {
            sm.observe(&window(flags));
        }
        prop_assert_eq!(sm.mode(), Mode::Normal);
    }
}
