//! Properties of transition selection and the two-phase protocol.
//!
//! Machines are generated as a fan of guarded transitions out of one
//! state; the properties relate what the engine chooses and commits to
//! what the guards say about the driven input.

use proptest::prelude::*;

use modal_kernel::{Engine, Machine, OutputState, Policy, Status, TransferPolicy, TransitionId};

/// A machine with transitions `a -> b_i` guarded by `x > k_i`, all
/// nondeterministic so any subset may be enabled at once.
fn fan(thresholds: &[i64]) -> (Machine, Vec<TransitionId>) {
    let mut m = Machine::new("m");
    let a = m.add_state("a").unwrap();
    let mut ids = Vec::with_capacity(thresholds.len());
    for (i, k) in thresholds.iter().enumerate() {
        let b = m.add_state(&format!("b{i}")).unwrap();
        let t = m.add_transition(a, b).unwrap();
        m.set_guard(t, &format!("x > {k}")).unwrap();
        m.set_nondeterministic(t, true).unwrap();
        ids.push(t);
    }
    m.add_input("x", 1).unwrap();
    m.set_initial_state("a");
    (m, ids)
}

fn driven(thresholds: &[i64], value: i64, seed: u64) -> (Engine, Vec<TransitionId>) {
    let (machine, ids) = fan(thresholds);
    let mut engine = Engine::with_seed(machine, seed);
    engine.initialize().unwrap();
    engine.put_input("x", 0, value).unwrap();
    assert!(engine.prefire().unwrap());
    engine.fire().unwrap();
    (engine, ids)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    /// A transition is chosen exactly when some guard holds, and the
    /// chosen one's own guard holds.
    #[test]
    fn chosen_transition_is_enabled(
        thresholds in proptest::collection::vec(-5i64..5, 1..5),
        value in -6i64..6,
        seed in 0u64..32,
    ) {
        let (engine, ids) = driven(&thresholds, value, seed);
        let satisfied: Vec<usize> = thresholds
            .iter()
            .enumerate()
            .filter(|(_, k)| value > **k)
            .map(|(i, _)| i)
            .collect();

        match engine.last_chosen_transition() {
            Some(chosen) => {
                let idx = ids.iter().position(|&t| t == chosen).unwrap();
                prop_assert!(
                    satisfied.contains(&idx),
                    "chose t{idx} but x = {value} fails its guard x > {}",
                    thresholds[idx]
                );
            }
            None => prop_assert!(
                satisfied.is_empty(),
                "nothing chosen with {} guards satisfied",
                satisfied.len()
            ),
        }
        prop_assert!(!engine.found_unknown());
    }

    /// Re-firing with refreshed inputs keeps the same choice, however
    /// the first one was tie-broken.
    #[test]
    fn refire_repeats_the_choice(
        thresholds in proptest::collection::vec(-5i64..5, 1..5),
        value in -6i64..6,
        seed in 0u64..32,
    ) {
        let (mut engine, _ids) = driven(&thresholds, value, seed);
        let first = engine.last_chosen_transition();
        for _ in 0..3 {
            engine.put_input("x", 0, value).unwrap();
            engine.fire().unwrap();
            prop_assert_eq!(engine.last_chosen_transition(), first);
        }
    }

    /// Postfire lands in the chosen transition's destination and
    /// resets every channel to unknown for the next iteration.
    #[test]
    fn commit_follows_the_choice(
        thresholds in proptest::collection::vec(-5i64..5, 1..5),
        value in -6i64..6,
        seed in 0u64..32,
    ) {
        let (mut engine, ids) = driven(&thresholds, value, seed);
        let chosen = engine.last_chosen_transition();
        prop_assert!(engine.postfire().unwrap());

        match chosen {
            Some(t) => {
                let idx = ids.iter().position(|&id| id == t).unwrap();
                let expected = Some(format!("b{idx}"));
                prop_assert_eq!(engine.current_state_name(), expected.as_deref());
            }
            None => prop_assert_eq!(engine.current_state_name(), Some("a")),
        }

        let input = engine.input_handle("x", 0).unwrap();
        prop_assert_eq!(input.borrow().status(), Status::Unknown);
    }

    /// With a single queued token the transfer policy is irrelevant to
    /// selection.
    #[test]
    fn transfer_policies_agree_on_single_token(
        thresholds in proptest::collection::vec(-5i64..5, 1..5),
        value in -6i64..6,
        seed in 0u64..32,
    ) {
        let (one, _) = driven(&thresholds, value, seed);

        let (machine, _) = fan(&thresholds);
        let mut drain = Engine::with_seed(machine, seed);
        drain.set_policy(Policy {
            transfer: TransferPolicy::DrainAll,
            ..Policy::default()
        });
        drain.initialize().unwrap();
        drain.put_input("x", 0, value).unwrap();
        assert!(drain.prefire().unwrap());
        drain.fire().unwrap();

        prop_assert_eq!(
            one.last_chosen_transition(),
            drain.last_chosen_transition()
        );
    }

    /// Every output port settles once all inputs are known, whatever
    /// the machine writes.
    #[test]
    fn decided_fire_leaves_no_unknown_outputs(
        thresholds in proptest::collection::vec(-5i64..5, 1..4),
        value in -6i64..6,
        seed in 0u64..32,
    ) {
        let (mut machine, _) = fan(&thresholds);
        machine.add_output("out", 1).unwrap();
        let mut engine = Engine::with_seed(machine, seed);
        engine.initialize().unwrap();
        engine.put_input("x", 0, value).unwrap();
        assert!(engine.prefire().unwrap());
        engine.fire().unwrap();

        let state = engine.output_state("out", 0).unwrap();
        prop_assert!(state != OutputState::Unknown, "output left unknown: {state:?}");
    }
}
