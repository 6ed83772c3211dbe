#![no_main]
use libfuzzer_sys::fuzz_target;
use modal_kernel::{Engine, Machine, Value};

fn machine() -> Machine {
    let mut m = Machine::new("f");
    let a = m.add_state("a").unwrap();
    let b = m.add_state("b").unwrap();
    let t0 = m.add_transition(a, b).unwrap();
    m.set_guard(t0, "x > y").unwrap();
    m.set_choice_actions(t0, "out = x + y").unwrap();
    let t1 = m.add_transition(b, a).unwrap();
    m.set_guard(t1, "y >= x").unwrap();
    m.set_commit_actions(t1, "v = v + 1").unwrap();
    let t2 = m.add_transition(b, a).unwrap();
    m.set_guard(t2, "x_isPresent").unwrap();
    m.set_nondeterministic(t1, true).unwrap();
    m.set_nondeterministic(t2, true).unwrap();
    m.add_input("x", 1).unwrap();
    m.add_input("y", 1).unwrap();
    m.add_output("out", 1).unwrap();
    m.add_variable("v", Value::Int(0)).unwrap();
    m.set_initial_state("a");
    m
}

fuzz_target!(|data: &[u8]| {
    let mut engine = Engine::with_seed(machine(), 0);
    if engine.initialize().is_err() {
        return;
    }
    for pair in data.chunks(2) {
        let x = pair[0];
        let y = pair.get(1).copied().unwrap_or(0);
        let _ = if x % 3 == 0 {
            engine.set_input_absent("x", 0)
        } else {
            engine.put_input("x", 0, (x / 3) as i64)
        };
        let _ = if y % 3 == 0 {
            engine.set_input_absent("y", 0)
        } else {
            engine.put_input("y", 0, (y / 3) as i64)
        };
        if engine.prefire().is_err() || engine.fire().is_err() {
            return;
        }
        match engine.postfire() {
            Ok(true) => {}
            _ => return,
        }
    }
});
