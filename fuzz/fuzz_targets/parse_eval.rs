#![no_main]
use libfuzzer_sys::fuzz_target;
use modal_eval::{eval, EmptyScope};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(expr) = modal_syntax::parse_expression(s) {
            let _ = eval(&expr, &EmptyScope);
        }
        let _ = modal_syntax::parse_actions(s);
    }
});
