//! Expression evaluation for modal state machines.

pub mod eval;
pub mod value;

pub use eval::{eval, EmptyScope, EvalError, EvalResult, Outcome, Scope};
pub use value::Value;
