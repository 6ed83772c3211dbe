//! Three-valued expression evaluation.
//!
//! Guards run while some channel statuses may still be undecided, so
//! evaluation produces an [`Outcome`] rather than a plain value:
//! `Defined` when every identifier the expression actually needed had
//! a value, `Unknown` when one had not settled yet, `Absent` when one
//! read a channel that is known to carry nothing. Unknown dominates
//! absent. Short-circuiting is monotonic: once one side of `&&` or
//! `||` decides the result, undecided identifiers on the other side
//! cannot change it.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use modal_syntax::{BinOp, Expr, ExprKind, UnaryOp};
use thiserror::Error;

use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("undefined identifier `{0}`")]
    UndefinedIdentifier(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("index out of bounds: index {index}, length {length}")]
    IndexOutOfBounds { index: i64, length: usize },

    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("`{name}` takes {expected} argument(s), got {actual}")]
    WrongArity {
        name: String,
        expected: usize,
        actual: usize,
    },
}

pub type EvalResult<T> = Result<T, EvalError>;

/// Result of evaluating an expression against a scope where some
/// identifiers may not have settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Defined(Value),
    Unknown,
    Absent,
}

impl Outcome {
    pub fn defined(self) -> Option<Value> {
        match self {
            Outcome::Defined(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, Outcome::Defined(_))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Outcome::Unknown)
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Outcome::Absent)
    }
}

impl From<Value> for Outcome {
    fn from(v: Value) -> Outcome {
        Outcome::Defined(v)
    }
}

/// Name resolution for evaluation. `None` means the identifier is not
/// in scope at all, which is an evaluation error; a scope that knows
/// the name but not yet its value answers `Some(Outcome::Unknown)`.
pub trait Scope {
    fn resolve(&self, name: &str) -> Option<Outcome>;
}

impl Scope for BTreeMap<String, Outcome> {
    fn resolve(&self, name: &str) -> Option<Outcome> {
        self.get(name).cloned()
    }
}

/// A scope with nothing in it, for closed expressions.
pub struct EmptyScope;

impl Scope for EmptyScope {
    fn resolve(&self, _name: &str) -> Option<Outcome> {
        None
    }
}

pub fn eval(expr: &Expr, scope: &dyn Scope) -> EvalResult<Outcome> {
    match &expr.kind {
        ExprKind::Bool(b) => Ok(Value::Bool(*b).into()),
        ExprKind::Int(n) => Ok(Value::Int(*n).into()),
        ExprKind::Float(x) => Ok(Value::Float(*x).into()),
        ExprKind::Str(s) => Ok(Value::string(s.as_str()).into()),
        ExprKind::Ident(name) => scope
            .resolve(name)
            .ok_or_else(|| EvalError::UndefinedIdentifier(name.clone())),
        ExprKind::Unary { op, operand } => match eval(operand, scope)? {
            Outcome::Defined(v) => apply_unary(*op, v).map(Outcome::Defined),
            undecided => Ok(undecided),
        },
        ExprKind::Binary { op, left, right } => match op {
            BinOp::And => eval_and(left, right, scope),
            BinOp::Or => eval_or(left, right, scope),
            _ => match (eval(left, scope)?, eval(right, scope)?) {
                (Outcome::Defined(a), Outcome::Defined(b)) => {
                    apply_binary(*op, a, b).map(Outcome::Defined)
                }
                (Outcome::Unknown, _) | (_, Outcome::Unknown) => Ok(Outcome::Unknown),
                _ => Ok(Outcome::Absent),
            },
        },
        ExprKind::Ternary {
            cond,
            then_branch,
            else_branch,
        } => match eval(cond, scope)? {
            Outcome::Defined(Value::Bool(true)) => eval(then_branch, scope),
            Outcome::Defined(Value::Bool(false)) => eval(else_branch, scope),
            Outcome::Defined(v) => Err(type_mismatch("Bool", &v)),
            undecided => Ok(undecided),
        },
        ExprKind::Call { name, args } => eval_call(name, args, scope),
        ExprKind::Index { base, index } => match (eval(base, scope)?, eval(index, scope)?) {
            (Outcome::Defined(base), Outcome::Defined(index)) => {
                let items = base
                    .as_array()
                    .ok_or_else(|| type_mismatch("Array", &base))?;
                let i = index
                    .as_int()
                    .ok_or_else(|| type_mismatch("Int", &index))?;
                if i < 0 || i as usize >= items.len() {
                    return Err(EvalError::IndexOutOfBounds {
                        index: i,
                        length: items.len(),
                    });
                }
                Ok(items[i as usize].clone().into())
            }
            (Outcome::Unknown, _) | (_, Outcome::Unknown) => Ok(Outcome::Unknown),
            _ => Ok(Outcome::Absent),
        },
    }
}

fn eval_and(left: &Expr, right: &Expr, scope: &dyn Scope) -> EvalResult<Outcome> {
    match eval(left, scope)? {
        Outcome::Defined(Value::Bool(false)) => Ok(Value::Bool(false).into()),
        Outcome::Defined(Value::Bool(true)) => expect_bool(eval(right, scope)?),
        Outcome::Defined(v) => Err(type_mismatch("Bool", &v)),
        undecided => match eval(right, scope)? {
            // A known-false side decides the conjunction even while
            // the other side is undecided.
            Outcome::Defined(Value::Bool(false)) => Ok(Value::Bool(false).into()),
            Outcome::Defined(Value::Bool(true)) => Ok(undecided),
            Outcome::Defined(v) => Err(type_mismatch("Bool", &v)),
            other => Ok(join_undecided(undecided, other)),
        },
    }
}

fn eval_or(left: &Expr, right: &Expr, scope: &dyn Scope) -> EvalResult<Outcome> {
    match eval(left, scope)? {
        Outcome::Defined(Value::Bool(true)) => Ok(Value::Bool(true).into()),
        Outcome::Defined(Value::Bool(false)) => expect_bool(eval(right, scope)?),
        Outcome::Defined(v) => Err(type_mismatch("Bool", &v)),
        undecided => match eval(right, scope)? {
            Outcome::Defined(Value::Bool(true)) => Ok(Value::Bool(true).into()),
            Outcome::Defined(Value::Bool(false)) => Ok(undecided),
            Outcome::Defined(v) => Err(type_mismatch("Bool", &v)),
            other => Ok(join_undecided(undecided, other)),
        },
    }
}

fn expect_bool(outcome: Outcome) -> EvalResult<Outcome> {
    match outcome {
        Outcome::Defined(Value::Bool(b)) => Ok(Value::Bool(b).into()),
        Outcome::Defined(v) => Err(type_mismatch("Bool", &v)),
        undecided => Ok(undecided),
    }
}

/// Combine two non-defined outcomes. Unknown dominates absent.
fn join_undecided(a: Outcome, b: Outcome) -> Outcome {
    if a.is_unknown() || b.is_unknown() {
        Outcome::Unknown
    } else {
        Outcome::Absent
    }
}

fn apply_unary(op: UnaryOp, v: Value) -> EvalResult<Value> {
    match op {
        UnaryOp::Not => match v {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(type_mismatch("Bool", &other)),
        },
        UnaryOp::Neg => match v {
            Value::Int(n) => Ok(Value::Int(-n)),
            Value::Float(x) => Ok(Value::Float(-x)),
            other => Err(type_mismatch("Int or Float", &other)),
        },
    }
}

fn apply_binary(op: BinOp, a: Value, b: Value) -> EvalResult<Value> {
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => arith_binop(op, a, b),
        BinOp::Eq => Ok(Value::Bool(values_equal(&a, &b)?)),
        BinOp::Neq => Ok(Value::Bool(!values_equal(&a, &b)?)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => ordering_binop(op, &a, &b),
        // Short-circuit operators never reach here; eval handles them.
        BinOp::And | BinOp::Or => unreachable!("short-circuit operator in strict path"),
    }
}

fn arith_binop(op: BinOp, a: Value, b: Value) -> EvalResult<Value> {
    if let (Value::Int(x), Value::Int(y)) = (&a, &b) {
        return int_binop(op, *x, *y);
    }
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => Ok(Value::Float(match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => x / y,
            BinOp::Mod => x % y,
            _ => unreachable!("non-arithmetic operator"),
        })),
        _ => {
            let offender = if a.is_numeric() { &b } else { &a };
            Err(type_mismatch("Int or Float", offender))
        }
    }
}

fn int_binop(op: BinOp, x: i64, y: i64) -> EvalResult<Value> {
    let n = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0 {
                return Err(EvalError::DivisionByZero);
            }
            x / y
        }
        BinOp::Mod => {
            if y == 0 {
                return Err(EvalError::DivisionByZero);
            }
            x % y
        }
        _ => unreachable!("non-arithmetic operator"),
    };
    Ok(Value::Int(n))
}

fn values_equal(a: &Value, b: &Value) -> EvalResult<bool> {
    if a.is_numeric() && b.is_numeric() {
        if let (Value::Int(x), Value::Int(y)) = (a, b) {
            return Ok(x == y);
        }
        return Ok(a.as_number() == b.as_number());
    }
    match (a, b) {
        (Value::Bool(_), Value::Bool(_))
        | (Value::Str(_), Value::Str(_))
        | (Value::Array(_), Value::Array(_)) => Ok(a == b),
        _ => Err(type_mismatch(a.type_name(), b)),
    }
}

fn ordering_binop(op: BinOp, a: &Value, b: &Value) -> EvalResult<Value> {
    let ord = match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.partial_cmp(y),
        (Value::Str(x), Value::Str(y)) => x.partial_cmp(y),
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => {
                let offender = if a.is_numeric() || a.as_str().is_some() {
                    b
                } else {
                    a
                };
                return Err(type_mismatch("Int, Float or String", offender));
            }
        },
    };
    // NaN makes every comparison false.
    let decided = match (op, ord) {
        (_, None) => false,
        (BinOp::Lt, Some(ord)) => ord == Ordering::Less,
        (BinOp::Le, Some(ord)) => ord != Ordering::Greater,
        (BinOp::Gt, Some(ord)) => ord == Ordering::Greater,
        (BinOp::Ge, Some(ord)) => ord != Ordering::Less,
        _ => unreachable!("non-ordering operator"),
    };
    Ok(Value::Bool(decided))
}

enum Builtin {
    Abs,
    Len,
    Min,
    Max,
}

fn builtin(name: &str) -> Option<(Builtin, usize)> {
    match name {
        "abs" => Some((Builtin::Abs, 1)),
        "len" => Some((Builtin::Len, 1)),
        "min" => Some((Builtin::Min, 2)),
        "max" => Some((Builtin::Max, 2)),
        _ => None,
    }
}

fn eval_call(name: &str, args: &[Expr], scope: &dyn Scope) -> EvalResult<Outcome> {
    let Some((func, arity)) = builtin(name) else {
        return Err(EvalError::UnknownFunction(name.to_string()));
    };
    if args.len() != arity {
        return Err(EvalError::WrongArity {
            name: name.to_string(),
            expected: arity,
            actual: args.len(),
        });
    }
    let mut values = Vec::with_capacity(args.len());
    let mut undecided: Option<Outcome> = None;
    for arg in args {
        match eval(arg, scope)? {
            Outcome::Defined(v) => values.push(v),
            other => {
                undecided = Some(match undecided.take() {
                    Some(prev) => join_undecided(prev, other),
                    None => other,
                });
            }
        }
    }
    if let Some(outcome) = undecided {
        return Ok(outcome);
    }
    apply_builtin(func, &values).map(Outcome::Defined)
}

fn apply_builtin(func: Builtin, values: &[Value]) -> EvalResult<Value> {
    match func {
        Builtin::Abs => match &values[0] {
            Value::Int(n) => Ok(Value::Int(n.abs())),
            Value::Float(x) => Ok(Value::Float(x.abs())),
            v => Err(type_mismatch("Int or Float", v)),
        },
        Builtin::Len => match &values[0] {
            Value::Array(items) => Ok(Value::Int(items.len() as i64)),
            Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
            v => Err(type_mismatch("Array or String", v)),
        },
        Builtin::Min | Builtin::Max => {
            let take_min = matches!(func, Builtin::Min);
            let (a, b) = (&values[0], &values[1]);
            if let (Value::Int(x), Value::Int(y)) = (a, b) {
                let n = if take_min { *x.min(y) } else { *x.max(y) };
                return Ok(Value::Int(n));
            }
            match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => {
                    let v = if take_min { x.min(y) } else { x.max(y) };
                    Ok(Value::Float(v))
                }
                _ => {
                    let offender = if a.is_numeric() { b } else { a };
                    Err(type_mismatch("Int or Float", offender))
                }
            }
        }
    }
}

fn type_mismatch(expected: &str, actual: &Value) -> EvalError {
    EvalError::TypeMismatch {
        expected: expected.to_string(),
        actual: actual.type_name().to_string(),
    }
}
