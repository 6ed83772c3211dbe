//! AST definitions for guard expressions and action scripts.

use std::collections::BTreeSet;

use crate::token::Span;

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `cond ? a : b`
    Ternary {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    /// Builtin function application, e.g. `min(a, b)`.
    Call {
        name: String,
        args: Vec<Expr>,
    },
    /// Array element access, e.g. `xArray[0]`.
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

impl UnaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Not => "!",
            UnaryOp::Neg => "-",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinOp {
    /// Binding strength; higher binds tighter. All binary operators
    /// are left-associative.
    pub fn precedence(&self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::Eq | BinOp::Neq => 3,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => 4,
            BinOp::Add | BinOp::Sub => 5,
            BinOp::Mul | BinOp::Div | BinOp::Mod => 6,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Or => "||",
            BinOp::And => "&&",
            BinOp::Eq => "==",
            BinOp::Neq => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
        }
    }
}

/// One `destination = expression` clause of an action script.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionClause {
    pub dest: Destination,
    pub expr: Expr,
    pub span: Span,
}

/// The left-hand side of an action clause. A bare name refers to an
/// output port or a variable; `name(2)` picks an explicit output
/// channel; `sub.name` refers to a variable inside the refinement
/// bound as `sub`.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub qualifier: Option<String>,
    pub name: String,
    pub channel: Option<usize>,
    pub span: Span,
}

impl Destination {
    /// The destination as written, for diagnostics.
    pub fn display_name(&self) -> String {
        let mut out = String::new();
        if let Some(q) = &self.qualifier {
            out.push_str(q);
            out.push('.');
        }
        out.push_str(&self.name);
        if let Some(ch) = self.channel {
            out.push('(');
            out.push_str(&ch.to_string());
            out.push(')');
        }
        out
    }
}

/// Collect every identifier an expression reads. Builtin function
/// names are not identifiers.
pub fn free_variables(expr: &Expr) -> BTreeSet<String> {
    let mut vars = BTreeSet::new();
    collect_free_variables(expr, &mut vars);
    vars
}

fn collect_free_variables(expr: &Expr, vars: &mut BTreeSet<String>) {
    match &expr.kind {
        ExprKind::Bool(_) | ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Str(_) => {}
        ExprKind::Ident(name) => {
            vars.insert(name.clone());
        }
        ExprKind::Unary { operand, .. } => collect_free_variables(operand, vars),
        ExprKind::Binary { left, right, .. } => {
            collect_free_variables(left, vars);
            collect_free_variables(right, vars);
        }
        ExprKind::Ternary {
            cond,
            then_branch,
            else_branch,
        } => {
            collect_free_variables(cond, vars);
            collect_free_variables(then_branch, vars);
            collect_free_variables(else_branch, vars);
        }
        ExprKind::Call { args, .. } => {
            for arg in args {
                collect_free_variables(arg, vars);
            }
        }
        ExprKind::Index { base, index } => {
            collect_free_variables(base, vars);
            collect_free_variables(index, vars);
        }
    }
}
