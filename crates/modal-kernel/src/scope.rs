//! Name resolution for guard and action evaluation.
//!
//! Each input channel projects shadow identifiers into scope: for a
//! port `x` and channel `c`, `x_c` is the channel's value,
//! `x_c_isPresent` its presence, and `x_cArray` the tokens consumed
//! this firing, most recent first. Channel 0 also answers to the
//! unsuffixed aliases `x`, `x_isPresent` and `xArray`. The engine
//! refreshes shadow entries from the channels when it reads inputs;
//! value entries for absent or unknown channels are never left stale.
//!
//! Resolution order is shadow entries, then the `errorMessage`
//! binding, then machine variables. A port-shaped identifier that was
//! never read resolves unknown.

use std::collections::BTreeMap;

use modal_eval::{Outcome, Scope, Value};
use tracing::trace;

use crate::graph::{InputPortId, Machine};

/// Binding available to error transition guards while a refinement
/// error is latched.
pub(crate) const ERROR_MESSAGE: &str = "errorMessage";

pub fn value_name(port: &str, channel: usize) -> String {
    format!("{port}_{channel}")
}

pub fn presence_name(port: &str, channel: usize) -> String {
    format!("{port}_{channel}_isPresent")
}

pub fn array_name(port: &str, channel: usize) -> String {
    format!("{port}_{channel}Array")
}

/// What a port-shaped identifier refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Value,
    Presence,
    Array,
}

#[derive(Debug, Clone, Copy)]
pub struct PortRef {
    pub port: InputPortId,
    pub channel: usize,
    pub kind: RefKind,
}

/// Identifier-to-port table, rebuilt when port structure changes.
#[derive(Debug, Default)]
pub struct IdentifierTable {
    version: u64,
    map: BTreeMap<String, PortRef>,
}

impl IdentifierTable {
    fn insert(&mut self, name: String, port: InputPortId, channel: usize, kind: RefKind) {
        self.map.insert(name, PortRef { port, channel, kind });
    }

    pub fn ensure(&mut self, machine: &Machine) {
        if self.version == machine.ports_version() {
            return;
        }
        self.map.clear();
        for (id, port) in machine.inputs() {
            for channel in 0..port.width {
                self.insert(value_name(&port.name, channel), id, channel, RefKind::Value);
                self.insert(
                    presence_name(&port.name, channel),
                    id,
                    channel,
                    RefKind::Presence,
                );
                self.insert(array_name(&port.name, channel), id, channel, RefKind::Array);
            }
            if port.width > 0 {
                self.insert(port.name.clone(), id, 0, RefKind::Value);
                self.insert(format!("{}_isPresent", port.name), id, 0, RefKind::Presence);
                self.insert(format!("{}Array", port.name), id, 0, RefKind::Array);
            }
        }
        self.version = machine.ports_version();
        trace!(identifiers = self.map.len(), "rebuilt identifier table");
    }

    pub fn lookup(&self, name: &str) -> Option<PortRef> {
        self.map.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, PortRef)> {
        self.map.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// A machine variable: defined, or explicitly marked unknown by an
/// action whose expression had not settled.
#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    Defined(Value),
    Unknown,
}

/// Runtime bindings owned by the engine.
#[derive(Debug, Default)]
pub struct MachineScope {
    pub(crate) shadow: BTreeMap<String, Outcome>,
    pub(crate) vars: BTreeMap<String, VarValue>,
    pub(crate) error_message: Option<Value>,
}

impl MachineScope {
    /// Reset machine variables to their declared initial values.
    pub fn reset_variables(&mut self, machine: &Machine) {
        self.vars = machine
            .variables()
            .iter()
            .map(|v| (v.name.clone(), VarValue::Defined(v.initial.clone())))
            .collect();
    }

    pub fn variable(&self, name: &str) -> Option<&VarValue> {
        self.vars.get(name)
    }

    pub fn set_variable(&mut self, name: &str, value: VarValue) {
        self.vars.insert(name.to_string(), value);
    }
}

/// Borrowed view the evaluator resolves names against.
pub struct EvalScope<'a> {
    pub shadow: &'a BTreeMap<String, Outcome>,
    pub vars: &'a BTreeMap<String, VarValue>,
    pub error_message: Option<&'a Value>,
    pub idents: &'a IdentifierTable,
}

impl Scope for EvalScope<'_> {
    fn resolve(&self, name: &str) -> Option<Outcome> {
        if let Some(outcome) = self.shadow.get(name) {
            return Some(outcome.clone());
        }
        if name == ERROR_MESSAGE {
            if let Some(v) = self.error_message {
                return Some(Outcome::Defined(v.clone()));
            }
        }
        if let Some(var) = self.vars.get(name) {
            return Some(match var {
                VarValue::Defined(v) => Outcome::Defined(v.clone()),
                VarValue::Unknown => Outcome::Unknown,
            });
        }
        // A port identifier before any read: nothing is known yet.
        if self.idents.lookup(name).is_some() {
            return Some(Outcome::Unknown);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_for(widths: &[(&str, usize)]) -> (Machine, IdentifierTable) {
        let mut m = Machine::new("m");
        for (name, width) in widths {
            m.add_input(name, *width).unwrap();
        }
        let mut table = IdentifierTable::default();
        table.ensure(&m);
        (m, table)
    }

    #[test]
    fn test_identifier_table_entries() {
        let (_, table) = table_for(&[("x", 2)]);
        let r = table.lookup("x_1_isPresent").unwrap();
        assert_eq!(r.channel, 1);
        assert_eq!(r.kind, RefKind::Presence);
        // Unsuffixed aliases map to channel 0.
        let r = table.lookup("x").unwrap();
        assert_eq!(r.channel, 0);
        assert_eq!(r.kind, RefKind::Value);
        let r = table.lookup("xArray").unwrap();
        assert_eq!(r.kind, RefKind::Array);
        assert!(table.lookup("y").is_none());
    }

    #[test]
    fn test_identifier_table_rebuilds_on_port_change() {
        let (mut m, mut table) = table_for(&[("x", 1)]);
        assert!(table.lookup("x_1").is_none());
        m.set_input_width(m.input_id("x").unwrap(), 2).unwrap();
        table.ensure(&m);
        assert!(table.lookup("x_1").is_some());
    }

    #[test]
    fn test_resolution_order() {
        let (mut m, table) = table_for(&[("x", 1)]);
        m.add_variable("v", Value::Int(7)).unwrap();
        let mut scope = MachineScope::default();
        scope.reset_variables(&m);
        scope
            .shadow
            .insert("x".to_string(), Outcome::Defined(Value::Int(1)));

        let view = EvalScope {
            shadow: &scope.shadow,
            vars: &scope.vars,
            error_message: None,
            idents: &table,
        };
        assert_eq!(view.resolve("x"), Some(Outcome::Defined(Value::Int(1))));
        assert_eq!(view.resolve("v"), Some(Outcome::Defined(Value::Int(7))));
        // Port-shaped identifier with no shadow entry yet.
        assert_eq!(view.resolve("x_0_isPresent"), Some(Outcome::Unknown));
        assert_eq!(view.resolve("nosuch"), None);
        assert_eq!(view.resolve(ERROR_MESSAGE), None);
    }

    #[test]
    fn test_error_message_binding() {
        let (_, table) = table_for(&[]);
        let scope = MachineScope::default();
        let msg = Value::string("boom");
        let view = EvalScope {
            shadow: &scope.shadow,
            vars: &scope.vars,
            error_message: Some(&msg),
            idents: &table,
        };
        assert_eq!(
            view.resolve(ERROR_MESSAGE),
            Some(Outcome::Defined(Value::string("boom")))
        );
    }

    #[test]
    fn test_unknown_variable_resolves_unknown() {
        let (_, table) = table_for(&[]);
        let mut scope = MachineScope::default();
        scope.set_variable("v", VarValue::Unknown);
        let view = EvalScope {
            shadow: &scope.shadow,
            vars: &scope.vars,
            error_message: None,
            idents: &table,
        };
        assert_eq!(view.resolve("v"), Some(Outcome::Unknown));
    }
}
