//! Static input-to-output dependency analysis.
//!
//! Derived from the transition structure alone: which output ports
//! depend on which input ports, and which groups of inputs must have
//! their statuses known together before selection can settle. An
//! output written by a choice action depends on every input its own
//! expression reads and on every input the owning transition's guard
//! reads, since the guard decides whether the write happens at all.

use std::cell::RefCell;
use std::collections::BTreeSet;

use modal_syntax::{free_variables, Expr};
use tracing::debug;

use crate::actions::ResolvedDest;
use crate::error::{KernelError, KernelResult};
use crate::graph::{GuardExpr, InputPortId, Machine, OutputPortId, StateId, Transition, TransitionId};
use crate::scope::IdentifierTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    Dependent,
    Independent,
}

#[derive(Debug)]
struct CausalityCache {
    version: u64,
    state: Option<StateId>,
    edges: BTreeSet<(InputPortId, OutputPortId)>,
    classes: Vec<BTreeSet<InputPortId>>,
}

/// Lazily computed causality interface, invalidated by machine edits.
///
/// In state-dependent mode only the current state's outgoing
/// transitions contribute, which gives a tighter interface at the
/// cost of a recompute on every state change.
#[derive(Debug)]
pub struct CausalityAnalyzer {
    state_dependent: bool,
    cache: RefCell<Option<CausalityCache>>,
}

impl CausalityAnalyzer {
    pub fn new(state_dependent: bool) -> Self {
        Self {
            state_dependent,
            cache: RefCell::new(None),
        }
    }

    pub fn state_dependent(&self) -> bool {
        self.state_dependent
    }

    pub fn dependency(
        &self,
        machine: &Machine,
        current: Option<StateId>,
        input: InputPortId,
        output: OutputPortId,
    ) -> KernelResult<Dependency> {
        self.with_cache(machine, current, |cache| {
            if cache.edges.contains(&(input, output)) {
                Dependency::Dependent
            } else {
                Dependency::Independent
            }
        })
    }

    /// Groups of inputs referenced together by some transition. Inputs
    /// no transition reads stay in singleton classes.
    pub fn equivalence_classes(
        &self,
        machine: &Machine,
        current: Option<StateId>,
    ) -> KernelResult<Vec<BTreeSet<InputPortId>>> {
        self.with_cache(machine, current, |cache| cache.classes.clone())
    }

    fn with_cache<T>(
        &self,
        machine: &Machine,
        current: Option<StateId>,
        f: impl FnOnce(&CausalityCache) -> T,
    ) -> KernelResult<T> {
        let key_state = if self.state_dependent { current } else { None };
        let mut slot = self.cache.borrow_mut();
        match slot.as_ref() {
            Some(cache) if cache.version == machine.version() && cache.state == key_state => {
                Ok(f(cache))
            }
            _ => {
                let cache = Self::compute(machine, key_state)?;
                let out = f(&cache);
                *slot = Some(cache);
                Ok(out)
            }
        }
    }

    fn compute(machine: &Machine, state: Option<StateId>) -> KernelResult<CausalityCache> {
        let mut idents = IdentifierTable::default();
        idents.ensure(machine);

        let mut classes: Vec<BTreeSet<InputPortId>> = machine
            .inputs()
            .map(|(id, _)| BTreeSet::from([id]))
            .collect();
        let mut edges = BTreeSet::new();

        for (id, tr) in machine.transitions() {
            if state.is_some_and(|s| tr.source() != s) {
                continue;
            }
            fold_transition(machine, &idents, id, tr, &mut edges, &mut classes)?;
        }
        debug!(
            machine = machine.name(),
            edges = edges.len(),
            classes = classes.len(),
            "computed causality interface"
        );
        Ok(CausalityCache {
            version: machine.version(),
            state,
            edges,
            classes,
        })
    }
}

fn fold_transition(
    machine: &Machine,
    idents: &IdentifierTable,
    id: TransitionId,
    tr: &Transition,
    edges: &mut BTreeSet<(InputPortId, OutputPortId)>,
    classes: &mut Vec<BTreeSet<InputPortId>>,
) -> KernelResult<()> {
    let mut guard_inputs = BTreeSet::new();
    if !tr.guard().is_empty() {
        let expr = compile(machine, id, tr.guard())?;
        collect_input_ports(&expr, idents, &mut guard_inputs);
    }
    if let Some(trigger) = tr.trigger() {
        let expr = compile(machine, id, trigger)?;
        collect_input_ports(&expr, idents, &mut guard_inputs);
    }

    let mut referenced = guard_inputs.clone();
    let dests = tr
        .choice_actions()
        .resolved(machine, &machine.qualified_name(id))?;
    for (clause, dest) in tr.choice_actions().clauses().iter().zip(dests.iter()) {
        let mut clause_inputs = BTreeSet::new();
        collect_input_ports(&clause.expr, idents, &mut clause_inputs);
        referenced.extend(clause_inputs.iter().copied());
        if let ResolvedDest::Output { port, .. } = dest {
            for &input in guard_inputs.iter().chain(clause_inputs.iter()) {
                edges.insert((input, *port));
            }
        }
    }

    if referenced.len() >= 2 {
        merge_classes(classes, &referenced);
    }
    Ok(())
}

fn compile(machine: &Machine, id: TransitionId, expr: &GuardExpr) -> KernelResult<std::rc::Rc<Expr>> {
    expr.compiled(machine.version())
        .map_err(|source| KernelError::ExpressionSyntax {
            transition: machine.qualified_name(id),
            text: expr.text().to_string(),
            source,
        })
}

fn collect_input_ports(expr: &Expr, idents: &IdentifierTable, out: &mut BTreeSet<InputPortId>) {
    for name in free_variables(expr) {
        if let Some(port_ref) = idents.lookup(&name) {
            out.insert(port_ref.port);
        }
    }
}

fn merge_classes(classes: &mut Vec<BTreeSet<InputPortId>>, referenced: &BTreeSet<InputPortId>) {
    let mut merged = BTreeSet::new();
    classes.retain(|class| {
        if class.is_disjoint(referenced) {
            true
        } else {
            merged.extend(class.iter().copied());
            false
        }
    });
    if !merged.is_empty() {
        classes.push(merged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        machine: Machine,
        a: StateId,
        b: StateId,
    }

    fn fixture(inputs: &[&str], outputs: &[&str]) -> Fixture {
        let mut machine = Machine::new("m");
        let a = machine.add_state("a").unwrap();
        let b = machine.add_state("b").unwrap();
        for name in inputs {
            machine.add_input(name, 1).unwrap();
        }
        for name in outputs {
            machine.add_output(name, 1).unwrap();
        }
        Fixture { machine, a, b }
    }

    fn input(f: &Fixture, name: &str) -> InputPortId {
        f.machine.input_id(name).unwrap()
    }

    fn output(f: &Fixture, name: &str) -> OutputPortId {
        f.machine.output_id(name).unwrap()
    }

    #[test]
    fn test_guard_inputs_gate_written_outputs() {
        let mut f = fixture(&["x", "y"], &["out"]);
        let t = f.machine.add_transition(f.a, f.b).unwrap();
        f.machine.set_guard(t, "x > 0").unwrap();
        f.machine.set_choice_actions(t, "out = y + 1").unwrap();

        let analyzer = CausalityAnalyzer::new(false);
        let dep = |i: &str, o: &str| {
            analyzer
                .dependency(&f.machine, None, input(&f, i), output(&f, o))
                .unwrap()
        };
        assert_eq!(dep("x", "out"), Dependency::Dependent);
        assert_eq!(dep("y", "out"), Dependency::Dependent);
    }

    #[test]
    fn test_clause_inputs_bind_to_own_output() {
        let mut f = fixture(&["x", "y"], &["p", "q"]);
        let t = f.machine.add_transition(f.a, f.b).unwrap();
        f.machine.set_guard(t, "true").unwrap();
        f.machine.set_choice_actions(t, "p = x; q = y").unwrap();

        let analyzer = CausalityAnalyzer::new(false);
        let dep = |i: &str, o: &str| {
            analyzer
                .dependency(&f.machine, None, input(&f, i), output(&f, o))
                .unwrap()
        };
        assert_eq!(dep("x", "p"), Dependency::Dependent);
        assert_eq!(dep("y", "q"), Dependency::Dependent);
        assert_eq!(dep("x", "q"), Dependency::Independent);
        assert_eq!(dep("y", "p"), Dependency::Independent);
    }

    #[test]
    fn test_equivalence_classes_merge_across_transitions() {
        let mut f = fixture(&["x", "y", "z", "w"], &[]);
        let t1 = f.machine.add_transition(f.a, f.b).unwrap();
        f.machine.set_guard(t1, "x > 0 && y > 0").unwrap();
        let t2 = f.machine.add_transition(f.b, f.a).unwrap();
        f.machine.set_guard(t2, "y < 0 && z < 0").unwrap();

        let analyzer = CausalityAnalyzer::new(false);
        let classes = analyzer.equivalence_classes(&f.machine, None).unwrap();
        // x, y, z chain into one class; w stays alone.
        assert_eq!(classes.len(), 2);
        let big: BTreeSet<_> = [input(&f, "x"), input(&f, "y"), input(&f, "z")].into();
        assert!(classes.contains(&big));
        assert!(classes.contains(&BTreeSet::from([input(&f, "w")])));
    }

    #[test]
    fn test_action_expression_joins_class() {
        let mut f = fixture(&["x", "y"], &["out"]);
        let t = f.machine.add_transition(f.a, f.b).unwrap();
        f.machine.set_guard(t, "x > 0").unwrap();
        f.machine.set_choice_actions(t, "out = y").unwrap();

        let analyzer = CausalityAnalyzer::new(false);
        let classes = analyzer.equivalence_classes(&f.machine, None).unwrap();
        assert_eq!(classes.len(), 1);
    }

    #[test]
    fn test_state_dependent_interface_is_narrower() {
        let mut f = fixture(&["x"], &["out"]);
        let t = f.machine.add_transition(f.b, f.a).unwrap();
        f.machine.set_guard(t, "x > 0").unwrap();
        f.machine.set_choice_actions(t, "out = x").unwrap();

        let x = input(&f, "x");
        let out = output(&f, "out");
        // Globally the edge exists.
        let global = CausalityAnalyzer::new(false);
        assert_eq!(
            global.dependency(&f.machine, Some(f.a), x, out).unwrap(),
            Dependency::Dependent
        );
        // From state a there is no outgoing transition reading x.
        let scoped = CausalityAnalyzer::new(true);
        assert_eq!(
            scoped.dependency(&f.machine, Some(f.a), x, out).unwrap(),
            Dependency::Independent
        );
        assert_eq!(
            scoped.dependency(&f.machine, Some(f.b), x, out).unwrap(),
            Dependency::Dependent
        );
    }

    #[test]
    fn test_cache_invalidated_by_edit() {
        let mut f = fixture(&["x"], &["out"]);
        let t = f.machine.add_transition(f.a, f.b).unwrap();
        f.machine.set_guard(t, "true").unwrap();

        let analyzer = CausalityAnalyzer::new(false);
        let x = input(&f, "x");
        let out = output(&f, "out");
        assert_eq!(
            analyzer.dependency(&f.machine, None, x, out).unwrap(),
            Dependency::Independent
        );
        f.machine.set_choice_actions(t, "out = x").unwrap();
        assert_eq!(
            analyzer.dependency(&f.machine, None, x, out).unwrap(),
            Dependency::Dependent
        );
    }

    #[test]
    fn test_channel_identifiers_map_to_port() {
        let mut f = fixture(&[], &["out"]);
        f.machine.add_input("x", 2).unwrap();
        let t = f.machine.add_transition(f.a, f.b).unwrap();
        f.machine.set_guard(t, "x_1_isPresent").unwrap();
        f.machine.set_choice_actions(t, "out = x_1").unwrap();

        let analyzer = CausalityAnalyzer::new(false);
        assert_eq!(
            analyzer
                .dependency(&f.machine, None, input(&f, "x"), output(&f, "out"))
                .unwrap(),
            Dependency::Dependent
        );
        // Both identifiers name the same port, so no merge happens.
        let classes = analyzer.equivalence_classes(&f.machine, None).unwrap();
        assert_eq!(classes.len(), 1);
    }
}
