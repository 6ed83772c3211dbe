//! The machine structure: states, transitions, ports and variables.
//!
//! The structure is mutable between iterations, so anything derived
//! from it is cached against a version counter and rebuilt lazily on
//! the first use after an edit. Port edits additionally bump a ports
//! version that governs channel and identifier-table lifetimes.
//!
//! States and transitions are addressed by index ids. Removal leaves a
//! tombstone so ids stay stable; a transition whose destination was
//! removed is only detected when it is committed.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use modal_eval::Value;
use modal_syntax::{parse_expression, Expr, ParseError};
use tracing::trace;

use crate::actions::ActionScript;
use crate::error::{KernelError, KernelResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransitionId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputPortId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputPortId(pub usize);

#[derive(Debug, Clone)]
pub struct InputPort {
    pub name: String,
    pub width: usize,
}

#[derive(Debug, Clone)]
pub struct OutputPort {
    pub name: String,
    pub width: usize,
}

#[derive(Debug, Clone)]
pub struct VariableDecl {
    pub name: String,
    pub initial: Value,
}

/// An expression attribute: source text plus a parse tree cached
/// against the machine version.
#[derive(Debug)]
pub struct GuardExpr {
    text: String,
    compiled: RefCell<Option<(u64, Rc<Expr>)>>,
}

impl GuardExpr {
    pub fn new(text: impl Into<String>) -> Self {
        GuardExpr {
            text: text.into(),
            compiled: RefCell::new(None),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// The parse tree, reparsed at most once per machine version.
    pub fn compiled(&self, version: u64) -> Result<Rc<Expr>, ParseError> {
        if let Some((cached_version, expr)) = &*self.compiled.borrow() {
            if *cached_version == version {
                return Ok(expr.clone());
            }
        }
        let expr = Rc::new(parse_expression(&self.text)?);
        *self.compiled.borrow_mut() = Some((version, expr.clone()));
        Ok(expr)
    }
}

/// Outgoing transitions of a state, split the way selection consumes
/// them. Order within each list is declaration order.
#[derive(Debug, Clone, Default)]
pub struct TransitionLists {
    pub preemptive: Vec<TransitionId>,
    pub nonpreemptive: Vec<TransitionId>,
    pub error: Vec<TransitionId>,
    version: u64,
}

#[derive(Debug)]
pub struct State {
    name: String,
    init_entry: bool,
    refinements: Vec<String>,
    partition: RefCell<Option<TransitionLists>>,
}

impl State {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether entering this state always re-initializes its
    /// refinements, regardless of the transition's reset flag.
    pub fn init_entry(&self) -> bool {
        self.init_entry
    }

    /// Names of the refinements slaved to this state.
    pub fn refinements(&self) -> &[String] {
        &self.refinements
    }
}

#[derive(Debug)]
pub struct Transition {
    name: String,
    source: StateId,
    dest: StateId,
    guard: GuardExpr,
    trigger: Option<GuardExpr>,
    preemptive: bool,
    nondeterministic: bool,
    reset: bool,
    default: bool,
    error: bool,
    choice_actions: ActionScript,
    commit_actions: ActionScript,
    refinements: Vec<String>,
}

impl Transition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> StateId {
        self.source
    }

    pub fn dest(&self) -> StateId {
        self.dest
    }

    pub fn guard(&self) -> &GuardExpr {
        &self.guard
    }

    pub fn trigger(&self) -> Option<&GuardExpr> {
        self.trigger.as_ref()
    }

    pub fn is_preemptive(&self) -> bool {
        self.preemptive
    }

    pub fn is_nondeterministic(&self) -> bool {
        self.nondeterministic
    }

    pub fn is_reset(&self) -> bool {
        self.reset
    }

    pub fn is_default(&self) -> bool {
        self.default
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn choice_actions(&self) -> &ActionScript {
        &self.choice_actions
    }

    pub fn commit_actions(&self) -> &ActionScript {
        &self.commit_actions
    }

    pub fn refinements(&self) -> &[String] {
        &self.refinements
    }
}

#[derive(Debug)]
pub struct Machine {
    name: String,
    states: Vec<Option<State>>,
    transitions: Vec<Option<Transition>>,
    inputs: Vec<InputPort>,
    outputs: Vec<OutputPort>,
    variables: Vec<VariableDecl>,
    initial_state: Option<String>,
    final_states: Vec<String>,
    version: Cell<u64>,
    ports_version: Cell<u64>,
}

impl Machine {
    pub fn new(name: impl Into<String>) -> Self {
        Machine {
            name: name.into(),
            states: Vec::new(),
            transitions: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            variables: Vec::new(),
            initial_state: None,
            final_states: Vec::new(),
            version: Cell::new(1),
            ports_version: Cell::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Counter bumped by every structural edit. Derived caches carry
    /// the version they were built at and rebuild when it moves.
    pub fn version(&self) -> u64 {
        self.version.get()
    }

    /// Bumped only by port edits; channel storage follows this one.
    pub fn ports_version(&self) -> u64 {
        self.ports_version.get()
    }

    fn bump(&mut self) {
        self.version.set(self.version.get() + 1);
    }

    fn bump_ports(&mut self) {
        self.bump();
        self.ports_version.set(self.ports_version.get() + 1);
    }

    /// Structural edits made outside this module, such as refinement
    /// binding, invalidate derived caches through this.
    pub(crate) fn invalidate(&mut self) {
        self.bump();
    }

    // ----- states and transitions -----

    pub fn add_state(&mut self, name: &str) -> KernelResult<StateId> {
        if self.state_id(name).is_some() {
            return Err(KernelError::DuplicateName(name.to_string()));
        }
        self.states.push(Some(State {
            name: name.to_string(),
            init_entry: false,
            refinements: Vec::new(),
            partition: RefCell::new(None),
        }));
        self.bump();
        Ok(StateId(self.states.len() - 1))
    }

    pub fn remove_state(&mut self, id: StateId) -> KernelResult<()> {
        let slot = self
            .states
            .get_mut(id.0)
            .ok_or(KernelError::InvalidStateId(id.0))?;
        if slot.take().is_none() {
            return Err(KernelError::InvalidStateId(id.0));
        }
        self.bump();
        Ok(())
    }

    pub fn add_transition(&mut self, source: StateId, dest: StateId) -> KernelResult<TransitionId> {
        if self.state(source).is_none() {
            return Err(KernelError::InvalidStateId(source.0));
        }
        if self.state(dest).is_none() {
            return Err(KernelError::InvalidStateId(dest.0));
        }
        let name = format!("t{}", self.transitions.len());
        self.transitions.push(Some(Transition {
            name,
            source,
            dest,
            guard: GuardExpr::new(""),
            trigger: None,
            preemptive: false,
            nondeterministic: false,
            reset: false,
            default: false,
            error: false,
            choice_actions: ActionScript::empty(),
            commit_actions: ActionScript::empty(),
            refinements: Vec::new(),
        }));
        self.bump();
        Ok(TransitionId(self.transitions.len() - 1))
    }

    pub fn remove_transition(&mut self, id: TransitionId) -> KernelResult<()> {
        let slot = self
            .transitions
            .get_mut(id.0)
            .ok_or(KernelError::InvalidTransitionId(id.0))?;
        if slot.take().is_none() {
            return Err(KernelError::InvalidTransitionId(id.0));
        }
        self.bump();
        Ok(())
    }

    pub fn state(&self, id: StateId) -> Option<&State> {
        self.states.get(id.0).and_then(|s| s.as_ref())
    }

    pub fn transition(&self, id: TransitionId) -> Option<&Transition> {
        self.transitions.get(id.0).and_then(|t| t.as_ref())
    }

    pub fn state_id(&self, name: &str) -> Option<StateId> {
        self.states
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.name == name))
            .map(StateId)
    }

    pub fn states(&self) -> impl Iterator<Item = (StateId, &State)> {
        self.states
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (StateId(i), s)))
    }

    pub fn transitions(&self) -> impl Iterator<Item = (TransitionId, &Transition)> {
        self.transitions
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|t| (TransitionId(i), t)))
    }

    /// `machine.element` form used in diagnostics.
    pub fn qualified_name(&self, id: TransitionId) -> String {
        let name = self
            .transition(id)
            .map(|t| t.name.as_str())
            .unwrap_or("<removed>");
        format!("{}.{}", self.name, name)
    }

    pub fn qualified_state_name(&self, id: StateId) -> String {
        let name = self
            .state(id)
            .map(|s| s.name.as_str())
            .unwrap_or("<removed>");
        format!("{}.{}", self.name, name)
    }

    fn transition_mut(&mut self, id: TransitionId) -> KernelResult<&mut Transition> {
        self.transitions
            .get_mut(id.0)
            .and_then(|t| t.as_mut())
            .ok_or(KernelError::InvalidTransitionId(id.0))
    }

    fn state_mut(&mut self, id: StateId) -> KernelResult<&mut State> {
        self.states
            .get_mut(id.0)
            .and_then(|s| s.as_mut())
            .ok_or(KernelError::InvalidStateId(id.0))
    }

    // ----- transition configuration -----

    pub fn set_guard(&mut self, id: TransitionId, text: &str) -> KernelResult<()> {
        self.transition_mut(id)?.guard = GuardExpr::new(text);
        self.bump();
        Ok(())
    }

    /// An empty trigger means no trigger at all.
    pub fn set_trigger(&mut self, id: TransitionId, text: &str) -> KernelResult<()> {
        self.transition_mut(id)?.trigger = if text.trim().is_empty() {
            None
        } else {
            Some(GuardExpr::new(text))
        };
        self.bump();
        Ok(())
    }

    pub fn set_preemptive(&mut self, id: TransitionId, preemptive: bool) -> KernelResult<()> {
        self.transition_mut(id)?.preemptive = preemptive;
        self.bump();
        Ok(())
    }

    pub fn set_nondeterministic(&mut self, id: TransitionId, flag: bool) -> KernelResult<()> {
        self.transition_mut(id)?.nondeterministic = flag;
        self.bump();
        Ok(())
    }

    pub fn set_reset(&mut self, id: TransitionId, reset: bool) -> KernelResult<()> {
        self.transition_mut(id)?.reset = reset;
        self.bump();
        Ok(())
    }

    pub fn set_default(&mut self, id: TransitionId, flag: bool) -> KernelResult<()> {
        self.transition_mut(id)?.default = flag;
        self.bump();
        Ok(())
    }

    pub fn set_error(&mut self, id: TransitionId, flag: bool) -> KernelResult<()> {
        self.transition_mut(id)?.error = flag;
        self.bump();
        Ok(())
    }

    /// Choice actions run in fire once a transition is chosen. The
    /// script is parsed here; malformed text never reaches execution.
    pub fn set_choice_actions(&mut self, id: TransitionId, text: &str) -> KernelResult<()> {
        let owner = self.qualified_name(id);
        self.transition_mut(id)?.choice_actions = parse_script(&owner, text)?;
        self.bump();
        Ok(())
    }

    /// Commit actions run in postfire when the transition is taken.
    pub fn set_commit_actions(&mut self, id: TransitionId, text: &str) -> KernelResult<()> {
        let owner = self.qualified_name(id);
        self.transition_mut(id)?.commit_actions = parse_script(&owner, text)?;
        self.bump();
        Ok(())
    }

    pub fn set_transition_refinements(&mut self, id: TransitionId, text: &str) -> KernelResult<()> {
        let owner = self.qualified_name(id);
        self.transition_mut(id)?.refinements = parse_name_list(&owner, text)?;
        self.bump();
        Ok(())
    }

    // ----- state configuration -----

    pub fn set_init_entry(&mut self, id: StateId, flag: bool) -> KernelResult<()> {
        self.state_mut(id)?.init_entry = flag;
        self.bump();
        Ok(())
    }

    pub fn set_state_refinements(&mut self, id: StateId, text: &str) -> KernelResult<()> {
        let owner = self.qualified_state_name(id);
        self.state_mut(id)?.refinements = parse_name_list(&owner, text)?;
        self.bump();
        Ok(())
    }

    /// Name of the state execution starts in. Resolved at initialize.
    pub fn set_initial_state(&mut self, name: &str) {
        self.initial_state = Some(name.to_string());
        self.bump();
    }

    pub fn initial_state_name(&self) -> Option<&str> {
        self.initial_state.as_deref()
    }

    /// Comma-separated names of states that end the run when reached.
    pub fn set_final_states(&mut self, text: &str) -> KernelResult<()> {
        self.final_states = parse_name_list(&self.name, text)?;
        self.bump();
        Ok(())
    }

    pub fn is_final(&self, id: StateId) -> bool {
        self.state(id)
            .is_some_and(|s| self.final_states.iter().any(|f| f == &s.name))
    }

    // ----- ports and variables -----

    pub fn add_input(&mut self, name: &str, width: usize) -> KernelResult<InputPortId> {
        self.check_port_name(name)?;
        self.inputs.push(InputPort {
            name: name.to_string(),
            width,
        });
        self.bump_ports();
        Ok(InputPortId(self.inputs.len() - 1))
    }

    pub fn add_output(&mut self, name: &str, width: usize) -> KernelResult<OutputPortId> {
        self.check_port_name(name)?;
        self.outputs.push(OutputPort {
            name: name.to_string(),
            width,
        });
        self.bump_ports();
        Ok(OutputPortId(self.outputs.len() - 1))
    }

    fn check_port_name(&self, name: &str) -> KernelResult<()> {
        let taken = self.inputs.iter().any(|p| p.name == name)
            || self.outputs.iter().any(|p| p.name == name);
        if taken {
            Err(KernelError::DuplicateName(name.to_string()))
        } else {
            Ok(())
        }
    }

    pub fn set_input_width(&mut self, id: InputPortId, width: usize) -> KernelResult<()> {
        let port = self
            .inputs
            .get_mut(id.0)
            .ok_or_else(|| KernelError::UnknownInputPort(format!("#{}", id.0)))?;
        port.width = width;
        self.bump_ports();
        Ok(())
    }

    /// A variable may share a name with a port; action destinations
    /// then resolve to the port.
    pub fn add_variable(&mut self, name: &str, initial: Value) -> KernelResult<()> {
        if self.variables.iter().any(|v| v.name == name) {
            return Err(KernelError::DuplicateName(name.to_string()));
        }
        self.variables.push(VariableDecl {
            name: name.to_string(),
            initial,
        });
        self.bump();
        Ok(())
    }

    pub fn input(&self, id: InputPortId) -> &InputPort {
        &self.inputs[id.0]
    }

    pub fn output(&self, id: OutputPortId) -> &OutputPort {
        &self.outputs[id.0]
    }

    pub fn inputs(&self) -> impl Iterator<Item = (InputPortId, &InputPort)> {
        self.inputs
            .iter()
            .enumerate()
            .map(|(i, p)| (InputPortId(i), p))
    }

    pub fn outputs(&self) -> impl Iterator<Item = (OutputPortId, &OutputPort)> {
        self.outputs
            .iter()
            .enumerate()
            .map(|(i, p)| (OutputPortId(i), p))
    }

    pub fn input_id(&self, name: &str) -> Option<InputPortId> {
        self.inputs
            .iter()
            .position(|p| p.name == name)
            .map(InputPortId)
    }

    pub fn output_id(&self, name: &str) -> Option<OutputPortId> {
        self.outputs
            .iter()
            .position(|p| p.name == name)
            .map(OutputPortId)
    }

    pub fn variables(&self) -> &[VariableDecl] {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&VariableDecl> {
        self.variables.iter().find(|v| v.name == name)
    }

    // ----- transition partition -----

    /// Outgoing transitions of `state`, partitioned for selection.
    /// Rebuilt lazily after structural edits; the rebuild also
    /// enforces the structural rules on flags.
    pub fn transition_lists(&self, state: StateId) -> KernelResult<TransitionLists> {
        let st = self.state(state).ok_or(KernelError::InvalidStateId(state.0))?;
        let version = self.version();
        if let Some(lists) = &*st.partition.borrow() {
            if lists.version == version {
                return Ok(lists.clone());
            }
        }

        let mut lists = TransitionLists {
            version,
            ..TransitionLists::default()
        };
        let state_is_final = self.is_final(state);
        for (id, tr) in self.transitions() {
            if tr.source != state {
                continue;
            }
            if state_is_final {
                return Err(KernelError::FinalStateOutgoing {
                    state: self.qualified_state_name(state),
                    transition: self.qualified_name(id),
                });
            }
            if tr.error {
                if tr.preemptive {
                    return Err(KernelError::PreemptiveErrorTransition {
                        transition: self.qualified_name(id),
                    });
                }
                if tr.default {
                    return Err(KernelError::DefaultErrorTransition {
                        transition: self.qualified_name(id),
                    });
                }
                lists.error.push(id);
            } else if tr.preemptive {
                lists.preemptive.push(id);
            } else {
                lists.nonpreemptive.push(id);
            }
        }
        trace!(
            state = %st.name,
            preemptive = lists.preemptive.len(),
            nonpreemptive = lists.nonpreemptive.len(),
            error = lists.error.len(),
            "rebuilt transition partition"
        );
        *st.partition.borrow_mut() = Some(lists.clone());
        Ok(lists)
    }
}

fn parse_script(owner: &str, text: &str) -> KernelResult<ActionScript> {
    ActionScript::parse(text).map_err(|source| KernelError::ActionSyntax {
        owner: owner.to_string(),
        source,
    })
}

fn parse_name_list(owner: &str, text: &str) -> KernelResult<Vec<String>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(KernelError::MalformedNameList {
                owner: owner.to_string(),
                text: text.to_string(),
            });
        }
        names.push(part.to_string());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_state_machine() -> (Machine, StateId, StateId, TransitionId) {
        let mut m = Machine::new("m");
        let a = m.add_state("a").unwrap();
        let b = m.add_state("b").unwrap();
        let t = m.add_transition(a, b).unwrap();
        (m, a, b, t)
    }

    #[test]
    fn test_partition_reuses_cache() {
        let (m, a, _, t) = two_state_machine();
        let first = m.transition_lists(a).unwrap();
        assert_eq!(first.nonpreemptive, vec![t]);
        let second = m.transition_lists(a).unwrap();
        assert_eq!(second.nonpreemptive, first.nonpreemptive);
    }

    #[test]
    fn test_partition_tracks_edits() {
        let (mut m, a, _, t) = two_state_machine();
        assert_eq!(m.transition_lists(a).unwrap().nonpreemptive, vec![t]);
        m.set_preemptive(t, true).unwrap();
        let lists = m.transition_lists(a).unwrap();
        assert!(lists.nonpreemptive.is_empty());
        assert_eq!(lists.preemptive, vec![t]);
    }

    #[test]
    fn test_error_transitions_partition_separately() {
        let (mut m, a, _, t) = two_state_machine();
        m.set_error(t, true).unwrap();
        let lists = m.transition_lists(a).unwrap();
        assert_eq!(lists.error, vec![t]);
        assert!(lists.nonpreemptive.is_empty());
    }

    #[test]
    fn test_final_state_with_outgoing_rejected() {
        let (mut m, a, _, _) = two_state_machine();
        m.set_final_states("a").unwrap();
        let err = m.transition_lists(a).unwrap_err();
        assert!(matches!(err, KernelError::FinalStateOutgoing { .. }));
    }

    #[test]
    fn test_preemptive_error_rejected() {
        let (mut m, a, _, t) = two_state_machine();
        m.set_error(t, true).unwrap();
        m.set_preemptive(t, true).unwrap();
        let err = m.transition_lists(a).unwrap_err();
        assert!(matches!(err, KernelError::PreemptiveErrorTransition { .. }));
    }

    #[test]
    fn test_default_error_rejected() {
        let (mut m, a, _, t) = two_state_machine();
        m.set_error(t, true).unwrap();
        m.set_default(t, true).unwrap();
        let err = m.transition_lists(a).unwrap_err();
        assert!(matches!(err, KernelError::DefaultErrorTransition { .. }));
    }

    #[test]
    fn test_guard_compile_cached_per_version() {
        let (mut m, _, _, t) = two_state_machine();
        m.set_guard(t, "x > 0").unwrap();
        let v = m.version();
        let first = m.transition(t).unwrap().guard().compiled(v).unwrap();
        let second = m.transition(t).unwrap().guard().compiled(v).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        // A version bump forces a reparse.
        let third = m.transition(t).unwrap().guard().compiled(v + 1).unwrap();
        assert!(!Rc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_remove_state_leaves_tombstone() {
        let (mut m, _, b, t) = two_state_machine();
        m.remove_state(b).unwrap();
        assert!(m.state(b).is_none());
        assert!(m.state_id("b").is_none());
        // The transition into it survives; commit detects the dangle.
        assert!(m.transition(t).is_some());
        assert!(matches!(
            m.remove_state(b),
            Err(KernelError::InvalidStateId(_))
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut m = Machine::new("m");
        m.add_state("a").unwrap();
        assert!(matches!(
            m.add_state("a"),
            Err(KernelError::DuplicateName(_))
        ));
        m.add_input("x", 1).unwrap();
        assert!(matches!(
            m.add_output("x", 1),
            Err(KernelError::DuplicateName(_))
        ));
        // Variables may shadow port names; ports win at resolution.
        m.add_variable("x", Value::Int(0)).unwrap();
        assert!(matches!(
            m.add_variable("x", Value::Int(0)),
            Err(KernelError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_name_list_parsing() {
        let (mut m, a, _, _) = two_state_machine();
        m.set_state_refinements(a, "r1, r2").unwrap();
        assert_eq!(m.state(a).unwrap().refinements(), ["r1", "r2"]);
        m.set_state_refinements(a, "").unwrap();
        assert!(m.state(a).unwrap().refinements().is_empty());
        assert!(matches!(
            m.set_state_refinements(a, "r1,,r2"),
            Err(KernelError::MalformedNameList { .. })
        ));
        assert!(matches!(
            m.set_state_refinements(a, "r1,"),
            Err(KernelError::MalformedNameList { .. })
        ));
    }

    #[test]
    fn test_trigger_empty_means_none() {
        let (mut m, _, _, t) = two_state_machine();
        m.set_trigger(t, "x_isPresent").unwrap();
        assert!(m.transition(t).unwrap().trigger().is_some());
        m.set_trigger(t, "  ").unwrap();
        assert!(m.transition(t).unwrap().trigger().is_none());
    }

    #[test]
    fn test_ports_version_only_tracks_ports() {
        let (mut m, _, _, t) = two_state_machine();
        let pv = m.ports_version();
        m.set_guard(t, "true").unwrap();
        assert_eq!(m.ports_version(), pv);
        m.add_input("x", 2).unwrap();
        assert_eq!(m.ports_version(), pv + 1);
    }
}
