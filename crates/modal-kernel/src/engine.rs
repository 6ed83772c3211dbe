//! The two-phase execution engine.
//!
//! The engine drives one machine through the prefire / fire / postfire
//! protocol of the enclosing scheduler. `fire` may be called any number
//! of times per iteration while the scheduler converges on a fixed
//! point; it never moves the current state. `postfire` commits the
//! transition chosen by the last fire, runs its commit actions, and
//! advances the state pointer.
//!
//! Input and output channels are shared cells handed out to drivers
//! and refinements; the engine reads inputs into shadow identifiers at
//! the start of every fire, so guards always see the latest statuses.

use std::collections::{BTreeMap, BTreeSet};

use modal_eval::{eval, Outcome, Value};
use rand::rngs::StdRng;
use tracing::{debug, info, trace, warn};

use crate::actions::ResolvedDest;
use crate::causality::{CausalityAnalyzer, Dependency};
use crate::error::{KernelError, KernelResult};
use crate::graph::{InputPortId, Machine, OutputPortId, StateId, TransitionId};
use crate::ports::{InputHandle, OutputHandle, OutputState, Status};
use crate::refinement::{Refinement, RefinementSlot, RefinementWiring, SharedVars};
use crate::scope::{
    array_name, presence_name, value_name, EvalScope, IdentifierTable, MachineScope, VarValue,
};
use crate::select::{choose, enabled_transitions, SelectionPolicy};

/// How many queued tokens one fire pass consumes per input channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferPolicy {
    /// At most one token per channel per fire call.
    #[default]
    OnePerFiring,
    /// Drain the queue; guards see the newest value and the `xArray`
    /// identifiers carry everything consumed this iteration.
    DrainAll,
}

/// Whether the engine drives bound refinements at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefinementPolicy {
    #[default]
    Fire,
    /// Run as a bare state machine, ignoring bound refinements.
    Skip,
}

/// The policy hooks that distinguish host-scheduler variants.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub selection: SelectionPolicy,
    pub transfer: TransferPolicy,
    pub refinements: RefinementPolicy,
    /// After a fire in which every guard was decided, settle output
    /// channels that provably cannot be written this iteration.
    pub assert_absent: bool,
    /// Compute the causality interface per state instead of over the
    /// whole machine.
    pub state_dependent_causality: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            selection: SelectionPolicy::default(),
            transfer: TransferPolicy::default(),
            refinements: RefinementPolicy::default(),
            assert_absent: true,
            state_dependent_causality: false,
        }
    }
}

/// Hooks for watching engine decisions.
pub trait StepObserver {
    fn transition_chosen(&mut self, _machine: &Machine, _transition: TransitionId) {}
    fn state_committed(&mut self, _machine: &Machine, _state: StateId) {}
}

#[derive(Clone, Copy, PartialEq)]
enum ActionKind {
    Choice,
    Commit,
}

pub struct Engine {
    machine: Machine,
    policy: Policy,
    rng: StdRng,

    current: Option<StateId>,
    last_chosen: Option<TransitionId>,
    previously_chosen: BTreeSet<TransitionId>,
    reached_final: bool,
    stop_requested: bool,
    model_error: bool,
    found_unknown: bool,

    scope: MachineScope,
    idents: IdentifierTable,

    // Channel storage, indexed by port id then channel, rebuilt when
    // the ports version moves.
    inputs: Vec<Vec<InputHandle>>,
    outputs: Vec<Vec<OutputHandle>>,
    drained: Vec<Vec<Vec<Value>>>,
    io_version: u64,

    refinements: BTreeMap<String, RefinementSlot>,
    refinement_var_tables: BTreeMap<String, SharedVars>,

    // Input channels driven by the current state's refinements.
    connections: Vec<(InputPortId, usize)>,
    connections_version: u64,

    fired_state_refinements: Vec<String>,
    fired_transition_refinements: Vec<String>,
    disabled_refinements: BTreeSet<String>,

    observer: Option<Box<dyn StepObserver>>,
    causality: CausalityAnalyzer,
}

impl Engine {
    pub fn new(machine: Machine) -> Self {
        use rand::SeedableRng;
        Self::build(machine, StdRng::from_entropy())
    }

    /// An engine whose nondeterministic tie-breaks are reproducible.
    pub fn with_seed(machine: Machine, seed: u64) -> Self {
        use rand::SeedableRng;
        Self::build(machine, StdRng::seed_from_u64(seed))
    }

    fn build(machine: Machine, rng: StdRng) -> Self {
        Engine {
            machine,
            policy: Policy::default(),
            rng,
            current: None,
            last_chosen: None,
            previously_chosen: BTreeSet::new(),
            reached_final: false,
            stop_requested: false,
            model_error: false,
            found_unknown: false,
            scope: MachineScope::default(),
            idents: IdentifierTable::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            drained: Vec::new(),
            io_version: 0,
            refinements: BTreeMap::new(),
            refinement_var_tables: BTreeMap::new(),
            connections: Vec::new(),
            connections_version: 0,
            fired_state_refinements: Vec::new(),
            fired_transition_refinements: Vec::new(),
            disabled_refinements: BTreeSet::new(),
            observer: None,
            causality: CausalityAnalyzer::new(false),
        }
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: Policy) {
        if policy.state_dependent_causality != self.causality.state_dependent() {
            self.causality = CausalityAnalyzer::new(policy.state_dependent_causality);
        }
        self.policy = policy;
    }

    pub fn set_observer(&mut self, observer: Box<dyn StepObserver>) {
        self.observer = Some(observer);
    }

    // ----- wiring -----

    /// Bind a refinement under `name`; states and transitions listing
    /// that name in their refinement lists will drive it.
    pub fn bind_refinement(
        &mut self,
        name: impl Into<String>,
        wiring: RefinementWiring,
        actor: Box<dyn Refinement>,
    ) -> KernelResult<()> {
        self.ensure_io();
        let name = name.into();
        let mut input_channels = Vec::with_capacity(wiring.drives_inputs.len());
        for (port, channel) in &wiring.drives_inputs {
            let id = self
                .machine
                .input_id(port)
                .ok_or_else(|| KernelError::UnknownInputPort(port.clone()))?;
            let width = self.machine.input(id).width;
            if *channel >= width {
                return Err(KernelError::ChannelOutOfRange {
                    port: port.clone(),
                    channel: *channel,
                    width,
                });
            }
            input_channels.push((id, *channel));
        }
        let mut output_ports = Vec::with_capacity(wiring.drives_outputs.len());
        for port in &wiring.drives_outputs {
            let id = self
                .machine
                .output_id(port)
                .ok_or_else(|| KernelError::UnknownOutputPort(port.clone()))?;
            output_ports.push(id);
        }
        debug!(refinement = %name, "bound refinement");
        self.refinements.insert(
            name,
            RefinementSlot {
                actor,
                input_channels,
                output_ports,
            },
        );
        // The connection map depends on the bindings.
        self.machine.invalidate();
        Ok(())
    }

    /// Variable table of a named refinement, shared with the actions
    /// that target `name.variable` destinations.
    pub fn refinement_vars(&mut self, name: &str) -> SharedVars {
        self.refinement_var_tables
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn input_handle(&mut self, port: &str, channel: usize) -> KernelResult<InputHandle> {
        self.ensure_io();
        let id = self
            .machine
            .input_id(port)
            .ok_or_else(|| KernelError::UnknownInputPort(port.to_string()))?;
        let channels = &self.inputs[id.0];
        channels
            .get(channel)
            .cloned()
            .ok_or_else(|| KernelError::ChannelOutOfRange {
                port: port.to_string(),
                channel,
                width: channels.len(),
            })
    }

    pub fn output_handle(&mut self, port: &str, channel: usize) -> KernelResult<OutputHandle> {
        self.ensure_io();
        let id = self
            .machine
            .output_id(port)
            .ok_or_else(|| KernelError::UnknownOutputPort(port.to_string()))?;
        let channels = &self.outputs[id.0];
        channels
            .get(channel)
            .cloned()
            .ok_or_else(|| KernelError::ChannelOutOfRange {
                port: port.to_string(),
                channel,
                width: channels.len(),
            })
    }

    pub fn put_input(
        &mut self,
        port: &str,
        channel: usize,
        value: impl Into<Value>,
    ) -> KernelResult<()> {
        let handle = self.input_handle(port, channel)?;
        handle.borrow_mut().put(value.into());
        Ok(())
    }

    /// Declare that a channel receives no token this iteration.
    pub fn set_input_absent(&mut self, port: &str, channel: usize) -> KernelResult<()> {
        let handle = self.input_handle(port, channel)?;
        handle.borrow_mut().mark_absent();
        Ok(())
    }

    /// Retract a channel's status, as a backtracking solver does.
    pub fn mark_input_unknown(&mut self, port: &str, channel: usize) -> KernelResult<()> {
        let handle = self.input_handle(port, channel)?;
        handle.borrow_mut().mark_unknown();
        Ok(())
    }

    pub fn output_state(&mut self, port: &str, channel: usize) -> KernelResult<OutputState> {
        let handle = self.output_handle(port, channel)?;
        let state = handle.borrow().state().clone();
        Ok(state)
    }

    // ----- lifecycle -----

    /// Move to the configured initial state and reset all runtime
    /// state, including bound refinements.
    pub fn initialize(&mut self) -> KernelResult<()> {
        let name = self
            .machine
            .initial_state_name()
            .ok_or_else(|| KernelError::NoInitialState {
                machine: self.machine.name().to_string(),
            })?
            .to_string();
        let initial =
            self.machine
                .state_id(&name)
                .ok_or_else(|| KernelError::UnknownInitialState {
                    machine: self.machine.name().to_string(),
                    name: name.clone(),
                })?;
        self.ensure_io();

        self.current = Some(initial);
        self.last_chosen = None;
        self.previously_chosen.clear();
        self.reached_final = false;
        self.stop_requested = false;
        self.model_error = false;
        self.found_unknown = false;
        self.fired_state_refinements.clear();
        self.fired_transition_refinements.clear();
        self.disabled_refinements.clear();

        self.scope.shadow.clear();
        self.scope.error_message = None;
        self.scope.reset_variables(&self.machine);
        for table in self.refinement_var_tables.values() {
            table.borrow_mut().clear();
        }

        for channels in &self.inputs {
            for handle in channels {
                handle.borrow_mut().clear();
            }
        }
        for channels in &self.outputs {
            for handle in channels {
                handle.borrow_mut().reset();
            }
        }
        for port in &mut self.drained {
            for channel in port {
                channel.clear();
            }
        }

        let owner = self.machine.name().to_string();
        for (name, slot) in self.refinements.iter_mut() {
            slot.actor
                .initialize()
                .map_err(|source| KernelError::RefinementFailed {
                    name: name.clone(),
                    owner: owner.clone(),
                    source: Box::new(source),
                })?;
        }
        self.refresh_connections();

        info!(machine = self.machine.name(), state = %name, "initialized");
        Ok(())
    }

    /// Readiness check at the start of an iteration. Clears the
    /// transition chosen by the previous iteration's final fire.
    pub fn prefire(&mut self) -> KernelResult<bool> {
        self.last_chosen = None;
        Ok(true)
    }

    /// One fire pass. Reads inputs, selects a transition, runs its
    /// choice actions and fires refinements. Never moves the current
    /// state, so the scheduler may call it repeatedly with refreshed
    /// inputs before committing.
    pub fn fire(&mut self) -> KernelResult<()> {
        let current = self.current.ok_or(KernelError::NotInitialized)?;
        if self.machine.state(current).is_none() {
            return Err(KernelError::CurrentStateRemoved);
        }
        self.ensure_io();
        self.idents.ensure(&self.machine);
        debug!(
            machine = self.machine.name(),
            state = %self.machine.qualified_state_name(current),
            "fire"
        );

        self.read_inputs();
        self.last_chosen = None;
        self.fired_state_refinements.clear();
        self.fired_transition_refinements.clear();

        let lists = self.machine.transition_lists(current)?;

        if let Some(id) = self.select(current, &lists.preemptive)? {
            // The current state's refinements provably do not run, so
            // whatever channels only they could drive settle absent.
            self.record_choice(id)?;
            self.clear_preempted_refinements(current)?;
        } else if !self.found_unknown {
            self.fire_current_refinements(current, !lists.error.is_empty())?;

            if self.model_error {
                let chosen = self.select(current, &lists.error)?;
                self.model_error = false;
                if let Some(id) = chosen {
                    self.record_choice(id)?;
                    // The error pass ends the firing; outputs stay as
                    // the error transition left them.
                    return Ok(());
                }
            }

            self.refresh_refinement_channels()?;
            if let Some(id) = self.select(current, &lists.nonpreemptive)? {
                self.record_choice(id)?;
            }
        }

        if self.policy.assert_absent && !self.found_unknown {
            self.assert_absent_outputs();
        }
        Ok(())
    }

    /// Commit the iteration: postfire fired refinements, run the
    /// chosen transition's commit actions, move the state pointer.
    /// Returns false once a final state is reached or a stop was
    /// requested.
    pub fn postfire(&mut self) -> KernelResult<bool> {
        if self.current.is_none() {
            return Err(KernelError::NotInitialized);
        }
        self.ensure_io();
        debug!(machine = self.machine.name(), "postfire");

        // A refinement bowing out retires it; it does not stop the
        // machine.
        let fired = std::mem::take(&mut self.fired_state_refinements);
        for name in &fired {
            self.postfire_refinement(name)?;
        }

        // Nondeterministic choices stay stable within one iteration
        // only.
        self.previously_chosen.clear();

        self.commit()?;
        self.last_chosen = None;

        let fired = std::mem::take(&mut self.fired_transition_refinements);
        for name in &fired {
            self.postfire_refinement(name)?;
        }

        self.reset_iteration_io();
        Ok(!self.reached_final && !self.stop_requested)
    }

    /// Latch a stop: commit actions in progress are cut short and the
    /// next postfire returns false.
    pub fn request_stop(&mut self) {
        info!(machine = self.machine.name(), "stop requested");
        self.stop_requested = true;
    }

    // ----- accessors -----

    pub fn current_state(&self) -> Option<StateId> {
        self.current
    }

    pub fn current_state_name(&self) -> Option<&str> {
        self.current
            .and_then(|id| self.machine.state(id))
            .map(|s| s.name())
    }

    /// The transition selected by the most recent fire, if any.
    pub fn last_chosen_transition(&self) -> Option<TransitionId> {
        self.last_chosen
    }

    /// Whether the most recent guard pass saw an undecided guard or
    /// choice action.
    pub fn found_unknown(&self) -> bool {
        self.found_unknown
    }

    pub fn reached_final(&self) -> bool {
        self.reached_final
    }

    pub fn variable(&self, name: &str) -> Option<&VarValue> {
        self.scope.variable(name)
    }

    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.scope.set_variable(name, VarValue::Defined(value));
    }

    // ----- causality -----

    pub fn dependency(&self, input: &str, output: &str) -> KernelResult<Dependency> {
        let input = self
            .machine
            .input_id(input)
            .ok_or_else(|| KernelError::UnknownInputPort(input.to_string()))?;
        let output = self
            .machine
            .output_id(output)
            .ok_or_else(|| KernelError::UnknownOutputPort(output.to_string()))?;
        self.causality
            .dependency(&self.machine, self.current, input, output)
    }

    pub fn equivalence_classes(&self) -> KernelResult<Vec<BTreeSet<InputPortId>>> {
        self.causality
            .equivalence_classes(&self.machine, self.current)
    }

    // ----- internals -----

    /// Rebuild channel storage after a port edit, keeping handles for
    /// channels that survive so external drivers stay wired.
    fn ensure_io(&mut self) {
        if self.io_version == self.machine.ports_version() {
            return;
        }
        let mut inputs: Vec<Vec<InputHandle>> = Vec::new();
        let mut drained: Vec<Vec<Vec<Value>>> = Vec::new();
        for (id, port) in self.machine.inputs() {
            let mut channels = Vec::with_capacity(port.width);
            for c in 0..port.width {
                let handle = self
                    .inputs
                    .get(id.0)
                    .and_then(|chs| chs.get(c))
                    .cloned()
                    .unwrap_or_default();
                channels.push(handle);
            }
            inputs.push(channels);
            drained.push(vec![Vec::new(); port.width]);
        }
        let mut outputs: Vec<Vec<OutputHandle>> = Vec::new();
        for (id, port) in self.machine.outputs() {
            let mut channels = Vec::with_capacity(port.width);
            for c in 0..port.width {
                let handle = self
                    .outputs
                    .get(id.0)
                    .and_then(|chs| chs.get(c))
                    .cloned()
                    .unwrap_or_default();
                channels.push(handle);
            }
            outputs.push(channels);
        }
        self.inputs = inputs;
        self.outputs = outputs;
        self.drained = drained;
        self.io_version = self.machine.ports_version();
        trace!(version = self.io_version, "rebuilt channel storage");
    }

    fn read_inputs(&mut self) {
        for id in 0..self.inputs.len() {
            for channel in 0..self.inputs[id].len() {
                self.read_channel(InputPortId(id), channel);
            }
        }
    }

    /// Refresh the shadow identifiers of one channel from its cell,
    /// consuming tokens per the transfer policy.
    fn read_channel(&mut self, port: InputPortId, channel: usize) {
        let name = self.machine.input(port).name.clone();
        let handle = self.inputs[port.0][channel].clone();

        if !handle.borrow().is_known() {
            self.write_shadow(
                &name,
                channel,
                Outcome::Unknown,
                Outcome::Unknown,
                Outcome::Unknown,
            );
            return;
        }

        match self.policy.transfer {
            TransferPolicy::OnePerFiring => {
                let token = handle.borrow_mut().read();
                match token {
                    Some(v) => {
                        trace!(port = %name, channel, value = %v, "read token");
                        self.write_shadow(
                            &name,
                            channel,
                            Outcome::Defined(v),
                            Outcome::Defined(Value::Bool(true)),
                            Outcome::Absent,
                        );
                    }
                    None => self.write_shadow(
                        &name,
                        channel,
                        Outcome::Absent,
                        Outcome::Defined(Value::Bool(false)),
                        Outcome::Absent,
                    ),
                }
            }
            TransferPolicy::DrainAll => {
                {
                    let mut cell = handle.borrow_mut();
                    while let Some(v) = cell.read() {
                        // Newest first, matching the order guards see
                        // in the array identifiers.
                        self.drained[port.0][channel].insert(0, v);
                    }
                }
                let (value, presence, array) = {
                    let drained = &self.drained[port.0][channel];
                    if drained.is_empty() {
                        (
                            Outcome::Absent,
                            Outcome::Defined(Value::Bool(false)),
                            Outcome::Absent,
                        )
                    } else {
                        (
                            Outcome::Defined(drained[0].clone()),
                            Outcome::Defined(Value::Bool(true)),
                            Outcome::Defined(Value::array(drained.clone())),
                        )
                    }
                };
                self.write_shadow(&name, channel, value, presence, array);
            }
        }
    }

    fn write_shadow(
        &mut self,
        port: &str,
        channel: usize,
        value: Outcome,
        presence: Outcome,
        array: Outcome,
    ) {
        let shadow = &mut self.scope.shadow;
        shadow.insert(value_name(port, channel), value.clone());
        shadow.insert(presence_name(port, channel), presence.clone());
        shadow.insert(array_name(port, channel), array.clone());
        if channel == 0 {
            shadow.insert(port.to_string(), value);
            shadow.insert(format!("{port}_isPresent"), presence);
            shadow.insert(format!("{port}Array"), array);
        }
    }

    /// Run a guard pass over `candidates` and pick at most one.
    fn select(
        &mut self,
        state: StateId,
        candidates: &[TransitionId],
    ) -> KernelResult<Option<TransitionId>> {
        let view = EvalScope {
            shadow: &self.scope.shadow,
            vars: &self.scope.vars,
            error_message: self.scope.error_message.as_ref(),
            idents: &self.idents,
        };
        let enabled =
            enabled_transitions(&self.machine, candidates, &view, self.policy.selection)?;
        self.found_unknown = enabled.found_unknown;
        choose(
            &self.machine,
            state,
            &enabled,
            &self.previously_chosen,
            &mut self.rng,
        )
    }

    /// Execute a chosen transition's choice actions and fire its
    /// refinements, and remember it for postfire.
    fn record_choice(&mut self, id: TransitionId) -> KernelResult<()> {
        debug!(transition = %self.machine.qualified_name(id), "chose transition");
        self.run_actions(id, ActionKind::Choice)?;
        self.fire_transition_refinements(id)?;
        self.previously_chosen.insert(id);
        self.last_chosen = Some(id);
        if let Some(observer) = &mut self.observer {
            observer.transition_chosen(&self.machine, id);
        }
        Ok(())
    }

    fn fire_transition_refinements(&mut self, id: TransitionId) -> KernelResult<()> {
        if self.policy.refinements == RefinementPolicy::Skip {
            return Ok(());
        }
        let names: Vec<String> = match self.machine.transition(id) {
            Some(tr) => tr.refinements().to_vec(),
            None => return Ok(()),
        };
        if names.is_empty() {
            return Ok(());
        }
        let owner = self.machine.qualified_name(id);
        for name in names {
            if self.stop_requested || self.disabled_refinements.contains(&name) {
                continue;
            }
            let Some(slot) = self.refinements.get_mut(&name) else {
                trace!(refinement = %name, "no binding; skipped");
                continue;
            };
            let ready = slot
                .actor
                .prefire()
                .map_err(|source| KernelError::RefinementFailed {
                    name: name.clone(),
                    owner: owner.clone(),
                    source: Box::new(source),
                })?;
            if ready {
                trace!(refinement = %name, "fire transition refinement");
                slot.actor
                    .fire()
                    .map_err(|source| KernelError::RefinementFailed {
                        name: name.clone(),
                        owner: owner.clone(),
                        source: Box::new(source),
                    })?;
                self.fired_transition_refinements.push(name);
            }
        }
        Ok(())
    }

    /// Fire the current state's refinements. When the state has error
    /// transitions, a refinement failure latches the model error and
    /// binds `errorMessage` instead of propagating.
    fn fire_current_refinements(
        &mut self,
        current: StateId,
        absorb_errors: bool,
    ) -> KernelResult<()> {
        if self.policy.refinements == RefinementPolicy::Skip {
            return Ok(());
        }
        let names: Vec<String> = match self.machine.state(current) {
            Some(s) => s.refinements().to_vec(),
            None => return Ok(()),
        };
        if names.is_empty() {
            return Ok(());
        }
        let owner = self.machine.qualified_state_name(current);
        for name in names {
            if self.stop_requested {
                break;
            }
            if self.disabled_refinements.contains(&name) {
                continue;
            }
            let Some(slot) = self.refinements.get_mut(&name) else {
                trace!(refinement = %name, "no binding; skipped");
                continue;
            };
            let ready = slot
                .actor
                .prefire()
                .map_err(|source| KernelError::RefinementFailed {
                    name: name.clone(),
                    owner: owner.clone(),
                    source: Box::new(source),
                })?;
            if !ready {
                trace!(refinement = %name, "not ready; skipped");
                continue;
            }
            trace!(refinement = %name, "fire state refinement");
            match slot.actor.fire() {
                Ok(()) => self.fired_state_refinements.push(name),
                Err(source) => {
                    if absorb_errors {
                        warn!(
                            refinement = %name,
                            error = %source,
                            "refinement failed; offering error transitions"
                        );
                        self.model_error = true;
                        self.scope.error_message = Some(Value::string(source.to_string()));
                        break;
                    }
                    return Err(KernelError::RefinementFailed {
                        name,
                        owner,
                        source: Box::new(source),
                    });
                }
            }
        }
        Ok(())
    }

    /// A preemptive transition was chosen, so the current state's
    /// refinements do not run: their declared channels settle absent
    /// unless something already wrote them.
    fn clear_preempted_refinements(&mut self, current: StateId) -> KernelResult<()> {
        if self.policy.refinements == RefinementPolicy::Skip {
            return Ok(());
        }
        let names: Vec<String> = match self.machine.state(current) {
            Some(s) => s.refinements().to_vec(),
            None => return Ok(()),
        };
        for name in &names {
            let Some(slot) = self.refinements.get(name) else {
                continue;
            };
            for &port in &slot.output_ports {
                for handle in &self.outputs[port.0] {
                    let mut cell = handle.borrow_mut();
                    if cell.status() == Status::Unknown {
                        trace!(
                            port = %self.machine.output(port).name,
                            "preempted refinement output settled absent"
                        );
                        cell.clear();
                    }
                }
            }
            for &(input, channel) in &slot.input_channels {
                let mut cell = self.inputs[input.0][channel].borrow_mut();
                if cell.status() == Status::Unknown {
                    cell.mark_absent();
                }
            }
        }
        self.refresh_refinement_channels()
    }

    /// Re-read the channels the current state's refinements drive, so
    /// guards evaluated after the refinements fired see their outputs.
    fn refresh_refinement_channels(&mut self) -> KernelResult<()> {
        if self.connections_version != self.machine.version() {
            self.refresh_connections();
        }
        if self.connections.is_empty() {
            return Ok(());
        }
        let connections = self.connections.clone();
        for (port, channel) in connections {
            self.read_channel(port, channel);
        }
        Ok(())
    }

    fn refresh_connections(&mut self) {
        self.connections_version = self.machine.version();
        self.connections.clear();
        let Some(current) = self.current else {
            return;
        };
        let Some(state) = self.machine.state(current) else {
            return;
        };
        for name in state.refinements() {
            if let Some(slot) = self.refinements.get(name) {
                self.connections.extend(slot.input_channels.iter().copied());
            }
        }
        trace!(channels = self.connections.len(), "connection map rebuilt");
    }

    /// Execute one action script of a transition against the current
    /// scope.
    fn run_actions(&mut self, id: TransitionId, kind: ActionKind) -> KernelResult<()> {
        self.idents.ensure(&self.machine);
        let Some(tr) = self.machine.transition(id) else {
            return Err(KernelError::InvalidTransitionId(id.0));
        };
        let script = match kind {
            ActionKind::Choice => tr.choice_actions(),
            ActionKind::Commit => tr.commit_actions(),
        };
        if script.is_empty() {
            return Ok(());
        }
        let owner = self.machine.qualified_name(id);
        let dests = script.resolved(&self.machine, &owner)?;

        for (clause, dest) in script.clauses().iter().zip(dests.iter()) {
            if kind == ActionKind::Commit && self.stop_requested {
                break;
            }
            let view = EvalScope {
                shadow: &self.scope.shadow,
                vars: &self.scope.vars,
                error_message: self.scope.error_message.as_ref(),
                idents: &self.idents,
            };
            let outcome =
                eval(&clause.expr, &view).map_err(|source| KernelError::ActionEvaluation {
                    transition: owner.clone(),
                    dest: clause.dest.display_name(),
                    source,
                })?;

            match dest {
                ResolvedDest::Output { port, channel } => {
                    if kind == ActionKind::Commit {
                        warn!(
                            port = %self.machine.output(*port).name,
                            transition = %owner,
                            "commit action writes an output port"
                        );
                    }
                    let handles = &self.outputs[port.0];
                    let targets = match channel {
                        Some(c) => std::slice::from_ref(&handles[*c]),
                        None => handles.as_slice(),
                    };
                    match &outcome {
                        Outcome::Defined(v) => {
                            trace!(dest = %clause.dest.display_name(), value = %v, "write output");
                            for handle in targets {
                                handle.borrow_mut().write(v.clone());
                            }
                        }
                        Outcome::Unknown => {
                            // The channel stays unknown; the fixed
                            // point has not settled.
                            if kind == ActionKind::Choice {
                                self.found_unknown = true;
                            }
                        }
                        Outcome::Absent => {
                            for handle in targets {
                                handle.borrow_mut().clear();
                            }
                        }
                    }
                }
                ResolvedDest::Variable { name } => {
                    let value = match &outcome {
                        Outcome::Defined(v) => VarValue::Defined(v.clone()),
                        Outcome::Unknown | Outcome::Absent => VarValue::Unknown,
                    };
                    trace!(variable = %name, "set variable");
                    self.scope.vars.insert(name.clone(), value);
                }
                ResolvedDest::RefinementVar { refinement, name } => {
                    let value = match &outcome {
                        Outcome::Defined(v) => VarValue::Defined(v.clone()),
                        Outcome::Unknown | Outcome::Absent => VarValue::Unknown,
                    };
                    trace!(refinement = %refinement, variable = %name, "set refinement variable");
                    let table = self
                        .refinement_var_tables
                        .entry(refinement.clone())
                        .or_default();
                    table.borrow_mut().insert(name.clone(), value);
                }
            }
        }
        Ok(())
    }

    /// End of a decided fire: output channels nothing can write
    /// anymore settle absent. Ports a fired refinement declares stay
    /// untouched, since its tokens may still be in flight.
    fn assert_absent_outputs(&self) {
        let mut protected: BTreeSet<OutputPortId> = BTreeSet::new();
        for name in self
            .fired_state_refinements
            .iter()
            .chain(self.fired_transition_refinements.iter())
        {
            if let Some(slot) = self.refinements.get(name) {
                protected.extend(slot.output_ports.iter().copied());
            }
        }
        for (id, port) in self.machine.outputs() {
            if protected.contains(&id) {
                continue;
            }
            for handle in &self.outputs[id.0] {
                let mut cell = handle.borrow_mut();
                if cell.status() == Status::Unknown {
                    trace!(port = %port.name, "asserting absent output");
                    cell.clear();
                }
            }
        }
    }

    fn postfire_refinement(&mut self, name: &str) -> KernelResult<()> {
        let owner = self.machine.name().to_string();
        let Some(slot) = self.refinements.get_mut(name) else {
            return Ok(());
        };
        let keep = slot
            .actor
            .postfire()
            .map_err(|source| KernelError::RefinementFailed {
                name: name.to_string(),
                owner,
                source: Box::new(source),
            })?;
        if !keep {
            debug!(refinement = %name, "refinement retired until reset");
            self.disabled_refinements.insert(name.to_string());
        }
        Ok(())
    }

    fn commit(&mut self) -> KernelResult<()> {
        let Some(id) = self.last_chosen else {
            trace!("no transition chosen; state unchanged");
            return Ok(());
        };
        let (dest, is_reset) = {
            let Some(tr) = self.machine.transition(id) else {
                return Err(KernelError::InvalidTransitionId(id.0));
            };
            (tr.dest(), tr.is_reset())
        };
        let Some(dest_state) = self.machine.state(dest) else {
            return Err(KernelError::DanglingTransition {
                transition: self.machine.qualified_name(id),
            });
        };
        let init_entry = dest_state.init_entry();

        // Reset entry reinitializes the destination's refinements
        // before the commit actions run, so an action targeting a
        // refinement variable survives the reset.
        if is_reset || init_entry {
            self.initialize_state_refinements(dest)?;
        }

        self.run_actions(id, ActionKind::Commit)?;

        debug!(
            transition = %self.machine.qualified_name(id),
            state = %self.machine.qualified_state_name(dest),
            "committed transition"
        );
        self.current = Some(dest);
        if self.machine.is_final(dest) {
            debug!(
                state = %self.machine.qualified_state_name(dest),
                "reached final state"
            );
            self.reached_final = true;
        }
        self.refresh_connections();
        if let Some(observer) = &mut self.observer {
            observer.state_committed(&self.machine, dest);
        }
        Ok(())
    }

    fn initialize_state_refinements(&mut self, state: StateId) -> KernelResult<()> {
        let names: Vec<String> = match self.machine.state(state) {
            Some(s) => s.refinements().to_vec(),
            None => return Ok(()),
        };
        let owner = self.machine.qualified_state_name(state);
        for name in names {
            let Some(slot) = self.refinements.get_mut(&name) else {
                continue;
            };
            debug!(refinement = %name, "reinitializing refinement");
            slot.actor
                .initialize()
                .map_err(|source| KernelError::RefinementFailed {
                    name: name.clone(),
                    owner: owner.clone(),
                    source: Box::new(source),
                })?;
            self.disabled_refinements.remove(&name);
            if let Some(table) = self.refinement_var_tables.get(&name) {
                table.borrow_mut().clear();
            }
        }
        Ok(())
    }

    /// Iteration boundary: input statuses revert to unknown with
    /// unread tokens carried over, outputs revert to unknown, shadow
    /// identifiers and drain buffers are dropped.
    fn reset_iteration_io(&mut self) {
        for channels in &self.inputs {
            for handle in channels {
                handle.borrow_mut().reset_known();
            }
        }
        for channels in &self.outputs {
            for handle in channels {
                handle.borrow_mut().reset();
            }
        }
        for port in &mut self.drained {
            for channel in port {
                channel.clear();
            }
        }
        self.scope.shadow.clear();
    }
}

/// An engine can itself refine a state of an enclosing machine.
impl Refinement for Engine {
    fn initialize(&mut self) -> KernelResult<()> {
        Engine::initialize(self)
    }

    fn prefire(&mut self) -> KernelResult<bool> {
        Engine::prefire(self)
    }

    fn fire(&mut self) -> KernelResult<()> {
        Engine::fire(self)
    }

    fn postfire(&mut self) -> KernelResult<bool> {
        Engine::postfire(self)
    }
}
