//! Execution engine for hierarchical modal state machines.
//!
//! A [`Machine`] holds the structure: states, guarded transitions,
//! ports, variables. An [`Engine`] executes it under the two-phase
//! protocol of a host scheduler: `fire` reads inputs, selects at most
//! one enabled transition and runs its choice actions without moving
//! the current state; `postfire` commits the choice, runs commit
//! actions and advances. `fire` may run several times per iteration
//! while a fixed-point scheduler converges, so everything it does is
//! replayable.
//!
//! States and transitions can name [`Refinement`]s, sub-actors the
//! engine drives with the same protocol while their state is current.
//! The [`causality`] module computes which outputs depend on which
//! inputs, the interface a fixed-point scheduler needs.

pub mod actions;
pub mod causality;
pub mod engine;
pub mod error;
pub mod graph;
pub mod ports;
pub mod refinement;
pub mod scope;
pub mod select;

pub use actions::{ActionScript, ResolvedDest};
pub use causality::{CausalityAnalyzer, Dependency};
pub use engine::{Engine, Policy, RefinementPolicy, StepObserver, TransferPolicy};
pub use error::{KernelError, KernelResult};
pub use graph::{
    InputPort, InputPortId, Machine, OutputPort, OutputPortId, State, StateId, Transition,
    TransitionId, TransitionLists,
};
pub use ports::{InputChannel, InputHandle, OutputHandle, OutputSlot, OutputState, Status};
pub use refinement::{Refinement, RefinementWiring, SharedVars, VarTable};
pub use scope::{IdentifierTable, MachineScope, PortRef, RefKind, VarValue};
pub use select::{EmptyGuardPolicy, Enabled, SelectionPolicy, TriggerPolicy};

pub use modal_eval::{Outcome, Scope, Value};
