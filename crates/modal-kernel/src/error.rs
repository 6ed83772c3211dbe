//! Error type shared across the kernel.

use modal_eval::EvalError;
use modal_syntax::ParseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    // Structure
    #[error("machine `{machine}` has no initial state configured")]
    NoInitialState { machine: String },

    #[error("initial state `{name}` does not exist in machine `{machine}`")]
    UnknownInitialState { machine: String, name: String },

    #[error("duplicate name `{0}`")]
    DuplicateName(String),

    #[error("state id {0} is not in the machine")]
    InvalidStateId(usize),

    #[error("transition id {0} is not in the machine")]
    InvalidTransitionId(usize),

    #[error("current state was removed from the machine")]
    CurrentStateRemoved,

    #[error("destination state of `{transition}` was removed")]
    DanglingTransition { transition: String },

    #[error("final state `{state}` has outgoing transition `{transition}`")]
    FinalStateOutgoing { state: String, transition: String },

    #[error("error transition `{transition}` cannot be preemptive")]
    PreemptiveErrorTransition { transition: String },

    #[error("default transition `{transition}` cannot be an error transition")]
    DefaultErrorTransition { transition: String },

    #[error("name list `{text}` on `{owner}` has an empty element")]
    MalformedNameList { owner: String, text: String },

    #[error("no input port named `{0}`")]
    UnknownInputPort(String),

    #[error("no output port named `{0}`")]
    UnknownOutputPort(String),

    #[error("channel {channel} out of range for port `{port}` of width {width}")]
    ChannelOutOfRange {
        port: String,
        channel: usize,
        width: usize,
    },

    // Guards and selection
    #[error("guard of `{transition}` is empty")]
    EmptyGuard { transition: String },

    #[error("failed to parse `{text}` on `{transition}`: {source}")]
    ExpressionSyntax {
        transition: String,
        text: String,
        source: ParseError,
    },

    #[error("`{text}` on `{transition}` failed to evaluate: {source}")]
    GuardEvaluation {
        transition: String,
        text: String,
        source: EvalError,
    },

    #[error("`{text}` on `{transition}` evaluated to {actual}, expected Bool")]
    GuardNotBoolean {
        transition: String,
        text: String,
        actual: String,
    },

    #[error(
        "multiple enabled transitions out of `{state}` but `{transition}` is not nondeterministic"
    )]
    MultipleEnabledTransitions { state: String, transition: String },

    #[error("trigger of `{transition}` is true while its guard `{guard}` is false")]
    TriggerWithoutGuard { transition: String, guard: String },

    // Actions
    #[error("malformed action script on `{owner}`: {source}")]
    ActionSyntax { owner: String, source: ParseError },

    #[error("destination `{name}` on `{transition}` is neither an output port nor a variable")]
    UnresolvedDestination { transition: String, name: String },

    #[error("action `{dest} = ...` on `{transition}` failed: {source}")]
    ActionEvaluation {
        transition: String,
        dest: String,
        source: EvalError,
    },

    // Engine lifecycle
    #[error("engine is not initialized")]
    NotInitialized,

    #[error("refinement `{name}` of `{owner}` failed: {source}")]
    RefinementFailed {
        name: String,
        owner: String,
        source: Box<KernelError>,
    },
}

pub type KernelResult<T> = Result<T, KernelError>;
