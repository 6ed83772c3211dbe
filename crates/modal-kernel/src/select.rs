//! Transition selection: guard evaluation over a candidate list and
//! the choice among enabled transitions.

use std::collections::BTreeSet;

use modal_eval::{eval, Outcome, Scope, Value};
use rand::rngs::StdRng;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::error::{KernelError, KernelResult};
use crate::graph::{GuardExpr, Machine, StateId, Transition, TransitionId};

/// What to do with a transition whose guard text is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyGuardPolicy {
    /// Surface a configuration error when the transition is examined.
    #[default]
    Reject,
    /// Treat the transition as never enabled.
    Disable,
}

/// What to do when a trigger is true while its guard is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerPolicy {
    #[default]
    HardError,
    /// Log the violation and treat the transition as disabled.
    DisableSilently,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionPolicy {
    pub empty_guard: EmptyGuardPolicy,
    pub trigger: TriggerPolicy,
}

/// Result of one guard pass over a candidate list.
#[derive(Debug, Default)]
pub struct Enabled {
    pub transitions: SmallVec<[TransitionId; 4]>,
    /// Some guard could not be decided because a channel status it
    /// reads is still unknown.
    pub found_unknown: bool,
}

enum GuardOutcome {
    Enabled,
    Disabled,
    Undecided,
}

/// Evaluate guards over `candidates` and collect the enabled set.
/// Default transitions become eligible only when no regular candidate
/// is enabled and every guard was decided.
pub fn enabled_transitions(
    machine: &Machine,
    candidates: &[TransitionId],
    scope: &dyn Scope,
    policy: SelectionPolicy,
) -> KernelResult<Enabled> {
    let mut enabled = Enabled::default();
    let mut defaults: SmallVec<[TransitionId; 4]> = SmallVec::new();
    for &id in candidates {
        let Some(tr) = machine.transition(id) else {
            continue;
        };
        match guard_outcome(machine, id, tr, scope, policy)? {
            GuardOutcome::Enabled => {
                if tr.is_default() {
                    defaults.push(id);
                } else {
                    enabled.transitions.push(id);
                }
            }
            GuardOutcome::Disabled => {}
            GuardOutcome::Undecided => enabled.found_unknown = true,
        }
    }
    if enabled.transitions.is_empty() && !enabled.found_unknown {
        enabled.transitions = defaults;
    }
    debug!(
        enabled = enabled.transitions.len(),
        found_unknown = enabled.found_unknown,
        "guard pass"
    );
    Ok(enabled)
}

fn guard_outcome(
    machine: &Machine,
    id: TransitionId,
    tr: &Transition,
    scope: &dyn Scope,
    policy: SelectionPolicy,
) -> KernelResult<GuardOutcome> {
    if tr.guard().is_empty() {
        return match policy.empty_guard {
            EmptyGuardPolicy::Reject => Err(KernelError::EmptyGuard {
                transition: machine.qualified_name(id),
            }),
            EmptyGuardPolicy::Disable => Ok(GuardOutcome::Disabled),
        };
    }
    match eval_expression(machine, id, tr.guard(), scope)? {
        Outcome::Defined(Value::Bool(true)) => {
            trace!(transition = %tr.name(), "guard true");
            Ok(GuardOutcome::Enabled)
        }
        Outcome::Defined(Value::Bool(false)) => {
            check_trigger(machine, id, tr, scope, policy)?;
            Ok(GuardOutcome::Disabled)
        }
        Outcome::Defined(v) => Err(KernelError::GuardNotBoolean {
            transition: machine.qualified_name(id),
            text: tr.guard().text().to_string(),
            actual: v.type_name().to_string(),
        }),
        Outcome::Unknown => {
            trace!(transition = %tr.name(), "guard undecided");
            Ok(GuardOutcome::Undecided)
        }
        Outcome::Absent => {
            // Reading an absent value disables the transition.
            check_trigger(machine, id, tr, scope, policy)?;
            Ok(GuardOutcome::Disabled)
        }
    }
}

/// A true trigger paired with a false guard means an event arrived
/// that the state cannot react to.
fn check_trigger(
    machine: &Machine,
    id: TransitionId,
    tr: &Transition,
    scope: &dyn Scope,
    policy: SelectionPolicy,
) -> KernelResult<()> {
    let Some(trigger) = tr.trigger() else {
        return Ok(());
    };
    match eval_expression(machine, id, trigger, scope)? {
        Outcome::Defined(Value::Bool(true)) => match policy.trigger {
            TriggerPolicy::HardError => Err(KernelError::TriggerWithoutGuard {
                transition: machine.qualified_name(id),
                guard: tr.guard().text().to_string(),
            }),
            TriggerPolicy::DisableSilently => {
                warn!(
                    transition = %machine.qualified_name(id),
                    guard = tr.guard().text(),
                    "trigger is true while guard is false"
                );
                Ok(())
            }
        },
        Outcome::Defined(Value::Bool(false)) | Outcome::Unknown | Outcome::Absent => Ok(()),
        Outcome::Defined(v) => Err(KernelError::GuardNotBoolean {
            transition: machine.qualified_name(id),
            text: trigger.text().to_string(),
            actual: v.type_name().to_string(),
        }),
    }
}

fn eval_expression(
    machine: &Machine,
    id: TransitionId,
    expr: &GuardExpr,
    scope: &dyn Scope,
) -> KernelResult<Outcome> {
    let compiled =
        expr.compiled(machine.version())
            .map_err(|source| KernelError::ExpressionSyntax {
                transition: machine.qualified_name(id),
                text: expr.text().to_string(),
                source,
            })?;
    eval(&compiled, scope).map_err(|source| KernelError::GuardEvaluation {
        transition: machine.qualified_name(id),
        text: expr.text().to_string(),
        source,
    })
}

/// Pick one transition from an enabled set.
///
/// More than one enabled transition is allowed only when all of them
/// are marked nondeterministic. A transition already chosen earlier in
/// the same iteration is preferred, so repeated firings at a fixed
/// point do not flip the choice; otherwise the pick is uniform from
/// the engine's seeded generator.
pub fn choose(
    machine: &Machine,
    state: StateId,
    enabled: &Enabled,
    previously_chosen: &BTreeSet<TransitionId>,
    rng: &mut StdRng,
) -> KernelResult<Option<TransitionId>> {
    let list = &enabled.transitions;
    if list.len() <= 1 {
        return Ok(list.first().copied());
    }
    if let Some(&deterministic) = list
        .iter()
        .find(|&&id| machine.transition(id).is_some_and(|t| !t.is_nondeterministic()))
    {
        return Err(KernelError::MultipleEnabledTransitions {
            state: machine.qualified_state_name(state),
            transition: machine.qualified_name(deterministic),
        });
    }
    if let Some(&prev) = list.iter().find(|&&id| previously_chosen.contains(&id)) {
        trace!(transition = %machine.qualified_name(prev), "kept previous choice");
        return Ok(Some(prev));
    }
    use rand::seq::SliceRandom;
    Ok(list.choose(rng).copied())
}
