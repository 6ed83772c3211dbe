//! Action scripts attached to transitions.
//!
//! Scripts are parsed when the text is set, so execution never sees
//! malformed text. Destinations are resolved against the machine
//! structure lazily and cached per version: a bare name is an output
//! port if one matches, otherwise a declared variable; qualified
//! `refinement.name` destinations bind lazily at execution time.

use std::cell::RefCell;
use std::rc::Rc;

use modal_syntax::{parse_actions, ActionClause, ParseResult};

use crate::error::{KernelError, KernelResult};
use crate::graph::{Machine, OutputPortId};

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedDest {
    /// Write an output port; `channel` of `None` broadcasts to every
    /// channel of the port.
    Output {
        port: OutputPortId,
        channel: Option<usize>,
    },
    /// Write a machine variable.
    Variable { name: String },
    /// Write a variable in the scope of a named refinement, created
    /// on first write.
    RefinementVar { refinement: String, name: String },
}

#[derive(Debug, Default)]
pub struct ActionScript {
    text: String,
    clauses: Vec<ActionClause>,
    resolved: RefCell<Option<(u64, Rc<[ResolvedDest]>)>>,
}

impl ActionScript {
    pub fn empty() -> Self {
        ActionScript::default()
    }

    pub fn parse(text: &str) -> ParseResult<ActionScript> {
        let clauses = parse_actions(text)?;
        Ok(ActionScript {
            text: text.to_string(),
            clauses,
            resolved: RefCell::new(None),
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Clauses in script order; `resolved` is index-parallel to this.
    pub fn clauses(&self) -> &[ActionClause] {
        &self.clauses
    }

    /// Destinations resolved against the current structure, cached per
    /// machine version. `owner` is the qualified transition name for
    /// diagnostics.
    pub fn resolved(&self, machine: &Machine, owner: &str) -> KernelResult<Rc<[ResolvedDest]>> {
        if let Some((version, dests)) = &*self.resolved.borrow() {
            if *version == machine.version() {
                return Ok(dests.clone());
            }
        }
        let mut dests = Vec::with_capacity(self.clauses.len());
        for clause in &self.clauses {
            let d = &clause.dest;
            let resolved = if let Some(qualifier) = &d.qualifier {
                ResolvedDest::RefinementVar {
                    refinement: qualifier.clone(),
                    name: d.name.clone(),
                }
            } else if let Some(port) = machine.output_id(&d.name) {
                if let Some(channel) = d.channel {
                    let width = machine.output(port).width;
                    if channel >= width {
                        return Err(KernelError::ChannelOutOfRange {
                            port: d.name.clone(),
                            channel,
                            width,
                        });
                    }
                }
                ResolvedDest::Output {
                    port,
                    channel: d.channel,
                }
            } else if machine.variable(&d.name).is_some() {
                ResolvedDest::Variable {
                    name: d.name.clone(),
                }
            } else {
                return Err(KernelError::UnresolvedDestination {
                    transition: owner.to_string(),
                    name: d.display_name(),
                });
            };
            dests.push(resolved);
        }
        let dests: Rc<[ResolvedDest]> = dests.into();
        *self.resolved.borrow_mut() = Some((machine.version(), dests.clone()));
        Ok(dests)
    }
}
