//! Sub-actors hosted by states and transitions.
//!
//! A refinement follows the same four-phase protocol as the engine
//! itself, so a nested machine can refine a state of an outer one.
//! Data moves through the shared channel handles the engine hands out;
//! the wiring declared here only tells the engine which channels to
//! re-read after the refinement fires and which output ports to spare
//! from the absent sweep.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::KernelResult;
use crate::graph::{InputPortId, OutputPortId};
use crate::scope::VarValue;

/// Variables owned by one refinement, addressable from actions through
/// a `refinement.variable` destination.
pub type VarTable = BTreeMap<String, VarValue>;

pub type SharedVars = Rc<RefCell<VarTable>>;

pub trait Refinement {
    fn initialize(&mut self) -> KernelResult<()> {
        Ok(())
    }

    /// Returning false skips this refinement's fire for the iteration.
    fn prefire(&mut self) -> KernelResult<bool> {
        Ok(true)
    }

    fn fire(&mut self) -> KernelResult<()> {
        Ok(())
    }

    /// Returning false retires the refinement until its hosting state
    /// is re-entered through a reset transition.
    fn postfire(&mut self) -> KernelResult<bool> {
        Ok(true)
    }
}

/// Declares which machine channels a refinement touches.
#[derive(Debug, Clone, Default)]
pub struct RefinementWiring {
    pub(crate) drives_inputs: Vec<(String, usize)>,
    pub(crate) drives_outputs: Vec<String>,
}

impl RefinementWiring {
    pub fn new() -> Self {
        Self::default()
    }

    /// The refinement writes into channel `channel` of machine input
    /// `port`. Guards evaluated after it fires see the refreshed value.
    pub fn drives_input(mut self, port: impl Into<String>, channel: usize) -> Self {
        self.drives_inputs.push((port.into(), channel));
        self
    }

    /// The refinement writes machine output `port` directly.
    pub fn drives_output(mut self, port: impl Into<String>) -> Self {
        self.drives_outputs.push(port.into());
        self
    }
}

/// A bound refinement with its wiring resolved to port ids.
pub(crate) struct RefinementSlot {
    pub(crate) actor: Box<dyn Refinement>,
    pub(crate) input_channels: Vec<(InputPortId, usize)>,
    pub(crate) output_ports: Vec<OutputPortId>,
}
