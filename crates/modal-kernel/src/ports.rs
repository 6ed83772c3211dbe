//! Channel cells shared between the engine, input drivers and
//! refinements.
//!
//! Every input channel is a FIFO with a known/unknown flag on top:
//! within one iteration a channel is unknown until a driver either
//! queues a token or marks it absent. Reads are destructive. Output
//! channels hold at most one token per iteration and settle from
//! unknown to absent or present as the fixed point converges.
//!
//! Cells are handed out as `Rc<RefCell<_>>` handles so a driver or a
//! refinement can keep writing to a channel the engine reads.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use modal_eval::Value;

/// Presence status of a channel within the current iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Unknown,
    Absent,
    Present,
}

#[derive(Debug, Default)]
pub struct InputChannel {
    queue: VecDeque<Value>,
    known: bool,
}

impl InputChannel {
    pub fn new() -> Self {
        InputChannel::default()
    }

    /// Queue a token. The channel becomes known-present.
    pub fn put(&mut self, value: Value) {
        self.queue.push_back(value);
        self.known = true;
    }

    /// Declare that no token will arrive this iteration.
    pub fn mark_absent(&mut self) {
        self.known = true;
    }

    /// Retract the channel's status for this iteration. Queued tokens
    /// stay where they are.
    pub fn mark_unknown(&mut self) {
        self.known = false;
    }

    pub fn status(&self) -> Status {
        if !self.known {
            Status::Unknown
        } else if self.queue.is_empty() {
            Status::Absent
        } else {
            Status::Present
        }
    }

    pub fn is_known(&self) -> bool {
        self.known
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Destructive read of the oldest token.
    pub fn read(&mut self) -> Option<Value> {
        self.queue.pop_front()
    }

    /// Iteration boundary: status reverts to unknown, unread tokens
    /// carry over.
    pub fn reset_known(&mut self) {
        self.known = false;
    }

    /// Drop everything, for a fresh run.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.known = false;
    }
}

/// The value of an output channel within one iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum OutputState {
    #[default]
    Unknown,
    Absent,
    Present(Value),
}

impl OutputState {
    pub fn status(&self) -> Status {
        match self {
            OutputState::Unknown => Status::Unknown,
            OutputState::Absent => Status::Absent,
            OutputState::Present(_) => Status::Present,
        }
    }
}

#[derive(Debug, Default)]
pub struct OutputSlot {
    state: OutputState,
}

impl OutputSlot {
    pub fn new() -> Self {
        OutputSlot::default()
    }

    /// Make the channel known-present. Writing twice in one iteration
    /// keeps the later token.
    pub fn write(&mut self, value: Value) {
        self.state = OutputState::Present(value);
    }

    /// Make the channel known-absent.
    pub fn clear(&mut self) {
        self.state = OutputState::Absent;
    }

    /// Iteration boundary: back to unknown.
    pub fn reset(&mut self) {
        self.state = OutputState::Unknown;
    }

    pub fn state(&self) -> &OutputState {
        &self.state
    }

    pub fn status(&self) -> Status {
        self.state.status()
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.state {
            OutputState::Present(v) => Some(v),
            _ => None,
        }
    }
}

pub type InputHandle = Rc<RefCell<InputChannel>>;
pub type OutputHandle = Rc<RefCell<OutputSlot>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_channel_statuses() {
        let mut ch = InputChannel::new();
        assert_eq!(ch.status(), Status::Unknown);
        ch.mark_absent();
        assert_eq!(ch.status(), Status::Absent);
        ch.put(Value::Int(1));
        assert_eq!(ch.status(), Status::Present);
        ch.mark_unknown();
        assert_eq!(ch.status(), Status::Unknown);
        assert_eq!(ch.len(), 1);
    }

    #[test]
    fn test_input_channel_fifo() {
        let mut ch = InputChannel::new();
        ch.put(Value::Int(1));
        ch.put(Value::Int(2));
        assert_eq!(ch.read(), Some(Value::Int(1)));
        assert_eq!(ch.read(), Some(Value::Int(2)));
        assert_eq!(ch.read(), None);
        // Draining leaves the channel known-absent.
        assert_eq!(ch.status(), Status::Absent);
    }

    #[test]
    fn test_input_channel_iteration_boundary() {
        let mut ch = InputChannel::new();
        ch.put(Value::Int(1));
        ch.put(Value::Int(2));
        assert_eq!(ch.read(), Some(Value::Int(1)));
        ch.reset_known();
        assert_eq!(ch.status(), Status::Unknown);
        // The unread token survived the boundary.
        assert_eq!(ch.len(), 1);
        ch.clear();
        assert_eq!(ch.len(), 0);
    }

    #[test]
    fn test_output_slot() {
        let mut slot = OutputSlot::new();
        assert_eq!(slot.status(), Status::Unknown);
        slot.write(Value::Int(3));
        assert_eq!(slot.value(), Some(&Value::Int(3)));
        slot.write(Value::Int(4));
        assert_eq!(slot.value(), Some(&Value::Int(4)));
        slot.clear();
        assert_eq!(slot.status(), Status::Absent);
        assert_eq!(slot.value(), None);
        slot.reset();
        assert_eq!(slot.status(), Status::Unknown);
    }
}
