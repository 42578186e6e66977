//! Fibers: user-level coroutines.
//!
//! A fiber owns a value stack, a call-frame array, and the list of open
//! upvalues pointing into its stack, kept sorted by strictly descending
//! stack index so closing is a prefix walk. Upvalues record stack
//! *indices*, not addresses, so growing the stack can never invalidate
//! them; `ensure_stack` is nevertheless the single point where the backing
//! buffer may reallocate.

use core_types::{ObjId, Value};

/// The scheduling state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Invoked through `try`: a runtime error in it (or below it) is
    /// caught and returned from the `try` call.
    Try,
    /// The fiber the host started the VM with; it cannot be re-called.
    Root,
    /// Every other fiber.
    Other,
}

/// One invocation of a closure.
#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    /// The closure being executed.
    pub closure: ObjId,
    /// Offset of the next instruction to execute.
    pub ip: usize,
    /// Index of the first stack slot this frame owns (the receiver).
    pub stack_start: usize,
}

/// A user-level coroutine.
#[derive(Debug)]
pub struct ObjFiber {
    /// The value stack.
    pub stack: Vec<Value>,
    /// Active call frames, innermost last.
    pub frames: Vec<CallFrame>,
    /// Open upvalues into `stack`, sorted by descending stack index.
    pub open_upvalues: Vec<ObjId>,
    /// The fiber that ran this one via `call` or `try`.
    pub caller: Option<ObjId>,
    /// The error that aborted this fiber, or null.
    pub error: Value,
    /// Scheduling state.
    pub state: FiberState,
}

impl ObjFiber {
    /// Create a suspended fiber ready to run `closure`, reserving room for
    /// `max_slots` stack slots.
    pub fn new(closure: ObjId, max_slots: usize) -> ObjFiber {
        let mut stack = Vec::with_capacity((max_slots + 1).next_power_of_two());
        stack.push(Value::obj(closure));
        ObjFiber {
            stack,
            frames: vec![CallFrame {
                closure,
                ip: 0,
                stack_start: 0,
            }],
            open_upvalues: Vec::new(),
            caller: None,
            error: Value::NULL,
            state: FiberState::Other,
        }
    }

    /// An empty fiber used as scratch space by the slot API.
    pub fn bare() -> ObjFiber {
        ObjFiber {
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            caller: None,
            error: Value::NULL,
            state: FiberState::Other,
        }
    }

    /// Whether the fiber has finished executing.
    pub fn is_done(&self) -> bool {
        self.frames.is_empty()
    }

    /// Whether the fiber was aborted with an error.
    pub fn has_error(&self) -> bool {
        !self.error.is_null()
    }

    /// Make sure the stack can hold `needed` slots without reallocating
    /// again. Returns the additional capacity reserved, for allocation
    /// accounting.
    pub fn ensure_stack(&mut self, needed: usize) -> usize {
        if needed <= self.stack.capacity() {
            return 0;
        }
        let grown = needed.next_power_of_two();
        let added = grown - self.stack.capacity();
        self.stack.reserve_exact(grown - self.stack.len());
        added * std::mem::size_of::<Value>()
    }

    /// Whether the fiber has not started running yet.
    pub fn is_fresh(&self) -> bool {
        self.frames.len() == 1 && self.frames[0].ip == 0 && self.stack.len() == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_fiber_is_suspended_at_start() {
        let fiber = ObjFiber::new(ObjId::new(3), 4);
        assert!(fiber.is_fresh());
        assert!(!fiber.is_done());
        assert!(!fiber.has_error());
        assert_eq!(fiber.frames.len(), 1);
        assert_eq!(fiber.frames[0].stack_start, 0);
        assert!(fiber.stack[0].same(Value::obj(ObjId::new(3))));
    }

    #[test]
    fn test_finished_fiber() {
        let mut fiber = ObjFiber::new(ObjId::new(0), 1);
        fiber.frames.clear();
        assert!(fiber.is_done());
    }

    #[test]
    fn test_ensure_stack_is_idempotent() {
        let mut fiber = ObjFiber::bare();
        let added = fiber.ensure_stack(100);
        assert!(added > 0);
        let capacity = fiber.stack.capacity();
        // A second request within the reserved size changes nothing.
        assert_eq!(fiber.ensure_stack(100), 0);
        assert_eq!(fiber.stack.capacity(), capacity);
    }

    #[test]
    fn test_state_transitions_are_explicit() {
        let mut fiber = ObjFiber::new(ObjId::new(0), 1);
        assert_eq!(fiber.state, FiberState::Other);
        fiber.state = FiberState::Try;
        assert_eq!(fiber.state, FiberState::Try);
    }
}
