//! Fixed-capacity operand stack and call-frame stack.

use crate::value::Value;
use crate::vm::VmError;

/// Operand stack capacity.
pub const STACK_MAX: usize = 256;
/// Call-frame stack capacity.
pub const FRAMES_MAX: usize = 64;
/// Local slots per frame.
pub const LOCALS_MAX: usize = 8;

/// The operand stack: a bounded LIFO of values.
///
/// Both overflow and underflow are defined fatal errors, never an
/// out-of-bounds read.
#[derive(Debug, Default)]
pub struct Stack {
    slots: Vec<Value>,
}

impl Stack {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(STACK_MAX),
        }
    }

    pub fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.slots.len() >= STACK_MAX {
            return Err(VmError::StackOverflow(STACK_MAX));
        }
        self.slots.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value, VmError> {
        self.slots.pop().ok_or(VmError::StackUnderflow)
    }

    /// Top of stack without popping.
    pub fn peek(&self) -> Option<&Value> {
        self.slots.last()
    }

    /// Value `depth` slots below the top without popping. `peek_at(0)`
    /// is the top of stack.
    pub fn peek_at(&self, depth: usize) -> Option<&Value> {
        self.slots.len().checked_sub(depth + 1).map(|i| &self.slots[i])
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots in use, bottom to top. These are GC roots.
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.slots.iter()
    }
}

/// An activation record: local slots, how many are in use, and the
/// caller's resume instruction pointer.
///
/// Frames are ordered by their position in the frame stack alone; there
/// is no per-frame link to the enclosing frame.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    locals: [Value; LOCALS_MAX],
    locals_in_use: usize,
    return_ip: usize,
}

impl Frame {
    fn new(return_ip: usize) -> Self {
        Self {
            locals: [Value::Number(0.0); LOCALS_MAX],
            locals_in_use: 0,
            return_ip,
        }
    }

    /// Instruction pointer to resume at when this frame pops.
    pub fn return_ip(&self) -> usize {
        self.return_ip
    }

    /// Read a local slot. Only slots that have been written count as in
    /// use; reading past them is a defined error.
    pub fn get_local(&self, slot: usize) -> Result<Value, VmError> {
        if slot >= self.locals_in_use {
            return Err(VmError::LocalOutOfRange {
                slot,
                in_use: self.locals_in_use,
            });
        }
        Ok(self.locals[slot])
    }

    /// Write a local slot, extending the in-use count to cover it.
    pub fn set_local(&mut self, slot: usize, value: Value) -> Result<(), VmError> {
        if slot >= LOCALS_MAX {
            return Err(VmError::LocalOutOfRange {
                slot,
                in_use: LOCALS_MAX,
            });
        }
        self.locals[slot] = value;
        self.locals_in_use = self.locals_in_use.max(slot + 1);
        Ok(())
    }

    /// Local slots in use. These are GC roots.
    pub fn live_locals(&self) -> impl Iterator<Item = &Value> {
        self.locals[..self.locals_in_use].iter()
    }
}

/// The call stack: a bounded LIFO of frames.
#[derive(Debug, Default)]
pub struct FrameStack {
    frames: Vec<Frame>,
}

impl FrameStack {
    pub fn new() -> Self {
        Self {
            frames: Vec::with_capacity(FRAMES_MAX),
        }
    }

    /// Push a fresh frame recording `return_ip` as the caller's resume
    /// point. Exceeding the frame capacity is the fatal call-depth
    /// error.
    pub fn push(&mut self, return_ip: usize) -> Result<(), VmError> {
        if self.frames.len() >= FRAMES_MAX {
            return Err(VmError::CallDepthExceeded(FRAMES_MAX));
        }
        self.frames.push(Frame::new(return_ip));
        Ok(())
    }

    /// Pop the active frame. `None` means execution is at top level.
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// The active frame, if any.
    pub fn current(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Every active frame's live locals, outermost first.
    pub fn live_locals(&self) -> impl Iterator<Item = &Value> {
        self.frames.iter().flat_map(|f| f.live_locals())
    }
}
