//! The Slip execution engine: dispatch loop, embedding surface, and the
//! fatal error type.
//!
//! A `Vm` is an explicit value — construct as many independent engines
//! as needed; nothing is process-global. All engine state (operand
//! stack, frame stack, heap, instruction pointer) is owned by the one
//! engine and mutated only from its single-threaded `run` loop. The
//! collector runs synchronously from the allocation path or on an
//! explicit request, never concurrently with dispatch.

use thiserror::Error;

use crate::bytecode::{Chunk, Op};
use crate::heap::{Handle, Heap};
use crate::stack::{FrameStack, Stack};
use crate::value::Value;

/// Fatal engine errors. A `run` that returns one of these has halted;
/// the embedding host decides whether to discard the engine instance or
/// the whole process.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("stack overflow: operand stack capacity {0} exceeded")]
    StackOverflow(usize),
    #[error("stack underflow: pop on empty operand stack")]
    StackUnderflow,
    #[error("call depth exceeded: {0} frames")]
    CallDepthExceeded(usize),
    #[error("unknown opcode {byte:#04x} at offset {offset}")]
    UnknownOpcode { byte: u8, offset: usize },
    #[error("unexpected end of code at offset {offset}")]
    EndOfCode { offset: usize },
    #[error("type error at runtime: {0}")]
    TypeError(String),
    #[error("constant index {index} out of range (pool has {len})")]
    ConstantOutOfRange { index: usize, len: usize },
    #[error("local slot {slot} out of range ({in_use} in use)")]
    LocalOutOfRange { slot: usize, in_use: usize },
    #[error("no active frame for {0}")]
    NoActiveFrame(&'static str),
    #[error("stale object handle {0:?}")]
    StaleHandle(Handle),
    #[error("out of memory: {requested} bytes requested over {limit}-byte heap limit")]
    OutOfMemory { requested: usize, limit: usize },
}

/// The Slip virtual machine.
pub struct Vm {
    stack: Stack,
    frames: FrameStack,
    heap: Heap,
    ip: usize,
}

impl Vm {
    pub fn new() -> Self {
        Self {
            stack: Stack::new(),
            frames: FrameStack::new(),
            heap: Heap::new(),
            ip: 0,
        }
    }

    /// Cap the heap at `limit` bytes; see [`Heap::set_byte_limit`].
    pub fn set_heap_limit(&mut self, limit: usize) {
        self.heap.set_byte_limit(limit);
    }

    // --- Embedding surface ---

    /// Push a value onto the operand stack.
    pub fn push(&mut self, value: Value) -> Result<(), VmError> {
        self.stack.push(value)
    }

    /// Pop the top of the operand stack.
    pub fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop()
    }

    /// Operand stack depth.
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Top of the operand stack without popping.
    pub fn stack_top(&self) -> Option<&Value> {
        self.stack.peek()
    }

    /// Active call depth.
    pub fn frame_depth(&self) -> usize {
        self.frames.depth()
    }

    /// The object heap, for inspection and host-built structures.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Run one full mark-sweep cycle now. Roots are every operand stack
    /// slot in use plus every active frame's live locals. Returns the
    /// number of objects freed.
    pub fn collect_garbage(&mut self) -> usize {
        let roots: Vec<Value> = self
            .stack
            .iter()
            .chain(self.frames.live_locals())
            .copied()
            .collect();
        self.heap.collect(roots)
    }

    /// Allocate a pair, collecting first if the allocation would cross
    /// the GC threshold or the hard byte cap. Out-of-memory after that
    /// one collection attempt is fatal and never retried.
    pub fn alloc_pair(&mut self, car: Value, cdr: Value) -> Result<Handle, VmError> {
        if self.heap.should_collect(Heap::OBJECT_SIZE) || self.heap.over_limit(Heap::OBJECT_SIZE) {
            self.collect_garbage();
        }
        self.heap.alloc_pair(car, cdr)
    }

    // --- Dispatch ---

    /// Execute `chunk` from offset 0 until a top-level `Return` (the one
    /// success path) or a fatal error (the one failure path). A fatal
    /// error halts the loop with no further state mutation.
    pub fn run(&mut self, chunk: &Chunk) -> Result<(), VmError> {
        self.ip = 0;
        loop {
            let offset = self.ip;
            let byte = self.fetch_byte(chunk)?;
            let op = Op::decode(byte).ok_or(VmError::UnknownOpcode { byte, offset })?;

            match op {
                Op::Constant => {
                    let index = self.fetch_byte(chunk)? as usize;
                    let constant = chunk.constants.get(index).copied().ok_or(
                        VmError::ConstantOutOfRange {
                            index,
                            len: chunk.constants.len(),
                        },
                    )?;
                    self.stack.push(Value::Number(constant))?;
                }
                Op::Add => {
                    let b = self.pop_number("add")?;
                    let a = self.pop_number("add")?;
                    self.stack.push(Value::Number(a + b))?;
                }
                Op::Pop => {
                    self.stack.pop()?;
                }
                Op::Pair => {
                    // Operands stay on the stack through the allocation
                    // so a triggered collection still sees them as roots.
                    let car = *self.stack.peek_at(1).ok_or(VmError::StackUnderflow)?;
                    let cdr = *self.stack.peek_at(0).ok_or(VmError::StackUnderflow)?;
                    let handle = self.alloc_pair(car, cdr)?;
                    self.stack.pop()?;
                    self.stack.pop()?;
                    self.stack.push(Value::Obj(handle))?;
                }
                Op::Car => {
                    let handle = self.pop_obj("car")?;
                    let (car, _) = self.heap.pair(handle)?;
                    self.stack.push(car)?;
                }
                Op::Cdr => {
                    let handle = self.pop_obj("cdr")?;
                    let (_, cdr) = self.heap.pair(handle)?;
                    self.stack.push(cdr)?;
                }
                Op::GetLocal => {
                    let slot = self.fetch_byte(chunk)? as usize;
                    let frame = self
                        .frames
                        .current()
                        .ok_or(VmError::NoActiveFrame("get_local"))?;
                    let value = frame.get_local(slot)?;
                    self.stack.push(value)?;
                }
                Op::SetLocal => {
                    let slot = self.fetch_byte(chunk)? as usize;
                    let value = self.stack.pop()?;
                    let frame = self
                        .frames
                        .current_mut()
                        .ok_or(VmError::NoActiveFrame("set_local"))?;
                    frame.set_local(slot, value)?;
                }
                Op::Call => {
                    let target = self.fetch_u16(chunk)? as usize;
                    self.frames.push(self.ip)?;
                    self.ip = target;
                }
                Op::Return => match self.frames.pop() {
                    Some(frame) => self.ip = frame.return_ip(),
                    // Top-level return halts the loop successfully.
                    None => return Ok(()),
                },
                Op::Collect => {
                    self.collect_garbage();
                }
            }
        }
    }

    fn fetch_byte(&mut self, chunk: &Chunk) -> Result<u8, VmError> {
        let byte = chunk
            .code
            .get(self.ip)
            .copied()
            .ok_or(VmError::EndOfCode { offset: self.ip })?;
        self.ip += 1;
        Ok(byte)
    }

    fn fetch_u16(&mut self, chunk: &Chunk) -> Result<u16, VmError> {
        let hi = self.fetch_byte(chunk)?;
        let lo = self.fetch_byte(chunk)?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn pop_number(&mut self, op: &str) -> Result<f64, VmError> {
        let value = self.stack.pop()?;
        value.as_number().ok_or_else(|| {
            VmError::TypeError(format!("{op} expects a number, got {value}"))
        })
    }

    fn pop_obj(&mut self, op: &str) -> Result<Handle, VmError> {
        let value = self.stack.pop()?;
        value.as_obj().ok_or_else(|| {
            VmError::TypeError(format!("{op} expects a pair, got {value}"))
        })
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ObjectKind;

    fn num(n: f64) -> Value {
        Value::Number(n)
    }

    #[test]
    fn test_push_pop_surface() {
        let mut vm = Vm::new();
        vm.push(num(1.0)).unwrap();
        vm.push(num(2.0)).unwrap();
        assert_eq!(vm.stack_len(), 2);
        assert_eq!(vm.pop().unwrap(), num(2.0));
        assert_eq!(vm.pop().unwrap(), num(1.0));
        assert!(matches!(vm.pop(), Err(VmError::StackUnderflow)));
    }

    #[test]
    fn test_independent_instances() {
        let mut a = Vm::new();
        let mut b = Vm::new();
        a.push(num(1.0)).unwrap();
        a.alloc_pair(num(1.0), num(2.0)).unwrap();
        assert_eq!(b.stack_len(), 0);
        assert_eq!(b.heap().live_objects(), 0);
        b.push(num(9.0)).unwrap();
        assert_eq!(a.stack_top(), Some(&num(1.0)));
    }

    #[test]
    fn test_alloc_triggers_collection_at_threshold() {
        let mut vm = Vm::new();
        // Unrooted garbage: everything allocated here is immediately
        // unreachable, so the threshold-triggered collection frees it
        // and the heap never grows past the initial threshold.
        for _ in 0..10_000 {
            vm.alloc_pair(num(0.0), num(0.0)).unwrap();
        }
        assert!(vm.heap().stats().collections > 0);
        assert!(vm.heap().bytes_allocated() <= vm.heap().next_gc());
    }

    #[test]
    fn test_collect_garbage_roots_stack_and_locals() {
        let mut vm = Vm::new();
        let on_stack = vm.alloc_pair(num(1.0), num(2.0)).unwrap();
        vm.push(Value::Obj(on_stack)).unwrap();
        let _garbage = vm.alloc_pair(num(3.0), num(4.0)).unwrap();

        let freed = vm.collect_garbage();
        assert_eq!(freed, 1);
        assert!(vm.heap().contains(on_stack));
        assert_eq!(vm.heap().get(on_stack).unwrap().kind(), ObjectKind::Pair);
    }

    #[test]
    fn test_oom_is_fatal_after_one_collection() {
        let mut vm = Vm::new();
        vm.set_heap_limit(Heap::OBJECT_SIZE * 2);
        let a = vm.alloc_pair(num(1.0), num(1.0)).unwrap();
        vm.push(Value::Obj(a)).unwrap();
        let b = vm.alloc_pair(num(2.0), num(2.0)).unwrap();
        vm.push(Value::Obj(b)).unwrap();

        // Both objects are rooted: the collection attempt frees nothing
        // and the allocation fails for good.
        let err = vm.alloc_pair(num(3.0), num(3.0)).unwrap_err();
        assert!(matches!(err, VmError::OutOfMemory { .. }));
        assert_eq!(vm.heap().stats().collections, 1);

        // Unrooting one object lets the same path succeed.
        vm.pop().unwrap();
        vm.pop().unwrap();
        vm.push(Value::Obj(a)).unwrap();
        assert!(vm.alloc_pair(num(3.0), num(3.0)).is_ok());
    }

    #[test]
    fn test_error_messages_name_the_fault() {
        let err = VmError::UnknownOpcode {
            byte: 0xEE,
            offset: 7,
        };
        assert_eq!(err.to_string(), "unknown opcode 0xee at offset 7");

        let err = VmError::ConstantOutOfRange { index: 3, len: 1 };
        assert!(err.to_string().contains("constant index 3"));
    }
}
