//! Slip VM — embeddable stack-based virtual machine with a mark-sweep
//! garbage collector.

pub mod bytecode;
pub mod heap;
pub mod stack;
pub mod value;
pub mod vm;

pub use bytecode::{Chunk, Op};
pub use heap::{GcStats, Handle, Heap, Object, ObjectKind, Payload};
pub use stack::{FRAMES_MAX, LOCALS_MAX, STACK_MAX};
pub use value::Value;
pub use vm::{Vm, VmError};
