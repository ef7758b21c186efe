//! Bytecode chunk and opcode encoding.
//!
//! A `Chunk` is a flat buffer of opcode bytes, each followed by a
//! fixed, opcode-specific number of immediate bytes, plus the constant
//! pool the `Constant` opcode indexes. Chunks are produced by the
//! out-of-scope compiler; the serde derives let a host driver load them
//! from disk or the wire.

use serde::{Deserialize, Serialize};

/// One opcode. The discriminant is the wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// Push `constants[u8 operand]`.
    Constant = 0x00,
    /// Pop two numbers, push their sum.
    Add = 0x01,
    /// Pop and discard the top of stack.
    Pop = 0x02,
    /// Pop cdr then car, allocate a pair, push its handle.
    Pair = 0x03,
    /// Pop a pair handle, push its car.
    Car = 0x04,
    /// Pop a pair handle, push its cdr.
    Cdr = 0x05,
    /// Push local slot `u8 operand` of the current frame.
    GetLocal = 0x06,
    /// Pop into local slot `u8 operand` of the current frame.
    SetLocal = 0x07,
    /// Push a frame recording the resume point, jump to the `u16
    /// operand` (big-endian absolute offset).
    Call = 0x08,
    /// Pop the current frame and resume the caller; at top level, halt
    /// successfully.
    Return = 0x09,
    /// Request an immediate full collection.
    Collect = 0x0A,
}

impl Op {
    /// Decode a wire byte. Returns `None` for unmapped bytes; the
    /// dispatch loop turns that into a fatal error naming the byte and
    /// its offset.
    pub fn decode(byte: u8) -> Option<Op> {
        match byte {
            0x00 => Some(Op::Constant),
            0x01 => Some(Op::Add),
            0x02 => Some(Op::Pop),
            0x03 => Some(Op::Pair),
            0x04 => Some(Op::Car),
            0x05 => Some(Op::Cdr),
            0x06 => Some(Op::GetLocal),
            0x07 => Some(Op::SetLocal),
            0x08 => Some(Op::Call),
            0x09 => Some(Op::Return),
            0x0A => Some(Op::Collect),
            _ => None,
        }
    }

    /// Number of immediate bytes following the opcode byte. Fixed per
    /// opcode; every opcode, present or future, must keep this static.
    pub fn operand_width(&self) -> usize {
        match self {
            Op::Constant | Op::GetLocal | Op::SetLocal => 1,
            Op::Call => 2,
            Op::Add | Op::Pop | Op::Pair | Op::Car | Op::Cdr | Op::Return | Op::Collect => 0,
        }
    }
}

/// A compiled unit: code buffer plus constant pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<f64>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an opcode byte.
    pub fn write_op(&mut self, op: Op) {
        self.code.push(op as u8);
    }

    /// Append a one-byte immediate.
    pub fn write_byte(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Append a two-byte big-endian immediate.
    pub fn write_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    /// Intern a constant, returning its pool index.
    ///
    /// # Panics
    /// Panics if the pool already holds 256 constants — the `Constant`
    /// opcode carries a one-byte index.
    pub fn add_constant(&mut self, value: f64) -> u8 {
        assert!(
            self.constants.len() < u8::MAX as usize + 1,
            "constant pool limit (256) exceeded"
        );
        self.constants.push(value);
        (self.constants.len() - 1) as u8
    }

    /// Current write offset, usable as a `Call` target.
    pub fn offset(&self) -> usize {
        self.code.len()
    }
}
