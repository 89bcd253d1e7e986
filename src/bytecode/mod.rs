//! Bytecode representation and compilation
//!
//! A [`Chunk`] is a flat byte vector of instructions plus a constant pool
//! and per-byte line information. Chunks are immutable once compiled; the
//! optimizer produces separate rewritten copies and never mutates a chunk
//! in place.

mod compiler;
mod opcode;
pub mod optimizer;

pub use compiler::compile;
pub use opcode::Opcode;
pub use optimizer::{OptimizedCode, Optimizer};

use crate::runtime::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CHUNK_ID: AtomicU64 = AtomicU64::new(1);

/// A compiled bytecode chunk
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Process-unique identity, used as a profiling and cache key
    pub id: u64,
    /// Function name (`<script>` for top-level code)
    pub name: String,
    /// Bytecode instructions
    pub code: Vec<u8>,
    /// Constant pool
    pub constants: Vec<Value>,
    /// Line number for each code byte
    pub lines: Vec<u32>,
    /// Local slot names, for disassembly
    pub locals: Vec<String>,
    /// Number of parameters
    pub arity: u8,
    /// Total local slots, parameters included
    pub local_count: u8,
}

impl Chunk {
    /// Create a new empty chunk with a fresh identity
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_CHUNK_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            code: Vec::new(),
            constants: Vec::new(),
            lines: Vec::new(),
            locals: Vec::new(),
            arity: 0,
            local_count: 0,
        }
    }

    /// Write a byte with line information
    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Write an opcode with line information
    pub fn write_opcode(&mut self, opcode: Opcode, line: u32) {
        self.write(opcode as u8, line);
    }

    /// Write a little-endian u16 operand
    pub fn write_u16(&mut self, value: u16, line: u32) {
        let [lo, hi] = value.to_le_bytes();
        self.write(lo, line);
        self.write(hi, line);
    }

    /// Read a u8 operand
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.code[offset]
    }

    /// Read a little-endian u16 operand
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.code[offset], self.code[offset + 1]])
    }

    /// Read a little-endian i16 operand
    pub fn read_i16(&self, offset: usize) -> i16 {
        i16::from_le_bytes([self.code[offset], self.code[offset + 1]])
    }

    /// Line number for a bytecode offset
    pub fn get_line(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(1)
    }

    /// Add a constant to the pool and return its index.
    ///
    /// Scalar and string constants are deduplicated; function constants are
    /// always appended.
    pub fn add_constant(&mut self, value: Value) -> u16 {
        for (i, existing) in self.constants.iter().enumerate() {
            if existing.same_constant(&value) {
                return i as u16;
            }
        }
        let index = self.constants.len();
        self.constants.push(value);
        index as u16
    }

    /// Get a constant from the pool
    pub fn get_constant(&self, index: u16) -> Option<&Value> {
        self.constants.get(index as usize)
    }

    /// Disassemble the chunk for debugging
    pub fn disassemble(&self) -> String {
        let mut output = format!("== {} ==\n", self.name);
        let mut offset = 0;
        while offset < self.code.len() {
            let (instruction, next) = self.disassemble_instruction(offset);
            output.push_str(&instruction);
            output.push('\n');
            offset = next;
        }
        output
    }

    /// Disassemble a single instruction, returning the offset after it
    pub fn disassemble_instruction(&self, offset: usize) -> (String, usize) {
        let line = self.get_line(offset);
        let line_str = if offset > 0 && self.lines.get(offset - 1) == Some(&line) {
            "   |".to_string()
        } else {
            format!("{:4}", line)
        };

        let Some(op) = Opcode::from_u8(self.code[offset]) else {
            return (
                format!("{:04} {} UNKNOWN({})", offset, line_str, self.code[offset]),
                offset + 1,
            );
        };

        let operands = self.format_operands(op, offset);
        let size = op.instruction_size();
        (
            format!("{:04} {} {:14} {}", offset, line_str, format!("{:?}", op), operands),
            offset + size,
        )
    }

    fn format_operands(&self, op: Opcode, offset: usize) -> String {
        match op {
            Opcode::Constant | Opcode::MakeFunction => {
                let index = self.read_u16(offset + 1);
                match self.get_constant(index) {
                    Some(constant) => format!("{} ({})", index, constant.display()),
                    Option::None => format!("{}", index),
                }
            }
            Opcode::GetGlobal
            | Opcode::SetGlobal
            | Opcode::GetAttr
            | Opcode::SetAttr
            | Opcode::Import => {
                let index = self.read_u16(offset + 1);
                match self.get_constant(index) {
                    Some(constant) => format!("{} ({})", index, constant.display()),
                    Option::None => format!("{}", index),
                }
            }
            Opcode::GetLocal | Opcode::SetLocal => {
                let slot = self.read_u8(offset + 1);
                match self.locals.get(slot as usize) {
                    Some(name) => format!("{} ({})", slot, name),
                    Option::None => format!("{}", slot),
                }
            }
            Opcode::MakeList
            | Opcode::MakeMap
            | Opcode::Call
            | Opcode::CallCached
            | Opcode::ShlImm => format!("{}", self.read_u8(offset + 1)),
            Opcode::Jump | Opcode::JumpIfFalse => {
                let jump = self.read_i16(offset + 1);
                let target = offset as i64 + 3 + jump as i64;
                format!("{} -> {}", jump, target)
            }
            Opcode::Loop => {
                let back = self.read_u16(offset + 1);
                let target = offset as i64 + 3 - back as i64;
                format!("{} -> {}", back, target)
            }
            Opcode::ForIter => {
                let slot = self.read_u8(offset + 1);
                let exit = self.read_u16(offset + 2);
                format!("slot {} exit +{}", slot, exit)
            }
            Opcode::Invoke | Opcode::SuperInvoke => {
                let name = self.read_u16(offset + 1);
                let argc = self.read_u8(offset + 3);
                match self.get_constant(name) {
                    Some(constant) => format!("{} args={}", constant.display(), argc),
                    Option::None => format!("{} args={}", name, argc),
                }
            }
            Opcode::MakeClass => {
                let name = self.read_u16(offset + 1);
                let methods = self.read_u8(offset + 3);
                let has_parent = self.read_u8(offset + 4) != 0;
                match self.get_constant(name) {
                    Some(constant) => format!(
                        "{} methods={} parent={}",
                        constant.display(),
                        methods,
                        has_parent
                    ),
                    Option::None => format!("{} methods={}", name, methods),
                }
            }
            Opcode::EnterTry => format!("handler +{}", self.read_u16(offset + 1)),
            _ => String::new(),
        }
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.disassemble())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_are_unique() {
        let a = Chunk::new("a");
        let b = Chunk::new("b");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn deduplicates_scalar_constants() {
        let mut chunk = Chunk::new("test");
        let first = chunk.add_constant(Value::Int(42));
        let second = chunk.add_constant(Value::Int(42));
        assert_eq!(first, second);
        assert_eq!(chunk.constants.len(), 1);
    }

    #[test]
    fn disassembles_constants_and_jumps() {
        let mut chunk = Chunk::new("test");
        let idx = chunk.add_constant(Value::Int(7));
        chunk.write_opcode(Opcode::Constant, 1);
        chunk.write_u16(idx, 1);
        chunk.write_opcode(Opcode::JumpIfFalse, 1);
        chunk.write_u16(3, 1);
        chunk.write_opcode(Opcode::Return, 2);

        let output = chunk.disassemble();
        assert!(output.contains("Constant"));
        assert!(output.contains("7"));
        assert!(output.contains("JumpIfFalse"));
        assert!(output.contains("Return"));
    }
}
