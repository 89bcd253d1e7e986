//! Bytecode opcodes for the Levython VM
//!
//! Instructions are byte-encoded with little-endian operands. The
//! specialized opcodes at the top of the range are never produced by the
//! compiler; only the optimizer emits them, inside guarded segments.

/// Bytecode opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    // ========== Stack Operations ==========
    /// No operation (used as padding by the optimizer)
    Nop = 0x00,
    /// Pop the top value from the stack
    Pop = 0x01,
    /// Duplicate the top value on the stack
    Dup = 0x02,

    // ========== Constants ==========
    /// Load a constant from the constant pool
    /// Operands: constant_index (u16)
    Constant = 0x10,
    /// Push `yes`
    True = 0x11,
    /// Push `no`
    False = 0x12,
    /// Push `none`
    None = 0x13,

    // ========== Variables ==========
    /// Load a local variable
    /// Operands: local_index (u8)
    GetLocal = 0x20,
    /// Store to a local variable (value is popped)
    /// Operands: local_index (u8)
    SetLocal = 0x21,
    /// Load a global variable
    /// Operands: name_index (u16)
    GetGlobal = 0x22,
    /// Store to a global variable (value is popped)
    /// Operands: name_index (u16)
    SetGlobal = 0x23,

    // ========== Arithmetic ==========
    /// Add two values (string concatenation when either side is a string)
    Add = 0x40,
    /// Subtract two values
    Sub = 0x41,
    /// Multiply two values
    Mul = 0x42,
    /// Divide two values (int / int produces a float)
    Div = 0x43,
    /// Modulo two values
    Mod = 0x44,
    /// Exponentiation (always produces a float)
    Pow = 0x45,
    /// Negate a value
    Negate = 0x46,

    // ========== Logic ==========
    /// `and` / `&` -- both operands already evaluated
    And = 0x50,
    /// `or` / `|` -- both operands already evaluated
    Or = 0x51,
    /// Logical NOT
    Not = 0x52,

    // ========== Comparison ==========
    /// Equal (==)
    Eq = 0x60,
    /// Not equal (!=)
    Ne = 0x61,
    /// Less than (<)
    Lt = 0x62,
    /// Less than or equal (<=)
    Le = 0x63,
    /// Greater than (>)
    Gt = 0x64,
    /// Greater than or equal (>=)
    Ge = 0x65,

    // ========== Collections ==========
    /// Create a list from the top N stack values
    /// Operands: element_count (u8)
    MakeList = 0x70,
    /// Create a map from the top 2*N stack values (key, value pairs)
    /// Operands: entry_count (u8)
    MakeMap = 0x71,
    /// Index read; stack: [object, key] -> [value]
    Index = 0x72,
    /// Index write; stack: [object, key, value] -> []
    SetIndex = 0x73,
    /// Get an attribute by name
    /// Operands: name_index (u16)
    GetAttr = 0x74,
    /// Set an attribute by name; stack: [object, value] -> []
    /// Operands: name_index (u16)
    SetAttr = 0x75,

    // ========== Control Flow ==========
    /// Unconditional forward jump
    /// Operands: offset (i16)
    Jump = 0x90,
    /// Jump if top of stack is falsy (value is popped)
    /// Operands: offset (i16)
    JumpIfFalse = 0x91,
    /// Backward jump to a loop head
    /// Operands: distance (u16, subtracted from the next instruction)
    Loop = 0x92,
    /// Advance a for-loop; pushes the next element or jumps past the body
    /// Operands: iter_slot (u8), exit_offset (u16)
    ForIter = 0x93,
    /// Type-check the top of stack is an integer (for `repeat` counts)
    RequireInt = 0x94,

    // ========== Functions ==========
    /// Call the callee below the arguments
    /// Operands: arg_count (u8)
    Call = 0xA0,
    /// Invoke a method on an object; stack: [receiver, args...] -> [result]
    /// Operands: name_index (u16), arg_count (u8)
    Invoke = 0xA1,
    /// Invoke a method on the parent class of `self`
    /// Operands: name_index (u16), arg_count (u8)
    SuperInvoke = 0xA2,
    /// Return from function with the top of stack
    Return = 0xA3,
    /// Return `none` from function
    ReturnNone = 0xA4,
    /// Push a function object from the constant pool
    /// Operands: function_index (u16)
    MakeFunction = 0xA5,
    /// Create a class from methods on the stack
    /// Operands: name_index (u16), method_count (u8), has_parent (u8)
    /// Stack: [parent?, methods...] -> [class]
    MakeClass = 0xA6,

    // ========== Exception Handling ==========
    /// Enter a try block
    /// Operands: handler_offset (u16)
    EnterTry = 0xD0,
    /// Leave a try block without raising
    LeaveTry = 0xD1,

    // ========== Modules ==========
    /// Import a module and bind its namespace map as a global
    /// Operands: name_index (u16)
    Import = 0xE0,

    // ========== Specialized (optimizer-only) ==========
    /// Integer add; deoptimizes when either operand is not an int
    AddInt = 0xF0,
    /// Integer subtract; deoptimizes when either operand is not an int
    SubInt = 0xF1,
    /// Integer multiply; deoptimizes when either operand is not an int
    MulInt = 0xF2,
    /// Shift the integer on top of stack left by a constant
    /// Operands: shift_amount (u8)
    ShlImm = 0xF3,
    /// Call through the inline cache, bypassing the global lookup
    /// Operands: arg_count (u8)
    CallCached = 0xF4,
    /// Float add; deoptimizes when either operand is not a float
    AddFloat = 0xF5,
    /// Float subtract; deoptimizes when either operand is not a float
    SubFloat = 0xF6,
    /// Float multiply; deoptimizes when either operand is not a float
    MulFloat = 0xF7,
    /// List index read; deoptimizes unless the stack holds a list and an
    /// in-bounds integer index
    IndexList = 0xF8,
}

impl Opcode {
    /// Convert a byte to an opcode
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        match byte {
            0x00 => Some(Opcode::Nop),
            0x01 => Some(Opcode::Pop),
            0x02 => Some(Opcode::Dup),

            0x10 => Some(Opcode::Constant),
            0x11 => Some(Opcode::True),
            0x12 => Some(Opcode::False),
            0x13 => Some(Opcode::None),

            0x20 => Some(Opcode::GetLocal),
            0x21 => Some(Opcode::SetLocal),
            0x22 => Some(Opcode::GetGlobal),
            0x23 => Some(Opcode::SetGlobal),

            0x40 => Some(Opcode::Add),
            0x41 => Some(Opcode::Sub),
            0x42 => Some(Opcode::Mul),
            0x43 => Some(Opcode::Div),
            0x44 => Some(Opcode::Mod),
            0x45 => Some(Opcode::Pow),
            0x46 => Some(Opcode::Negate),

            0x50 => Some(Opcode::And),
            0x51 => Some(Opcode::Or),
            0x52 => Some(Opcode::Not),

            0x60 => Some(Opcode::Eq),
            0x61 => Some(Opcode::Ne),
            0x62 => Some(Opcode::Lt),
            0x63 => Some(Opcode::Le),
            0x64 => Some(Opcode::Gt),
            0x65 => Some(Opcode::Ge),

            0x70 => Some(Opcode::MakeList),
            0x71 => Some(Opcode::MakeMap),
            0x72 => Some(Opcode::Index),
            0x73 => Some(Opcode::SetIndex),
            0x74 => Some(Opcode::GetAttr),
            0x75 => Some(Opcode::SetAttr),

            0x90 => Some(Opcode::Jump),
            0x91 => Some(Opcode::JumpIfFalse),
            0x92 => Some(Opcode::Loop),
            0x93 => Some(Opcode::ForIter),
            0x94 => Some(Opcode::RequireInt),

            0xA0 => Some(Opcode::Call),
            0xA1 => Some(Opcode::Invoke),
            0xA2 => Some(Opcode::SuperInvoke),
            0xA3 => Some(Opcode::Return),
            0xA4 => Some(Opcode::ReturnNone),
            0xA5 => Some(Opcode::MakeFunction),
            0xA6 => Some(Opcode::MakeClass),

            0xD0 => Some(Opcode::EnterTry),
            0xD1 => Some(Opcode::LeaveTry),

            0xE0 => Some(Opcode::Import),

            0xF0 => Some(Opcode::AddInt),
            0xF1 => Some(Opcode::SubInt),
            0xF2 => Some(Opcode::MulInt),
            0xF3 => Some(Opcode::ShlImm),
            0xF4 => Some(Opcode::CallCached),
            0xF5 => Some(Opcode::AddFloat),
            0xF6 => Some(Opcode::SubFloat),
            0xF7 => Some(Opcode::MulFloat),
            0xF8 => Some(Opcode::IndexList),

            _ => None,
        }
    }

    /// Size of the instruction including operands
    pub fn instruction_size(&self) -> usize {
        match self {
            // No operands
            Opcode::Nop
            | Opcode::Pop
            | Opcode::Dup
            | Opcode::True
            | Opcode::False
            | Opcode::None
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Pow
            | Opcode::Negate
            | Opcode::And
            | Opcode::Or
            | Opcode::Not
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::Index
            | Opcode::SetIndex
            | Opcode::RequireInt
            | Opcode::Return
            | Opcode::ReturnNone
            | Opcode::LeaveTry
            | Opcode::AddInt
            | Opcode::SubInt
            | Opcode::MulInt
            | Opcode::AddFloat
            | Opcode::SubFloat
            | Opcode::MulFloat
            | Opcode::IndexList => 1,

            // 1-byte operand
            Opcode::GetLocal
            | Opcode::SetLocal
            | Opcode::MakeList
            | Opcode::MakeMap
            | Opcode::Call
            | Opcode::ShlImm
            | Opcode::CallCached => 2,

            // 2-byte operand
            Opcode::Constant
            | Opcode::GetGlobal
            | Opcode::SetGlobal
            | Opcode::GetAttr
            | Opcode::SetAttr
            | Opcode::Jump
            | Opcode::JumpIfFalse
            | Opcode::Loop
            | Opcode::MakeFunction
            | Opcode::EnterTry
            | Opcode::Import => 3,

            // u8 slot + u16 exit offset
            Opcode::ForIter => 4,

            // u16 name + u8 arg count
            Opcode::Invoke | Opcode::SuperInvoke => 4,

            // u16 name + u8 method count + u8 has_parent
            Opcode::MakeClass => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bytes() {
        for byte in 0..=0xFF_u8 {
            if let Some(op) = Opcode::from_u8(byte) {
                assert_eq!(op as u8, byte);
            }
        }
    }

    #[test]
    fn sizes_cover_operands() {
        assert_eq!(Opcode::Add.instruction_size(), 1);
        assert_eq!(Opcode::GetLocal.instruction_size(), 2);
        assert_eq!(Opcode::Constant.instruction_size(), 3);
        assert_eq!(Opcode::Invoke.instruction_size(), 4);
        assert_eq!(Opcode::MakeClass.instruction_size(), 5);
    }
}
