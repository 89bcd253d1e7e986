//! Native code generation
//!
//! [`NativeOp`] is the tiny stack IR a straight-line integer segment lowers
//! to. A [`NativeBackend`] encodes it for one target; the provided backend
//! is x86-64 System V. Generated code receives a pointer to an unboxed
//! locals image in `rdi` and keeps the operand stack on the hardware
//! stack, with `rax` as the working register. Nothing is called from
//! generated code, so no frame or alignment setup is needed.

use thiserror::Error;

/// Codegen failures; all of them leave execution on the bytecode path
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodegenError {
    #[error("no native backend for this target")]
    UnsupportedTarget,
    #[error("segment does not lower to native code")]
    NotLowerable,
}

/// Stack IR over an i64 locals image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeOp {
    /// Push `locals[slot]`
    LoadLocal(u8),
    /// Pop into `locals[slot]`
    StoreLocal(u8),
    /// Push an immediate
    PushConst(i64),
    /// Pop two, push their sum
    Add,
    /// Pop two, push their difference
    Sub,
    /// Pop two, push their product
    Mul,
    /// Shift the top of stack left
    ShlImm(u8),
    /// Duplicate the top of stack
    Dup,
    /// Discard the top of stack
    Pop,
}

/// Encoder for one target architecture
pub trait NativeBackend {
    /// Target name, for logging
    fn name(&self) -> &'static str;
    /// Encode the IR as machine code ending in a return
    fn emit(&self, ops: &[NativeOp]) -> Result<Vec<u8>, CodegenError>;
}

/// The x86-64 System V backend
pub struct X64Backend;

impl X64Backend {
    /// mov rax, [rdi + disp]
    fn load(code: &mut Vec<u8>, disp: u32) {
        if disp <= i8::MAX as u32 {
            code.extend_from_slice(&[0x48, 0x8B, 0x47, disp as u8]);
        } else {
            code.extend_from_slice(&[0x48, 0x8B, 0x87]);
            code.extend_from_slice(&disp.to_le_bytes());
        }
    }

    /// mov [rdi + disp], rax
    fn store(code: &mut Vec<u8>, disp: u32) {
        if disp <= i8::MAX as u32 {
            code.extend_from_slice(&[0x48, 0x89, 0x47, disp as u8]);
        } else {
            code.extend_from_slice(&[0x48, 0x89, 0x87]);
            code.extend_from_slice(&disp.to_le_bytes());
        }
    }
}

impl NativeBackend for X64Backend {
    fn name(&self) -> &'static str {
        "x86-64 sysv"
    }

    fn emit(&self, ops: &[NativeOp]) -> Result<Vec<u8>, CodegenError> {
        let mut code = Vec::with_capacity(ops.len() * 6 + 1);
        for op in ops {
            match *op {
                NativeOp::LoadLocal(slot) => {
                    Self::load(&mut code, slot as u32 * 8);
                    code.push(0x50); // push rax
                }
                NativeOp::StoreLocal(slot) => {
                    code.push(0x58); // pop rax
                    Self::store(&mut code, slot as u32 * 8);
                }
                NativeOp::PushConst(value) => {
                    code.extend_from_slice(&[0x48, 0xB8]); // mov rax, imm64
                    code.extend_from_slice(&value.to_le_bytes());
                    code.push(0x50);
                }
                NativeOp::Add => {
                    code.push(0x59); // pop rcx
                    code.push(0x58); // pop rax
                    code.extend_from_slice(&[0x48, 0x01, 0xC8]); // add rax, rcx
                    code.push(0x50);
                }
                NativeOp::Sub => {
                    code.push(0x59);
                    code.push(0x58);
                    code.extend_from_slice(&[0x48, 0x29, 0xC8]); // sub rax, rcx
                    code.push(0x50);
                }
                NativeOp::Mul => {
                    code.push(0x59);
                    code.push(0x58);
                    code.extend_from_slice(&[0x48, 0x0F, 0xAF, 0xC1]); // imul rax, rcx
                    code.push(0x50);
                }
                NativeOp::ShlImm(shift) => {
                    code.push(0x58);
                    code.extend_from_slice(&[0x48, 0xC1, 0xE0, shift]); // shl rax, imm8
                    code.push(0x50);
                }
                NativeOp::Dup => {
                    code.push(0x58);
                    code.push(0x50);
                    code.push(0x50);
                }
                NativeOp::Pop => {
                    code.push(0x58);
                }
            }
        }
        code.push(0xC3); // ret
        Ok(code)
    }
}

/// The backend for the current target, if there is one
pub fn native_backend() -> Option<Box<dyn NativeBackend>> {
    #[cfg(all(target_arch = "x86_64", unix))]
    {
        Some(Box::new(X64Backend))
    }
    #[cfg(not(all(target_arch = "x86_64", unix)))]
    {
        None
    }
}
