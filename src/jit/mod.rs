//! JIT tier for optimized segments
//!
//! Takes an installed [`OptimizedCode`] segment, finds the longest
//! straight-line run of integer operations over locals inside it, and
//! compiles that run to native code. The run must enter and leave with an
//! empty operand stack, so the VM can substitute the native body for the
//! interpreted one: unbox the touched locals to an i64 image, call, rebox.
//!
//! Every failure here is survivable. Unsupported targets, unlowerable
//! segments, and mapping errors are logged at debug level and the segment
//! keeps running as optimized bytecode.

pub mod codegen;
pub mod memory;

pub use codegen::{native_backend, CodegenError, NativeBackend, NativeOp, X64Backend};
pub use memory::{ExecutableMemory, MemoryError};

use crate::bytecode::{Chunk, Opcode, OptimizedCode};
use thiserror::Error;

/// Why a segment did not reach native code
#[derive(Debug, Error)]
pub enum JitError {
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// A compiled native body for part of an optimized segment
pub struct JitCode {
    memory: ExecutableMemory,
    /// Bytecode range the native body replaces
    pub body_start: usize,
    pub body_end: usize,
    /// Local slots the body reads or writes; all must hold ints at entry
    pub used_slots: Vec<u8>,
    /// Times the native body ran
    pub calls: u64,
}

impl JitCode {
    /// Run the native body over an unboxed locals image.
    ///
    /// # Safety
    /// `locals` must have at least as many slots as the chunk declares;
    /// the image layout is what the code was compiled against.
    pub unsafe fn run(&mut self, locals: &mut [i64]) {
        let entry = unsafe { self.memory.entry() };
        if let Some(entry) = entry {
            self.calls += 1;
            entry(locals.as_mut_ptr());
        }
    }
}

impl std::fmt::Debug for JitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitCode")
            .field("body_start", &self.body_start)
            .field("body_end", &self.body_end)
            .field("used_slots", &self.used_slots)
            .field("calls", &self.calls)
            .finish()
    }
}

/// Compiles optimized segments down to native code
pub struct JitCompiler {
    backend: Option<Box<dyn NativeBackend>>,
}

impl Default for JitCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl JitCompiler {
    pub fn new() -> Self {
        Self {
            backend: native_backend(),
        }
    }

    /// Compile the best lowerable run inside `code`, if any
    pub fn compile(&self, chunk: &Chunk, code: &OptimizedCode) -> Result<JitCode, JitError> {
        let backend = self
            .backend
            .as_deref()
            .ok_or(CodegenError::UnsupportedTarget)?;
        let run = lower_segment(chunk, code).ok_or(CodegenError::NotLowerable)?;
        let native = backend.emit(&run.ops)?;
        let mut memory = ExecutableMemory::new(native.len())?;
        memory.write(0, &native)?;
        memory.seal()?;
        tracing::debug!(
            chunk = code.chunk_id,
            start = run.start,
            end = run.end,
            bytes = native.len(),
            backend = backend.name(),
            "jit compiled segment body"
        );
        Ok(JitCode {
            memory,
            body_start: run.start,
            body_end: run.end,
            used_slots: run.used_slots,
            calls: 0,
        })
    }
}

struct LoweredRun {
    start: usize,
    end: usize,
    ops: Vec<NativeOp>,
    used_slots: Vec<u8>,
}

/// Find the longest run of lowerable instructions in the rewritten stream
/// that begins and ends with an empty operand stack
fn lower_segment(chunk: &Chunk, code: &OptimizedCode) -> Option<LoweredRun> {
    let stream = &code.rewritten;
    let mut best: Option<LoweredRun> = None;

    let mut offset = code.start;
    let mut run_start = code.start;
    let mut ops: Vec<NativeOp> = Vec::new();
    let mut depth: i32 = 0;
    // last offset where the run could legally end
    let mut balanced: Option<(usize, usize)> = None; // (offset, ops len)

    macro_rules! close_run {
        ($next:expr) => {{
            if let Some((balanced_end, ops_len)) = balanced {
                let candidate_ops = ops[..ops_len].to_vec();
                if worth_compiling(&candidate_ops)
                    && best
                        .as_ref()
                        .is_none_or(|b| balanced_end - run_start > b.end - b.start)
                {
                    let used_slots = used_slots(&candidate_ops);
                    best = Some(LoweredRun {
                        start: run_start,
                        end: balanced_end,
                        ops: candidate_ops,
                        used_slots,
                    });
                }
            }
            ops.clear();
            depth = 0;
            balanced = None;
            run_start = $next;
        }};
    }

    while offset < code.end {
        let Some(op) = Opcode::from_u8(stream[offset]) else {
            break;
        };
        let next = offset + op.instruction_size();
        let lowered = match op {
            Opcode::Nop => Some(None),
            Opcode::GetLocal => Some(Some(NativeOp::LoadLocal(stream[offset + 1]))),
            Opcode::SetLocal => Some(Some(NativeOp::StoreLocal(stream[offset + 1]))),
            Opcode::Dup => Some(Some(NativeOp::Dup)),
            Opcode::Pop => Some(Some(NativeOp::Pop)),
            Opcode::AddInt => Some(Some(NativeOp::Add)),
            Opcode::SubInt => Some(Some(NativeOp::Sub)),
            Opcode::MulInt => Some(Some(NativeOp::Mul)),
            Opcode::ShlImm => Some(Some(NativeOp::ShlImm(stream[offset + 1]))),
            Opcode::Constant => {
                let index = u16::from_le_bytes([stream[offset + 1], stream[offset + 2]]);
                match code.constant(chunk, index).and_then(|v| v.as_int()) {
                    Some(value) => Some(Some(NativeOp::PushConst(value))),
                    None => None,
                }
            }
            _ => None,
        };

        match lowered {
            None => {
                close_run!(next);
            }
            Some(native) => {
                if let Some(native) = native {
                    let (pops, pushes) = stack_effect(native);
                    if depth < pops {
                        // stack content predates the run; cannot lower
                        close_run!(next);
                    } else {
                        depth = depth - pops + pushes;
                        ops.push(native);
                    }
                }
                if depth == 0 && !ops.is_empty() {
                    balanced = Some((next, ops.len()));
                }
            }
        }
        offset = next;
    }
    close_run!(offset);
    best
}

fn stack_effect(op: NativeOp) -> (i32, i32) {
    match op {
        NativeOp::LoadLocal(_) | NativeOp::PushConst(_) => (0, 1),
        NativeOp::StoreLocal(_) | NativeOp::Pop => (1, 0),
        NativeOp::Add | NativeOp::Sub | NativeOp::Mul => (2, 1),
        NativeOp::ShlImm(_) => (1, 1),
        NativeOp::Dup => (1, 2),
    }
}

/// A run is worth native code when it both computes and lands somewhere
fn worth_compiling(ops: &[NativeOp]) -> bool {
    let computes = ops.iter().any(|op| {
        matches!(
            op,
            NativeOp::Add | NativeOp::Sub | NativeOp::Mul | NativeOp::ShlImm(_)
        )
    });
    let stores = ops.iter().any(|op| matches!(op, NativeOp::StoreLocal(_)));
    computes && stores
}

fn used_slots(ops: &[NativeOp]) -> Vec<u8> {
    let mut slots: Vec<u8> = Vec::new();
    for op in ops {
        if let NativeOp::LoadLocal(slot) | NativeOp::StoreLocal(slot) = op {
            if !slots.contains(slot) {
                slots.push(*slot);
            }
        }
    }
    slots.sort_unstable();
    slots
}
