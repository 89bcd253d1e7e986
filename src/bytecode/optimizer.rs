//! Profile-guided bytecode optimizer
//!
//! Rewrites a hot instruction range into a faster stream under guards. All
//! rewrites are length-preserving: replaced patterns are padded with `Nop`
//! so every instruction keeps its offset in both streams. That alignment is
//! what makes deoptimization exact: the interpreter can fall back to the
//! original stream at the current offset (or, for patterns that change the
//! stack shape, at a recorded bailout) without any state repair.
//!
//! Side-effecting instructions are never removed, reordered, or moved
//! across one another.

use crate::bytecode::{Chunk, Opcode};
use crate::profiler::Profiler;
use crate::runtime::vm::InlineCaches;
use crate::runtime::{Globals, Value};
use rustc_hash::FxHashMap;

/// Deopts an optimized segment tolerates; one more retires it for good
pub const DEOPT_THRESHOLD: u32 = 10;

/// A predicate over frame and global state, checked before running a
/// rewritten stream
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// Local slot holds an int
    IsInt { slot: u8 },
    /// Local slot holds a float
    IsFloat { slot: u8 },
    /// Local `index_slot` is a valid index into the list in `list_slot`
    InBounds { list_slot: u8, index_slot: u8 },
    /// The named global still resolves to this exact function
    CalleeIs { name: String, identity: usize },
    /// The named global binding has not been rebound since version
    GlobalUnchanged { name: String, version: u64 },
}

/// Where to resume in the original stream when a rewritten instruction
/// bails out, and how many pushed values to discard first
#[derive(Debug, Clone, Copy)]
pub struct Bailout {
    pub resume: usize,
    pub pop: u8,
}

/// A rewritten copy of a hot segment, plus everything needed to abandon it
#[derive(Debug)]
pub struct OptimizedCode {
    pub chunk_id: u64,
    /// Segment bounds in the chunk, loop head to just past the back edge
    pub start: usize,
    pub end: usize,
    /// Bit-identical copy of the chunk's code at optimization time
    pub original: Vec<u8>,
    /// Same stream with the segment rewritten
    pub rewritten: Vec<u8>,
    /// Constants the rewrite introduced, indexed after the chunk's pool
    pub extra_constants: Vec<Value>,
    /// Entry guards, all of which must pass before the rewritten stream runs
    pub guards: Vec<Guard>,
    /// Mid-segment bailout points for instructions that self-check
    pub bailouts: FxHashMap<usize, Bailout>,
    /// Times the rewritten stream was entered
    pub hits: u64,
    /// Times a guard failed or an instruction bailed out
    pub deopts: u32,
    /// Cleared permanently once deopts cross [`DEOPT_THRESHOLD`]
    pub active: bool,
}

impl OptimizedCode {
    /// Whether an instruction offset lies inside the rewritten segment
    pub fn contains(&self, offset: usize) -> bool {
        offset >= self.start && offset < self.end
    }

    /// Count one guard failure or bailout. The segment stays live until
    /// failures exceed `threshold`, then retires permanently; returns
    /// whether this call retired it.
    pub fn record_deopt(&mut self, threshold: u32) -> bool {
        self.deopts += 1;
        if self.active && self.deopts > threshold {
            self.active = false;
            return true;
        }
        false
    }

    /// Bailout for a rewritten offset; identity when none was recorded
    pub fn bailout(&self, offset: usize) -> Bailout {
        self.bailouts
            .get(&offset)
            .copied()
            .unwrap_or(Bailout {
                resume: offset,
                pop: 0,
            })
    }

    /// Resolve a constant index through the chunk pool, then the extras
    pub fn constant<'a>(&'a self, chunk: &'a Chunk, index: u16) -> Option<&'a Value> {
        let index = index as usize;
        if index < chunk.constants.len() {
            chunk.constants.get(index)
        } else {
            self.extra_constants.get(index - chunk.constants.len())
        }
    }
}

/// The optimizer itself; stateless between calls
#[derive(Debug, Default)]
pub struct Optimizer;

impl Optimizer {
    pub fn new() -> Self {
        Self
    }

    /// Rewrite `chunk[start..end]` using the collected profiles. Returns
    /// `None` when no rewrite applies.
    pub fn optimize(
        &self,
        chunk: &Chunk,
        start: usize,
        end: usize,
        profiler: &Profiler,
        caches: &InlineCaches,
        globals: &Globals,
    ) -> Option<OptimizedCode> {
        let mut code = chunk.code.clone();
        let mut extra = Vec::new();
        let mut guards = Vec::new();
        let mut bailouts = FxHashMap::default();
        let mut changed = false;

        changed |= fold_constants(&mut code, start, end, &chunk.constants, &mut extra);
        changed |= reduce_strength(&mut code, start, end, &chunk.constants, &mut extra, &mut guards);
        changed |= elide_redundant_loads(&mut code, start, end);
        changed |= specialize_arith_ops(&mut code, start, end, chunk.id, profiler, &mut guards);
        changed |= specialize_list_index(&mut code, start, end, &mut guards);
        changed |= specialize_calls(
            &mut code,
            start,
            end,
            chunk,
            caches,
            globals,
            &mut guards,
            &mut bailouts,
        );

        if !changed {
            return None;
        }
        tracing::debug!(
            chunk = chunk.id,
            start,
            end,
            guards = guards.len(),
            "installed optimized segment"
        );
        Some(OptimizedCode {
            chunk_id: chunk.id,
            start,
            end,
            original: chunk.code.clone(),
            rewritten: code,
            extra_constants: extra,
            guards,
            bailouts,
            hits: 0,
            deopts: 0,
            active: true,
        })
    }
}

/// Iterate instruction offsets in `[start, end)`
fn instruction_offsets(code: &[u8], start: usize, end: usize) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut offset = start;
    while offset < end {
        let Some(op) = Opcode::from_u8(code[offset]) else {
            break;
        };
        offsets.push(offset);
        offset += op.instruction_size();
    }
    offsets
}

fn opcode_at(code: &[u8], offset: usize) -> Option<Opcode> {
    code.get(offset).copied().and_then(Opcode::from_u8)
}

fn read_u16_at(code: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([code[offset], code[offset + 1]])
}

/// Index of `value` in the combined pool, appending to the extras if new.
/// `None` when the pool is full.
fn intern_constant(base: &[Value], extra: &mut Vec<Value>, value: Value) -> Option<u16> {
    if let Some(i) = base.iter().position(|c| c.same_constant(&value)) {
        return Some(i as u16);
    }
    if let Some(i) = extra.iter().position(|c| c.same_constant(&value)) {
        return u16::try_from(base.len() + i).ok();
    }
    let index = u16::try_from(base.len() + extra.len()).ok()?;
    extra.push(value);
    Some(index)
}

fn constant_of<'a>(base: &'a [Value], extra: &'a [Value], index: u16) -> Option<&'a Value> {
    let index = index as usize;
    if index < base.len() {
        base.get(index)
    } else {
        extra.get(index - base.len())
    }
}

/// Fold `Constant a; Constant b; arith-op` into a single constant load.
/// Numeric operands only; a fold that would fail at runtime (division by
/// zero) is left alone. Running this on already-folded code changes
/// nothing.
fn fold_constants(
    code: &mut [u8],
    start: usize,
    end: usize,
    base: &[Value],
    extra: &mut Vec<Value>,
) -> bool {
    let mut changed = false;
    let offsets = instruction_offsets(code, start, end);
    for &p in &offsets {
        if p + 7 > end {
            break;
        }
        if opcode_at(code, p) != Some(Opcode::Constant)
            || opcode_at(code, p + 3) != Some(Opcode::Constant)
        {
            continue;
        }
        let op = match opcode_at(code, p + 6) {
            Some(
                op @ (Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::Pow),
            ) => op,
            _ => continue,
        };
        let left = constant_of(base, extra, read_u16_at(code, p + 1)).cloned();
        let right = constant_of(base, extra, read_u16_at(code, p + 4)).cloned();
        let (Some(left), Some(right)) = (left, right) else {
            continue;
        };
        if !(left.is_int() || left.is_float()) || !(right.is_int() || right.is_float()) {
            continue;
        }
        let folded = match op {
            Opcode::Add => left.add(&right),
            Opcode::Sub => left.sub(&right),
            Opcode::Mul => left.mul(&right),
            Opcode::Div => left.div(&right),
            Opcode::Mod => left.rem(&right),
            Opcode::Pow => left.pow(&right),
            _ => unreachable!(),
        };
        let Ok(folded) = folded else {
            continue;
        };
        let Some(index) = intern_constant(base, extra, folded) else {
            continue;
        };
        code[p] = Opcode::Constant as u8;
        code[p + 1..p + 3].copy_from_slice(&index.to_le_bytes());
        for byte in &mut code[p + 3..p + 7] {
            *byte = Opcode::Nop as u8;
        }
        changed = true;
    }
    changed
}

/// Reduce `GetLocal x; Constant 2^k; Mul` to `GetLocal x; ShlImm k`,
/// guarded on the local holding an int
fn reduce_strength(
    code: &mut [u8],
    start: usize,
    end: usize,
    base: &[Value],
    extra: &[Value],
    guards: &mut Vec<Guard>,
) -> bool {
    let mut changed = false;
    let offsets = instruction_offsets(code, start, end);
    for &p in &offsets {
        if p + 6 > end {
            break;
        }
        if opcode_at(code, p) != Some(Opcode::GetLocal)
            || opcode_at(code, p + 2) != Some(Opcode::Constant)
            || opcode_at(code, p + 5) != Some(Opcode::Mul)
        {
            continue;
        }
        let factor = constant_of(base, extra, read_u16_at(code, p + 3)).and_then(Value::as_int);
        let Some(factor) = factor else {
            continue;
        };
        if factor <= 0 || !(factor as u64).is_power_of_two() {
            continue;
        }
        let shift = factor.trailing_zeros() as u8;
        let slot = code[p + 1];
        code[p + 2] = Opcode::ShlImm as u8;
        code[p + 3] = shift;
        code[p + 4] = Opcode::Nop as u8;
        code[p + 5] = Opcode::Nop as u8;
        let guard = Guard::IsInt { slot };
        if !guards.contains(&guard) {
            guards.push(guard);
        }
        changed = true;
    }
    changed
}

/// Replace `SetLocal n; GetLocal n` with `Dup; SetLocal n`, removing the
/// reload of a value that is already on the stack
fn elide_redundant_loads(code: &mut [u8], start: usize, end: usize) -> bool {
    let mut changed = false;
    let offsets = instruction_offsets(code, start, end);
    for &p in &offsets {
        if p + 4 > end {
            break;
        }
        if opcode_at(code, p) != Some(Opcode::SetLocal)
            || opcode_at(code, p + 2) != Some(Opcode::GetLocal)
            || code[p + 1] != code[p + 3]
        {
            continue;
        }
        let slot = code[p + 1];
        code[p] = Opcode::Dup as u8;
        code[p + 1] = Opcode::SetLocal as u8;
        code[p + 2] = slot;
        code[p + 3] = Opcode::Nop as u8;
        changed = true;
    }
    changed
}

/// Swap generic arithmetic for the type-specialized form where the profile
/// has only ever seen one numeric kind. The specialized ops self-check and
/// bail out in place; when both operands come straight from locals the pass
/// also emits entry type guards, so a loop whose slots drifted is not
/// re-entered at all.
fn specialize_arith_ops(
    code: &mut [u8],
    start: usize,
    end: usize,
    chunk_id: u64,
    profiler: &Profiler,
    guards: &mut Vec<Guard>,
) -> bool {
    let mut changed = false;
    let offsets = instruction_offsets(code, start, end);
    for &p in &offsets {
        let (int_form, float_form) = match opcode_at(code, p) {
            Some(Opcode::Add) => (Opcode::AddInt, Opcode::AddFloat),
            Some(Opcode::Sub) => (Opcode::SubInt, Opcode::SubFloat),
            Some(Opcode::Mul) => (Opcode::MulInt, Opcode::MulFloat),
            _ => continue,
        };
        let Some(profile) = profiler.binary_profile(chunk_id, p) else {
            continue;
        };
        let ints = profile.stable_int();
        let replacement = if ints {
            int_form
        } else if profile.stable_float() {
            float_form
        } else {
            continue;
        };
        code[p] = replacement as u8;
        // `GetLocal a; GetLocal b; op`: the operand slots are known here,
        // so segment entry can check them directly.
        let through_locals = p >= start + 4
            && offsets.contains(&(p - 4))
            && opcode_at(code, p - 4) == Some(Opcode::GetLocal)
            && opcode_at(code, p - 2) == Some(Opcode::GetLocal);
        if through_locals {
            for slot in [code[p - 3], code[p - 1]] {
                let guard = if ints {
                    Guard::IsInt { slot }
                } else {
                    Guard::IsFloat { slot }
                };
                if !guards.contains(&guard) {
                    guards.push(guard);
                }
            }
        }
        changed = true;
    }
    changed
}

/// Narrow `GetLocal list; GetLocal index; Index` to the list-specialized
/// read, guarded on the index being in bounds at segment entry. The
/// specialized read still self-checks, so a list that shrinks mid-loop
/// bails out in place.
fn specialize_list_index(
    code: &mut [u8],
    start: usize,
    end: usize,
    guards: &mut Vec<Guard>,
) -> bool {
    let mut changed = false;
    let offsets = instruction_offsets(code, start, end);
    for &p in &offsets {
        if p + 5 > end {
            break;
        }
        if opcode_at(code, p) != Some(Opcode::GetLocal)
            || opcode_at(code, p + 2) != Some(Opcode::GetLocal)
            || opcode_at(code, p + 4) != Some(Opcode::Index)
        {
            continue;
        }
        code[p + 4] = Opcode::IndexList as u8;
        let guard = Guard::InBounds {
            list_slot: code[p + 1],
            index_slot: code[p + 3],
        };
        if !guards.contains(&guard) {
            guards.push(guard);
        }
        changed = true;
    }
    changed
}

/// Specialize a monomorphic `GetGlobal f; <pure arg pushes>; Call n` into
/// `Nop x3; <pushes>; CallCached n`. The bailout rewinds past the argument
/// pushes, which the matcher restricts to side-effect-free instructions,
/// so re-execution from the `GetGlobal` is exact.
#[allow(clippy::too_many_arguments)]
fn specialize_calls(
    code: &mut [u8],
    start: usize,
    end: usize,
    chunk: &Chunk,
    caches: &InlineCaches,
    globals: &Globals,
    guards: &mut Vec<Guard>,
    bailouts: &mut FxHashMap<usize, Bailout>,
) -> bool {
    let mut changed = false;
    let offsets = instruction_offsets(code, start, end);
    for &g in &offsets {
        if opcode_at(code, g) != Some(Opcode::GetGlobal) {
            continue;
        }
        let name = match chunk.get_constant(read_u16_at(code, g + 1)).and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => continue,
        };

        // Walk the pure pushes between the load and the call.
        let mut p = g + 3;
        let mut pushes = 0u8;
        let call_at = loop {
            match opcode_at(code, p) {
                Some(Opcode::Call) => break p,
                Some(
                    op @ (Opcode::Constant
                    | Opcode::GetLocal
                    | Opcode::True
                    | Opcode::False
                    | Opcode::None),
                ) => {
                    if p + op.instruction_size() > end || pushes == u8::MAX {
                        break usize::MAX;
                    }
                    pushes += 1;
                    p += op.instruction_size();
                }
                _ => break usize::MAX,
            }
        };
        if call_at == usize::MAX || call_at + 2 > end || code[call_at + 1] != pushes {
            continue;
        }

        let site = (chunk.id, call_at);
        let Some(target) = caches.monomorphic_target(site) else {
            continue;
        };
        let through_global = caches
            .lookup(site)
            .and_then(|entry| entry.global.as_deref())
            == Some(name.as_str());
        if !through_global {
            continue;
        }
        // The binding must still hold the cached function right now.
        let current = globals.get(&name);
        if current.as_ref().and_then(Value::identity) != Some(target.identity) {
            continue;
        }

        code[g] = Opcode::Nop as u8;
        code[g + 1] = Opcode::Nop as u8;
        code[g + 2] = Opcode::Nop as u8;
        code[call_at] = Opcode::CallCached as u8;
        bailouts.insert(
            call_at,
            Bailout {
                resume: g,
                pop: pushes,
            },
        );
        guards.push(Guard::CalleeIs {
            name: name.clone(),
            identity: target.identity,
        });
        guards.push(Guard::GlobalUnchanged {
            version: globals.version(&name),
            name,
        });
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_with(build: impl FnOnce(&mut Chunk)) -> Chunk {
        let mut chunk = Chunk::new("test");
        build(&mut chunk);
        chunk
    }

    #[test]
    fn folds_literal_arithmetic() {
        let mut chunk = chunk_with(|c| {
            let a = c.add_constant(Value::Int(2));
            let b = c.add_constant(Value::Int(3));
            c.write_opcode(Opcode::Constant, 1);
            c.write_u16(a, 1);
            c.write_opcode(Opcode::Constant, 1);
            c.write_u16(b, 1);
            c.write_opcode(Opcode::Add, 1);
        });
        let end = chunk.code.len();
        let mut code = chunk.code.clone();
        let mut extra = Vec::new();
        assert!(fold_constants(&mut code, 0, end, &chunk.constants, &mut extra));

        assert_eq!(Opcode::from_u8(code[0]), Some(Opcode::Constant));
        let index = read_u16_at(&code, 1);
        let folded = constant_of(&chunk.constants, &extra, index).unwrap();
        assert!(folded.same_constant(&Value::Int(5)));
        assert!(code[3..7].iter().all(|&b| b == Opcode::Nop as u8));

        // idempotent: a second run changes nothing
        let before = code.clone();
        assert!(!fold_constants(&mut code, 0, end, &chunk.constants, &mut extra));
        assert_eq!(code, before);

        // mutating `chunk` was never on the table
        assert_eq!(Opcode::from_u8(chunk.code[6]), Some(Opcode::Add));
    }

    #[test]
    fn never_folds_division_by_zero() {
        let chunk = chunk_with(|c| {
            let a = c.add_constant(Value::Int(1));
            let b = c.add_constant(Value::Int(0));
            c.write_opcode(Opcode::Constant, 1);
            c.write_u16(a, 1);
            c.write_opcode(Opcode::Constant, 1);
            c.write_u16(b, 1);
            c.write_opcode(Opcode::Div, 1);
        });
        let mut code = chunk.code.clone();
        let mut extra = Vec::new();
        let end = code.len();
        assert!(!fold_constants(&mut code, 0, end, &chunk.constants, &mut extra));
        assert_eq!(code, chunk.code);
    }

    #[test]
    fn fold_preserves_result_kind() {
        let chunk = chunk_with(|c| {
            let a = c.add_constant(Value::Int(7));
            let b = c.add_constant(Value::Int(2));
            c.write_opcode(Opcode::Constant, 1);
            c.write_u16(a, 1);
            c.write_opcode(Opcode::Constant, 1);
            c.write_u16(b, 1);
            c.write_opcode(Opcode::Div, 1);
        });
        let mut code = chunk.code.clone();
        let mut extra = Vec::new();
        let end = code.len();
        assert!(fold_constants(&mut code, 0, end, &chunk.constants, &mut extra));
        let folded = constant_of(&chunk.constants, &extra, read_u16_at(&code, 1)).unwrap();
        assert!(folded.is_float());
    }

    #[test]
    fn reduces_power_of_two_multiply() {
        let chunk = chunk_with(|c| {
            let eight = c.add_constant(Value::Int(8));
            c.write_opcode(Opcode::GetLocal, 1);
            c.write(2, 1);
            c.write_opcode(Opcode::Constant, 1);
            c.write_u16(eight, 1);
            c.write_opcode(Opcode::Mul, 1);
        });
        let mut code = chunk.code.clone();
        let mut guards = Vec::new();
        let end = code.len();
        assert!(reduce_strength(
            &mut code,
            0,
            end,
            &chunk.constants,
            &[],
            &mut guards
        ));
        assert_eq!(Opcode::from_u8(code[2]), Some(Opcode::ShlImm));
        assert_eq!(code[3], 3);
        assert_eq!(guards, vec![Guard::IsInt { slot: 2 }]);
    }

    #[test]
    fn non_power_of_two_multiply_is_left_alone() {
        for factor in [6, -8, 0] {
            let chunk = chunk_with(|c| {
                let factor = c.add_constant(Value::Int(factor));
                c.write_opcode(Opcode::GetLocal, 1);
                c.write(0, 1);
                c.write_opcode(Opcode::Constant, 1);
                c.write_u16(factor, 1);
                c.write_opcode(Opcode::Mul, 1);
            });
            let mut code = chunk.code.clone();
            let mut guards = Vec::new();
            let end = code.len();
            assert!(!reduce_strength(
                &mut code,
                0,
                end,
                &chunk.constants,
                &[],
                &mut guards
            ));
            assert_eq!(code, chunk.code);
        }
    }

    #[test]
    fn elides_store_then_load() {
        let chunk = chunk_with(|c| {
            c.write_opcode(Opcode::SetLocal, 1);
            c.write(4, 1);
            c.write_opcode(Opcode::GetLocal, 1);
            c.write(4, 1);
        });
        let mut code = chunk.code.clone();
        let end = code.len();
        assert!(elide_redundant_loads(&mut code, 0, end));
        assert_eq!(Opcode::from_u8(code[0]), Some(Opcode::Dup));
        assert_eq!(Opcode::from_u8(code[1]), Some(Opcode::SetLocal));
        assert_eq!(code[2], 4);
        assert_eq!(Opcode::from_u8(code[3]), Some(Opcode::Nop));
    }

    #[test]
    fn store_load_of_different_slots_is_kept() {
        let chunk = chunk_with(|c| {
            c.write_opcode(Opcode::SetLocal, 1);
            c.write(4, 1);
            c.write_opcode(Opcode::GetLocal, 1);
            c.write(5, 1);
        });
        let mut code = chunk.code.clone();
        let end = code.len();
        assert!(!elide_redundant_loads(&mut code, 0, end));
    }

    #[test]
    fn specializes_stably_int_add() {
        let chunk = chunk_with(|c| {
            c.write_opcode(Opcode::GetLocal, 1);
            c.write(0, 1);
            c.write_opcode(Opcode::GetLocal, 1);
            c.write(1, 1);
            c.write_opcode(Opcode::Add, 1);
        });
        let mut profiler = Profiler::new(100);
        profiler.record_binary(chunk.id, 4, &Value::Int(1), &Value::Int(2));

        let mut code = chunk.code.clone();
        let mut guards = Vec::new();
        let end = code.len();
        assert!(specialize_arith_ops(
            &mut code,
            0,
            end,
            chunk.id,
            &profiler,
            &mut guards
        ));
        assert_eq!(Opcode::from_u8(code[4]), Some(Opcode::AddInt));
        assert_eq!(
            guards,
            vec![Guard::IsInt { slot: 0 }, Guard::IsInt { slot: 1 }]
        );

        // a mixed profile blocks the rewrite
        profiler.record_binary(chunk.id, 4, &Value::Float(1.0), &Value::Int(2));
        let mut code = chunk.code.clone();
        let mut guards = Vec::new();
        assert!(!specialize_arith_ops(
            &mut code,
            0,
            end,
            chunk.id,
            &profiler,
            &mut guards
        ));
        assert!(guards.is_empty());
    }

    #[test]
    fn specializes_stably_float_add() {
        let chunk = chunk_with(|c| {
            c.write_opcode(Opcode::GetLocal, 1);
            c.write(0, 1);
            c.write_opcode(Opcode::GetLocal, 1);
            c.write(1, 1);
            c.write_opcode(Opcode::Add, 1);
        });
        let mut profiler = Profiler::new(100);
        profiler.record_binary(chunk.id, 4, &Value::Float(0.5), &Value::Float(1.5));

        let mut code = chunk.code.clone();
        let mut guards = Vec::new();
        let end = code.len();
        assert!(specialize_arith_ops(
            &mut code,
            0,
            end,
            chunk.id,
            &profiler,
            &mut guards
        ));
        assert_eq!(Opcode::from_u8(code[4]), Some(Opcode::AddFloat));
        assert_eq!(
            guards,
            vec![Guard::IsFloat { slot: 0 }, Guard::IsFloat { slot: 1 }]
        );
    }

    #[test]
    fn arith_without_local_operands_gets_no_entry_guard() {
        // Constant 1; GetLocal 0; Add: the left operand is not a slot, so
        // the rewrite lands but no guard does.
        let chunk = chunk_with(|c| {
            let one = c.add_constant(Value::Int(1));
            c.write_opcode(Opcode::Constant, 1);
            c.write_u16(one, 1);
            c.write_opcode(Opcode::GetLocal, 1);
            c.write(0, 1);
            c.write_opcode(Opcode::Add, 1);
        });
        let mut profiler = Profiler::new(100);
        profiler.record_binary(chunk.id, 5, &Value::Int(1), &Value::Int(2));

        let mut code = chunk.code.clone();
        let mut guards = Vec::new();
        let end = code.len();
        assert!(specialize_arith_ops(
            &mut code,
            0,
            end,
            chunk.id,
            &profiler,
            &mut guards
        ));
        assert_eq!(Opcode::from_u8(code[5]), Some(Opcode::AddInt));
        assert!(guards.is_empty());
    }

    #[test]
    fn narrows_list_index_through_locals() {
        let chunk = chunk_with(|c| {
            c.write_opcode(Opcode::GetLocal, 1);
            c.write(2, 1);
            c.write_opcode(Opcode::GetLocal, 1);
            c.write(3, 1);
            c.write_opcode(Opcode::Index, 1);
        });
        let mut code = chunk.code.clone();
        let mut guards = Vec::new();
        let end = code.len();
        assert!(specialize_list_index(&mut code, 0, end, &mut guards));
        assert_eq!(Opcode::from_u8(code[4]), Some(Opcode::IndexList));
        assert_eq!(
            guards,
            vec![Guard::InBounds {
                list_slot: 2,
                index_slot: 3
            }]
        );

        // an index computed on the stack is left alone
        let chunk = chunk_with(|c| {
            c.write_opcode(Opcode::GetLocal, 1);
            c.write(2, 1);
            c.write_opcode(Opcode::Dup, 1);
            c.write_opcode(Opcode::Index, 1);
        });
        let mut code = chunk.code.clone();
        let mut guards = Vec::new();
        let end = code.len();
        assert!(!specialize_list_index(&mut code, 0, end, &mut guards));
        assert_eq!(code, chunk.code);
    }

    #[test]
    fn retirement_requires_exceeding_the_threshold() {
        let chunk = chunk_with(|c| c.write_opcode(Opcode::Nop, 1));
        let mut code = OptimizedCode {
            chunk_id: chunk.id,
            start: 0,
            end: chunk.code.len(),
            original: chunk.code.clone(),
            rewritten: chunk.code.clone(),
            extra_constants: Vec::new(),
            guards: Vec::new(),
            bailouts: FxHashMap::default(),
            hits: 0,
            deopts: 0,
            active: true,
        };
        // threshold failures are tolerated; one more retires for good
        assert!(!code.record_deopt(2));
        assert!(!code.record_deopt(2));
        assert!(code.active);
        assert!(code.record_deopt(2));
        assert!(!code.active);
        assert!(!code.record_deopt(2));
        assert!(!code.active);
    }

    #[test]
    fn caches_monomorphic_global_call() {
        let mut chunk = chunk_with(|c| {
            let name = c.add_constant(Value::string("f"));
            let arg = c.add_constant(Value::Int(1));
            c.write_opcode(Opcode::GetGlobal, 1);
            c.write_u16(name, 1);
            c.write_opcode(Opcode::Constant, 1);
            c.write_u16(arg, 1);
            c.write_opcode(Opcode::Call, 1);
            c.write(1, 1);
        });
        chunk.local_count = 0;
        let call_at = 6;

        let callee = Value::builtin("f");
        let mut globals = Globals::default();
        globals.set("f", callee.clone());
        let mut caches = InlineCaches::new(4);
        caches.record((chunk.id, call_at), &callee, Some("f"));

        let mut code = chunk.code.clone();
        let mut guards = Vec::new();
        let mut bailouts = FxHashMap::default();
        let end = code.len();
        assert!(specialize_calls(
            &mut code,
            0,
            end,
            &chunk,
            &caches,
            &globals,
            &mut guards,
            &mut bailouts
        ));
        assert!(code[0..3].iter().all(|&b| b == Opcode::Nop as u8));
        assert_eq!(Opcode::from_u8(code[call_at]), Some(Opcode::CallCached));

        let bailout = bailouts[&call_at];
        assert_eq!(bailout.resume, 0);
        assert_eq!(bailout.pop, 1);
        assert!(guards
            .iter()
            .any(|g| matches!(g, Guard::CalleeIs { name, .. } if name == "f")));
        assert!(guards
            .iter()
            .any(|g| matches!(g, Guard::GlobalUnchanged { name, .. } if name == "f")));

        // a polymorphic site is never rewritten
        caches.record((chunk.id, call_at), &Value::builtin("g"), Some("f"));
        let mut code = chunk.code.clone();
        let mut guards = Vec::new();
        let mut bailouts = FxHashMap::default();
        assert!(!specialize_calls(
            &mut code,
            0,
            end,
            &chunk,
            &caches,
            &globals,
            &mut guards,
            &mut bailouts
        ));
    }
}
