//! The bytecode interpreter
//!
//! The VM is the semantic oracle: every optimized or JIT-compiled path
//! must produce exactly what this interpreter produces, or abandon itself
//! and fall back here. Frames keep their locals in a per-frame vector and
//! share one operand stack.
//!
//! Tiering works through the `Loop` instruction. Each back edge feeds the
//! profiler; the edge that crosses the hot threshold hands the loop body to
//! the optimizer, and every later arrival at the loop head re-checks the
//! installed segment's guards before running its rewritten stream.
//! Specialized instructions self-check and bail out to the original stream
//! at the recorded offset, so deoptimization never repairs state after the
//! fact.

pub mod cache;

pub use cache::{CacheState, CacheTarget, CallSiteCache, InlineCaches, POLYMORPHIC_BOUND};

use crate::bytecode::optimizer::{Guard, DEOPT_THRESHOLD};
use crate::bytecode::{compile, Chunk, Opcode, OptimizedCode, Optimizer};
use crate::error::{Error, ErrorKind, Result, StackFrame};
use crate::jit::JitCompiler;
use crate::lexer::tokenize;
use crate::parser::parse;
use crate::profiler::{Profiler, ProfilerStats, HOT_LOOP_THRESHOLD};
use crate::runtime::builtins::Builtins;
use crate::runtime::value::{Class, Function, Instance, Object, Value};
use crate::runtime::Globals;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;

/// Script call depth at which recursion is cut off
pub const MAX_CALL_DEPTH: usize = 256;

/// Tuning knobs for one VM
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Back edges before a loop is handed to the optimizer
    pub hot_loop_threshold: u32,
    /// Deopts a segment tolerates; one more retires it for good
    pub deopt_threshold: u32,
    /// Distinct callees a call-site cache tracks before going megamorphic
    pub polymorphic_bound: usize,
    /// Whether hot loops are optimized at all
    pub optimize: bool,
    /// Whether optimized segments are also compiled to native code
    pub jit: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            hot_loop_threshold: HOT_LOOP_THRESHOLD,
            deopt_threshold: DEOPT_THRESHOLD,
            polymorphic_bound: POLYMORPHIC_BOUND,
            optimize: true,
            jit: true,
        }
    }
}

/// Execution counters, surfaced through `--profile`
#[derive(Debug, Clone, Copy, Default)]
pub struct VmStats {
    pub profiler: ProfilerStats,
    pub cached_call_sites: usize,
    pub optimized_segments: usize,
    pub retired_segments: usize,
    pub jit_bodies: usize,
    pub jit_calls: u64,
}

/// One activation record
struct CallFrame {
    chunk: Rc<Chunk>,
    ip: usize,
    locals: Vec<Value>,
    /// Operand stack height at entry; everything above it belongs to us
    stack_base: usize,
    /// Initializer frames discard the returned value for this one
    replace_return: Option<Value>,
    /// Optimized segment the frame is currently executing inside
    segment: Option<(u64, usize)>,
    /// Global table this frame resolves names in: the callee's defining
    /// environment, which for module functions is the module's own table
    globals: Rc<RefCell<Globals>>,
}

/// A registered `try` handler
#[derive(Debug, Clone, Copy)]
struct TryHandler {
    frame: usize,
    ip: usize,
    stack_len: usize,
}

/// The virtual machine
pub struct Vm {
    config: VmConfig,
    pub globals: Rc<RefCell<Globals>>,
    builtins: Rc<Builtins>,
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    handlers: Vec<TryHandler>,
    profiler: Profiler,
    caches: InlineCaches,
    optimizer: Optimizer,
    /// Installed segments, keyed by (chunk id, loop head)
    segments: FxHashMap<(u64, usize), OptimizedCode>,
    jit: JitCompiler,
    /// `None` marks a segment the JIT already refused
    jit_bodies: FxHashMap<(u64, usize), Option<crate::jit::JitCode>>,
    modules: FxHashMap<String, Value>,
    module_dir: PathBuf,
    /// Most recent `GetGlobal`, for attributing call-site callees
    last_global_load: Option<(String, usize)>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        Self::with_builtins(config, Builtins::new())
    }

    pub fn with_builtins(config: VmConfig, builtins: Builtins) -> Self {
        Self::with_shared(config, Rc::new(builtins))
    }

    fn with_shared(config: VmConfig, builtins: Rc<Builtins>) -> Self {
        let globals = Rc::new(RefCell::new(Globals::default()));
        builtins.install(&mut globals.borrow_mut());
        Self {
            profiler: Profiler::new(config.hot_loop_threshold),
            caches: InlineCaches::new(config.polymorphic_bound),
            optimizer: Optimizer::new(),
            jit: JitCompiler::new(),
            config,
            globals,
            builtins,
            frames: Vec::new(),
            stack: Vec::new(),
            handlers: Vec::new(),
            segments: FxHashMap::default(),
            jit_bodies: FxHashMap::default(),
            modules: FxHashMap::default(),
            module_dir: PathBuf::from("."),
            last_global_load: None,
        }
    }

    /// Where `import` resolves `<name>.levy` files
    pub fn set_module_dir(&mut self, dir: PathBuf) {
        self.module_dir = dir;
    }

    pub fn stats(&self) -> VmStats {
        VmStats {
            profiler: self.profiler.stats(),
            cached_call_sites: self.caches.len(),
            optimized_segments: self.segments.len(),
            retired_segments: self.segments.values().filter(|s| !s.active).count(),
            jit_bodies: self.jit_bodies.values().filter(|b| b.is_some()).count(),
            jit_calls: self.jit_bodies.values().flatten().map(|b| b.calls).sum(),
        }
    }

    /// Run a chunk to completion against the VM's globals
    pub fn execute(&mut self, chunk: Rc<Chunk>) -> Result<Value> {
        let entry_depth = self.frames.len();
        let stack_base = self.stack.len();
        let locals = vec![Value::None; chunk.local_count as usize];
        self.frames.push(CallFrame {
            chunk,
            ip: 0,
            locals,
            stack_base,
            replace_return: None,
            segment: None,
            globals: self.globals.clone(),
        });
        loop {
            match self.dispatch_one(entry_depth) {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(err) => {
                    if let Err(err) = self.unwind(err, entry_depth) {
                        self.frames.truncate(entry_depth);
                        self.handlers.retain(|h| h.frame < entry_depth);
                        self.stack.truncate(stack_base);
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Execute one instruction. `Some(value)` means the entry frame
    /// returned.
    fn dispatch_one(&mut self, entry_depth: usize) -> Result<Option<Value>> {
        let Some(frame_index) = self.frames.len().checked_sub(1) else {
            return Err(internal("no active frame"));
        };
        let chunk = self.frames[frame_index].chunk.clone();
        let ip = self.frames[frame_index].ip;

        // Validate the frame's segment before trusting its stream.
        let mut segment_key = None;
        if let Some(key) = self.frames[frame_index].segment {
            let live = self
                .segments
                .get(&key)
                .is_some_and(|s| s.active && s.contains(ip));
            if live {
                segment_key = Some(key);
            } else {
                self.frames[frame_index].segment = None;
            }
        }

        // Native fast path: run the compiled body over unboxed locals when
        // every slot it touches holds an int.
        if let Some(key) = segment_key {
            let entry = self
                .jit_bodies
                .get(&key)
                .and_then(|b| b.as_ref())
                .and_then(|body| {
                    (ip == body.body_start).then(|| (body.used_slots.clone(), body.body_end))
                });
            if let Some((slots, body_end)) = entry {
                let locals = &self.frames[frame_index].locals;
                let ready = slots
                    .iter()
                    .all(|&s| locals.get(s as usize).is_some_and(Value::is_int));
                if ready {
                    let size = slots.iter().map(|&s| s as usize + 1).max().unwrap_or(0);
                    let mut image = vec![0i64; size];
                    for &s in &slots {
                        if let Some(v) = self.frames[frame_index].locals[s as usize].as_int() {
                            image[s as usize] = v;
                        }
                    }
                    if let Some(Some(body)) = self.jit_bodies.get_mut(&key) {
                        unsafe { body.run(&mut image) };
                    }
                    for &s in &slots {
                        self.frames[frame_index].locals[s as usize] = Value::Int(image[s as usize]);
                    }
                    self.frames[frame_index].ip = body_end;
                    return Ok(None);
                }
            }
        }

        let (op, o1, o2, o3, o4) = {
            let stream: &[u8] = match segment_key {
                Some(key) => self
                    .segments
                    .get(&key)
                    .map(|s| s.rewritten.as_slice())
                    .unwrap_or(&chunk.code),
                None => &chunk.code,
            };
            let Some(byte) = stream.get(ip).copied() else {
                return Err(internal(&format!("ip {} out of range in {}", ip, chunk.name)));
            };
            let Some(op) = Opcode::from_u8(byte) else {
                return Err(internal(&format!("invalid opcode {:#04x} at {}", byte, ip)));
            };
            let at = |k: usize| stream.get(ip + k).copied().unwrap_or(0);
            (op, at(1), at(2), at(3), at(4))
        };
        let next = ip + op.instruction_size();
        self.frames[frame_index].ip = next;
        let wide = u16::from_le_bytes([o1, o2]);

        match op {
            Opcode::Nop => {}
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Dup => {
                let top = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| internal("dup on empty stack"))?;
                self.stack.push(top);
            }

            Opcode::Constant => {
                let value = match segment_key {
                    Some(key) => self
                        .segments
                        .get(&key)
                        .and_then(|s| s.constant(&chunk, wide))
                        .cloned(),
                    None => chunk.get_constant(wide).cloned(),
                };
                let value =
                    value.ok_or_else(|| internal(&format!("missing constant {}", wide)))?;
                self.stack.push(value);
            }
            Opcode::True => self.stack.push(Value::Bool(true)),
            Opcode::False => self.stack.push(Value::Bool(false)),
            Opcode::None => self.stack.push(Value::None),

            Opcode::GetLocal => {
                let value = self.frames[frame_index]
                    .locals
                    .get(o1 as usize)
                    .cloned()
                    .ok_or_else(|| internal("local slot out of range"))?;
                self.stack.push(value);
            }
            Opcode::SetLocal => {
                let value = self.pop()?;
                let slot = self.frames[frame_index]
                    .locals
                    .get_mut(o1 as usize)
                    .ok_or_else(|| internal("local slot out of range"))?;
                *slot = value;
            }
            Opcode::GetGlobal => {
                let name = self.const_str(&chunk, wide)?;
                let value = self.frames[frame_index]
                    .globals
                    .borrow()
                    .get(&name)
                    .ok_or_else(|| Error::name_error(format!("Undefined variable: {}", name)))?;
                self.stack.push(value);
                self.last_global_load = Some((name, self.stack.len() - 1));
            }
            Opcode::SetGlobal => {
                let name = self.const_str(&chunk, wide)?;
                let value = self.pop()?;
                self.frames[frame_index].globals.borrow_mut().set(&name, value);
                self.caches.invalidate_global(&name);
            }

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::Pow => {
                let b = self.pop()?;
                let a = self.pop()?;
                if matches!(op, Opcode::Add | Opcode::Sub | Opcode::Mul) {
                    self.profiler.record_binary(chunk.id, ip, &a, &b);
                }
                let result = match op {
                    Opcode::Add => a.add(&b),
                    Opcode::Sub => a.sub(&b),
                    Opcode::Mul => a.mul(&b),
                    Opcode::Div => a.div(&b),
                    Opcode::Mod => a.rem(&b),
                    _ => a.pow(&b),
                }?;
                self.stack.push(result);
            }
            Opcode::Negate => {
                let value = self.pop()?;
                self.stack.push(value.negate()?);
            }
            Opcode::And => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(a.logical_and(&b));
            }
            Opcode::Or => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(a.logical_or(&b));
            }
            Opcode::Not => {
                let value = self.pop()?;
                self.stack.push(value.not());
            }

            Opcode::Eq => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Value::Bool(a.equals(&b)));
            }
            Opcode::Ne => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Value::Bool(!a.equals(&b)));
            }
            Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                let b = self.pop()?;
                let a = self.pop()?;
                let (symbol, accept): (&str, fn(Ordering) -> bool) = match op {
                    Opcode::Lt => ("<", |o| o == Ordering::Less),
                    Opcode::Le => ("<=", |o| o != Ordering::Greater),
                    Opcode::Gt => (">", |o| o == Ordering::Greater),
                    _ => (">=", |o| o != Ordering::Less),
                };
                let ordering = a.order(&b, symbol)?;
                self.stack.push(Value::Bool(accept(ordering)));
            }

            Opcode::MakeList => {
                let count = o1 as usize;
                let Some(split) = self.stack.len().checked_sub(count) else {
                    return Err(internal("stack underflow in MakeList"));
                };
                let elements = self.stack.split_off(split);
                self.stack.push(Value::list(elements));
            }
            Opcode::MakeMap => {
                let mut entries = BTreeMap::new();
                for _ in 0..o1 {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    let Some(key) = key.as_str() else {
                        return Err(internal("non-string map key"));
                    };
                    entries.insert(key.to_string(), value);
                }
                self.stack.push(Value::map(entries));
            }
            Opcode::Index => {
                let key = self.pop()?;
                let object = self.pop()?;
                self.stack.push(index_value(&object, &key)?);
            }
            Opcode::SetIndex => {
                let value = self.pop()?;
                let key = self.pop()?;
                let object = self.pop()?;
                set_index_value(&object, &key, value)?;
            }
            Opcode::GetAttr => {
                let name = self.const_str(&chunk, wide)?;
                let object = self.pop()?;
                self.stack.push(get_attr(&object, &name)?);
            }
            Opcode::SetAttr => {
                let name = self.const_str(&chunk, wide)?;
                let value = self.pop()?;
                let object = self.pop()?;
                set_attr(&object, &name, value)?;
            }

            Opcode::Jump => {
                let distance = i16::from_le_bytes([o1, o2]);
                self.frames[frame_index].ip = (next as i64 + distance as i64) as usize;
            }
            Opcode::JumpIfFalse => {
                let condition = self.pop()?;
                if !condition.is_truthy() {
                    let distance = i16::from_le_bytes([o1, o2]);
                    self.frames[frame_index].ip = (next as i64 + distance as i64) as usize;
                }
            }
            Opcode::Loop => {
                let back = wide as usize;
                let Some(target) = next.checked_sub(back) else {
                    return Err(internal("loop target out of range"));
                };
                if let Some(hot) = self.profiler.record_back_edge(chunk.id, target, next) {
                    if self.config.optimize {
                        self.install_segment(frame_index, &chunk, hot.head, hot.end);
                    }
                }
                self.enter_segment(frame_index, (chunk.id, target));
                self.frames[frame_index].ip = target;
            }
            Opcode::ForIter => {
                let slot = o1 as usize;
                let exit = u16::from_le_bytes([o2, o3]) as usize;
                let iterable = self.frames[frame_index]
                    .locals
                    .get(slot)
                    .cloned()
                    .ok_or_else(|| internal("iterator slot out of range"))?;
                let cursor = self.frames[frame_index]
                    .locals
                    .get(slot + 1)
                    .and_then(Value::as_int)
                    .ok_or_else(|| internal("iterator cursor is not an int"))?;
                let element = match iterable.as_object().map(|o| &**o) {
                    Some(Object::List(elements)) => {
                        let elements = elements.borrow();
                        elements.get(cursor as usize).cloned()
                    }
                    Some(Object::Str(s)) => s
                        .chars()
                        .nth(cursor as usize)
                        .map(|c| Value::string(c.to_string())),
                    _ => {
                        return Err(Error::type_error(
                            "For loop requires an iterable (list or string).",
                        ))
                    }
                };
                match element {
                    Some(value) => {
                        self.stack.push(value);
                        self.frames[frame_index].locals[slot + 1] = Value::Int(cursor + 1);
                    }
                    None => self.frames[frame_index].ip = next + exit,
                }
            }
            Opcode::RequireInt => {
                if !self.stack.last().is_some_and(Value::is_int) {
                    return Err(Error::type_error("Repeat requires an integer count."));
                }
            }

            Opcode::Call => {
                let argc = o1 as usize;
                let Some(callee_index) = self.stack.len().checked_sub(argc + 1) else {
                    return Err(internal("stack underflow in Call"));
                };
                let callee = self.stack[callee_index].clone();
                let global = match &self.last_global_load {
                    Some((name, index)) if *index == callee_index => Some(name.clone()),
                    _ => None,
                };
                self.profiler.record_call(chunk.id, ip);
                self.caches
                    .record((chunk.id, ip), &callee, global.as_deref());
                let args = self.stack.split_off(callee_index + 1);
                self.stack.pop();
                self.call_value(&callee, args)?;
            }
            Opcode::CallCached => {
                let argc = o1 as usize;
                let site = (chunk.id, ip);
                let target = self.caches.monomorphic_target(site).map(|t| t.value.clone());
                match target {
                    Some(callee) => {
                        self.profiler.record_call(chunk.id, ip);
                        let Some(split) = self.stack.len().checked_sub(argc) else {
                            return Err(internal("stack underflow in CallCached"));
                        };
                        let args = self.stack.split_off(split);
                        self.call_value(&callee, args)?;
                    }
                    // The cache was invalidated under us; replay the
                    // original load-and-call sequence.
                    None => self.deopt_here(frame_index, ip)?,
                }
            }
            Opcode::Invoke => {
                let name = self.const_str(&chunk, wide)?;
                let argc = o3 as usize;
                let Some(receiver_index) = self.stack.len().checked_sub(argc + 1) else {
                    return Err(internal("stack underflow in Invoke"));
                };
                let receiver = self.stack[receiver_index].clone();
                self.profiler.record_call(chunk.id, ip);
                let method = resolve_member(&receiver, &name)?;
                self.caches.record((chunk.id, ip), &method, None);
                let args = self.stack.split_off(receiver_index + 1);
                self.stack.pop();
                self.invoke_resolved(&receiver, &name, method, args)?;
            }
            Opcode::SuperInvoke => {
                let name = self.const_str(&chunk, wide)?;
                let argc = o3 as usize;
                let Some(receiver_index) = self.stack.len().checked_sub(argc + 1) else {
                    return Err(internal("stack underflow in SuperInvoke"));
                };
                let receiver = self.stack[receiver_index].clone();
                let method = super_method(&receiver, &name)?;
                let args = self.stack.split_off(receiver_index + 1);
                self.stack.pop();
                self.call_function(&method, args, receiver, None)?;
            }
            Opcode::Return | Opcode::ReturnNone => {
                let value = if op == Opcode::Return {
                    self.pop()?
                } else {
                    Value::None
                };
                let Some(frame) = self.frames.pop() else {
                    return Err(internal("return without a frame"));
                };
                self.handlers.retain(|h| h.frame < self.frames.len());
                self.stack.truncate(frame.stack_base);
                let value = frame.replace_return.unwrap_or(value);
                if self.frames.len() == entry_depth {
                    return Ok(Some(value));
                }
                self.stack.push(value);
            }
            Opcode::MakeFunction => {
                let prototype = chunk
                    .get_constant(wide)
                    .ok_or_else(|| internal("missing function constant"))?;
                let Some(Object::Function(prototype)) = prototype.as_object().map(|o| &**o)
                else {
                    return Err(internal("non-function constant in MakeFunction"));
                };
                // Capture the defining environment, so the function keeps
                // resolving names in its own module after the import.
                let function = Value::function(Function {
                    name: prototype.name.clone(),
                    arity: prototype.arity,
                    chunk: prototype.chunk.clone(),
                    globals: Some(self.frames[frame_index].globals.clone()),
                });
                self.stack.push(function);
            }
            Opcode::MakeClass => {
                let name = self.const_str(&chunk, wide)?;
                let count = o3 as usize;
                let has_parent = o4 != 0;
                let Some(split) = self.stack.len().checked_sub(count) else {
                    return Err(internal("stack underflow in MakeClass"));
                };
                let method_values = self.stack.split_off(split);
                let parent = if has_parent {
                    let parent = self.pop()?;
                    match parent.as_object() {
                        Some(o) if matches!(&**o, Object::Class(_)) => Some(o.clone()),
                        _ => {
                            return Err(Error::type_error(format!(
                                "Parent of '{}' must be a class.",
                                name
                            )))
                        }
                    }
                } else {
                    None
                };
                let mut methods = FxHashMap::default();
                for method in method_values {
                    let Some(Object::Function(f)) = method.as_object().map(|o| &**o) else {
                        return Err(internal("non-function in class body"));
                    };
                    methods.insert(f.name.clone(), method.clone());
                }
                self.stack.push(Value::Object(Rc::new(Object::Class(Class {
                    name,
                    methods,
                    parent,
                }))));
            }

            Opcode::EnterTry => {
                self.handlers.push(TryHandler {
                    frame: frame_index,
                    ip: next + wide as usize,
                    stack_len: self.stack.len(),
                });
            }
            Opcode::LeaveTry => {
                if self.handlers.pop().is_none() {
                    return Err(internal("LeaveTry without a handler"));
                }
            }

            Opcode::Import => {
                let name = self.const_str(&chunk, wide)?;
                let module = match self.modules.get(&name) {
                    Some(module) => module.clone(),
                    None => self.load_module(&name)?,
                };
                self.frames[frame_index]
                    .globals
                    .borrow_mut()
                    .set(&name, module.clone());
                self.caches.invalidate_global(&name);
                self.stack.push(module);
            }

            Opcode::AddInt | Opcode::SubInt | Opcode::MulInt => {
                let len = self.stack.len();
                let ints =
                    len >= 2 && self.stack[len - 1].is_int() && self.stack[len - 2].is_int();
                if ints {
                    let (Some(Value::Int(b)), Some(Value::Int(a))) =
                        (self.stack.pop(), self.stack.pop())
                    else {
                        return Err(internal("int specialization lost its operands"));
                    };
                    let result = match op {
                        Opcode::AddInt => a.wrapping_add(b),
                        Opcode::SubInt => a.wrapping_sub(b),
                        _ => a.wrapping_mul(b),
                    };
                    self.stack.push(Value::Int(result));
                } else {
                    self.deopt_here(frame_index, ip)?;
                }
            }
            Opcode::AddFloat | Opcode::SubFloat | Opcode::MulFloat => {
                let len = self.stack.len();
                let floats =
                    len >= 2 && self.stack[len - 1].is_float() && self.stack[len - 2].is_float();
                if floats {
                    let (Some(Value::Float(b)), Some(Value::Float(a))) =
                        (self.stack.pop(), self.stack.pop())
                    else {
                        return Err(internal("float specialization lost its operands"));
                    };
                    let result = match op {
                        Opcode::AddFloat => a + b,
                        Opcode::SubFloat => a - b,
                        _ => a * b,
                    };
                    self.stack.push(Value::Float(result));
                } else {
                    self.deopt_here(frame_index, ip)?;
                }
            }
            Opcode::ShlImm => {
                if self.stack.last().is_some_and(Value::is_int) {
                    let Some(Value::Int(v)) = self.stack.pop() else {
                        return Err(internal("shift lost its operand"));
                    };
                    self.stack.push(Value::Int(v.wrapping_shl(o1 as u32)));
                } else {
                    self.deopt_here(frame_index, ip)?;
                }
            }
            Opcode::IndexList => {
                let len = self.stack.len();
                let element = if len >= 2 {
                    let index = self.stack[len - 1].as_int();
                    match (self.stack[len - 2].as_object().map(|o| &**o), index) {
                        (Some(Object::List(elements)), Some(i)) if i >= 0 => {
                            elements.borrow().get(i as usize).cloned()
                        }
                        _ => Option::None,
                    }
                } else {
                    Option::None
                };
                match element {
                    Some(value) => {
                        self.stack.truncate(len - 2);
                        self.stack.push(value);
                    }
                    Option::None => self.deopt_here(frame_index, ip)?,
                }
            }
        }
        Ok(None)
    }

    // ---- calls ----

    fn call_value(&mut self, callee: &Value, args: Vec<Value>) -> Result<()> {
        match callee.as_object().map(|o| &**o) {
            Some(Object::Function(_)) => self.call_function(callee, args, Value::None, None),
            Some(Object::Builtin(name)) => {
                let result = self.builtins.invoke(name, None, &args)?;
                self.stack.push(result);
                Ok(())
            }
            Some(Object::Class(_)) => self.instantiate(callee.clone(), args),
            _ => Err(Error::type_error(format!(
                "Type {} is not callable.",
                callee.type_name()
            ))),
        }
    }

    fn call_function(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        receiver: Value,
        replace_return: Option<Value>,
    ) -> Result<()> {
        let Some(Object::Function(function)) = callee.as_object().map(|o| &**o) else {
            return Err(internal("call_function on a non-function"));
        };
        if args.len() != function.arity as usize {
            return Err(Error::runtime(
                ErrorKind::ArityError,
                format!("Expected {} args, got {}.", function.arity, args.len()),
            ));
        }
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(Error::runtime(
                ErrorKind::GenericError,
                "Maximum call depth exceeded.",
            ));
        }
        let mut locals = vec![Value::None; function.chunk.local_count as usize];
        if let Some(slot) = locals.get_mut(0) {
            *slot = receiver;
        }
        for (i, arg) in args.into_iter().enumerate() {
            locals[i + 1] = arg;
        }
        self.frames.push(CallFrame {
            chunk: function.chunk.clone(),
            ip: 0,
            locals,
            stack_base: self.stack.len(),
            replace_return,
            segment: None,
            globals: function
                .globals
                .clone()
                .unwrap_or_else(|| self.globals.clone()),
        });
        Ok(())
    }

    fn instantiate(&mut self, class_value: Value, args: Vec<Value>) -> Result<()> {
        let Some(class_obj) = class_value.as_object().cloned() else {
            return Err(internal("instantiate on a non-class"));
        };
        let Object::Class(class) = &*class_obj else {
            return Err(internal("instantiate on a non-class"));
        };
        let instance = Value::Object(Rc::new(Object::Instance(Instance {
            class: class_obj.clone(),
            fields: RefCell::new(BTreeMap::new()),
        })));
        match class.find_method("init") {
            Some(init) => self.call_function(&init, args, instance.clone(), Some(instance)),
            None if args.is_empty() => {
                self.stack.push(instance);
                Ok(())
            }
            None => Err(Error::runtime(
                ErrorKind::ArityError,
                format!("Expected 0 args, got {}.", args.len()),
            )),
        }
    }

    fn invoke_resolved(
        &mut self,
        receiver: &Value,
        name: &str,
        method: Value,
        args: Vec<Value>,
    ) -> Result<()> {
        match method.as_object().map(|o| &**o) {
            Some(Object::Function(_)) => {
                // Instance methods bind the receiver; functions carried in
                // maps (modules) are called unbound.
                let bound = matches!(
                    receiver.as_object().map(|o| &**o),
                    Some(Object::Instance(_))
                );
                let this = if bound { receiver.clone() } else { Value::None };
                self.call_function(&method, args, this, None)
            }
            Some(Object::Builtin(builtin)) => {
                let result = self.builtins.invoke(builtin, Some(receiver), &args)?;
                self.stack.push(result);
                Ok(())
            }
            _ => Err(Error::type_error(format!("'{}' is not callable.", name))),
        }
    }

    // ---- tiering ----

    fn install_segment(&mut self, frame_index: usize, chunk: &Chunk, head: usize, end: usize) {
        let key = (chunk.id, head);
        if self.segments.contains_key(&key) {
            return;
        }
        let globals = self.frames[frame_index].globals.clone();
        let Some(code) = self.optimizer.optimize(
            chunk,
            head,
            end,
            &self.profiler,
            &self.caches,
            &globals.borrow(),
        ) else {
            return;
        };
        if self.config.jit {
            match self.jit.compile(chunk, &code) {
                Ok(body) => {
                    self.jit_bodies.insert(key, Some(body));
                }
                Err(err) => {
                    tracing::debug!(chunk = chunk.id, head, %err, "segment stays on bytecode");
                    self.jit_bodies.insert(key, None);
                }
            }
        }
        self.segments.insert(key, code);
    }

    /// Arriving at a loop head: activate the installed segment when its
    /// guards hold, count a deopt when they do not
    fn enter_segment(&mut self, frame_index: usize, key: (u64, usize)) {
        let verdict = self
            .segments
            .get(&key)
            .filter(|s| s.active)
            .map(|s| self.guards_hold(frame_index, s));
        match verdict {
            Some(true) => {
                if let Some(seg) = self.segments.get_mut(&key) {
                    seg.hits += 1;
                }
                self.frames[frame_index].segment = Some(key);
            }
            Some(false) => {
                if let Some(seg) = self.segments.get_mut(&key) {
                    if seg.record_deopt(self.config.deopt_threshold) {
                        tracing::debug!(
                            chunk = key.0,
                            head = key.1,
                            deopts = seg.deopts,
                            "optimized segment retired"
                        );
                    }
                }
                self.frames[frame_index].segment = None;
            }
            None => self.frames[frame_index].segment = None,
        }
    }

    fn guards_hold(&self, frame_index: usize, segment: &OptimizedCode) -> bool {
        let frame = &self.frames[frame_index];
        let globals = frame.globals.borrow();
        segment
            .guards
            .iter()
            .all(|guard| guard_holds(guard, &frame.locals, &globals))
    }

    /// Abandon the rewritten stream at `ip`, rewinding to the recorded
    /// bailout in the original
    fn deopt_here(&mut self, frame_index: usize, ip: usize) -> Result<()> {
        let Some(key) = self.frames[frame_index].segment else {
            return Err(internal(&format!(
                "specialized instruction at {} outside a segment",
                ip
            )));
        };
        let Some(seg) = self.segments.get_mut(&key) else {
            return Err(internal("segment vanished during execution"));
        };
        if seg.record_deopt(self.config.deopt_threshold) {
            tracing::debug!(
                chunk = key.0,
                head = key.1,
                deopts = seg.deopts,
                "optimized segment retired"
            );
        }
        let bailout = seg.bailout(ip);
        for _ in 0..bailout.pop {
            self.stack.pop();
        }
        let frame = &mut self.frames[frame_index];
        frame.ip = bailout.resume;
        frame.segment = None;
        Ok(())
    }

    // ---- errors ----

    fn unwind(&mut self, err: Error, entry_depth: usize) -> Result<()> {
        if err.is_catchable() {
            if let Some(pos) = self.handlers.iter().rposition(|h| h.frame >= entry_depth) {
                let handler = self.handlers[pos];
                self.handlers.truncate(pos);
                self.frames.truncate(handler.frame + 1);
                self.stack.truncate(handler.stack_len);
                if let Some(frame) = self.frames.last_mut() {
                    frame.ip = handler.ip;
                    frame.segment = None;
                }
                return Ok(());
            }
        }
        Err(self.attach_trace(err))
    }

    fn attach_trace(&self, err: Error) -> Error {
        let Error::RuntimeError {
            kind,
            message,
            mut trace,
        } = err
        else {
            return err;
        };
        for frame in self.frames.iter().rev() {
            let line = frame.chunk.get_line(frame.ip.saturating_sub(1));
            trace.push(StackFrame::new(frame.chunk.name.clone(), line));
        }
        Error::RuntimeError {
            kind,
            message,
            trace,
        }
    }

    // ---- modules ----

    /// Load `<name>.levy`, run it in a fresh VM sharing this one's
    /// builtins, and capture its top-level bindings as a map
    fn load_module(&mut self, name: &str) -> Result<Value> {
        let path = self.module_dir.join(format!("{}.levy", name));
        let source = std::fs::read_to_string(&path).map_err(|_| {
            Error::Module(format!("Cannot load module '{}' ({})", name, path.display()))
        })?;
        let chunk = compile(&parse(tokenize(&source)?)?)?;
        let mut child = Vm::with_shared(self.config.clone(), self.builtins.clone());
        child.module_dir = self.module_dir.clone();
        let baseline: FxHashMap<String, u64> = {
            let globals = child.globals.borrow();
            globals
                .iter()
                .map(|(n, _)| (n.clone(), globals.version(n)))
                .collect()
        };
        child
            .execute(chunk)
            .map_err(|err| Error::Module(format!("In module '{}': {}", name, err)))?;
        let mut entries = BTreeMap::new();
        let globals = child.globals.borrow();
        for (n, v) in globals.iter() {
            if baseline.get(n).copied() != Some(globals.version(n)) {
                entries.insert(n.clone(), v.clone());
            }
        }
        let module = Value::map(entries);
        self.modules.insert(name.to_string(), module.clone());
        Ok(module)
    }

    // ---- small helpers ----

    fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| internal("operand stack underflow"))
    }

    fn const_str(&self, chunk: &Chunk, index: u16) -> Result<String> {
        chunk
            .get_constant(index)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| internal(&format!("missing name constant {}", index)))
    }
}

fn internal(message: &str) -> Error {
    Error::Internal(message.to_string())
}

/// Check one speculation guard against a frame's locals and globals
fn guard_holds(guard: &Guard, locals: &[Value], globals: &Globals) -> bool {
    match guard {
        Guard::IsInt { slot } => locals.get(*slot as usize).is_some_and(Value::is_int),
        Guard::IsFloat { slot } => locals.get(*slot as usize).is_some_and(Value::is_float),
        Guard::InBounds {
            list_slot,
            index_slot,
        } => {
            let list = locals.get(*list_slot as usize);
            let index = locals.get(*index_slot as usize).and_then(Value::as_int);
            match (list.and_then(Value::as_object).map(|o| &**o), index) {
                (Some(Object::List(elements)), Some(i)) => {
                    i >= 0 && (i as usize) < elements.borrow().len()
                }
                _ => false,
            }
        }
        Guard::CalleeIs { name, identity } => {
            globals.get(name).as_ref().and_then(Value::identity) == Some(*identity)
        }
        Guard::GlobalUnchanged { name, version } => globals.version(name) == *version,
    }
}

// ---- object protocol ----

fn index_value(object: &Value, key: &Value) -> Result<Value> {
    match object.as_object().map(|o| &**o) {
        Some(Object::List(elements)) => {
            let index = key
                .as_int()
                .ok_or_else(|| Error::type_error("List index must be an integer."))?;
            let elements = elements.borrow();
            if index < 0 || index as usize >= elements.len() {
                return Err(Error::runtime(ErrorKind::IndexError, "Index out of range."));
            }
            Ok(elements[index as usize].clone())
        }
        Some(Object::Str(s)) => {
            let index = key
                .as_int()
                .ok_or_else(|| Error::type_error("String index must be an integer."))?;
            s.chars()
                .nth(index.try_into().map_err(|_| {
                    Error::runtime(ErrorKind::IndexError, "Index out of range.")
                })?)
                .map(|c| Value::string(c.to_string()))
                .ok_or_else(|| Error::runtime(ErrorKind::IndexError, "Index out of range."))
        }
        Some(Object::Map(entries)) => {
            let Some(k) = key.as_str() else {
                return Err(Error::type_error("Map key must be a string."));
            };
            entries
                .borrow()
                .get(k)
                .cloned()
                .ok_or_else(|| Error::runtime(ErrorKind::KeyError, format!("Key not found: {}", k)))
        }
        _ => Err(Error::type_error(format!(
            "Type {} is not indexable.",
            object.type_name()
        ))),
    }
}

fn set_index_value(object: &Value, key: &Value, value: Value) -> Result<()> {
    match object.as_object().map(|o| &**o) {
        Some(Object::List(elements)) => {
            let index = key
                .as_int()
                .ok_or_else(|| Error::type_error("List index must be an integer."))?;
            let mut elements = elements.borrow_mut();
            if index < 0 || index as usize >= elements.len() {
                return Err(Error::runtime(ErrorKind::IndexError, "Index out of range."));
            }
            elements[index as usize] = value;
            Ok(())
        }
        Some(Object::Map(entries)) => {
            let Some(k) = key.as_str() else {
                return Err(Error::type_error("Map key must be a string."));
            };
            entries.borrow_mut().insert(k.to_string(), value);
            Ok(())
        }
        _ => Err(Error::type_error(format!(
            "Type {} is not indexable.",
            object.type_name()
        ))),
    }
}

fn get_attr(object: &Value, name: &str) -> Result<Value> {
    match object.as_object().map(|o| &**o) {
        Some(Object::Instance(instance)) => {
            if let Some(value) = instance.fields.borrow().get(name) {
                return Ok(value.clone());
            }
            match &*instance.class {
                Object::Class(class) => class.find_method(name),
                _ => Option::None,
            }
            .ok_or_else(|| Error::name_error(format!("Undefined property: {}", name)))
        }
        Some(Object::Map(entries)) => entries
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::runtime(ErrorKind::KeyError, format!("Key not found: {}", name))),
        _ => Err(Error::type_error(format!(
            "Type {} has no attributes.",
            object.type_name()
        ))),
    }
}

fn set_attr(object: &Value, name: &str, value: Value) -> Result<()> {
    match object.as_object().map(|o| &**o) {
        Some(Object::Instance(instance)) => {
            instance.fields.borrow_mut().insert(name.to_string(), value);
            Ok(())
        }
        Some(Object::Map(entries)) => {
            entries.borrow_mut().insert(name.to_string(), value);
            Ok(())
        }
        _ => Err(Error::type_error(format!(
            "Type {} has no attributes.",
            object.type_name()
        ))),
    }
}

/// Member lookup for `Invoke`: instance fields and methods, or map entries
fn resolve_member(receiver: &Value, name: &str) -> Result<Value> {
    match receiver.as_object().map(|o| &**o) {
        Some(Object::Instance(instance)) => {
            if let Some(value) = instance.fields.borrow().get(name) {
                return Ok(value.clone());
            }
            match &*instance.class {
                Object::Class(class) => class.find_method(name),
                _ => Option::None,
            }
            .ok_or_else(|| Error::name_error(format!("Undefined property: {}", name)))
        }
        Some(Object::Map(entries)) => entries
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::runtime(ErrorKind::KeyError, format!("Key not found: {}", name))),
        _ => Err(Error::type_error(format!(
            "Cannot call method '{}' on {}.",
            name,
            receiver.type_name()
        ))),
    }
}

fn super_method(receiver: &Value, name: &str) -> Result<Value> {
    let Some(Object::Instance(instance)) = receiver.as_object().map(|o| &**o) else {
        return Err(Error::type_error("'super' is only valid inside a method."));
    };
    let Object::Class(class) = &*instance.class else {
        return Err(internal("instance without a class"));
    };
    let parent = class
        .parent
        .as_ref()
        .ok_or_else(|| Error::name_error(format!("Class '{}' has no parent.", class.name)))?;
    let Object::Class(parent_class) = &**parent else {
        return Err(internal("parent is not a class"));
    };
    parent_class
        .find_method(name)
        .ok_or_else(|| Error::name_error(format!("Undefined property: {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_capture(config: VmConfig, source: &str) -> (Vm, String) {
        let buffer = Rc::new(RefCell::new(Vec::new()));
        let mut vm = Vm::with_builtins(config, Builtins::with_output(buffer.clone()));
        let chunk = compile(&parse(tokenize(source).unwrap()).unwrap()).unwrap();
        vm.execute(chunk).unwrap();
        let out = String::from_utf8(buffer.borrow().clone()).unwrap();
        (vm, out)
    }

    fn interpreted() -> VmConfig {
        VmConfig {
            optimize: false,
            jit: false,
            ..VmConfig::default()
        }
    }

    #[test]
    fn arithmetic_and_say() {
        let (_, out) = run_capture(interpreted(), "say(1 + 2 * 3)");
        assert_eq!(out, "7\n");
    }

    #[test]
    fn while_loop_sums_interpreted() {
        let source = r#"
            total <- 0
            i <- 0
            while i < 1000 {
                total <- total + i
                i <- i + 1
            }
            say(total)
        "#;
        let (_, out) = run_capture(interpreted(), source);
        assert_eq!(out, "499500\n");
    }

    #[test]
    fn hot_loop_optimizes_and_matches_interpreter() {
        let source = r#"
            total <- 0
            i <- 0
            while i < 1000 {
                total <- total + i
                i <- i + 1
            }
            say(total)
        "#;
        let config = VmConfig {
            hot_loop_threshold: 10,
            ..VmConfig::default()
        };
        let (vm, out) = run_capture(config, source);
        assert_eq!(out, "499500\n");
        let stats = vm.stats();
        assert!(stats.profiler.hot_loops >= 1);
        assert!(stats.optimized_segments >= 1);
    }

    #[test]
    fn type_change_deoptimizes_and_retires() {
        let source = r#"
            act run() {
                x <- 0
                i <- 0
                while i < 50 {
                    if i == 30 {
                        x <- x + 0.5
                    }
                    x <- x + 1
                    i <- i + 1
                }
                -> x
            }
            say(run())
        "#;
        let config = VmConfig {
            hot_loop_threshold: 10,
            deopt_threshold: 3,
            jit: false,
            ..VmConfig::default()
        };
        let (vm, out) = run_capture(config, source);
        assert_eq!(out, "50.500000\n");
        let stats = vm.stats();
        assert!(stats.optimized_segments >= 1);
        assert_eq!(stats.retired_segments, stats.optimized_segments);
    }

    #[test]
    fn monomorphic_call_gets_cached() {
        let source = r#"
            act double(n) {
                -> n * 2
            }
            act run() {
                total <- 0
                i <- 0
                while i < 300 {
                    total <- total + double(i)
                    i <- i + 1
                }
                -> total
            }
            say(run())
        "#;
        let config = VmConfig {
            hot_loop_threshold: 10,
            ..VmConfig::default()
        };
        let (vm, out) = run_capture(config, source);
        // 2 * sum(0..299)
        assert_eq!(out, "89700\n");
        let stats = vm.stats();
        assert!(stats.cached_call_sites >= 1);
        assert!(stats.optimized_segments >= 1);
    }

    #[cfg(all(target_arch = "x86_64", unix))]
    #[test]
    fn straight_line_int_loop_reaches_native_code() {
        let source = r#"
            act spin() {
                x <- 1
                i <- 0
                while i < 200 {
                    x <- i * 8
                    i <- i + 1
                }
                -> x
            }
            say(spin())
        "#;
        let config = VmConfig {
            hot_loop_threshold: 10,
            ..VmConfig::default()
        };
        let (vm, out) = run_capture(config, source);
        assert_eq!(out, "1592\n");
        let stats = vm.stats();
        assert!(stats.jit_bodies >= 1);
        assert!(stats.jit_calls > 0);
    }

    #[test]
    fn try_catch_recovers() {
        let source = r#"
            try {
                x <- 1 / 0
                say("unreachable")
            } catch {
                say("caught")
            }
            say("after")
        "#;
        let (_, out) = run_capture(interpreted(), source);
        assert_eq!(out, "caught\nafter\n");
    }

    #[test]
    fn undefined_variable_reports_a_trace() {
        let buffer = Rc::new(RefCell::new(Vec::new()));
        let mut vm = Vm::with_builtins(interpreted(), Builtins::with_output(buffer));
        let chunk = compile(&parse(tokenize("say(missing)").unwrap()).unwrap()).unwrap();
        let err = vm.execute(chunk).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("Undefined variable: missing"));
        assert!(text.contains("<script>"));
    }

    #[test]
    fn classes_support_init_fields_and_super() {
        let source = r#"
            class Animal {
                init(name) {
                    self.name <- name
                }
                act speak() {
                    -> self.name + " makes a sound"
                }
            }
            class Dog is a Animal {
                act speak() {
                    -> super.speak() + " (woof)"
                }
            }
            d <- Dog("Rex")
            say(d.speak())
        "#;
        let (_, out) = run_capture(interpreted(), source);
        assert_eq!(out, "Rex makes a sound (woof)\n");
    }

    #[test]
    fn for_loops_iterate_lists_and_strings() {
        let source = r#"
            for x in [1, 2, 3] {
                say(x)
            }
            for c in "ab" {
                say(c)
            }
        "#;
        let (_, out) = run_capture(interpreted(), source);
        assert_eq!(out, "1\n2\n3\na\nb\n");
    }

    #[test]
    fn repeat_requires_an_integer() {
        let buffer = Rc::new(RefCell::new(Vec::new()));
        let mut vm = Vm::with_builtins(interpreted(), Builtins::with_output(buffer));
        let chunk =
            compile(&parse(tokenize("repeat \"three\" { say(1) }").unwrap()).unwrap()).unwrap();
        let err = vm.execute(chunk).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::TypeError));
    }

    #[test]
    fn type_guards_check_the_frame_locals() {
        let locals = vec![Value::Int(3), Value::Float(1.5), Value::string("x")];
        let globals = Globals::default();
        assert!(guard_holds(&Guard::IsInt { slot: 0 }, &locals, &globals));
        assert!(!guard_holds(&Guard::IsInt { slot: 1 }, &locals, &globals));
        assert!(guard_holds(&Guard::IsFloat { slot: 1 }, &locals, &globals));
        assert!(!guard_holds(&Guard::IsFloat { slot: 2 }, &locals, &globals));
        // a slot past the frame never passes
        assert!(!guard_holds(&Guard::IsInt { slot: 9 }, &locals, &globals));
    }

    #[test]
    fn bounds_guards_check_list_and_index() {
        let globals = Globals::default();
        let guard = Guard::InBounds {
            list_slot: 0,
            index_slot: 1,
        };
        let list = Value::list(vec![Value::Int(1), Value::Int(2)]);
        assert!(guard_holds(&guard, &[list.clone(), Value::Int(1)], &globals));
        assert!(!guard_holds(&guard, &[list.clone(), Value::Int(2)], &globals));
        assert!(!guard_holds(&guard, &[list.clone(), Value::Int(-1)], &globals));
        assert!(!guard_holds(&guard, &[list, Value::Float(0.0)], &globals));
        assert!(!guard_holds(&guard, &[Value::Int(0), Value::Int(0)], &globals));
    }

    #[test]
    fn global_guards_track_identity_and_version() {
        let mut globals = Globals::default();
        let callee = Value::builtin("f");
        globals.set("f", callee.clone());
        let identity = callee.identity().unwrap();
        let version = globals.version("f");
        let callee_is = Guard::CalleeIs {
            name: "f".to_string(),
            identity,
        };
        let unchanged = Guard::GlobalUnchanged {
            name: "f".to_string(),
            version,
        };
        assert!(guard_holds(&callee_is, &[], &globals));
        assert!(guard_holds(&unchanged, &[], &globals));
        globals.set("f", Value::builtin("g"));
        assert!(!guard_holds(&callee_is, &[], &globals));
        assert!(!guard_holds(&unchanged, &[], &globals));
    }

    #[test]
    fn rebinding_a_called_global_stays_correct() {
        // The first function gets cached inside the hot loop; rebinding
        // must route every later call to the second.
        let source = r#"
            act one(n) {
                -> 1
            }
            act two(n) {
                -> 2
            }
            pick <- one
            total <- 0
            i <- 0
            while i < 400 {
                total <- total + pick(i)
                if i == 199 {
                    pick <- two
                }
                i <- i + 1
            }
            say(total)
        "#;
        let config = VmConfig {
            hot_loop_threshold: 10,
            deopt_threshold: 3,
            ..VmConfig::default()
        };
        let (_, out) = run_capture(config, source);
        assert_eq!(out, "600\n");
    }
}
