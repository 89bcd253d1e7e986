//! Hot-path profiler
//!
//! Counts loop back edges and observes operand types while the interpreter
//! runs. A loop whose back-edge count crosses the configured threshold is
//! reported as hot exactly once; the VM then hands its body to the
//! optimizer. Type observations merge monotonically: once two different
//! kinds have been seen at an instruction the profile is `Mixed` and stays
//! there.

use crate::runtime::Value;
use rustc_hash::FxHashMap;

/// Back-edge count at which a loop becomes a candidate for optimization
pub const HOT_LOOP_THRESHOLD: u32 = 100;

/// Operand kind as seen by the profiler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedType {
    Int,
    Float,
    Bool,
    Str,
    Heap,
    Mixed,
}

impl ObservedType {
    /// Classify a runtime value
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Int(_) => ObservedType::Int,
            Value::Float(_) => ObservedType::Float,
            Value::Bool(_) => ObservedType::Bool,
            Value::None => ObservedType::Heap,
            Value::Object(_) => {
                if value.is_str() {
                    ObservedType::Str
                } else {
                    ObservedType::Heap
                }
            }
        }
    }

    /// Monotone merge; disagreement collapses to `Mixed` permanently
    pub fn merge(self, other: ObservedType) -> ObservedType {
        if self == other {
            self
        } else {
            ObservedType::Mixed
        }
    }
}

/// Type observations for one binary instruction
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeProfile {
    pub left: Option<ObservedType>,
    pub right: Option<ObservedType>,
    pub samples: u32,
}

impl TypeProfile {
    fn record(&mut self, left: ObservedType, right: ObservedType) {
        self.left = Some(self.left.map_or(left, |t| t.merge(left)));
        self.right = Some(self.right.map_or(right, |t| t.merge(right)));
        self.samples = self.samples.saturating_add(1);
    }

    /// Both operands have only ever been integers
    pub fn stable_int(&self) -> bool {
        self.left == Some(ObservedType::Int) && self.right == Some(ObservedType::Int)
    }

    /// Both operands have only ever been floats
    pub fn stable_float(&self) -> bool {
        self.left == Some(ObservedType::Float) && self.right == Some(ObservedType::Float)
    }
}

/// State of one profiled loop
#[derive(Debug, Clone, Copy)]
pub struct LoopProfile {
    /// Offset of the loop head (back-edge target)
    pub head: usize,
    /// Offset just past the `Loop` instruction
    pub end: usize,
    /// Back edges taken so far
    pub back_edges: u32,
    /// Whether the loop has already been handed to the optimizer
    pub compiled: bool,
}

/// Summary counters exposed through the runtime's `--profile` output
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfilerStats {
    pub loops_seen: usize,
    pub hot_loops: usize,
    pub call_sites: usize,
}

/// Per-VM profiling tables, keyed by (chunk id, offset)
#[derive(Debug, Default)]
pub struct Profiler {
    hot_threshold: u32,
    loops: FxHashMap<(u64, usize), LoopProfile>,
    types: FxHashMap<(u64, usize), TypeProfile>,
    calls: FxHashMap<(u64, usize), u32>,
}

impl Profiler {
    /// Create a profiler with the given hot-loop threshold
    pub fn new(hot_threshold: u32) -> Self {
        Self {
            hot_threshold,
            ..Self::default()
        }
    }

    /// Record one back edge. Returns the loop profile when this edge pushed
    /// the loop over the threshold; a loop is reported at most once.
    pub fn record_back_edge(
        &mut self,
        chunk_id: u64,
        head: usize,
        end: usize,
    ) -> Option<LoopProfile> {
        let profile = self
            .loops
            .entry((chunk_id, head))
            .or_insert(LoopProfile {
                head,
                end,
                back_edges: 0,
                compiled: false,
            });
        profile.back_edges = profile.back_edges.saturating_add(1);
        if !profile.compiled && profile.back_edges >= self.hot_threshold {
            profile.compiled = true;
            return Some(*profile);
        }
        None
    }

    /// Record operand types at a binary instruction
    pub fn record_binary(&mut self, chunk_id: u64, offset: usize, left: &Value, right: &Value) {
        self.types
            .entry((chunk_id, offset))
            .or_default()
            .record(ObservedType::of(left), ObservedType::of(right));
    }

    /// Observations for one instruction, if any
    pub fn binary_profile(&self, chunk_id: u64, offset: usize) -> Option<&TypeProfile> {
        self.types.get(&(chunk_id, offset))
    }

    /// Count one invocation at a call site
    pub fn record_call(&mut self, chunk_id: u64, offset: usize) {
        *self.calls.entry((chunk_id, offset)).or_insert(0) += 1;
    }

    /// Summary counters
    pub fn stats(&self) -> ProfilerStats {
        ProfilerStats {
            loops_seen: self.loops.len(),
            hot_loops: self.loops.values().filter(|l| l.compiled).count(),
            call_sites: self.calls.len(),
        }
    }
}
