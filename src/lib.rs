//! Levython: a bytecode VM with a speculative JIT tier for the Levy
//! scripting language
//!
//! Levy is a small dynamically typed language (`x <- 1`, `say(x)`,
//! `act f(n) { -> n * 2 }`). Levython executes it in tiers: a bytecode
//! interpreter that defines the language's semantics, a hot-loop profiler,
//! a profile-guided bytecode optimizer that rewrites hot segments under
//! guards, and a JIT that compiles straight-line integer runs of those
//! segments to native code. Every speculative tier bails back to the
//! interpreter when its assumptions stop holding, so observable behavior
//! never depends on which tier ran.
//!
//! # Quick Start
//!
//! ```no_run
//! use levython::Runtime;
//!
//! fn main() -> levython::Result<()> {
//!     let mut runtime = Runtime::default();
//!     runtime.eval("say(1 + 2 * 3)")?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! The pipeline flows: Source → [`lexer`] → [`parser`] → [`ast`] →
//! [`bytecode`] → [`runtime`], with [`profiler`] and [`jit`] feeding the
//! optimizing tiers.

pub mod ast;
pub mod bytecode;
pub mod jit;
pub mod lexer;
pub mod parser;
pub mod profiler;
pub mod runtime;

mod error;

pub use error::{Error, ErrorKind, Result};
pub use runtime::{Runtime, Value, Vm, VmConfig, VmStats};

/// Levython version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
