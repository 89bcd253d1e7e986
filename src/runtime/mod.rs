//! Runtime: values, globals, builtins, and the VM
//!
//! [`Runtime`] is the embedding surface. It owns one [`vm::Vm`], feeds it
//! compiled chunks, and keeps global state alive between `eval` calls so a
//! REPL session accumulates definitions.

pub mod builtins;
pub mod value;
pub mod vm;

pub use builtins::{Builtins, OutputSink};
pub use value::{Class, FileHandle, Function, Instance, Object, Value};
pub use vm::{Vm, VmConfig, VmStats, MAX_CALL_DEPTH};

use crate::bytecode::compile;
use crate::error::Result;
use crate::lexer::tokenize;
use crate::parser::parse;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};

/// Global bindings with per-name rebind versions
///
/// Every store bumps the name's version, including a store of the same
/// value. The optimizer records versions in guards and the VM compares
/// them, which is how a rebound global retires the code specialized on it.
#[derive(Debug, Default)]
pub struct Globals {
    values: FxHashMap<String, Value>,
    versions: FxHashMap<String, u64>,
}

impl Globals {
    /// Current value of a binding
    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }

    /// Bind or rebind a name, bumping its version
    pub fn set(&mut self, name: &str, value: Value) {
        *self.versions.entry(name.to_string()).or_insert(0) += 1;
        self.values.insert(name.to_string(), value);
    }

    /// Times the name has been bound; 0 when never bound
    pub fn version(&self, name: &str) -> u64 {
        self.versions.get(name).copied().unwrap_or(0)
    }

    /// Whether the name is bound
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Iterate over all bindings
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

/// The embedding surface: one VM plus source-to-chunk plumbing
pub struct Runtime {
    vm: Vm,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(VmConfig::default())
    }
}

impl Runtime {
    pub fn new(config: VmConfig) -> Self {
        Self {
            vm: Vm::new(config),
        }
    }

    /// A runtime whose `say` output goes to `out` instead of stdout
    pub fn with_output(config: VmConfig, out: OutputSink) -> Self {
        Self {
            vm: Vm::with_builtins(config, Builtins::with_output(out)),
        }
    }

    /// Compile and run one source unit against the accumulated globals
    pub fn eval(&mut self, source: &str) -> Result<()> {
        let chunk = compile(&parse(tokenize(source)?)?)?;
        self.vm.execute(chunk)?;
        Ok(())
    }

    /// Run a script file; imports resolve relative to its directory
    pub fn run_file(&mut self, path: &Path) -> Result<()> {
        let source = std::fs::read_to_string(path)?;
        if let Some(parent) = path.parent() {
            self.vm.set_module_dir(parent.to_path_buf());
        }
        self.eval(&source)
    }

    /// Where `import` looks for `<name>.levy` files
    pub fn set_module_dir(&mut self, dir: PathBuf) {
        self.vm.set_module_dir(dir);
    }

    /// Execution counters for profile output
    pub fn stats(&self) -> VmStats {
        self.vm.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_store_bumps_the_version() {
        let mut globals = Globals::default();
        assert_eq!(globals.version("x"), 0);
        globals.set("x", Value::Int(1));
        assert_eq!(globals.version("x"), 1);
        globals.set("x", Value::Int(1));
        assert_eq!(globals.version("x"), 2);
        assert!(globals.get("x").unwrap().equals(&Value::Int(1)));
    }

    #[test]
    fn globals_survive_between_evals() {
        let mut runtime = Runtime::default();
        runtime.eval("x <- 41").unwrap();
        runtime.eval("x <- x + 1").unwrap();
        runtime.eval("say(x)").unwrap();
    }
}
