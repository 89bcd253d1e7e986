//! Shared helpers for the integration tests: run Levy source in a runtime
//! whose `say` output is captured.
#![allow(dead_code)]

use levython::{Runtime, VmConfig};
use std::cell::RefCell;
use std::rc::Rc;

/// Run source under `config`, returning everything `say` printed
pub fn run_with(config: VmConfig, source: &str) -> levython::Result<String> {
    let buffer: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let mut runtime = Runtime::with_output(config, buffer.clone());
    runtime.eval(source)?;
    let out = String::from_utf8(buffer.borrow().clone()).expect("say output is utf-8");
    Ok(out)
}

/// Run source under the default tiered configuration
pub fn run(source: &str) -> String {
    run_with(VmConfig::default(), source).expect("script failed")
}

/// Interpreter only: no optimizer, no JIT
pub fn interpreted() -> VmConfig {
    VmConfig {
        optimize: false,
        jit: false,
        ..VmConfig::default()
    }
}

/// Tiered configuration that optimizes after only a few back edges
pub fn eager(hot_loop_threshold: u32) -> VmConfig {
    VmConfig {
        hot_loop_threshold,
        ..VmConfig::default()
    }
}

/// Run source expecting a script failure
pub fn run_err(source: &str) -> levython::Error {
    run_with(interpreted(), source).expect_err("script should have failed")
}

/// Assert that every tier produces the same output for `source`
pub fn assert_tier_equivalence(source: &str) {
    let reference = run_with(interpreted(), source).expect("interpreted run failed");
    let optimized = run_with(
        VmConfig {
            jit: false,
            ..eager(5)
        },
        source,
    )
    .expect("optimized run failed");
    assert_eq!(reference, optimized, "optimizer changed observable output");
    let jitted = run_with(eager(5), source).expect("jit run failed");
    assert_eq!(reference, jitted, "jit changed observable output");
}
