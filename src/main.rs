//! Levython CLI
//!
//! Runs a script file, evaluates a one-liner, or starts a REPL.

use anyhow::{Context, Result};
use clap::Parser;
use levython::bytecode::compile;
use levython::lexer::tokenize;
use levython::parser::parse;
use levython::{Runtime, VmConfig, VERSION};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "levython")]
#[command(author, version, about = "A bytecode VM with a speculative JIT tier for the Levy language", long_about = None)]
struct Cli {
    /// Levy script to execute
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,

    /// Evaluate a string of Levy code
    #[arg(short, long, value_name = "CODE")]
    eval: Option<String>,

    /// Print the compiled bytecode instead of running
    #[arg(long)]
    dump_bytecode: bool,

    /// Show execution statistics after the run
    #[arg(short, long)]
    profile: bool,

    /// Back edges before a loop is considered hot
    #[arg(long, value_name = "N")]
    hot_loop_threshold: Option<u32>,

    /// Deopts before an optimized segment is retired
    #[arg(long, value_name = "N")]
    deopt_threshold: Option<u32>,

    /// Disable the bytecode optimizer (and with it the JIT)
    #[arg(long)]
    no_optimize: bool,

    /// Disable native code generation; optimized bytecode still runs
    #[arg(long)]
    no_jit: bool,

    /// Verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn config(&self) -> VmConfig {
        let mut config = VmConfig::default();
        if let Some(threshold) = self.hot_loop_threshold {
            config.hot_loop_threshold = threshold;
        }
        if let Some(threshold) = self.deopt_threshold {
            config.deopt_threshold = threshold;
        }
        if self.no_optimize {
            config.optimize = false;
        }
        if self.no_jit {
            config.jit = false;
        }
        config
    }
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let result = run(&cli);
    if let Err(err) = result {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    if let Some(code) = &cli.eval {
        if cli.dump_bytecode {
            return dump_bytecode(code);
        }
        let mut runtime = Runtime::new(cli.config());
        runtime.eval(code)?;
        report(cli, &runtime);
        return Ok(());
    }

    if let Some(file) = &cli.file {
        if cli.dump_bytecode {
            let source = std::fs::read_to_string(file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            return dump_bytecode(&source);
        }
        let mut runtime = Runtime::new(cli.config());
        runtime.run_file(file)?;
        report(cli, &runtime);
        return Ok(());
    }

    repl(cli)
}

fn dump_bytecode(source: &str) -> Result<()> {
    let chunk = compile(&parse(tokenize(source)?)?)?;
    print!("{}", chunk.disassemble());
    Ok(())
}

fn report(cli: &Cli, runtime: &Runtime) {
    if !cli.profile {
        return;
    }
    let stats = runtime.stats();
    eprintln!("-- profile --");
    eprintln!(
        "loops seen: {}, hot: {}",
        stats.profiler.loops_seen, stats.profiler.hot_loops
    );
    eprintln!(
        "call sites profiled: {}, cached: {}",
        stats.profiler.call_sites, stats.cached_call_sites
    );
    eprintln!(
        "optimized segments: {} ({} retired)",
        stats.optimized_segments, stats.retired_segments
    );
    eprintln!(
        "jit bodies: {}, native calls: {}",
        stats.jit_bodies, stats.jit_calls
    );
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("levython=warn")),
        1 => EnvFilter::new("levython=debug"),
        _ => EnvFilter::new("levython=trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn repl(cli: &Cli) -> Result<()> {
    println!("Levython {} - Levy language runtime", VERSION);
    println!("Type .help for help, .exit to quit\n");

    let mut editor = DefaultEditor::new()?;
    let mut runtime = Runtime::new(cli.config());
    let mut buffer = String::new();

    loop {
        let prompt = if buffer.is_empty() { "> " } else { "... " };
        let line = match editor.readline(prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                buffer.clear();
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        };

        let trimmed = line.trim();
        if buffer.is_empty() {
            match trimmed {
                "" => continue,
                ".exit" | ".quit" => break,
                ".help" => {
                    println!(".exit, .quit  - Exit the REPL");
                    println!(".help         - Show this help");
                    println!(".stats        - Show execution statistics");
                    println!(".bc <code>    - Show bytecode for code");
                    continue;
                }
                ".stats" => {
                    let stats = runtime.stats();
                    println!(
                        "loops: {} ({} hot), segments: {} ({} retired), jit calls: {}",
                        stats.profiler.loops_seen,
                        stats.profiler.hot_loops,
                        stats.optimized_segments,
                        stats.retired_segments,
                        stats.jit_calls
                    );
                    continue;
                }
                _ if trimmed.starts_with(".bc ") => {
                    if let Err(err) = dump_bytecode(&trimmed[4..]) {
                        eprintln!("{:#}", err);
                    }
                    continue;
                }
                _ if trimmed.starts_with('.') => {
                    println!("Unknown command: {}", trimmed);
                    continue;
                }
                _ => {}
            }
        }

        buffer.push_str(&line);
        buffer.push('\n');
        if !input_complete(&buffer) {
            continue;
        }

        let code = std::mem::take(&mut buffer);
        let _ = editor.add_history_entry(code.trim());
        if let Err(err) = runtime.eval(&code) {
            eprintln!("{}", err);
        }
    }
    Ok(())
}

/// Whether the accumulated input has balanced braces and brackets outside
/// of string literals
fn input_complete(source: &str) -> bool {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => in_string = !in_string,
            '\\' if in_string => {
                chars.next();
            }
            '#' if !in_string => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '{' | '[' | '(' if !in_string => depth += 1,
            '}' | ']' | ')' if !in_string => depth -= 1,
            _ => {}
        }
    }
    depth <= 0 && !in_string
}
