//! Error types for the Levython runtime

use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// A single frame in a script stack trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Function name (`<script>` for top-level code)
    pub function_name: String,
    /// Line number in source (1-indexed)
    pub line: u32,
}

impl StackFrame {
    /// Create a new stack frame
    pub fn new(function_name: impl Into<String>, line: u32) -> Self {
        Self {
            function_name: function_name.into(),
            line,
        }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "    at {} (line {})", self.function_name, self.line)
    }
}

/// A script stack trace, innermost frame first
#[derive(Debug, Clone, Default)]
pub struct StackTrace {
    pub frames: Vec<StackFrame>,
}

impl StackTrace {
    /// Create an empty stack trace
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Add a frame to the stack trace
    pub fn push(&mut self, frame: StackFrame) {
        self.frames.push(frame);
    }

    /// Check if the stack trace is empty
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            writeln!(f, "{}", frame)?;
        }
        Ok(())
    }
}

/// Script-level runtime error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operand of the wrong kind for an operation
    TypeError,
    /// Undefined variable or attribute
    NameError,
    /// List index out of range
    IndexError,
    /// Map key not found
    KeyError,
    /// Division or modulo by zero
    ZeroDivisionError,
    /// Wrong number of call arguments
    ArityError,
    /// File or OS resource failure raised by a builtin
    IoError,
    /// Anything else a builtin raises
    GenericError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::TypeError => write!(f, "TypeError"),
            ErrorKind::NameError => write!(f, "NameError"),
            ErrorKind::IndexError => write!(f, "IndexError"),
            ErrorKind::KeyError => write!(f, "KeyError"),
            ErrorKind::ZeroDivisionError => write!(f, "ZeroDivisionError"),
            ErrorKind::ArityError => write!(f, "ArityError"),
            ErrorKind::IoError => write!(f, "IOError"),
            ErrorKind::GenericError => write!(f, "Error"),
        }
    }
}

/// Main error type for Levython
#[derive(Error, Debug)]
pub enum Error {
    /// Lexer error - invalid token or character
    #[error("SyntaxError: {message} [line {line}]")]
    LexError { message: String, line: u32 },

    /// Parser error - invalid syntax
    #[error("SyntaxError: {message} [line {line}]")]
    ParseError { message: String, line: u32 },

    /// Compiler error - a construct the bytecode compiler rejects
    #[error("CompileError: {message} [line {line}]")]
    CompileError { message: String, line: u32 },

    /// Script-level runtime failure (catchable by `try`/`catch`)
    #[error("{kind}: {message}{}", if trace.is_empty() { String::new() } else { format!("\n{}", trace) })]
    RuntimeError {
        kind: ErrorKind,
        message: String,
        trace: StackTrace,
    },

    /// Internal invariant violation in the VM or optimizer
    #[error("InternalError: {0}")]
    Internal(String),

    /// Module loading/resolution error
    #[error("ModuleError: {0}")]
    Module(String),

    /// IO error outside script control (reading the script file itself)
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a runtime error with an empty trace (the VM attaches frames
    /// while unwinding)
    pub fn runtime(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::RuntimeError {
            kind,
            message: message.into(),
            trace: StackTrace::new(),
        }
    }

    /// Shorthand for a type error
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::runtime(ErrorKind::TypeError, message)
    }

    /// Shorthand for a name error
    pub fn name_error(message: impl Into<String>) -> Self {
        Self::runtime(ErrorKind::NameError, message)
    }

    /// Whether this error unwinds through script `try`/`catch`
    pub fn is_catchable(&self) -> bool {
        matches!(self, Error::RuntimeError { .. })
    }

    /// The runtime error kind, if any
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::RuntimeError { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
