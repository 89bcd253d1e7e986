//! Native builtins
//!
//! Every native function goes through one dispatch boundary,
//! [`Builtins::invoke`], keyed by the name stored in the callee's
//! `Object::Builtin`. The file methods additionally receive the map object
//! `open` returned as `this` and reach the OS handle through its
//! `__handle__` entry.
//!
//! Output is written through an injectable sink so tests can capture
//! everything `say` produces.

use crate::error::{Error, ErrorKind, Result};
use crate::runtime::value::{FileHandle, Object, Value};
use crate::runtime::Globals;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

/// Where `say` and `ask` prompts go
pub type OutputSink = Rc<RefCell<dyn Write>>;

/// Native function table
pub struct Builtins {
    out: OutputSink,
    input: Option<Rc<RefCell<dyn BufRead>>>,
}

impl Default for Builtins {
    fn default() -> Self {
        Self {
            out: Rc::new(RefCell::new(io::stdout())),
            input: None,
        }
    }
}

impl Builtins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route output somewhere else (tests capture it this way)
    pub fn with_output(out: OutputSink) -> Self {
        Self { out, input: None }
    }

    /// Replace the input source `ask` reads from
    pub fn set_input(&mut self, input: Rc<RefCell<dyn BufRead>>) {
        self.input = Some(input);
    }

    /// Define every builtin binding, plus the `math` module map
    pub fn install(&self, globals: &mut Globals) {
        for name in [
            "say", "ask", "open", "len", "range", "type", "int", "float", "str", "append",
        ] {
            globals.set(name, Value::builtin(name));
        }
        let mut math = BTreeMap::new();
        math.insert("pi".to_string(), Value::Float(std::f64::consts::PI));
        math.insert("e".to_string(), Value::Float(std::f64::consts::E));
        math.insert("sin".to_string(), Value::builtin("math.sin"));
        math.insert("cos".to_string(), Value::builtin("math.cos"));
        globals.set("math", Value::map(math));
    }

    /// The single dispatch boundary for native calls
    pub fn invoke(&self, name: &str, this: Option<&Value>, args: &[Value]) -> Result<Value> {
        match name {
            "say" => self.say(args),
            "ask" => self.ask(args),
            "open" => open(args),
            "len" => len(args),
            "range" => range(args),
            "type" => type_of(args),
            "int" => to_int(args),
            "float" => to_float(args),
            "str" => to_str(args),
            "append" => append(args),
            "math.sin" => math_fn(args, "math.sin", f64::sin),
            "math.cos" => math_fn(args, "math.cos", f64::cos),
            "file.read" => file_read(this),
            "file.write" => file_write(this, args),
            "file.close" => file_close(this),
            _ => Err(Error::Internal(format!("unknown builtin '{}'", name))),
        }
    }

    fn say(&self, args: &[Value]) -> Result<Value> {
        expect_args("say", args, 1)?;
        let mut out = self.out.borrow_mut();
        writeln!(out, "{}", args[0].display())?;
        out.flush()?;
        Ok(Value::None)
    }

    fn ask(&self, args: &[Value]) -> Result<Value> {
        if args.len() > 1 {
            return Err(Error::runtime(
                ErrorKind::ArityError,
                "ask() expects 0 or 1 argument.",
            ));
        }
        if let Some(prompt) = args.first() {
            let Some(prompt) = prompt.as_str() else {
                return Err(Error::type_error("ask() prompt must be a string."));
            };
            let mut out = self.out.borrow_mut();
            write!(out, "{}", prompt)?;
            out.flush()?;
        }
        let mut line = String::new();
        match &self.input {
            Some(input) => {
                input.borrow_mut().read_line(&mut line)?;
            }
            None => {
                io::stdin().lock().read_line(&mut line)?;
            }
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Value::string(line))
    }
}

fn expect_args(name: &str, args: &[Value], count: usize) -> Result<()> {
    if args.len() != count {
        return Err(Error::runtime(
            ErrorKind::ArityError,
            format!(
                "{}() expects {} argument{}.",
                name,
                count,
                if count == 1 { "" } else { "s" }
            ),
        ));
    }
    Ok(())
}

fn open(args: &[Value]) -> Result<Value> {
    if args.len() != 2 {
        return Err(Error::runtime(
            ErrorKind::ArityError,
            "open() expects 2 arguments (filename, mode).",
        ));
    }
    let (Some(path), Some(mode)) = (args[0].as_str(), args[1].as_str()) else {
        return Err(Error::type_error("open() arguments must be strings."));
    };

    let mut options = OpenOptions::new();
    match mode {
        "r" | "rb" => options.read(true),
        "w" | "wb" => options.write(true).create(true).truncate(true),
        "a" => options.append(true).create(true),
        _ => {
            return Err(Error::type_error(format!("Invalid file mode: {}", mode)));
        }
    };
    let file = options.open(path).map_err(|_| {
        Error::runtime(
            ErrorKind::IoError,
            format!("Failed to open file: {}", path),
        )
    })?;

    let handle = Value::Object(Rc::new(Object::File(RefCell::new(FileHandle {
        file: Some(file),
        path: path.to_string(),
    }))));

    // The file object is a plain map carrying the handle and its methods.
    let mut entries = BTreeMap::new();
    entries.insert("__handle__".to_string(), handle);
    entries.insert("read".to_string(), Value::builtin("file.read"));
    entries.insert("write".to_string(), Value::builtin("file.write"));
    entries.insert("close".to_string(), Value::builtin("file.close"));
    Ok(Value::map(entries))
}

/// The `__handle__` entry of a file object
fn handle_of(this: Option<&Value>) -> Result<Rc<Object>> {
    let object = this
        .and_then(Value::as_object)
        .ok_or_else(|| Error::type_error("Invalid file object"))?;
    let Object::Map(entries) = &**object else {
        return Err(Error::type_error("Invalid file object"));
    };
    let handle = entries
        .borrow()
        .get("__handle__")
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| Error::type_error("Invalid file object"))?;
    match &*handle {
        Object::File(_) => Ok(handle),
        _ => Err(Error::type_error("Invalid file object")),
    }
}

fn file_read(this: Option<&Value>) -> Result<Value> {
    let handle = handle_of(this)?;
    let Object::File(state) = &*handle else {
        unreachable!()
    };
    let mut state = state.borrow_mut();
    let file = state
        .file
        .as_mut()
        .ok_or_else(|| Error::runtime(ErrorKind::IoError, "File is not open"))?;
    let mut content = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut content)?;
    Ok(Value::string(content))
}

fn file_write(this: Option<&Value>, args: &[Value]) -> Result<Value> {
    let handle = handle_of(this)?;
    expect_args("write", args, 1)?;
    let Some(content) = args[0].as_str() else {
        return Err(Error::type_error("write() argument must be a string"));
    };
    let Object::File(state) = &*handle else {
        unreachable!()
    };
    let mut state = state.borrow_mut();
    let file = state
        .file
        .as_mut()
        .ok_or_else(|| Error::runtime(ErrorKind::IoError, "File is not open"))?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    Ok(Value::None)
}

fn file_close(this: Option<&Value>) -> Result<Value> {
    let handle = handle_of(this)?;
    let Object::File(state) = &*handle else {
        unreachable!()
    };
    let mut state = state.borrow_mut();
    if state.file.take().is_none() {
        return Err(Error::runtime(ErrorKind::IoError, "File is not open"));
    }
    Ok(Value::None)
}

fn len(args: &[Value]) -> Result<Value> {
    expect_args("len", args, 1)?;
    let length = match args[0].as_object().map(|o| &**o) {
        Some(Object::Str(s)) => s.chars().count() as i64,
        Some(Object::List(l)) => l.borrow().len() as i64,
        Some(Object::Map(m)) => m.borrow().len() as i64,
        _ => {
            return Err(Error::type_error(format!(
                "len() not supported for type {}",
                args[0].display()
            )))
        }
    };
    Ok(Value::Int(length))
}

fn range(args: &[Value]) -> Result<Value> {
    let ints: Vec<i64> = args.iter().filter_map(Value::as_int).collect();
    if ints.len() != args.len() {
        return Err(Error::type_error("range() requires integer arguments."));
    }
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => {
            if *step == 0 {
                return Err(Error::type_error("range() step cannot be zero."));
            }
            (*start, *stop, *step)
        }
        _ => {
            return Err(Error::runtime(
                ErrorKind::ArityError,
                "range() expects 1, 2, or 3 arguments.",
            ))
        }
    };
    let mut elements = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        elements.push(Value::Int(i));
        i += step;
    }
    Ok(Value::list(elements))
}

fn type_of(args: &[Value]) -> Result<Value> {
    expect_args("type", args, 1)?;
    Ok(Value::string(args[0].type_name()))
}

fn to_int(args: &[Value]) -> Result<Value> {
    expect_args("int", args, 1)?;
    let arg = &args[0];
    match arg {
        Value::Int(_) => Ok(arg.clone()),
        Value::Float(f) => Ok(Value::Int(*f as i64)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        _ => match arg.as_str() {
            Some(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                Error::type_error(format!("Cannot convert '{}' to integer.", arg.display()))
            }),
            None => Err(Error::type_error(format!(
                "Cannot convert type {} to integer.",
                arg.type_name()
            ))),
        },
    }
}

fn to_float(args: &[Value]) -> Result<Value> {
    expect_args("float", args, 1)?;
    let arg = &args[0];
    match arg {
        Value::Float(_) => Ok(arg.clone()),
        Value::Int(i) => Ok(Value::Float(*i as f64)),
        Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
        _ => match arg.as_str() {
            Some(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                Error::type_error(format!("Cannot convert '{}' to float.", arg.display()))
            }),
            None => Err(Error::type_error(format!(
                "Cannot convert type {} to float.",
                arg.type_name()
            ))),
        },
    }
}

fn to_str(args: &[Value]) -> Result<Value> {
    expect_args("str", args, 1)?;
    Ok(Value::string(args[0].display()))
}

fn append(args: &[Value]) -> Result<Value> {
    expect_args("append", args, 2)?;
    let Some(Object::List(elements)) = args[0].as_object().map(|o| &**o) else {
        return Err(Error::type_error("First argument to append() must be a list."));
    };
    elements.borrow_mut().push(args[1].clone());
    Ok(args[0].clone())
}

fn math_fn(args: &[Value], name: &str, f: fn(f64) -> f64) -> Result<Value> {
    expect_args(name, args, 1)?;
    let x = match &args[0] {
        Value::Int(i) => *i as f64,
        Value::Float(v) => *v,
        _ => {
            return Err(Error::type_error(format!(
                "{}() argument must be a number.",
                name
            )))
        }
    };
    Ok(Value::Float(f(x)))
}
