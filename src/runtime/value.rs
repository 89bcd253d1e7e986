//! Runtime values for the Levython VM
//!
//! A [`Value`] is one machine word of tag plus payload: scalars are stored
//! inline, everything else lives behind an `Rc<Object>`. All consumers go
//! through the constructors and accessors here, so the interior could be
//! swapped for a packed representation without touching the VM.
//!
//! Reference cycles between heap objects are not collected; a script that
//! builds one leaks it.

use crate::bytecode::Chunk;
use crate::error::{Error, ErrorKind, Result};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::rc::Rc;

/// A Levy value
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    None,
    Object(Rc<Object>),
}

/// Heap-allocated objects
#[derive(Debug)]
pub enum Object {
    /// Immutable string
    Str(String),
    /// Ordered, mutable list
    List(RefCell<Vec<Value>>),
    /// String-keyed map; BTreeMap keeps display order deterministic
    Map(RefCell<BTreeMap<String, Value>>),
    /// Compiled script function
    Function(Function),
    /// Native function, dispatched by name through the builtin table
    Builtin(String),
    /// Class with a method table and optional parent
    Class(Class),
    /// Class instance
    Instance(Instance),
    /// Native file handle backing the object `open` returns
    File(RefCell<FileHandle>),
}

/// A compiled script function
pub struct Function {
    pub name: String,
    pub arity: u8,
    pub chunk: Rc<Chunk>,
    /// Globals of the defining environment. `None` in the compiler's
    /// constant-pool prototype; `MakeFunction` attaches the live table, so
    /// a module function resolves names in its own module.
    pub globals: Option<Rc<RefCell<crate::runtime::Globals>>>,
}

// The captured environment can contain the function itself, so Debug
// stays shallow.
impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

/// A class definition
#[derive(Debug)]
pub struct Class {
    pub name: String,
    pub methods: FxHashMap<String, Value>,
    pub parent: Option<Rc<Object>>,
}

impl Class {
    /// Look up a method here or in a parent class
    pub fn find_method(&self, name: &str) -> Option<Value> {
        if let Some(method) = self.methods.get(name) {
            return Some(method.clone());
        }
        match &self.parent {
            Some(parent) => match &**parent {
                Object::Class(parent_class) => parent_class.find_method(name),
                _ => None,
            },
            None => None,
        }
    }
}

/// A class instance
#[derive(Debug)]
pub struct Instance {
    pub class: Rc<Object>,
    pub fields: RefCell<BTreeMap<String, Value>>,
}

impl Instance {
    /// Name of the instance's class
    pub fn class_name(&self) -> &str {
        match &*self.class {
            Object::Class(class) => &class.name,
            _ => "?",
        }
    }
}

/// OS file handle; `None` once closed
#[derive(Debug)]
pub struct FileHandle {
    pub file: Option<File>,
    pub path: String,
}

impl Value {
    /// Construct a string value
    pub fn string(s: impl Into<String>) -> Value {
        Value::Object(Rc::new(Object::Str(s.into())))
    }

    /// Construct a list value
    pub fn list(elements: Vec<Value>) -> Value {
        Value::Object(Rc::new(Object::List(RefCell::new(elements))))
    }

    /// Construct a map value
    pub fn map(entries: BTreeMap<String, Value>) -> Value {
        Value::Object(Rc::new(Object::Map(RefCell::new(entries))))
    }

    /// Construct a function value
    pub fn function(function: Function) -> Value {
        Value::Object(Rc::new(Object::Function(function)))
    }

    /// Construct a builtin function value
    pub fn builtin(name: impl Into<String>) -> Value {
        Value::Object(Rc::new(Object::Builtin(name.into())))
    }

    /// The integer payload, when this is an int
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The string payload, when this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Object(o) => match &**o {
                Object::Str(s) => Some(s),
                _ => None,
            },
            _ => None,
        }
    }

    /// The heap object, when this is one
    pub fn as_object(&self) -> Option<&Rc<Object>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Whether this is an int
    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    /// Whether this is a float
    pub fn is_float(&self) -> bool {
        matches!(self, Value::Float(_))
    }

    /// Whether this is a string
    pub fn is_str(&self) -> bool {
        self.as_str().is_some()
    }

    /// Heap identity for pointer comparison; `None` for scalars
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Object(o) => Some(Rc::as_ptr(o) as *const () as usize),
            _ => None,
        }
    }

    /// Type name as reported by the `type()` builtin
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Bool(_) => "boolean",
            Value::None => "none",
            Value::Object(o) => match &**o {
                Object::Str(_) => "string",
                Object::List(_) => "list",
                Object::Map(_) => "map",
                Object::Function(_) | Object::Builtin(_) => "function",
                Object::Class(_) => "class",
                Object::Instance(_) => "instance",
                Object::File(_) => "file",
            },
        }
    }

    /// Truthiness: `no`, `none`, `0`, `0.0`, `""`, `[]`, `{}` are falsey
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::None => false,
            Value::Object(o) => match &**o {
                Object::Str(s) => !s.is_empty(),
                Object::List(l) => !l.borrow().is_empty(),
                Object::Map(m) => !m.borrow().is_empty(),
                _ => true,
            },
        }
    }

    /// Human-readable form, as `say` and `str()` print it
    pub fn display(&self) -> String {
        match self {
            Value::Int(i) => i.to_string(),
            // fixed six decimals, matching C-style float formatting
            Value::Float(f) => format!("{:.6}", f),
            Value::Bool(true) => "yes".to_string(),
            Value::Bool(false) => "no".to_string(),
            Value::None => "none".to_string(),
            Value::Object(o) => match &**o {
                Object::Str(s) => s.clone(),
                Object::List(l) => {
                    let elements: Vec<String> =
                        l.borrow().iter().map(|v| v.display()).collect();
                    format!("[{}]", elements.join(", "))
                }
                Object::Map(m) => {
                    let entries: Vec<String> = m
                        .borrow()
                        .iter()
                        .map(|(k, v)| format!("\"{}\": {}", k, v.display()))
                        .collect();
                    format!("{{{}}}", entries.join(", "))
                }
                Object::Function(_) => "<function>".to_string(),
                Object::Builtin(name) => format!("<function {}>", name),
                Object::Class(class) => format!("<class {}>", class.name),
                Object::Instance(instance) => {
                    format!("<instance of {}>", instance.class_name())
                }
                Object::File(handle) => {
                    if handle.borrow().file.is_some() {
                        "<file open>".to_string()
                    } else {
                        "<file closed>".to_string()
                    }
                }
            },
        }
    }

    /// Constant-pool equality; strings by content, other heap values never
    pub fn same_constant(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::None, Value::None) => true,
            _ => match (self.as_str(), other.as_str()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn unsupported(op: &str, left: &Value, right: &Value) -> Error {
        Error::type_error(format!(
            "Unsupported operand types for '{}': {}, {}",
            op,
            left.display(),
            right.display()
        ))
    }

    /// `+`; concatenates displays when either side is a string
    pub fn add(&self, other: &Value) -> Result<Value> {
        if self.is_str() || other.is_str() {
            return Ok(Value::string(format!("{}{}", self.display(), other.display())));
        }
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::Float(a + b)),
                _ => Err(Self::unsupported("+", self, other)),
            },
        }
    }

    /// `-`
    pub fn sub(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(*b))),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::Float(a - b)),
                _ => Err(Self::unsupported("-", self, other)),
            },
        }
    }

    /// `*`
    pub fn mul(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_mul(*b))),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::Float(a * b)),
                _ => Err(Self::unsupported("*", self, other)),
            },
        }
    }

    /// `/`; always produces a float, zero divisor is a runtime failure
    pub fn div(&self, other: &Value) -> Result<Value> {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => {
                if b == 0.0 {
                    Err(Error::runtime(
                        ErrorKind::ZeroDivisionError,
                        "Division by zero.",
                    ))
                } else {
                    Ok(Value::Float(a / b))
                }
            }
            _ => Err(Self::unsupported("/", self, other)),
        }
    }

    /// `%`; integers only
    pub fn rem(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => {
                if *b == 0 {
                    Err(Error::runtime(
                        ErrorKind::ZeroDivisionError,
                        "Modulo by zero.",
                    ))
                } else {
                    Ok(Value::Int(a.wrapping_rem(*b)))
                }
            }
            _ => Err(Self::unsupported("%", self, other)),
        }
    }

    /// `^`; always produces a float
    pub fn pow(&self, other: &Value) -> Result<Value> {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Float(a.powf(b))),
            _ => Err(Self::unsupported("^", self, other)),
        }
    }

    /// `==`: numbers by value, strings by content, booleans by value;
    /// otherwise true only when both sides are `none`
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::None, Value::None) => true,
            _ => {
                if let (Some(a), Some(b)) = (self.as_str(), other.as_str()) {
                    return a == b;
                }
                if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
                    return a == b;
                }
                false
            }
        }
    }

    /// Ordering for `< <= > >=`: numbers numerically, strings
    /// lexicographically
    pub fn order(&self, other: &Value, op: &str) -> Result<std::cmp::Ordering> {
        if let (Some(a), Some(b)) = (self.as_str(), other.as_str()) {
            return Ok(a.cmp(b));
        }
        if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
            return a
                .partial_cmp(&b)
                .ok_or_else(|| Self::unsupported(op, self, other));
        }
        Err(Self::unsupported(op, self, other))
    }

    /// `&` / `and`: both operands already evaluated. Two ints or two bools
    /// produce a boolean; otherwise the right operand when the left is
    /// truthy, else the left.
    pub fn logical_and(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Int(_), Value::Int(_)) | (Value::Bool(_), Value::Bool(_)) => {
                Value::Bool(self.is_truthy() && other.is_truthy())
            }
            _ => {
                if self.is_truthy() {
                    other.clone()
                } else {
                    self.clone()
                }
            }
        }
    }

    /// `|` / `or`, symmetric to [`Value::logical_and`]
    pub fn logical_or(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Int(_), Value::Int(_)) | (Value::Bool(_), Value::Bool(_)) => {
                Value::Bool(self.is_truthy() || other.is_truthy())
            }
            _ => {
                if self.is_truthy() {
                    self.clone()
                } else {
                    other.clone()
                }
            }
        }
    }

    /// Unary `-`; numbers only
    pub fn negate(&self) -> Result<Value> {
        match self {
            Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
            Value::Float(f) => Ok(Value::Float(-f)),
            _ => Err(Error::type_error("Operand for unary '-' must be number.")),
        }
    }

    /// Unary `!` / `not`
    pub fn not(&self) -> Value {
        Value::Bool(!self.is_truthy())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_add_concatenates_displays() {
        let result = Value::string("n = ").add(&Value::Int(3)).unwrap();
        assert_eq!(result.as_str(), Some("n = 3"));
        let result = Value::Bool(true).add(&Value::string("!")).unwrap();
        assert_eq!(result.as_str(), Some("yes!"));
    }

    #[test]
    fn int_division_produces_float() {
        let result = Value::Int(7).div(&Value::Int(2)).unwrap();
        assert!(matches!(result, Value::Float(f) if f == 3.5));
    }

    #[test]
    fn division_by_zero_fails() {
        let err = Value::Int(1).div(&Value::Int(0)).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ZeroDivisionError));
        let err = Value::Int(1).rem(&Value::Int(0)).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ZeroDivisionError));
    }

    #[test]
    fn modulo_is_integer_only() {
        assert!(Value::Float(1.5).rem(&Value::Float(0.5)).is_err());
    }

    #[test]
    fn heap_values_never_compare_equal() {
        let list = Value::list(vec![Value::Int(1)]);
        assert!(!list.equals(&list.clone()));
        assert!(Value::None.equals(&Value::None));
        assert!(Value::string("a").equals(&Value::string("a")));
    }

    #[test]
    fn eager_logic_selects_operands() {
        let list = Value::list(vec![]);
        let chosen = Value::Int(1).logical_and(&Value::string("x"));
        assert_eq!(chosen.as_str(), Some("x"));
        assert!(matches!(
            Value::Int(2).logical_or(&Value::Int(0)),
            Value::Bool(true)
        ));
        // falsey left for `&` returns the left operand itself
        let kept = list.logical_and(&Value::Int(5));
        assert!(matches!(kept, Value::Object(_)));
        assert!(!kept.is_truthy());
    }

    #[test]
    fn display_forms() {
        assert_eq!(Value::Bool(true).display(), "yes");
        assert_eq!(Value::None.display(), "none");
        assert_eq!(Value::Float(2.5).display(), "2.500000");
        let mut entries = BTreeMap::new();
        entries.insert("b".to_string(), Value::Int(2));
        entries.insert("a".to_string(), Value::Int(1));
        assert_eq!(Value::map(entries).display(), "{\"a\": 1, \"b\": 2}");
        assert_eq!(
            Value::list(vec![Value::Int(1), Value::string("x")]).display(),
            "[1, x]"
        );
    }

    #[test]
    fn truthiness_of_empty_containers() {
        assert!(!Value::list(vec![]).is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Float(0.5).is_truthy());
    }
}
