//! Abstract syntax tree for the Levy language
//!
//! The parser produces these nodes; the bytecode compiler consumes them.
//! Every node carries the source line it started on for diagnostics.

/// Binary operators, in source notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// `&` / `and` — both operands are evaluated (no short circuit)
    And,
    /// `|` / `or` — both operands are evaluated (no short circuit)
    Or,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// An expression node
#[derive(Debug, Clone)]
pub enum Expr {
    /// Integer literal
    Int { value: i64, line: u32 },
    /// Float literal
    Float { value: f64, line: u32 },
    /// String literal
    Str { value: String, line: u32 },
    /// `yes` / `no`
    Bool { value: bool, line: u32 },
    /// `none`
    None { line: u32 },
    /// Variable reference
    Variable { name: String, line: u32 },
    /// `[a, b, c]`
    List { elements: Vec<Expr>, line: u32 },
    /// `{"k": v}` — keys must be string literals
    Map { entries: Vec<(String, Expr)>, line: u32 },
    /// Binary operation
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
        line: u32,
    },
    /// Unary operation
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        line: u32,
    },
    /// Assignment to a variable, attribute, or index target
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
        line: u32,
    },
    /// Function or class-constructor call
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        line: u32,
    },
    /// Method invocation `obj.name(args)` — kept distinct from Call so the
    /// compiler can emit a single Invoke and the VM can cache the target
    Invoke {
        object: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        line: u32,
    },
    /// Attribute access `obj.name`
    GetAttr {
        object: Box<Expr>,
        name: String,
        line: u32,
    },
    /// Index access `obj[key]`
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        line: u32,
    },
}

impl Expr {
    /// Source line this expression starts on
    pub fn line(&self) -> u32 {
        match self {
            Expr::Int { line, .. }
            | Expr::Float { line, .. }
            | Expr::Str { line, .. }
            | Expr::Bool { line, .. }
            | Expr::None { line }
            | Expr::Variable { line, .. }
            | Expr::List { line, .. }
            | Expr::Map { line, .. }
            | Expr::Binary { line, .. }
            | Expr::Unary { line, .. }
            | Expr::Assign { line, .. }
            | Expr::Call { line, .. }
            | Expr::Invoke { line, .. }
            | Expr::GetAttr { line, .. }
            | Expr::Index { line, .. } => *line,
        }
    }
}

/// A function definition (`act` or a class method)
#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub line: u32,
}

/// A class definition
#[derive(Debug, Clone)]
pub struct ClassDecl {
    pub name: String,
    pub parent: Option<String>,
    pub methods: Vec<FunctionDecl>,
    pub line: u32,
}

/// A statement node
#[derive(Debug, Clone)]
pub enum Stmt {
    /// Bare expression (value discarded except at the REPL)
    Expr(Expr),
    /// `say(e)`
    Say { value: Expr, line: u32 },
    /// `if cond ... else ...`
    If {
        condition: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Option<Vec<Stmt>>,
        line: u32,
    },
    /// `while cond body`
    While {
        condition: Expr,
        body: Vec<Stmt>,
        line: u32,
    },
    /// `for var in iterable body`
    For {
        variable: String,
        iterable: Expr,
        body: Vec<Stmt>,
        line: u32,
    },
    /// `repeat count body`
    Repeat {
        count: Expr,
        body: Vec<Stmt>,
        line: u32,
    },
    /// `try body catch handler`
    Try {
        body: Vec<Stmt>,
        handler: Vec<Stmt>,
        line: u32,
    },
    /// `act name(params) { ... }`
    Function(FunctionDecl),
    /// `class Name [is a Parent] { ... }`
    Class(ClassDecl),
    /// `return e` / `-> e`
    Return { value: Option<Expr>, line: u32 },
    /// `import name`
    Import { module: String, line: u32 },
    /// `{ ... }`
    Block { body: Vec<Stmt>, line: u32 },
}
