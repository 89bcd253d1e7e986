//! AST to bytecode compiler
//!
//! One pass, no register allocation: expressions leave exactly one value on
//! the operand stack, statements leave none. Variables are function-scoped:
//! inside a function body a name becomes a local slot on first assignment
//! (parameters and `self` are pre-bound), every other name resolves to a
//! global. Top-level names are always globals; the script chunk only uses
//! local slots for the hidden loop state of `for` and `repeat`.
//!
//! Assignment to a plain variable leaves the stored value on the stack by
//! re-loading the slot, which is the pattern the optimizer's redundant-load
//! rewrite targets.

use crate::ast::{BinaryOp, ClassDecl, Expr, FunctionDecl, Stmt, UnaryOp};
use crate::bytecode::{Chunk, Opcode};
use crate::error::{Error, Result};
use crate::runtime::{Function, Value};
use std::rc::Rc;

/// Compile a program into a chunk named `<script>`
pub fn compile(program: &[Stmt]) -> Result<Rc<Chunk>> {
    let mut compiler = Compiler::new("<script>", true);
    for stmt in program {
        compiler.statement(stmt)?;
    }
    compiler
        .chunk
        .write_opcode(Opcode::ReturnNone, compiler.last_line);
    Ok(Rc::new(compiler.finish()?))
}

struct Compiler {
    chunk: Chunk,
    /// Local slot names; `$`-prefixed entries are compiler temporaries
    locals: Vec<String>,
    /// Top-level code binds named variables as globals
    is_script: bool,
    last_line: u32,
}

impl Compiler {
    fn new(name: &str, is_script: bool) -> Self {
        Self {
            chunk: Chunk::new(name),
            locals: Vec::new(),
            is_script,
            last_line: 1,
        }
    }

    /// Compile a function body; slot 0 is the receiver, parameters follow
    fn function(decl: &FunctionDecl) -> Result<Rc<Chunk>> {
        let mut compiler = Compiler::new(&decl.name, false);
        compiler.locals.push("self".to_string());
        for param in &decl.params {
            compiler.locals.push(param.clone());
        }
        if compiler.locals.len() > u8::MAX as usize {
            return Err(Error::CompileError {
                message: format!("Too many parameters in '{}'.", decl.name),
                line: decl.line,
            });
        }
        for stmt in &decl.body {
            compiler.statement(stmt)?;
        }
        compiler
            .chunk
            .write_opcode(Opcode::ReturnNone, compiler.last_line);
        let mut chunk = compiler.finish()?;
        chunk.arity = decl.params.len() as u8;
        Ok(Rc::new(chunk))
    }

    fn finish(mut self) -> Result<Chunk> {
        if self.locals.len() > u8::MAX as usize {
            return Err(Error::CompileError {
                message: "Too many local variables.".to_string(),
                line: self.last_line,
            });
        }
        self.chunk.local_count = self.locals.len() as u8;
        self.chunk.locals = std::mem::take(&mut self.locals);
        Ok(self.chunk)
    }

    // ---- emission helpers ----

    fn emit(&mut self, op: Opcode, line: u32) {
        self.last_line = line;
        self.chunk.write_opcode(op, line);
    }

    fn emit_u8(&mut self, op: Opcode, operand: u8, line: u32) {
        self.emit(op, line);
        self.chunk.write(operand, line);
    }

    fn emit_u16(&mut self, op: Opcode, operand: u16, line: u32) {
        self.emit(op, line);
        self.chunk.write_u16(operand, line);
    }

    fn emit_constant(&mut self, value: Value, line: u32) -> Result<u16> {
        let index = self.add_constant(value, line)?;
        self.emit_u16(Opcode::Constant, index, line);
        Ok(index)
    }

    fn add_constant(&mut self, value: Value, line: u32) -> Result<u16> {
        if self.chunk.constants.len() > u16::MAX as usize {
            return Err(Error::CompileError {
                message: "Too many constants in one chunk.".to_string(),
                line,
            });
        }
        Ok(self.chunk.add_constant(value))
    }

    fn name_constant(&mut self, name: &str, line: u32) -> Result<u16> {
        self.add_constant(Value::string(name), line)
    }

    /// Emit a jump with a placeholder offset, returning the operand position
    fn emit_jump(&mut self, op: Opcode, line: u32) -> usize {
        self.emit(op, line);
        let at = self.chunk.code.len();
        self.chunk.write_u16(0xFFFF, line);
        at
    }

    /// Patch a forward jump to land on the current end of code
    fn patch_jump(&mut self, operand_at: usize, line: u32) -> Result<()> {
        let target = self.chunk.code.len();
        let distance = target - (operand_at + 2);
        if distance > i16::MAX as usize {
            return Err(Error::CompileError {
                message: "Jump distance too large.".to_string(),
                line,
            });
        }
        let bytes = (distance as i16).to_le_bytes();
        self.chunk.code[operand_at] = bytes[0];
        self.chunk.code[operand_at + 1] = bytes[1];
        Ok(())
    }

    /// Emit a backward jump to `head`
    fn emit_loop(&mut self, head: usize, line: u32) -> Result<()> {
        self.emit(Opcode::Loop, line);
        let back = self.chunk.code.len() + 2 - head;
        if back > u16::MAX as usize {
            return Err(Error::CompileError {
                message: "Loop body too large.".to_string(),
                line,
            });
        }
        self.chunk.write_u16(back as u16, line);
        Ok(())
    }

    // ---- variable resolution ----

    fn resolve_local(&self, name: &str) -> Option<u8> {
        self.locals.iter().position(|l| l == name).map(|i| i as u8)
    }

    /// Slot for a temporary the program cannot name
    fn hidden_local(&mut self, purpose: &str, line: u32) -> Result<u8> {
        if self.locals.len() >= u8::MAX as usize {
            return Err(Error::CompileError {
                message: "Too many local variables.".to_string(),
                line,
            });
        }
        let slot = self.locals.len() as u8;
        self.locals.push(format!("${}{}", purpose, slot));
        Ok(slot)
    }

    /// Store the top of stack into `name`, creating a local in function
    /// bodies on first use
    fn store_variable(&mut self, name: &str, line: u32) -> Result<()> {
        if let Some(slot) = self.resolve_local(name) {
            self.emit_u8(Opcode::SetLocal, slot, line);
            return Ok(());
        }
        if !self.is_script {
            if self.locals.len() >= u8::MAX as usize {
                return Err(Error::CompileError {
                    message: "Too many local variables.".to_string(),
                    line,
                });
            }
            let slot = self.locals.len() as u8;
            self.locals.push(name.to_string());
            self.emit_u8(Opcode::SetLocal, slot, line);
            return Ok(());
        }
        let index = self.name_constant(name, line)?;
        self.emit_u16(Opcode::SetGlobal, index, line);
        Ok(())
    }

    /// Push the value of `name`
    fn load_variable(&mut self, name: &str, line: u32) -> Result<()> {
        if let Some(slot) = self.resolve_local(name) {
            self.emit_u8(Opcode::GetLocal, slot, line);
            return Ok(());
        }
        let index = self.name_constant(name, line)?;
        self.emit_u16(Opcode::GetGlobal, index, line);
        Ok(())
    }

    // ---- statements ----

    fn statement(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Expr(expr) => {
                self.expression(expr)?;
                self.emit(Opcode::Pop, expr.line());
            }
            Stmt::Say { value, line } => {
                let index = self.name_constant("say", *line)?;
                self.emit_u16(Opcode::GetGlobal, index, *line);
                self.expression(value)?;
                self.emit_u8(Opcode::Call, 1, *line);
                self.emit(Opcode::Pop, *line);
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
                line,
            } => {
                self.expression(condition)?;
                let to_else = self.emit_jump(Opcode::JumpIfFalse, *line);
                for stmt in then_branch {
                    self.statement(stmt)?;
                }
                match else_branch {
                    Some(else_branch) => {
                        let to_end = self.emit_jump(Opcode::Jump, *line);
                        self.patch_jump(to_else, *line)?;
                        for stmt in else_branch {
                            self.statement(stmt)?;
                        }
                        self.patch_jump(to_end, *line)?;
                    }
                    None => self.patch_jump(to_else, *line)?,
                }
            }
            Stmt::While {
                condition,
                body,
                line,
            } => {
                let head = self.chunk.code.len();
                self.expression(condition)?;
                let to_exit = self.emit_jump(Opcode::JumpIfFalse, *line);
                for stmt in body {
                    self.statement(stmt)?;
                }
                self.emit_loop(head, *line)?;
                self.patch_jump(to_exit, *line)?;
            }
            Stmt::For {
                variable,
                iterable,
                body,
                line,
            } => self.for_statement(variable, iterable, body, *line)?,
            Stmt::Repeat { count, body, line } => self.repeat_statement(count, body, *line)?,
            Stmt::Try {
                body,
                handler,
                line,
            } => {
                self.emit(Opcode::EnterTry, *line);
                let operand_at = self.chunk.code.len();
                self.chunk.write_u16(0xFFFF, *line);
                for stmt in body {
                    self.statement(stmt)?;
                }
                self.emit(Opcode::LeaveTry, *line);
                let to_end = self.emit_jump(Opcode::Jump, *line);
                // handler target, measured from after the EnterTry operand
                let handler_at = self.chunk.code.len();
                let distance = handler_at - (operand_at + 2);
                if distance > u16::MAX as usize {
                    return Err(Error::CompileError {
                        message: "Try block too large.".to_string(),
                        line: *line,
                    });
                }
                let bytes = (distance as u16).to_le_bytes();
                self.chunk.code[operand_at] = bytes[0];
                self.chunk.code[operand_at + 1] = bytes[1];
                for stmt in handler {
                    self.statement(stmt)?;
                }
                self.patch_jump(to_end, *line)?;
            }
            Stmt::Function(decl) => {
                let chunk = Compiler::function(decl)?;
                let function = Value::function(Function {
                    name: decl.name.clone(),
                    arity: decl.params.len() as u8,
                    chunk,
                    globals: None,
                });
                let index = self.add_constant(function, decl.line)?;
                self.emit_u16(Opcode::MakeFunction, index, decl.line);
                let name = self.name_constant(&decl.name, decl.line)?;
                self.emit_u16(Opcode::SetGlobal, name, decl.line);
            }
            Stmt::Class(decl) => self.class_statement(decl)?,
            Stmt::Return { value, line } => match value {
                Some(value) => {
                    self.expression(value)?;
                    self.emit(Opcode::Return, *line);
                }
                None => self.emit(Opcode::ReturnNone, *line),
            },
            Stmt::Import { module, line } => {
                let index = self.name_constant(module, *line)?;
                self.emit_u16(Opcode::Import, index, *line);
                self.emit(Opcode::Pop, *line);
            }
            Stmt::Block { body, .. } => {
                for stmt in body {
                    self.statement(stmt)?;
                }
            }
        }
        Ok(())
    }

    fn for_statement(
        &mut self,
        variable: &str,
        iterable: &Expr,
        body: &[Stmt],
        line: u32,
    ) -> Result<()> {
        // Hidden state: the iterable and a cursor, in adjacent slots.
        let iter_slot = self.hidden_local("iter", line)?;
        let _cursor = self.hidden_local("cursor", line)?;
        self.expression(iterable)?;
        self.emit_u8(Opcode::SetLocal, iter_slot, line);
        self.emit_constant(Value::Int(0), line)?;
        self.emit_u8(Opcode::SetLocal, iter_slot + 1, line);

        let head = self.chunk.code.len();
        self.emit(Opcode::ForIter, line);
        self.chunk.write(iter_slot, line);
        let exit_at = self.chunk.code.len();
        self.chunk.write_u16(0xFFFF, line);

        self.store_variable(variable, line)?;
        for stmt in body {
            self.statement(stmt)?;
        }
        self.emit_loop(head, line)?;

        let distance = self.chunk.code.len() - (exit_at + 2);
        if distance > u16::MAX as usize {
            return Err(Error::CompileError {
                message: "Loop body too large.".to_string(),
                line,
            });
        }
        let bytes = (distance as u16).to_le_bytes();
        self.chunk.code[exit_at] = bytes[0];
        self.chunk.code[exit_at + 1] = bytes[1];
        Ok(())
    }

    fn repeat_statement(&mut self, count: &Expr, body: &[Stmt], line: u32) -> Result<()> {
        let count_slot = self.hidden_local("count", line)?;
        let index_slot = self.hidden_local("index", line)?;
        self.expression(count)?;
        self.emit(Opcode::RequireInt, line);
        self.emit_u8(Opcode::SetLocal, count_slot, line);
        self.emit_constant(Value::Int(0), line)?;
        self.emit_u8(Opcode::SetLocal, index_slot, line);

        let head = self.chunk.code.len();
        self.emit_u8(Opcode::GetLocal, index_slot, line);
        self.emit_u8(Opcode::GetLocal, count_slot, line);
        self.emit(Opcode::Lt, line);
        let to_exit = self.emit_jump(Opcode::JumpIfFalse, line);
        for stmt in body {
            self.statement(stmt)?;
        }
        self.emit_u8(Opcode::GetLocal, index_slot, line);
        self.emit_constant(Value::Int(1), line)?;
        self.emit(Opcode::Add, line);
        self.emit_u8(Opcode::SetLocal, index_slot, line);
        self.emit_loop(head, line)?;
        self.patch_jump(to_exit, line)
    }

    fn class_statement(&mut self, decl: &ClassDecl) -> Result<()> {
        if decl.methods.len() > u8::MAX as usize {
            return Err(Error::CompileError {
                message: format!("Too many methods in class '{}'.", decl.name),
                line: decl.line,
            });
        }
        if let Some(parent) = &decl.parent {
            self.load_variable(parent, decl.line)?;
        }
        for method in &decl.methods {
            let chunk = Compiler::function(method)?;
            let function = Value::function(Function {
                name: method.name.clone(),
                arity: method.params.len() as u8,
                chunk,
                globals: None,
            });
            let index = self.add_constant(function, method.line)?;
            self.emit_u16(Opcode::MakeFunction, index, method.line);
        }
        let name = self.name_constant(&decl.name, decl.line)?;
        self.emit(Opcode::MakeClass, decl.line);
        self.chunk.write_u16(name, decl.line);
        self.chunk.write(decl.methods.len() as u8, decl.line);
        self.chunk
            .write(u8::from(decl.parent.is_some()), decl.line);
        self.emit_u16(Opcode::SetGlobal, name, decl.line);
        Ok(())
    }

    // ---- expressions ----

    fn expression(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Int { value, line } => {
                self.emit_constant(Value::Int(*value), *line)?;
            }
            Expr::Float { value, line } => {
                self.emit_constant(Value::Float(*value), *line)?;
            }
            Expr::Str { value, line } => {
                self.emit_constant(Value::string(value.clone()), *line)?;
            }
            Expr::Bool { value: true, line } => self.emit(Opcode::True, *line),
            Expr::Bool { value: false, line } => self.emit(Opcode::False, *line),
            Expr::None { line } => self.emit(Opcode::None, *line),
            Expr::Variable { name, line } => {
                if name == "super" {
                    return Err(Error::CompileError {
                        message: "'super' is only valid as 'super.method(...)'.".to_string(),
                        line: *line,
                    });
                }
                self.load_variable(name, *line)?;
            }
            Expr::List { elements, line } => {
                if elements.len() > u8::MAX as usize {
                    return Err(Error::CompileError {
                        message: "Too many list elements.".to_string(),
                        line: *line,
                    });
                }
                for element in elements {
                    self.expression(element)?;
                }
                self.emit_u8(Opcode::MakeList, elements.len() as u8, *line);
            }
            Expr::Map { entries, line } => {
                if entries.len() > u8::MAX as usize {
                    return Err(Error::CompileError {
                        message: "Too many map entries.".to_string(),
                        line: *line,
                    });
                }
                for (key, value) in entries {
                    self.emit_constant(Value::string(key.clone()), *line)?;
                    self.expression(value)?;
                }
                self.emit_u8(Opcode::MakeMap, entries.len() as u8, *line);
            }
            Expr::Binary {
                op,
                left,
                right,
                line,
            } => {
                self.expression(left)?;
                self.expression(right)?;
                let opcode = match op {
                    BinaryOp::Add => Opcode::Add,
                    BinaryOp::Sub => Opcode::Sub,
                    BinaryOp::Mul => Opcode::Mul,
                    BinaryOp::Div => Opcode::Div,
                    BinaryOp::Mod => Opcode::Mod,
                    BinaryOp::Pow => Opcode::Pow,
                    BinaryOp::Eq => Opcode::Eq,
                    BinaryOp::Ne => Opcode::Ne,
                    BinaryOp::Lt => Opcode::Lt,
                    BinaryOp::Le => Opcode::Le,
                    BinaryOp::Gt => Opcode::Gt,
                    BinaryOp::Ge => Opcode::Ge,
                    BinaryOp::And => Opcode::And,
                    BinaryOp::Or => Opcode::Or,
                };
                self.emit(opcode, *line);
            }
            Expr::Unary { op, operand, line } => {
                self.expression(operand)?;
                match op {
                    UnaryOp::Neg => self.emit(Opcode::Negate, *line),
                    UnaryOp::Not => self.emit(Opcode::Not, *line),
                }
            }
            Expr::Assign {
                target,
                value,
                line,
            } => self.assignment(target, value, *line)?,
            Expr::Call { callee, args, line } => {
                self.check_arg_count(args, *line)?;
                self.expression(callee)?;
                for arg in args {
                    self.expression(arg)?;
                }
                self.emit_u8(Opcode::Call, args.len() as u8, *line);
            }
            Expr::Invoke {
                object,
                name,
                args,
                line,
            } => {
                self.check_arg_count(args, *line)?;
                let is_super =
                    matches!(&**object, Expr::Variable { name, .. } if name == "super");
                if is_super {
                    if self.is_script {
                        return Err(Error::CompileError {
                            message: "'super' is only valid inside a method.".to_string(),
                            line: *line,
                        });
                    }
                    self.emit_u8(Opcode::GetLocal, 0, *line);
                } else {
                    self.expression(object)?;
                }
                for arg in args {
                    self.expression(arg)?;
                }
                let index = self.name_constant(name, *line)?;
                let opcode = if is_super {
                    Opcode::SuperInvoke
                } else {
                    Opcode::Invoke
                };
                self.emit(opcode, *line);
                self.chunk.write_u16(index, *line);
                self.chunk.write(args.len() as u8, *line);
            }
            Expr::GetAttr { object, name, line } => {
                self.expression(object)?;
                let index = self.name_constant(name, *line)?;
                self.emit_u16(Opcode::GetAttr, index, *line);
            }
            Expr::Index {
                object,
                index,
                line,
            } => {
                self.expression(object)?;
                self.expression(index)?;
                self.emit(Opcode::Index, *line);
            }
        }
        Ok(())
    }

    /// Compile an assignment expression. Variable targets leave the stored
    /// value on the stack; attribute and index targets leave `none`.
    fn assignment(&mut self, target: &Expr, value: &Expr, line: u32) -> Result<()> {
        match target {
            Expr::Variable { name, .. } => {
                self.expression(value)?;
                self.store_variable(name, line)?;
                self.load_variable(name, line)?;
            }
            Expr::GetAttr { object, name, .. } => {
                self.expression(object)?;
                self.expression(value)?;
                let index = self.name_constant(name, line)?;
                self.emit_u16(Opcode::SetAttr, index, line);
                self.emit(Opcode::None, line);
            }
            Expr::Index { object, index, .. } => {
                self.expression(object)?;
                self.expression(index)?;
                self.expression(value)?;
                self.emit(Opcode::SetIndex, line);
                self.emit(Opcode::None, line);
            }
            _ => {
                return Err(Error::CompileError {
                    message: "Invalid assignment target.".to_string(),
                    line,
                })
            }
        }
        Ok(())
    }

    fn check_arg_count(&self, args: &[Expr], line: u32) -> Result<()> {
        if args.len() > u8::MAX as usize {
            return Err(Error::CompileError {
                message: "Too many call arguments.".to_string(),
                line,
            });
        }
        Ok(())
    }
}
