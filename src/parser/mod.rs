//! Recursive-descent parser for the Levy language
//!
//! Precedence, lowest binding first:
//! assignment, or, and, equality, comparison, term, factor, power, unary,
//! call/attribute/index, primary.

use crate::ast::{BinaryOp, ClassDecl, Expr, FunctionDecl, Stmt, UnaryOp};
use crate::error::{Error, Result};
use crate::lexer::{Token, TokenKind};

/// Parse a token stream into a list of top-level statements
pub fn parse(tokens: Vec<Token>) -> Result<Vec<Stmt>> {
    Parser::new(tokens).parse_program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn parse_program(&mut self) -> Result<Vec<Stmt>> {
        let mut statements = Vec::new();
        while !self.is_at_end() {
            statements.push(self.statement()?);
        }
        Ok(statements)
    }

    // ---- token helpers ----

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos.saturating_sub(1)]
    }

    fn is_at_end(&self) -> bool {
        self.current().kind == TokenKind::Eof
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current().kind == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if !self.is_at_end() {
            self.pos += 1;
        }
        token
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> Result<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error_at_current(message))
        }
    }

    fn error_at_current(&self, message: &str) -> Error {
        let token = self.current();
        let at = if token.kind == TokenKind::Eof {
            "at end".to_string()
        } else {
            format!("at '{}'", token.lexeme)
        };
        Error::ParseError {
            message: format!("{} ({})", message, at),
            line: token.line,
        }
    }

    // ---- statements ----

    fn statement(&mut self) -> Result<Stmt> {
        if self.matches(TokenKind::Say) {
            return self.say_statement();
        }
        if self.matches(TokenKind::If) {
            return self.if_statement();
        }
        if self.matches(TokenKind::While) {
            return self.while_statement();
        }
        if self.matches(TokenKind::For) {
            return self.for_statement();
        }
        if self.matches(TokenKind::Repeat) {
            return self.repeat_statement();
        }
        if self.matches(TokenKind::Return) {
            return self.return_statement();
        }
        if self.matches(TokenKind::Act) {
            return Ok(Stmt::Function(self.function_definition()?));
        }
        if self.matches(TokenKind::Class) {
            return self.class_definition();
        }
        if self.matches(TokenKind::Import) {
            return self.import_statement();
        }
        if self.matches(TokenKind::Try) {
            return self.try_statement();
        }
        if self.matches(TokenKind::LeftBrace) {
            let line = self.previous().line;
            return Ok(Stmt::Block {
                body: self.block_body()?,
                line,
            });
        }
        let expr = self.expression()?;
        self.matches(TokenKind::Semicolon);
        Ok(Stmt::Expr(expr))
    }

    /// The statements of a `{ ... }` block; the opening brace is consumed
    fn block_body(&mut self) -> Result<Vec<Stmt>> {
        let mut body = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            body.push(self.statement()?);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.")?;
        Ok(body)
    }

    /// A braced block or a single statement, as loop/branch bodies allow
    fn statement_or_block(&mut self) -> Result<Vec<Stmt>> {
        if self.matches(TokenKind::LeftBrace) {
            self.block_body()
        } else {
            Ok(vec![self.statement()?])
        }
    }

    fn say_statement(&mut self) -> Result<Stmt> {
        let line = self.previous().line;
        self.consume(TokenKind::LeftParen, "Expect '(' after 'say'.")?;
        let value = self.expression()?;
        self.consume(TokenKind::RightParen, "Expect ')' after value.")?;
        self.matches(TokenKind::Semicolon);
        Ok(Stmt::Say { value, line })
    }

    fn if_statement(&mut self) -> Result<Stmt> {
        let line = self.previous().line;
        let condition = self.expression()?;
        let then_branch = self.statement_or_block()?;
        let else_branch = if self.matches(TokenKind::Else) {
            Some(self.statement_or_block()?)
        } else {
            None
        };
        Ok(Stmt::If {
            condition,
            then_branch,
            else_branch,
            line,
        })
    }

    fn while_statement(&mut self) -> Result<Stmt> {
        let line = self.previous().line;
        let condition = self.expression()?;
        let body = self.statement_or_block()?;
        Ok(Stmt::While {
            condition,
            body,
            line,
        })
    }

    fn for_statement(&mut self) -> Result<Stmt> {
        let line = self.previous().line;
        let variable = self
            .consume(TokenKind::Identifier, "Expect loop variable name.")?
            .lexeme;
        self.consume(TokenKind::In, "Expect 'in' after loop variable.")?;
        let iterable = self.expression()?;
        let body = self.statement_or_block()?;
        Ok(Stmt::For {
            variable,
            iterable,
            body,
            line,
        })
    }

    fn repeat_statement(&mut self) -> Result<Stmt> {
        let line = self.previous().line;
        let count = self.expression()?;
        let body = self.statement_or_block()?;
        Ok(Stmt::Repeat { count, body, line })
    }

    fn return_statement(&mut self) -> Result<Stmt> {
        let line = self.previous().line;
        let value = if !self.check(TokenKind::Semicolon) && !self.check(TokenKind::RightBrace) {
            Some(self.expression()?)
        } else {
            None
        };
        self.matches(TokenKind::Semicolon);
        Ok(Stmt::Return { value, line })
    }

    fn function_definition(&mut self) -> Result<FunctionDecl> {
        let name_token = self.consume(TokenKind::Identifier, "Expect function name.")?;
        let line = name_token.line;
        let name = name_token.lexeme;
        let params = self.parameter_list()?;
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.")?;
        let body = self.block_body()?;
        Ok(FunctionDecl {
            name,
            params,
            body,
            line,
        })
    }

    fn parameter_list(&mut self) -> Result<Vec<String>> {
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.")?;
        let mut params = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                params.push(
                    self.consume(TokenKind::Identifier, "Expect parameter name.")?
                        .lexeme,
                );
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.")?;
        Ok(params)
    }

    fn class_definition(&mut self) -> Result<Stmt> {
        let name_token = self.consume(TokenKind::Identifier, "Expect class name.")?;
        let line = name_token.line;
        let name = name_token.lexeme;
        let parent = if self.matches(TokenKind::IsA) {
            Some(
                self.consume(TokenKind::Identifier, "Expect parent class name after 'is a'.")?
                    .lexeme,
            )
        } else {
            None
        };
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.")?;

        let mut methods = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            if self.matches(TokenKind::Act) {
                methods.push(self.function_definition()?);
            } else if self.matches(TokenKind::Init) {
                let init_line = self.previous().line;
                let params = self.parameter_list()?;
                self.consume(TokenKind::LeftBrace, "Expect '{' before init body.")?;
                let body = self.block_body()?;
                methods.push(FunctionDecl {
                    name: "init".into(),
                    params,
                    body,
                    line: init_line,
                });
            } else {
                return Err(
                    self.error_at_current("Expect method definition or '}' in class body.")
                );
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.")?;
        Ok(Stmt::Class(ClassDecl {
            name,
            parent,
            methods,
            line,
        }))
    }

    fn import_statement(&mut self) -> Result<Stmt> {
        let line = self.previous().line;
        let module = self
            .consume(TokenKind::Identifier, "Expect module name after 'import'.")?
            .lexeme;
        self.matches(TokenKind::Semicolon);
        Ok(Stmt::Import { module, line })
    }

    fn try_statement(&mut self) -> Result<Stmt> {
        let line = self.previous().line;
        let body = self.statement_or_block()?;
        self.consume(TokenKind::Catch, "Expect 'catch' after try block.")?;
        let handler = self.statement_or_block()?;
        Ok(Stmt::Try {
            body,
            handler,
            line,
        })
    }

    // ---- expressions ----

    fn expression(&mut self) -> Result<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr> {
        let expr = self.logical_or()?;
        if self.matches(TokenKind::Assign) {
            let line = self.previous().line;
            let value = self.assignment()?;
            return match expr {
                Expr::Variable { .. } | Expr::GetAttr { .. } | Expr::Index { .. } => {
                    Ok(Expr::Assign {
                        target: Box::new(expr),
                        value: Box::new(value),
                        line,
                    })
                }
                _ => Err(Error::ParseError {
                    message: "Invalid assignment target.".into(),
                    line,
                }),
            };
        }
        Ok(expr)
    }

    fn binary_ladder(
        &mut self,
        operators: &[(TokenKind, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr>,
    ) -> Result<Expr> {
        let mut expr = next(self)?;
        'outer: loop {
            for (kind, op) in operators {
                if self.matches(*kind) {
                    let line = self.previous().line;
                    let right = next(self)?;
                    expr = Expr::Binary {
                        op: *op,
                        left: Box::new(expr),
                        right: Box::new(right),
                        line,
                    };
                    continue 'outer;
                }
            }
            break;
        }
        Ok(expr)
    }

    fn logical_or(&mut self) -> Result<Expr> {
        self.binary_ladder(&[(TokenKind::Or, BinaryOp::Or)], Self::logical_and)
    }

    fn logical_and(&mut self) -> Result<Expr> {
        self.binary_ladder(&[(TokenKind::And, BinaryOp::And)], Self::equality)
    }

    fn equality(&mut self) -> Result<Expr> {
        self.binary_ladder(
            &[
                (TokenKind::EqEq, BinaryOp::Eq),
                (TokenKind::BangEq, BinaryOp::Ne),
            ],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> Result<Expr> {
        self.binary_ladder(
            &[
                (TokenKind::Greater, BinaryOp::Gt),
                (TokenKind::GreaterEq, BinaryOp::Ge),
                (TokenKind::Less, BinaryOp::Lt),
                (TokenKind::LessEq, BinaryOp::Le),
            ],
            Self::term,
        )
    }

    fn term(&mut self) -> Result<Expr> {
        self.binary_ladder(
            &[
                (TokenKind::Plus, BinaryOp::Add),
                (TokenKind::Minus, BinaryOp::Sub),
            ],
            Self::factor,
        )
    }

    fn factor(&mut self) -> Result<Expr> {
        self.binary_ladder(
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Mod),
            ],
            Self::power,
        )
    }

    fn power(&mut self) -> Result<Expr> {
        self.binary_ladder(&[(TokenKind::Caret, BinaryOp::Pow)], Self::unary)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.matches(TokenKind::Not) {
            let line = self.previous().line;
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
                line,
            });
        }
        if self.matches(TokenKind::Minus) {
            let line = self.previous().line;
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
                line,
            });
        }
        self.call()
    }

    fn call(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.matches(TokenKind::Dot) {
                // Method names may be `init`, which lexes as a keyword.
                let name_token = if self.check(TokenKind::Identifier) || self.check(TokenKind::Init)
                {
                    self.advance()
                } else {
                    return Err(
                        self.error_at_current("Expect property or method name after '.'.")
                    );
                };
                let name = name_token.lexeme;
                let line = name_token.line;
                if self.matches(TokenKind::LeftParen) {
                    let args = self.argument_list()?;
                    expr = Expr::Invoke {
                        object: Box::new(expr),
                        name,
                        args,
                        line,
                    };
                } else {
                    expr = Expr::GetAttr {
                        object: Box::new(expr),
                        name,
                        line,
                    };
                }
            } else if self.matches(TokenKind::LeftParen) {
                let line = self.previous().line;
                let args = self.argument_list()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    line,
                };
            } else if self.matches(TokenKind::LeftBracket) {
                let line = self.previous().line;
                let index = self.expression()?;
                self.consume(TokenKind::RightBracket, "Expect ']' after index.")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                    line,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn argument_list(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                args.push(self.expression()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.")?;
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr> {
        let token = self.advance();
        let line = token.line;
        match token.kind {
            TokenKind::True => Ok(Expr::Bool { value: true, line }),
            TokenKind::False => Ok(Expr::Bool { value: false, line }),
            TokenKind::None => Ok(Expr::None { line }),
            TokenKind::Number => {
                if token.lexeme.contains('.') {
                    let value = token.lexeme.parse::<f64>().map_err(|_| Error::ParseError {
                        message: format!("Invalid numeric literal: {}", token.lexeme),
                        line,
                    })?;
                    Ok(Expr::Float { value, line })
                } else {
                    let value = token.lexeme.parse::<i64>().map_err(|_| Error::ParseError {
                        message: format!("Invalid numeric literal: {}", token.lexeme),
                        line,
                    })?;
                    Ok(Expr::Int { value, line })
                }
            }
            TokenKind::Str => Ok(Expr::Str {
                value: token.lexeme,
                line,
            }),
            // `ask` is an ordinary builtin reached by name
            TokenKind::Identifier | TokenKind::Ask => Ok(Expr::Variable {
                name: token.lexeme,
                line,
            }),
            TokenKind::LeftParen => {
                let expr = self.expression()?;
                self.consume(TokenKind::RightParen, "Expect ')' after expression.")?;
                Ok(expr)
            }
            TokenKind::LeftBracket => {
                let mut elements = Vec::new();
                if !self.check(TokenKind::RightBracket) {
                    loop {
                        if self.check(TokenKind::RightBracket) {
                            break;
                        }
                        elements.push(self.expression()?);
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(TokenKind::RightBracket, "Expect ']' after list elements.")?;
                Ok(Expr::List { elements, line })
            }
            TokenKind::LeftBrace => {
                let mut entries = Vec::new();
                if !self.check(TokenKind::RightBrace) {
                    loop {
                        let key = self
                            .consume(TokenKind::Str, "Map keys must be string literals.")?
                            .lexeme;
                        self.consume(TokenKind::Colon, "Expect ':' after map key.")?;
                        let value = self.expression()?;
                        entries.push((key, value));
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(TokenKind::RightBrace, "Expect '}' after map elements.")?;
                Ok(Expr::Map { entries, line })
            }
            _ => Err(Error::ParseError {
                message: format!("Expect expression (at '{}').", token.lexeme),
                line,
            }),
        }
    }
}
