//! Token definitions for the Levy language

use std::fmt;

/// Kinds of tokens produced by the lexer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Literals and names
    Identifier,
    Number,
    Str,
    True,  // `yes`
    False, // `no`
    None,  // `none`

    // Keywords
    Say,
    Ask,
    Act,
    Class,
    IsA, // the two-word `is a`
    Init,
    Try,
    Catch,
    If,
    Else,
    While,
    For,
    In,
    Repeat,
    Import,
    Return, // `return` or `->`

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    EqEq,
    BangEq,
    Less,
    Greater,
    LessEq,
    GreaterEq,
    And, // `and` or `&`
    Or,  // `or` or `|`
    Not, // `not` or `!`
    Assign, // `<-`

    // Punctuation
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Colon,
    Dot,
    Comma,
    Semicolon,

    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A single token with its source text and line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub line: u32,
}

impl Token {
    pub fn new(kind: TokenKind, lexeme: impl Into<String>, line: u32) -> Self {
        Self {
            kind,
            lexeme: lexeme.into(),
            line,
        }
    }

    /// Synthetic end-of-file token
    pub fn eof(line: u32) -> Self {
        Self::new(TokenKind::Eof, "", line)
    }
}
