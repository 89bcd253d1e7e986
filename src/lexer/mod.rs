//! Lexer for the Levy language
//!
//! Turns source text into a token stream. Levy is line-oriented only for
//! comments (`#` to end of line); whitespace is otherwise insignificant.
//! The assignment arrow is `<-`, the return arrow `->`, and the inheritance
//! relation is the two-word keyword `is a`.

mod token;

pub use token::{Token, TokenKind};

use crate::error::{Error, Result};

/// Streaming tokenizer over Levy source text
pub struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    line: u32,
}

/// Tokenize a complete source string
pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    Lexer::new(source).tokenize()
}

impl<'a> Lexer<'a> {
    /// Create a lexer over a source string
    pub fn new(source: &'a str) -> Self {
        Self {
            source: source.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    /// Consume the whole input, producing tokens plus a trailing Eof
    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            match c {
                b' ' | b'\t' | b'\r' => {
                    self.pos += 1;
                }
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                b'#' => {
                    while self.peek().is_some_and(|c| c != b'\n') {
                        self.pos += 1;
                    }
                }
                b'"' => tokens.push(self.scan_string()?),
                c if c.is_ascii_alphabetic() || c == b'_' => tokens.push(self.scan_identifier()),
                c if c.is_ascii_digit() => tokens.push(self.scan_number()),
                b'.' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => {
                    tokens.push(self.scan_number())
                }
                _ => tokens.push(self.scan_operator()?),
            }
        }
        tokens.push(Token::eof(self.line));
        Ok(tokens)
    }

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.source.get(self.pos + ahead).copied()
    }

    fn scan_identifier(&mut self) -> Token {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
        {
            self.pos += 1;
        }
        let lexeme = std::str::from_utf8(&self.source[start..self.pos])
            .unwrap_or_default()
            .to_string();

        // `is` followed by a bare `a` forms the inheritance keyword.
        if lexeme == "is" {
            let mut ahead = self.pos;
            while self
                .source
                .get(ahead)
                .is_some_and(|&c| c == b' ' || c == b'\t')
            {
                ahead += 1;
            }
            if self.source.get(ahead) == Some(&b'a')
                && !self
                    .source
                    .get(ahead + 1)
                    .is_some_and(|c| c.is_ascii_alphanumeric() || *c == b'_')
            {
                self.pos = ahead + 1;
                return Token::new(TokenKind::IsA, "is a", self.line);
            }
        }

        let kind = match lexeme.as_str() {
            "say" => TokenKind::Say,
            "ask" => TokenKind::Ask,
            "act" => TokenKind::Act,
            "class" => TokenKind::Class,
            "init" => TokenKind::Init,
            "try" => TokenKind::Try,
            "catch" => TokenKind::Catch,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "for" => TokenKind::For,
            "in" => TokenKind::In,
            "repeat" => TokenKind::Repeat,
            "import" => TokenKind::Import,
            "return" => TokenKind::Return,
            "yes" => TokenKind::True,
            "no" => TokenKind::False,
            "none" => TokenKind::None,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            _ => TokenKind::Identifier,
        };
        Token::new(kind, lexeme, self.line)
    }

    fn scan_number(&mut self) -> Token {
        let start = self.pos;
        let mut seen_dot = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == b'.' && !seen_dot && self.peek_at(1).is_some_and(|d| d.is_ascii_digit())
            {
                seen_dot = true;
                self.pos += 1;
            } else if c == b'.' && !seen_dot && start < self.pos {
                // Trailing dot with digits before it, e.g. `3.` — keep the
                // original interpreter's behavior of accepting it as a float.
                seen_dot = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let lexeme = std::str::from_utf8(&self.source[start..self.pos])
            .unwrap_or_default()
            .to_string();
        Token::new(TokenKind::Number, lexeme, self.line)
    }

    fn scan_string(&mut self) -> Result<Token> {
        let start_line = self.line;
        self.pos += 1; // opening quote
        // Collect raw bytes and decode once, so multi-byte UTF-8 sequences
        // pass through intact.
        let mut bytes = Vec::new();
        loop {
            match self.peek() {
                None => {
                    return Err(Error::LexError {
                        message: "Unterminated string.".into(),
                        line: start_line,
                    })
                }
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(b'n') => bytes.push(b'\n'),
                        Some(b't') => bytes.push(b'\t'),
                        Some(b'"') => bytes.push(b'"'),
                        Some(b'\\') => bytes.push(b'\\'),
                        Some(c) => bytes.push(c),
                        None => {
                            return Err(Error::LexError {
                                message: "Unterminated string.".into(),
                                line: start_line,
                            })
                        }
                    }
                    self.pos += 1;
                }
                Some(b'\n') => {
                    self.line += 1;
                    bytes.push(b'\n');
                    self.pos += 1;
                }
                Some(c) => {
                    bytes.push(c);
                    self.pos += 1;
                }
            }
        }
        let lexeme = String::from_utf8(bytes).map_err(|_| Error::LexError {
            message: "Invalid UTF-8 in string literal.".into(),
            line: start_line,
        })?;
        Ok(Token::new(TokenKind::Str, lexeme, start_line))
    }

    fn scan_operator(&mut self) -> Result<Token> {
        let line = self.line;
        let two = (self.peek(), self.peek_at(1));
        let two_char = match two {
            (Some(b'='), Some(b'=')) => Some((TokenKind::EqEq, "==")),
            (Some(b'!'), Some(b'=')) => Some((TokenKind::BangEq, "!=")),
            (Some(b'<'), Some(b'=')) => Some((TokenKind::LessEq, "<=")),
            (Some(b'>'), Some(b'=')) => Some((TokenKind::GreaterEq, ">=")),
            (Some(b'<'), Some(b'-')) => Some((TokenKind::Assign, "<-")),
            (Some(b'-'), Some(b'>')) => Some((TokenKind::Return, "->")),
            _ => None,
        };
        if let Some((kind, lexeme)) = two_char {
            self.pos += 2;
            return Ok(Token::new(kind, lexeme, line));
        }

        let c = self.peek().unwrap_or(0);
        self.pos += 1;
        let kind = match c {
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'%' => TokenKind::Percent,
            b'^' => TokenKind::Caret,
            b'<' => TokenKind::Less,
            b'>' => TokenKind::Greater,
            b'&' => TokenKind::And,
            b'|' => TokenKind::Or,
            b'!' => TokenKind::Not,
            b'(' => TokenKind::LeftParen,
            b')' => TokenKind::RightParen,
            b'[' => TokenKind::LeftBracket,
            b']' => TokenKind::RightBracket,
            b'{' => TokenKind::LeftBrace,
            b'}' => TokenKind::RightBrace,
            b':' => TokenKind::Colon,
            b'.' => TokenKind::Dot,
            b',' => TokenKind::Comma,
            b';' => TokenKind::Semicolon,
            other => {
                return Err(Error::LexError {
                    message: format!("Unexpected character '{}'.", other as char),
                    line,
                })
            }
        };
        Ok(Token::new(kind, (c as char).to_string(), line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scans_assignment_and_arrows() {
        assert_eq!(
            kinds("x <- 1 -> y"),
            vec![
                TokenKind::Identifier,
                TokenKind::Assign,
                TokenKind::Number,
                TokenKind::Return,
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn scans_is_a_keyword() {
        assert_eq!(
            kinds("class Dog is a Animal"),
            vec![
                TokenKind::Class,
                TokenKind::Identifier,
                TokenKind::IsA,
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
        // `is` followed by a longer identifier is a plain identifier pair
        assert_eq!(
            kinds("is apple"),
            vec![TokenKind::Identifier, TokenKind::Identifier, TokenKind::Eof]
        );
    }

    #[test]
    fn scans_string_escapes() {
        let tokens = tokenize(r#""a\nb\"c""#).unwrap();
        assert_eq!(tokens[0].lexeme, "a\nb\"c");
    }

    #[test]
    fn strings_keep_non_ascii_intact() {
        let tokens = tokenize("\"héllo wörld\"").unwrap();
        assert_eq!(tokens[0].lexeme, "héllo wörld");
        let tokens = tokenize("\"日本語\"").unwrap();
        assert_eq!(tokens[0].lexeme, "日本語");
    }

    #[test]
    fn comments_run_to_end_of_line() {
        assert_eq!(
            kinds("1 # everything here is ignored\n2"),
            vec![TokenKind::Number, TokenKind::Number, TokenKind::Eof]
        );
    }

    #[test]
    fn tracks_line_numbers() {
        let tokens = tokenize("1\n2\n3").unwrap();
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2);
        assert_eq!(tokens[2].line, 3);
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(tokenize("\"abc").is_err());
    }
}
