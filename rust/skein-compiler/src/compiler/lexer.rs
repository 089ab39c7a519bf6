//! Lexer for Skein source code.
//!
//! Newlines are significant as statement terminators, except inside
//! parentheses and brackets where they are skipped.

use crate::compiler::tokens::{Span, Token, TokenKind};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum LexError {
    #[error("unexpected character '{ch}' at line {line}, col {col}")]
    UnexpectedChar { ch: char, line: usize, col: usize },
    #[error("unterminated string at line {line}, col {col}")]
    UnterminatedString { line: usize, col: usize },
    #[error("unterminated block comment at line {line}, col {col}")]
    UnterminatedComment { line: usize, col: usize },
    #[error("invalid number at line {line}, col {col}")]
    InvalidNumber { line: usize, col: usize },
}

impl LexError {
    pub fn line(&self) -> usize {
        match self {
            LexError::UnexpectedChar { line, .. }
            | LexError::UnterminatedString { line, .. }
            | LexError::UnterminatedComment { line, .. }
            | LexError::InvalidNumber { line, .. } => *line,
        }
    }
}

pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    byte_offset: usize,
    /// Open `(` and `[` count; newlines inside them are not terminators.
    nesting: usize,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            byte_offset: 0,
            nesting: 0,
        }
    }

    fn current(&self) -> Option<char> { self.source.get(self.pos).copied() }
    fn peek(&self) -> Option<char> { self.source.get(self.pos + 1).copied() }

    fn advance(&mut self) -> Option<char> {
        let ch = self.source.get(self.pos).copied()?;
        self.pos += 1;
        self.byte_offset += ch.len_utf8();
        if ch == '\n' { self.line += 1; self.col = 1; } else { self.col += 1; }
        Some(ch)
    }

    fn span_here(&self) -> Span {
        Span::new(self.byte_offset, self.byte_offset, self.line, self.col)
    }

    fn span_from(&self, so: usize, sl: usize, sc: usize) -> Span {
        Span::new(so, self.byte_offset, sl, sc)
    }

    fn skip_block_comment(&mut self) -> Result<(), LexError> {
        let (line, col) = (self.line, self.col);
        self.advance();
        self.advance();
        loop {
            match self.current() {
                None => return Err(LexError::UnterminatedComment { line, col }),
                Some('*') if self.peek() == Some('/') => {
                    self.advance();
                    self.advance();
                    return Ok(());
                }
                Some(_) => { self.advance(); }
            }
        }
    }

    fn read_string(&mut self, quote: char) -> Result<Token, LexError> {
        let (so, sl, sc) = (self.byte_offset, self.line, self.col);
        self.advance(); // opening quote
        let mut s = String::new();
        loop {
            match self.current() {
                None | Some('\n') => return Err(LexError::UnterminatedString { line: sl, col: sc }),
                Some('\\') => {
                    self.advance();
                    match self.current() {
                        Some('n') => { s.push('\n'); self.advance(); }
                        Some('t') => { s.push('\t'); self.advance(); }
                        Some('\\') => { s.push('\\'); self.advance(); }
                        Some(c) if c == quote => { s.push(c); self.advance(); }
                        Some(c) => { s.push('\\'); s.push(c); self.advance(); }
                        None => return Err(LexError::UnterminatedString { line: sl, col: sc }),
                    }
                }
                Some(c) if c == quote => { self.advance(); break; }
                Some(c) => { s.push(c); self.advance(); }
            }
        }
        Ok(Token::new(TokenKind::StringLit(s), self.span_from(so, sl, sc)))
    }

    fn read_number(&mut self) -> Result<Token, LexError> {
        let (so, sl, sc) = (self.byte_offset, self.line, self.col);
        let mut ns = String::new();
        let mut is_float = false;
        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() { ns.push(ch); self.advance(); }
            else if ch == '.' && !is_float && matches!(self.peek(), Some(d) if d.is_ascii_digit()) {
                is_float = true; ns.push(ch); self.advance();
            }
            else if ch == '_' { self.advance(); }
            else { break; }
        }
        if matches!(self.current(), Some(c) if c.is_alphabetic()) {
            return Err(LexError::InvalidNumber { line: sl, col: sc });
        }
        let span = self.span_from(so, sl, sc);
        if is_float {
            ns.parse::<f64>().map(|f| Token::new(TokenKind::FloatLit(f), span))
                .map_err(|_| LexError::InvalidNumber { line: sl, col: sc })
        } else {
            ns.parse::<i64>().map(|n| Token::new(TokenKind::IntLit(n), span))
                .map_err(|_| LexError::InvalidNumber { line: sl, col: sc })
        }
    }

    fn read_ident(&mut self) -> Token {
        let (so, sl, sc) = (self.byte_offset, self.line, self.col);
        let mut id = String::new();
        while let Some(ch) = self.current() {
            if ch.is_alphanumeric() || ch == '_' { id.push(ch); self.advance(); } else { break; }
        }
        let span = self.span_from(so, sl, sc);
        let kind = match id.as_str() {
            "fn" => TokenKind::Fn, "import" => TokenKind::Import,
            "if" => TokenKind::If, "else" => TokenKind::Else,
            "async" => TokenKind::Async, "await" => TokenKind::Await,
            "null" => TokenKind::Null,
            "true" => TokenKind::BoolLit(true), "false" => TokenKind::BoolLit(false),
            _ => TokenKind::Ident(id),
        };
        Token::new(kind, span)
    }

    fn two_char(&mut self, second: char, matched: TokenKind, single: TokenKind) -> Token {
        let (so, sl, sc) = (self.byte_offset, self.line, self.col);
        self.advance();
        if self.current() == Some(second) { self.advance(); Token::new(matched, self.span_from(so, sl, sc)) }
        else { Token::new(single, self.span_from(so, sl, sc)) }
    }

    /// A character that is only valid doubled, like `&&`.
    fn doubled(&mut self, ch: char, kind: TokenKind) -> Result<Token, LexError> {
        let (so, sl, sc) = (self.byte_offset, self.line, self.col);
        self.advance();
        if self.current() == Some(ch) {
            self.advance();
            Ok(Token::new(kind, self.span_from(so, sl, sc)))
        } else {
            Err(LexError::UnexpectedChar { ch, line: sl, col: sc })
        }
    }

    fn single(&mut self, kind: TokenKind) -> Token {
        let span = self.span_here(); self.advance(); Token::new(kind, span)
    }

    fn open(&mut self, kind: TokenKind) -> Token {
        self.nesting += 1;
        self.single(kind)
    }

    fn close(&mut self, kind: TokenKind) -> Token {
        self.nesting = self.nesting.saturating_sub(1);
        self.single(kind)
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens: Vec<Token> = Vec::new();
        while self.pos < self.source.len() {
            let ch = match self.current() { Some(c) => c, None => break };
            match ch {
                '\n' => {
                    let span = self.span_here(); self.advance();
                    let redundant = matches!(tokens.last().map(|t| &t.kind), Some(TokenKind::Newline) | None);
                    if self.nesting == 0 && !redundant {
                        tokens.push(Token::new(TokenKind::Newline, span));
                    }
                }
                ' ' | '\t' | '\r' => { while matches!(self.current(), Some(' ' | '\t' | '\r')) { self.advance(); } }
                '/' if self.peek() == Some('/') => { while matches!(self.current(), Some(c) if c != '\n') { self.advance(); } }
                '/' if self.peek() == Some('*') => self.skip_block_comment()?,
                '"' | '\'' => tokens.push(self.read_string(ch)?),
                '0'..='9' => tokens.push(self.read_number()?),
                c if c.is_alphabetic() || c == '_' => tokens.push(self.read_ident()),
                '+' => tokens.push(self.single(TokenKind::Plus)),
                '-' => tokens.push(self.single(TokenKind::Minus)),
                '*' => tokens.push(self.single(TokenKind::Star)),
                '/' => tokens.push(self.single(TokenKind::Slash)),
                '%' => tokens.push(self.single(TokenKind::Percent)),
                '=' => tokens.push(self.two_char('=', TokenKind::Eq, TokenKind::Assign)),
                '!' => tokens.push(self.two_char('=', TokenKind::NotEq, TokenKind::Bang)),
                '<' => tokens.push(self.two_char('=', TokenKind::LtEq, TokenKind::Lt)),
                '>' => tokens.push(self.two_char('=', TokenKind::GtEq, TokenKind::Gt)),
                '&' => tokens.push(self.doubled('&', TokenKind::AndAnd)?),
                '|' => tokens.push(self.doubled('|', TokenKind::OrOr)?),
                '.' => tokens.push(self.single(TokenKind::Dot)),
                ',' => tokens.push(self.single(TokenKind::Comma)),
                ';' => tokens.push(self.single(TokenKind::Semicolon)),
                '(' => tokens.push(self.open(TokenKind::LParen)),
                ')' => tokens.push(self.close(TokenKind::RParen)),
                '[' => tokens.push(self.open(TokenKind::LBracket)),
                ']' => tokens.push(self.close(TokenKind::RBracket)),
                '{' => tokens.push(self.single(TokenKind::LBrace)),
                '}' => tokens.push(self.single(TokenKind::RBrace)),
                _ => return Err(LexError::UnexpectedChar { ch, line: self.line, col: self.col }),
            }
        }
        tokens.push(Token::new(TokenKind::Eof, self.span_here()));
        Ok(tokens)
    }
}

/// Tokenize a whole source file.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).tokenize()
}
