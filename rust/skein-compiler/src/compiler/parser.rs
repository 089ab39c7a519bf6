//! Recursive-descent parser with Pratt expression parsing.

use crate::compiler::ast::*;
use crate::compiler::tokens::{Span, Token, TokenKind};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("unexpected token {found} at line {line}, col {col}; expected {expected}")]
    Unexpected { found: String, expected: String, line: usize, col: usize },
    #[error("invalid assignment target at line {line}, col {col}")]
    InvalidAssignTarget { line: usize, col: usize },
}

impl ParseError {
    pub fn line(&self) -> usize {
        match self {
            ParseError::Unexpected { line, .. } | ParseError::InvalidAssignTarget { line, .. } => *line,
        }
    }
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    eof: Token,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        let eof_span = tokens.last().map(|t| t.span).unwrap_or_else(Span::dummy);
        Self { tokens, pos: 0, eof: Token::new(TokenKind::Eof, eof_span) }
    }

    fn current(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&self.eof)
    }

    fn peek_kind(&self) -> &TokenKind { &self.current().kind }

    fn peek_kind_at(&self, offset: usize) -> &TokenKind {
        self.tokens.get(self.pos + offset).map(|t| &t.kind).unwrap_or(&self.eof.kind)
    }

    fn advance(&mut self) -> Token {
        let tok = self.current().clone();
        if self.pos < self.tokens.len() { self.pos += 1; }
        tok
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let tok = self.current();
        ParseError::Unexpected {
            found: format!("{}", tok.kind), expected: expected.into(),
            line: tok.span.line, col: tok.span.col,
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<Token, ParseError> {
        if std::mem::discriminant(self.peek_kind()) == std::mem::discriminant(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&format!("{}", kind)))
        }
    }

    fn expect_ident(&mut self) -> Result<(String, Span), ParseError> {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                let tok = self.advance();
                Ok((name, tok.span))
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline) { self.advance(); }
    }

    fn skip_terminators(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline | TokenKind::Semicolon) { self.advance(); }
    }

    // ── Items ──

    pub fn parse_program(&mut self) -> Result<Program, ParseError> {
        let start = self.current().span;
        let mut items = Vec::new();
        self.skip_terminators();
        while !matches!(self.peek_kind(), TokenKind::Eof) {
            let item = match self.peek_kind() {
                TokenKind::Fn => Item::Function(self.parse_fn()?),
                TokenKind::Import => Item::Import(self.parse_import()?),
                _ => return Err(self.unexpected("'fn' or 'import' at top level")),
            };
            items.push(item);
            if !matches!(self.peek_kind(), TokenKind::Eof | TokenKind::Newline | TokenKind::Semicolon) {
                return Err(self.unexpected("newline or ';' after top-level item"));
            }
            self.skip_terminators();
        }
        let span = start.merge(self.current().span);
        Ok(Program { items, span })
    }

    fn parse_fn(&mut self) -> Result<FnDef, ParseError> {
        let start = self.expect(&TokenKind::Fn)?.span;
        let (name, _) = self.expect_ident()?;
        self.expect(&TokenKind::LParen)?;
        let mut params = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RParen) {
            let (pname, span) = self.expect_ident()?;
            params.push(Param { name: pname, span });
            if matches!(self.peek_kind(), TokenKind::Comma) { self.advance(); } else { break; }
        }
        self.expect(&TokenKind::RParen)?;
        let (body, end) = self.parse_block()?;
        Ok(FnDef { name, params, body, span: start.merge(end) })
    }

    fn parse_import(&mut self) -> Result<ImportDecl, ParseError> {
        let start = self.expect(&TokenKind::Import)?.span;
        self.expect(&TokenKind::LParen)?;
        let (name, _) = self.expect_ident()?;
        self.expect(&TokenKind::Comma)?;
        let (mut module, _) = self.expect_ident()?;
        while matches!(self.peek_kind(), TokenKind::Dot) {
            self.advance();
            let (part, _) = self.expect_ident()?;
            module.push('.');
            module.push_str(&part);
        }
        let mut arity = None;
        if matches!(self.peek_kind(), TokenKind::Comma) {
            self.advance();
            match self.peek_kind().clone() {
                TokenKind::IntLit(n) if n >= 0 => {
                    self.advance();
                    arity = Some(n as usize);
                }
                _ => return Err(self.unexpected("arity")),
            }
        }
        let end = self.expect(&TokenKind::RParen)?.span;
        Ok(ImportDecl { name, module, arity, span: start.merge(end) })
    }

    /// `{ expr (term expr)* }`, returning the body and the closing brace span.
    fn parse_block(&mut self) -> Result<(Vec<Expr>, Span), ParseError> {
        self.expect(&TokenKind::LBrace)?;
        let mut body = Vec::new();
        self.skip_terminators();
        while !matches!(self.peek_kind(), TokenKind::RBrace) {
            body.push(self.parse_expr(0)?);
            match self.peek_kind() {
                TokenKind::Newline | TokenKind::Semicolon => self.skip_terminators(),
                TokenKind::RBrace => break,
                _ => return Err(self.unexpected("newline, ';' or '}'")),
            }
        }
        let end = self.expect(&TokenKind::RBrace)?.span;
        Ok((body, end))
    }

    // ── Expressions ──

    pub fn parse_expr(&mut self, min_bp: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_prefix()?;
        loop {
            let (op, (l_bp, r_bp)) = match self.peek_kind() {
                TokenKind::OrOr => (BinOp::Or, (2, 3)),
                TokenKind::AndAnd => (BinOp::And, (4, 5)),
                TokenKind::Eq => (BinOp::Eq, (6, 7)),
                TokenKind::NotEq => (BinOp::NotEq, (6, 7)),
                TokenKind::Lt => (BinOp::Lt, (8, 9)),
                TokenKind::LtEq => (BinOp::LtEq, (8, 9)),
                TokenKind::Gt => (BinOp::Gt, (8, 9)),
                TokenKind::GtEq => (BinOp::GtEq, (8, 9)),
                TokenKind::Plus => (BinOp::Add, (10, 11)),
                TokenKind::Minus => (BinOp::Sub, (10, 11)),
                TokenKind::Star => (BinOp::Mul, (12, 13)),
                TokenKind::Slash => (BinOp::Div, (12, 13)),
                TokenKind::Percent => (BinOp::Mod, (12, 13)),
                TokenKind::Assign => {
                    let span = self.current().span;
                    return Err(ParseError::InvalidAssignTarget { line: span.line, col: span.col });
                }
                _ => break,
            };
            if l_bp < min_bp { break; }
            self.advance();
            self.skip_newlines();
            let rhs = self.parse_expr(r_bp)?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::BinOp(Box::new(lhs), op, Box::new(rhs), span);
        }
        Ok(lhs)
    }

    const PREFIX_BP: u8 = 14;

    fn parse_prefix(&mut self) -> Result<Expr, ParseError> {
        let tok = self.current().clone();
        match tok.kind {
            TokenKind::IntLit(n) => { self.advance(); Ok(Expr::IntLit(n, tok.span)) }
            TokenKind::FloatLit(x) => { self.advance(); Ok(Expr::FloatLit(x, tok.span)) }
            TokenKind::StringLit(s) => { self.advance(); Ok(Expr::StringLit(s, tok.span)) }
            TokenKind::BoolLit(b) => { self.advance(); Ok(Expr::BoolLit(b, tok.span)) }
            TokenKind::Null => { self.advance(); Ok(Expr::NullLit(tok.span)) }
            TokenKind::Ident(name) => {
                self.advance();
                match self.peek_kind() {
                    TokenKind::LParen => {
                        let (args, end) = self.parse_args()?;
                        Ok(Expr::Call(name, args, tok.span.merge(end)))
                    }
                    TokenKind::Assign => {
                        self.advance();
                        self.skip_newlines();
                        let value = self.parse_expr(0)?;
                        let span = tok.span.merge(value.span());
                        Ok(Expr::Assign(name, Box::new(value), span))
                    }
                    _ => Ok(Expr::Ident(name, tok.span)),
                }
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr(0)?;
                self.expect(&TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !matches!(self.peek_kind(), TokenKind::RBracket) {
                    items.push(self.parse_expr(0)?);
                    if matches!(self.peek_kind(), TokenKind::Comma) { self.advance(); } else { break; }
                }
                let end = self.expect(&TokenKind::RBracket)?.span;
                Ok(Expr::ListLit(items, tok.span.merge(end)))
            }
            TokenKind::Minus => self.parse_unary(UnaryOp::Neg, tok.span),
            TokenKind::Bang => self.parse_unary(UnaryOp::Not, tok.span),
            TokenKind::Await => {
                self.advance();
                let operand = self.parse_expr(Self::PREFIX_BP)?;
                let span = tok.span.merge(operand.span());
                Ok(Expr::Await(Box::new(operand), span))
            }
            TokenKind::Async => {
                self.advance();
                let is_call = matches!(self.peek_kind(), TokenKind::Ident(_))
                    && matches!(self.peek_kind_at(1), TokenKind::LParen);
                if !is_call {
                    return Err(self.unexpected("function call after 'async'"));
                }
                let (name, _) = self.expect_ident()?;
                let (args, end) = self.parse_args()?;
                Ok(Expr::AsyncCall(name, args, tok.span.merge(end)))
            }
            TokenKind::If => self.parse_if().map(Expr::If),
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_unary(&mut self, op: UnaryOp, start: Span) -> Result<Expr, ParseError> {
        self.advance();
        let operand = self.parse_expr(Self::PREFIX_BP)?;
        let span = start.merge(operand.span());
        Ok(Expr::UnaryOp(op, Box::new(operand), span))
    }

    fn parse_args(&mut self) -> Result<(Vec<Expr>, Span), ParseError> {
        self.expect(&TokenKind::LParen)?;
        let mut args = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RParen) {
            args.push(self.parse_expr(0)?);
            if matches!(self.peek_kind(), TokenKind::Comma) { self.advance(); } else { break; }
        }
        let end = self.expect(&TokenKind::RParen)?.span;
        Ok((args, end))
    }

    fn parse_if(&mut self) -> Result<IfExpr, ParseError> {
        let start = self.expect(&TokenKind::If)?.span;
        let cond = self.parse_expr(0)?;
        let (then_body, mut end) = self.parse_block()?;

        // `else` may sit on the line after the closing brace.
        let checkpoint = self.pos;
        self.skip_newlines();
        let else_body = if matches!(self.peek_kind(), TokenKind::Else) {
            self.advance();
            if matches!(self.peek_kind(), TokenKind::If) {
                let nested = self.parse_if()?;
                end = nested.span;
                Some(vec![Expr::If(nested)])
            } else {
                let (body, close) = self.parse_block()?;
                end = close;
                Some(body)
            }
        } else {
            self.pos = checkpoint;
            None
        };
        Ok(IfExpr { cond: Box::new(cond), then_body, else_body, span: start.merge(end) })
    }
}

/// Parse a token stream into a [`Program`].
pub fn parse(tokens: Vec<Token>) -> Result<Program, ParseError> {
    Parser::new(tokens).parse_program()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::tokenize;

    fn parse_src(src: &str) -> Result<Program, ParseError> {
        parse(tokenize(src).unwrap())
    }

    fn only_fn(src: &str) -> FnDef {
        let prog = parse_src(src).unwrap();
        match prog.items.into_iter().next() {
            Some(Item::Function(f)) => f,
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_async_await_sequence() {
        let f = only_fn("fn main() { x = async add(2, 3); await x }");
        assert_eq!(f.name, "main");
        assert_eq!(f.body.len(), 2);
        match &f.body[0] {
            Expr::Assign(name, value, _) => {
                assert_eq!(name, "x");
                assert!(matches!(value.as_ref(), Expr::AsyncCall(callee, args, _) if callee == "add" && args.len() == 2));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&f.body[1], Expr::Await(inner, _) if matches!(inner.as_ref(), Expr::Ident(n, _) if n == "x")));
    }

    #[test]
    fn test_precedence() {
        let f = only_fn("fn f(a, b, c) { a + b * c == c || !a }");
        match &f.body[0] {
            Expr::BinOp(lhs, BinOp::Or, rhs, _) => {
                assert!(matches!(lhs.as_ref(), Expr::BinOp(_, BinOp::Eq, _, _)));
                assert!(matches!(rhs.as_ref(), Expr::UnaryOp(UnaryOp::Not, _, _)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_await_binds_tighter_than_addition() {
        let f = only_fn("fn f(t) { await t + 1 }");
        assert!(matches!(&f.body[0], Expr::BinOp(lhs, BinOp::Add, _, _) if matches!(lhs.as_ref(), Expr::Await(_, _))));
    }

    #[test]
    fn test_else_if_chain_across_lines() {
        let f = only_fn("fn f(x) {\n  if x > 1 {\n    \"big\"\n  }\n  else if x > 0 { \"small\" }\n  else { \"none\" }\n}");
        assert_eq!(f.body.len(), 1);
        match &f.body[0] {
            Expr::If(i) => {
                let else_body = i.else_body.as_ref().unwrap();
                assert!(matches!(&else_body[0], Expr::If(nested) if nested.else_body.is_some()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_if_without_else() {
        let f = only_fn("fn f(x) { if x { 1 }\n 2 }");
        assert_eq!(f.body.len(), 2);
        assert!(matches!(&f.body[0], Expr::If(i) if i.else_body.is_none()));
    }

    #[test]
    fn test_import_forms() {
        let prog = parse_src("import(fetch, net.http, 1)\nimport(now, clock)").unwrap();
        match (&prog.items[0], &prog.items[1]) {
            (Item::Import(a), Item::Import(b)) => {
                assert_eq!((a.name.as_str(), a.module.as_str(), a.arity), ("fetch", "net.http", Some(1)));
                assert_eq!((b.name.as_str(), b.module.as_str(), b.arity), ("now", "clock", None));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_list_literal_spans_lines() {
        let f = only_fn("fn f() { [1,\n 2,\n 3] }");
        assert!(matches!(&f.body[0], Expr::ListLit(items, _) if items.len() == 3));
    }

    #[test]
    fn test_async_requires_call() {
        let err = parse_src("fn f(x) { async x }").unwrap_err();
        assert!(matches!(err, ParseError::Unexpected { ref expected, .. } if expected.contains("async")));
    }

    #[test]
    fn test_missing_terminator_between_expressions() {
        assert!(parse_src("fn f() { 1 2 }").is_err());
    }

    #[test]
    fn test_statement_at_top_level_rejected() {
        assert!(parse_src("x = 1").is_err());
    }

    #[test]
    fn test_assignment_to_expression_rejected() {
        let err = parse_src("fn f(a) { a + 1 = 2 }").unwrap_err();
        assert!(matches!(err, ParseError::InvalidAssignTarget { .. }));
    }
}
