//! Error diagnostics with source snippets.

use crate::compiler::lexer::LexError;
use crate::compiler::parser::ParseError;
use crate::CompileError;

/// A rendered diagnostic with source context
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: String,
    pub message: String,
    pub file: String,
    pub line: usize,
    pub col: Option<usize>,
    pub source_line: Option<String>,
}

impl Diagnostic {
    fn new(code: &str, message: String, file: &str, line: usize, col: Option<usize>, source: &str) -> Self {
        let source_line = line.checked_sub(1).and_then(|i| source.lines().nth(i)).map(str::to_string);
        Self { code: code.to_string(), message, file: file.to_string(), line, col, source_line }
    }

    /// Render without colors.
    pub fn render(&self) -> String {
        let mut out = format!("error[{}]: {}\n", self.code, self.message);
        match self.col {
            Some(col) => out.push_str(&format!("  --> {}:{}:{}\n", self.file, self.line, col)),
            None => out.push_str(&format!("  --> {}:{}\n", self.file, self.line)),
        }
        if let Some(ref text) = self.source_line {
            out.push_str("   |\n");
            out.push_str(&format!("{:>3} | {}\n", self.line, text));
            if let Some(col) = self.col {
                out.push_str(&format!("   | {}^\n", " ".repeat(col.saturating_sub(1))));
            }
        }
        out
    }
}

fn lex_col(e: &LexError) -> usize {
    match e {
        LexError::UnexpectedChar { col, .. }
        | LexError::UnterminatedString { col, .. }
        | LexError::UnterminatedComment { col, .. }
        | LexError::InvalidNumber { col, .. } => *col,
    }
}

fn parse_col(e: &ParseError) -> usize {
    match e {
        ParseError::Unexpected { col, .. } | ParseError::InvalidAssignTarget { col, .. } => *col,
    }
}

pub fn format_compile_error(error: &CompileError, source: &str, filename: &str) -> Vec<Diagnostic> {
    let code = error.kind().to_string();
    match error {
        CompileError::Lex(e) => vec![Diagnostic::new(&code, e.to_string(), filename, e.line(), Some(lex_col(e)), source)],
        CompileError::Parse(e) => {
            vec![Diagnostic::new(&code, e.to_string(), filename, e.line(), Some(parse_col(e)), source)]
        }
        CompileError::Resolve(errors) => errors
            .iter()
            .map(|e| Diagnostic::new(&code, e.to_string(), filename, e.line(), None, source))
            .collect(),
        CompileError::Lower(e) => vec![Diagnostic::new(&code, e.to_string(), filename, e.line(), None, source)],
    }
}
