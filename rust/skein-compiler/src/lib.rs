//! Skein Compiler
//!
//! Transforms Skein source text into a bytecode [`Program`] for the VM.

pub mod compiler;
pub mod diagnostics;

pub use compiler::bytecode::{Constant, ForeignFn, Function, Instruction, Program};

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("lex error: {0}")]
    Lex(#[from] compiler::lexer::LexError),
    #[error("parse error: {0}")]
    Parse(#[from] compiler::parser::ParseError),
    #[error("resolve errors: {}", join_errors(.0))]
    Resolve(Vec<compiler::resolve::ResolveError>),
    #[error("lowering error: {0}")]
    Lower(#[from] compiler::lower::LowerError),
}

fn join_errors(errors: &[compiler::resolve::ResolveError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

/// Compile-time error classes reported to callers of [`compile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    SyntaxError,
    NameError,
    CompileError,
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileErrorKind::SyntaxError => write!(f, "SyntaxError"),
            CompileErrorKind::NameError => write!(f, "NameError"),
            CompileErrorKind::CompileError => write!(f, "CompileError"),
        }
    }
}

impl CompileError {
    pub fn kind(&self) -> CompileErrorKind {
        match self {
            CompileError::Lex(_) | CompileError::Parse(_) => CompileErrorKind::SyntaxError,
            CompileError::Resolve(_) => CompileErrorKind::NameError,
            CompileError::Lower(compiler::lower::LowerError::UnresolvedName { .. }) => CompileErrorKind::NameError,
            CompileError::Lower(_) => CompileErrorKind::CompileError,
        }
    }
}

/// Compile a Skein source file.
pub fn compile(source: &str) -> Result<Program, CompileError> {
    let tokens = compiler::lexer::tokenize(source)?;
    let ast = compiler::parser::parse(tokens)?;
    let symbols = compiler::resolve::resolve(&ast).map_err(CompileError::Resolve)?;
    Ok(compiler::lower::lower(&ast, &symbols, source)?)
}

/// Render a compile error with the offending source lines.
pub fn format_error(error: &CompileError, source: &str, filename: &str) -> String {
    diagnostics::format_compile_error(error, source, filename)
        .iter()
        .map(|d| d.render())
        .collect::<Vec<_>>()
        .join("\n")
}
