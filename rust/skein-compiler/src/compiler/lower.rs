//! AST → bytecode lowering.
//!
//! Every expression lowers to code that leaves exactly one value on the
//! operand stack. Non-final expressions of a block are discarded by storing
//! them into the reserved `_` local, and `if` branches are checked to end at
//! the same stack depth.

use crate::compiler::ast::*;
use crate::compiler::bytecode::{self, Constant, ForeignFn, Instruction};
use crate::compiler::resolve::{ForeignInfo, NameRef, Scope, SymbolTable, DISCARD};
use crate::compiler::tokens::Span;
use sha2::{Digest, Sha256};
use skein_core::builtins::{BUILTIN_MODULE, LIST_CONSTRUCTOR};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum LowerError {
    #[error("'{name}' expects {expected} argument(s) but got {found} at line {line}")]
    ArityMismatch { name: String, expected: usize, found: usize, line: usize },
    #[error("foreign function '{name}' cannot be used as a value at line {line}")]
    ForeignAsValue { name: String, line: usize },
    #[error("foreign function '{name}' cannot be started with async at line {line}")]
    AsyncForeign { name: String, line: usize },
    #[error("too many arguments ({found}) at line {line}")]
    TooManyArguments { found: usize, line: usize },
    #[error("branches of if leave different stack depths in '{function}' at line {line}")]
    StackImbalance { function: String, line: usize },
    #[error("unresolved name '{name}' at line {line}")]
    UnresolvedName { name: String, line: usize },
}

impl LowerError {
    pub fn line(&self) -> usize {
        match self {
            LowerError::ArityMismatch { line, .. }
            | LowerError::ForeignAsValue { line, .. }
            | LowerError::AsyncForeign { line, .. }
            | LowerError::TooManyArguments { line, .. }
            | LowerError::StackImbalance { line, .. }
            | LowerError::UnresolvedName { line, .. } => *line,
        }
    }
}

/// Lower an entire resolved program.
pub fn lower(program: &Program, symbols: &SymbolTable, source: &str) -> Result<bytecode::Program, LowerError> {
    let source_hash = format!("sha256:{:x}", Sha256::digest(source.as_bytes()));
    let mut imports = Vec::new();
    let mut functions = BTreeMap::new();

    for item in &program.items {
        if let Item::Function(f) = item {
            let func = FnLowerer::new(f, symbols, &mut imports).lower_fn(f)?;
            functions.insert(func.name.clone(), func);
        }
    }

    Ok(bytecode::Program { source_hash, functions, imports })
}

struct FnLowerer<'a> {
    symbols: &'a SymbolTable,
    imports: &'a mut Vec<ForeignFn>,
    function: String,
    scope: Scope,
    constants: Vec<Constant>,
    names: Vec<String>,
    code: Vec<Instruction>,
    lines: Vec<usize>,
    depth: usize,
    line: usize,
}

impl<'a> FnLowerer<'a> {
    fn new(f: &FnDef, symbols: &'a SymbolTable, imports: &'a mut Vec<ForeignFn>) -> Self {
        Self {
            symbols,
            imports,
            function: f.name.clone(),
            scope: Scope::with_params(&f.params),
            constants: Vec::new(),
            names: f.params.iter().map(|p| p.name.clone()).collect(),
            code: Vec::new(),
            lines: Vec::new(),
            depth: 0,
            line: f.span.line,
        }
    }

    fn lower_fn(mut self, f: &FnDef) -> Result<bytecode::Function, LowerError> {
        self.lower_block(&f.body, f.span)?;
        self.emit(Instruction::Return);
        Ok(bytecode::Function {
            name: self.function,
            params: f.params.iter().map(|p| p.name.clone()).collect(),
            constants: self.constants,
            names: self.names,
            code: self.code,
            lines: self.lines,
        })
    }

    // ── Pools ──

    fn constant(&mut self, c: Constant) -> u32 {
        if let Some(i) = self.constants.iter().position(|k| *k == c) {
            return i as u32;
        }
        self.constants.push(c);
        (self.constants.len() - 1) as u32
    }

    fn name(&mut self, name: &str) -> u32 {
        if let Some(i) = self.names.iter().position(|n| n == name) {
            return i as u32;
        }
        self.names.push(name.to_string());
        (self.names.len() - 1) as u32
    }

    fn import(&mut self, name: &str, info: &ForeignInfo) -> u32 {
        let wanted = ForeignFn { name: name.to_string(), module: info.module.clone(), arity: info.arity };
        if let Some(i) = self.imports.iter().position(|f| *f == wanted) {
            return i as u32;
        }
        self.imports.push(wanted);
        (self.imports.len() - 1) as u32
    }

    // ── Emission ──

    fn emit(&mut self, inst: Instruction) -> usize {
        // Net stack effect, tracked statically.
        match inst {
            Instruction::LoadConst(_) | Instruction::LoadName(_) => self.depth += 1,
            Instruction::StoreName(_) | Instruction::BinOp(_) | Instruction::JumpIfFalse(_) => {
                self.depth = self.depth.saturating_sub(1)
            }
            Instruction::Call(argc) | Instruction::AsyncCall(argc) => {
                self.depth = self.depth.saturating_sub(argc as usize)
            }
            Instruction::ForeignCall { argc, .. } => {
                self.depth = (self.depth + 1).saturating_sub(argc as usize)
            }
            Instruction::Return => self.depth = self.depth.saturating_sub(1),
            Instruction::UnOp(_) | Instruction::Jump(_) | Instruction::Await => {}
        }
        self.code.push(inst);
        self.lines.push(self.line);
        self.code.len() - 1
    }

    fn here(&self) -> u32 {
        self.code.len() as u32
    }

    fn patch(&mut self, at: usize, target: u32) {
        self.code[at] = match self.code[at] {
            Instruction::Jump(_) => Instruction::Jump(target),
            Instruction::JumpIfFalse(_) => Instruction::JumpIfFalse(target),
            other => other,
        };
    }

    fn argc(&self, n: usize, span: Span) -> Result<u8, LowerError> {
        u8::try_from(n).map_err(|_| LowerError::TooManyArguments { found: n, line: span.line })
    }

    // ── Blocks and expressions ──

    /// Lower a sequence; leaves the value of its last expression (or null).
    fn lower_block(&mut self, body: &[Expr], span: Span) -> Result<(), LowerError> {
        let Some((last, init)) = body.split_last() else {
            self.line = span.line;
            let k = self.constant(Constant::Null);
            self.emit(Instruction::LoadConst(k));
            return Ok(());
        };
        for expr in init {
            self.lower_expr(expr)?;
            let discard = self.name(DISCARD);
            self.emit(Instruction::StoreName(discard));
        }
        self.lower_expr(last)
    }

    fn lower_expr(&mut self, expr: &Expr) -> Result<(), LowerError> {
        self.line = expr.span().line;
        match expr {
            Expr::IntLit(n, _) => self.load_const(Constant::Int(*n)),
            Expr::FloatLit(x, _) => self.load_const(Constant::Float(*x)),
            Expr::StringLit(s, _) => self.load_const(Constant::Str(s.clone())),
            Expr::BoolLit(b, _) => self.load_const(Constant::Bool(*b)),
            Expr::NullLit(_) => self.load_const(Constant::Null),
            Expr::ListLit(items, span) => {
                for item in items {
                    self.lower_expr(item)?;
                }
                let info = ForeignInfo { module: BUILTIN_MODULE.to_string(), arity: None };
                let import = self.import(LIST_CONSTRUCTOR, &info);
                let argc = self.argc(items.len(), *span)?;
                self.line = span.line;
                self.emit(Instruction::ForeignCall { import, argc });
            }
            Expr::Ident(name, span) => self.load_name(name, *span)?,
            Expr::Assign(name, value, _) => {
                self.lower_expr(value)?;
                let slot = self.name(name);
                self.emit(Instruction::StoreName(slot));
                if name == DISCARD {
                    self.load_const(Constant::Null);
                } else {
                    self.scope.bind(name);
                    self.emit(Instruction::LoadName(slot));
                }
            }
            Expr::BinOp(lhs, op, rhs, span) => {
                self.lower_expr(lhs)?;
                self.lower_expr(rhs)?;
                self.line = span.line;
                self.emit(Instruction::BinOp(*op));
            }
            Expr::UnaryOp(op, operand, span) => {
                self.lower_expr(operand)?;
                self.line = span.line;
                self.emit(Instruction::UnOp(*op));
            }
            Expr::Call(name, args, span) => self.lower_call(name, args, *span, false)?,
            Expr::AsyncCall(name, args, span) => self.lower_call(name, args, *span, true)?,
            Expr::Await(operand, span) => {
                self.lower_expr(operand)?;
                self.line = span.line;
                self.emit(Instruction::Await);
            }
            Expr::If(i) => self.lower_if(i)?,
        }
        Ok(())
    }

    fn load_const(&mut self, c: Constant) {
        let k = self.constant(c);
        self.emit(Instruction::LoadConst(k));
    }

    fn load_name(&mut self, name: &str, span: Span) -> Result<(), LowerError> {
        match self.symbols.lookup(name, &self.scope) {
            Some(NameRef::Local) => {
                let slot = self.name(name);
                self.emit(Instruction::LoadName(slot));
            }
            Some(NameRef::Function(_)) => self.load_const(Constant::Function(name.to_string())),
            Some(NameRef::Foreign(_)) => {
                return Err(LowerError::ForeignAsValue { name: name.to_string(), line: span.line })
            }
            None => return Err(LowerError::UnresolvedName { name: name.to_string(), line: span.line }),
        }
        Ok(())
    }

    fn lower_call(&mut self, name: &str, args: &[Expr], span: Span, spawn: bool) -> Result<(), LowerError> {
        let argc = self.argc(args.len(), span)?;
        let target = self.symbols.lookup(name, &self.scope);
        match target {
            Some(NameRef::Foreign(info)) => {
                if spawn {
                    return Err(LowerError::AsyncForeign { name: name.to_string(), line: span.line });
                }
                if let Some(expected) = info.arity {
                    if expected != args.len() {
                        return Err(LowerError::ArityMismatch {
                            name: name.to_string(), expected, found: args.len(), line: span.line,
                        });
                    }
                }
                let info = info.clone();
                for arg in args {
                    self.lower_expr(arg)?;
                }
                let import = self.import(name, &info);
                self.line = span.line;
                self.emit(Instruction::ForeignCall { import, argc });
                return Ok(());
            }
            Some(NameRef::Function(f)) => {
                if f.params.len() != args.len() {
                    return Err(LowerError::ArityMismatch {
                        name: name.to_string(), expected: f.params.len(), found: args.len(), line: span.line,
                    });
                }
                self.load_const(Constant::Function(name.to_string()));
            }
            // Arity of a function held in a local is checked at runtime.
            Some(NameRef::Local) => {
                let slot = self.name(name);
                self.emit(Instruction::LoadName(slot));
            }
            None => return Err(LowerError::UnresolvedName { name: name.to_string(), line: span.line }),
        }
        for arg in args {
            self.lower_expr(arg)?;
        }
        self.line = span.line;
        if spawn {
            self.emit(Instruction::AsyncCall(argc));
        } else {
            self.emit(Instruction::Call(argc));
        }
        Ok(())
    }

    fn lower_if(&mut self, i: &IfExpr) -> Result<(), LowerError> {
        self.lower_expr(&i.cond)?;
        self.line = i.span.line;
        let to_else = self.emit(Instruction::JumpIfFalse(0));
        let base = self.depth;
        let outer = self.scope.clone();

        self.lower_block(&i.then_body, i.span)?;
        let then_depth = self.depth;
        let then_scope = std::mem::replace(&mut self.scope, outer);
        let to_end = self.emit(Instruction::Jump(0));
        let else_start = self.here();
        self.patch(to_else, else_start);

        self.depth = base;
        match &i.else_body {
            Some(body) => self.lower_block(body, i.span)?,
            None => self.load_const(Constant::Null),
        }
        if then_depth != base + 1 || self.depth != base + 1 {
            return Err(LowerError::StackImbalance { function: self.function.clone(), line: i.span.line });
        }
        let end = self.here();
        self.patch(to_end, end);

        let else_scope = std::mem::take(&mut self.scope);
        self.scope = Scope::join(then_scope, else_scope);
        Ok(())
    }
}
