//! Bytecode data types: a stack machine with per-function constant pools.

use crate::compiler::ast::{BinOp, UnaryOp};
use serde::{Deserialize, Serialize};
use skein_core::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Instructions for the Skein stack VM.
///
/// Jump targets are absolute indices into the owning function's code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Push constant `k`.
    LoadConst(u32),
    /// Push the local named by `names[n]`.
    LoadName(u32),
    /// Pop into the local named by `names[n]`.
    StoreName(u32),
    BinOp(BinOp),
    UnOp(UnaryOp),
    Jump(u32),
    /// Pop a bool; jump when it is false.
    JumpIfFalse(u32),
    /// Stack: callee, arg1..argN. Pushes a new frame.
    Call(u8),
    Return,
    /// Call `imports[import]` with the top `argc` values.
    ForeignCall { import: u32, argc: u8 },
    /// Stack: callee, arg1..argN. Pushes a thread reference.
    AsyncCall(u8),
    Await,
}

impl Instruction {
    /// Stable opcode name, used in traces and listings.
    pub fn opcode(&self) -> &'static str {
        match self {
            Instruction::LoadConst(_) => "LOAD_CONST",
            Instruction::LoadName(_) => "LOAD_NAME",
            Instruction::StoreName(_) => "STORE_NAME",
            Instruction::BinOp(_) => "BINOP",
            Instruction::UnOp(_) => "UNOP",
            Instruction::Jump(_) => "JUMP",
            Instruction::JumpIfFalse(_) => "JUMP_IF_FALSE",
            Instruction::Call(_) => "CALL",
            Instruction::Return => "RETURN",
            Instruction::ForeignCall { .. } => "FOREIGN_CALL",
            Instruction::AsyncCall(_) => "ASYNC_CALL",
            Instruction::Await => "AWAIT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Function(String),
}

impl Constant {
    pub fn to_value(&self) -> Value {
        match self {
            Constant::Null => Value::Null,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(n) => Value::Int(*n),
            Constant::Float(x) => Value::Float(*x),
            Constant::Str(s) => Value::Str(s.clone()),
            Constant::Function(name) => Value::Function(name.clone()),
        }
    }
}

/// A foreign function the program calls through the capability boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignFn {
    pub name: String,
    pub module: String,
    pub arity: Option<usize>,
}

impl ForeignFn {
    /// `module.name`, the key capabilities dispatch on.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }
}

/// One compiled function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub constants: Vec<Constant>,
    pub names: Vec<String>,
    pub code: Vec<Instruction>,
    /// Source line of each instruction, parallel to `code`.
    pub lines: Vec<usize>,
}

impl Function {
    pub fn line_at(&self, ip: usize) -> usize {
        self.lines.get(ip).copied().unwrap_or(0)
    }
}

/// A compiled program. Immutable once produced by the compiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    /// `sha256:<hex>` of the source text.
    pub source_hash: String,
    pub functions: BTreeMap<String, Function>,
    pub imports: Vec<ForeignFn>,
}

impl Program {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    /// Human-readable disassembly of every function.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "; program {}", self.source_hash);
        for (i, import) in self.imports.iter().enumerate() {
            let arity = import.arity.map(|a| a.to_string()).unwrap_or_else(|| "*".into());
            let _ = writeln!(out, "; import #{} {}/{}", i, import.qualified(), arity);
        }
        for func in self.functions.values() {
            let _ = writeln!(out, "\nfn {}({}):", func.name, func.params.join(", "));
            for (ip, inst) in func.code.iter().enumerate() {
                let operand = match inst {
                    Instruction::LoadConst(k) => match func.constants.get(*k as usize) {
                        Some(c) => format!("{} ({})", k, c.to_value()),
                        None => k.to_string(),
                    },
                    Instruction::LoadName(n) | Instruction::StoreName(n) => {
                        format!("{} ({})", n, func.names.get(*n as usize).map(String::as_str).unwrap_or("?"))
                    }
                    Instruction::BinOp(op) => op.to_string(),
                    Instruction::UnOp(op) => op.to_string(),
                    Instruction::Jump(t) | Instruction::JumpIfFalse(t) => format!("-> {}", t),
                    Instruction::Call(argc) | Instruction::AsyncCall(argc) => format!("argc={}", argc),
                    Instruction::ForeignCall { import, argc } => {
                        let target = self.imports.get(*import as usize).map(|f| f.qualified()).unwrap_or_default();
                        format!("{} argc={}", target, argc)
                    }
                    Instruction::Return | Instruction::Await => String::new(),
                };
                let row = format!("  {:>4}  L{:<4} {:<14} {}", ip, func.line_at(ip), inst.opcode(), operand);
                out.push_str(row.trim_end());
                out.push('\n');
            }
        }
        out
    }
}
