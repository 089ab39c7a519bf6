//! Builtin foreign functions available to every program without an import.
//!
//! The compiler resolves these names against [`BUILTINS`]; the VM crate
//! provides the implementations under [`BUILTIN_MODULE`].

/// Module name builtin foreign calls are routed to.
pub const BUILTIN_MODULE: &str = "builtin";

/// Name of the builtin that list literals lower to.
pub const LIST_CONSTRUCTOR: &str = "list";

/// Signature of one builtin. `arity` is `None` for variadic builtins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinSig {
    pub name: &'static str,
    pub arity: Option<usize>,
}

pub const BUILTINS: &[BuiltinSig] = &[
    BuiltinSig { name: "print", arity: None },
    BuiltinSig { name: "list", arity: None },
    BuiltinSig { name: "len", arity: Some(1) },
    BuiltinSig { name: "append", arity: Some(2) },
    BuiltinSig { name: "nth", arity: Some(2) },
    BuiltinSig { name: "first", arity: Some(1) },
    BuiltinSig { name: "rest", arity: Some(1) },
    BuiltinSig { name: "str", arity: Some(1) },
];

pub fn lookup(name: &str) -> Option<&'static BuiltinSig> {
    BUILTINS.iter().find(|b| b.name == name)
}
