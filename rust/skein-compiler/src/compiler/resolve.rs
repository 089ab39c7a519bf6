//! Name resolution pass: top-level functions, foreign imports, and locals.

use crate::compiler::ast::*;
use skein_core::builtins::{BUILTINS, BUILTIN_MODULE};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ResolveError {
    #[error("undefined name '{name}' at line {line}")]
    UndefinedName { name: String, line: usize },
    #[error("undefined function '{name}' at line {line}")]
    UndefinedFunction { name: String, line: usize },
    #[error("duplicate definition '{name}' at line {line}")]
    Duplicate { name: String, line: usize },
    #[error("duplicate parameter '{name}' at line {line}")]
    DuplicateParam { name: String, line: usize },
}

impl ResolveError {
    pub fn line(&self) -> usize {
        match self {
            ResolveError::UndefinedName { line, .. }
            | ResolveError::UndefinedFunction { line, .. }
            | ResolveError::Duplicate { line, .. }
            | ResolveError::DuplicateParam { line, .. } => *line,
        }
    }
}

/// Local reserved for discarded statement values; never readable.
pub const DISCARD: &str = "_";

/// Symbol table built during resolution
#[derive(Debug, Clone)]
pub struct SymbolTable {
    pub functions: HashMap<String, FnInfo>,
    pub foreign: HashMap<String, ForeignInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FnInfo {
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignInfo {
    pub module: String,
    /// `None` accepts any argument count.
    pub arity: Option<usize>,
}

/// What a name refers to at one point in a function body.
#[derive(Debug, Clone, PartialEq)]
pub enum NameRef<'a> {
    Local,
    Function(&'a FnInfo),
    Foreign(&'a ForeignInfo),
}

impl SymbolTable {
    pub fn new() -> Self {
        let foreign = BUILTINS
            .iter()
            .map(|b| (b.name.to_string(), ForeignInfo { module: BUILTIN_MODULE.to_string(), arity: b.arity }))
            .collect();
        Self { functions: HashMap::new(), foreign }
    }

    /// Locals shadow functions, and functions shadow foreign names.
    pub fn lookup<'a>(&'a self, name: &str, scope: &Scope) -> Option<NameRef<'a>> {
        if scope.contains(name) {
            Some(NameRef::Local)
        } else if let Some(f) = self.functions.get(name) {
            Some(NameRef::Function(f))
        } else {
            self.foreign.get(name).map(NameRef::Foreign)
        }
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Locals bound so far in one function body.
///
/// After an `if`, only names bound on every branch stay visible, so a read
/// can never observe an unbound slot at runtime.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    bound: HashSet<String>,
}

impl Scope {
    pub fn with_params(params: &[Param]) -> Self {
        Self { bound: params.iter().map(|p| p.name.clone()).collect() }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bound.contains(name)
    }

    pub fn bind(&mut self, name: &str) {
        if name != DISCARD {
            self.bound.insert(name.to_string());
        }
    }

    /// Merge the scopes at the end of two branches.
    pub fn join(then_scope: Scope, else_scope: Scope) -> Scope {
        let bound = then_scope.bound.intersection(&else_scope.bound).cloned().collect();
        Scope { bound }
    }
}

/// Resolve all names in a program, building the symbol table.
pub fn resolve(program: &Program) -> Result<SymbolTable, Vec<ResolveError>> {
    let mut table = SymbolTable::new();
    let mut errors = Vec::new();
    let mut imported: HashSet<String> = HashSet::new();

    // First pass: register functions and imports
    for item in &program.items {
        match item {
            Item::Function(f) => {
                if table.functions.contains_key(&f.name) || imported.contains(&f.name) {
                    errors.push(ResolveError::Duplicate { name: f.name.clone(), line: f.span.line });
                    continue;
                }
                let mut seen = HashSet::new();
                for p in &f.params {
                    if !seen.insert(p.name.as_str()) {
                        errors.push(ResolveError::DuplicateParam { name: p.name.clone(), line: p.span.line });
                    }
                }
                table.functions.insert(f.name.clone(), FnInfo {
                    params: f.params.iter().map(|p| p.name.clone()).collect(),
                });
            }
            Item::Import(i) => {
                if table.functions.contains_key(&i.name) || !imported.insert(i.name.clone()) {
                    errors.push(ResolveError::Duplicate { name: i.name.clone(), line: i.span.line });
                    continue;
                }
                table.foreign.insert(i.name.clone(), ForeignInfo { module: i.module.clone(), arity: i.arity });
            }
        }
    }

    // Second pass: check every reference inside function bodies
    for item in &program.items {
        if let Item::Function(f) = item {
            let mut scope = Scope::with_params(&f.params);
            for expr in &f.body {
                check_expr(expr, &table, &mut scope, &mut errors);
            }
        }
    }

    if errors.is_empty() { Ok(table) } else { Err(errors) }
}

fn check_expr(expr: &Expr, table: &SymbolTable, scope: &mut Scope, errors: &mut Vec<ResolveError>) {
    match expr {
        Expr::IntLit(..) | Expr::FloatLit(..) | Expr::StringLit(..) | Expr::BoolLit(..) | Expr::NullLit(_) => {}
        Expr::Ident(name, span) => {
            if table.lookup(name, scope).is_none() {
                errors.push(ResolveError::UndefinedName { name: name.clone(), line: span.line });
            }
        }
        Expr::ListLit(items, _) => {
            for item in items {
                check_expr(item, table, scope, errors);
            }
        }
        Expr::Assign(name, value, _) => {
            check_expr(value, table, scope, errors);
            scope.bind(name);
        }
        Expr::BinOp(lhs, _, rhs, _) => {
            check_expr(lhs, table, scope, errors);
            check_expr(rhs, table, scope, errors);
        }
        Expr::UnaryOp(_, operand, _) | Expr::Await(operand, _) => check_expr(operand, table, scope, errors),
        Expr::Call(name, args, span) | Expr::AsyncCall(name, args, span) => {
            if table.lookup(name, scope).is_none() {
                errors.push(ResolveError::UndefinedFunction { name: name.clone(), line: span.line });
            }
            for arg in args {
                check_expr(arg, table, scope, errors);
            }
        }
        Expr::If(i) => {
            check_expr(&i.cond, table, scope, errors);
            let mut then_scope = scope.clone();
            for e in &i.then_body {
                check_expr(e, table, &mut then_scope, errors);
            }
            let mut else_scope = scope.clone();
            for e in i.else_body.iter().flatten() {
                check_expr(e, table, &mut else_scope, errors);
            }
            *scope = Scope::join(then_scope, else_scope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::tokenize;
    use crate::compiler::parser::parse;

    fn resolve_src(src: &str) -> Result<SymbolTable, Vec<ResolveError>> {
        resolve(&parse(tokenize(src).unwrap()).unwrap())
    }

    #[test]
    fn test_resolves_functions_params_and_locals() {
        let table = resolve_src("fn add(x, y) { x + y }\nfn main() { z = add(1, 2); z }").unwrap();
        assert_eq!(table.functions["add"].params, vec!["x", "y"]);
    }

    #[test]
    fn test_undefined_name() {
        let errs = resolve_src("fn main() { y + 1 }").unwrap_err();
        assert_eq!(errs, vec![ResolveError::UndefinedName { name: "y".into(), line: 1 }]);
    }

    #[test]
    fn test_use_before_binding_is_undefined() {
        let errs = resolve_src("fn main() { x = x + 1 }").unwrap_err();
        assert!(matches!(&errs[0], ResolveError::UndefinedName { name, .. } if name == "x"));
    }

    #[test]
    fn test_binding_in_one_branch_only_is_not_visible_after_if() {
        let errs = resolve_src("fn f(c) {\n if c { y = 1 }\n y\n}").unwrap_err();
        assert!(matches!(&errs[0], ResolveError::UndefinedName { name, line: 3 } if name == "y"));
        assert!(resolve_src("fn f(c) {\n if c { y = 1 } else { y = 2 }\n y\n}").is_ok());
    }

    #[test]
    fn test_undefined_function() {
        let errs = resolve_src("fn main() { nope(1) }").unwrap_err();
        assert!(matches!(&errs[0], ResolveError::UndefinedFunction { name, .. } if name == "nope"));
    }

    #[test]
    fn test_imports_and_builtins_resolve() {
        let table = resolve_src("import(fetch, net.http, 1)\nfn main() { print(fetch(\"x\")) }").unwrap();
        assert_eq!(table.foreign["fetch"].module, "net.http");
        assert_eq!(table.foreign["print"].module, BUILTIN_MODULE);
    }

    #[test]
    fn test_duplicates() {
        let errs = resolve_src("fn a() { 1 }\nfn a() { 2 }").unwrap_err();
        assert!(matches!(&errs[0], ResolveError::Duplicate { name, line: 2 } if name == "a"));
        let errs = resolve_src("import(a, m)\nfn a() { 1 }").unwrap_err();
        assert!(matches!(&errs[0], ResolveError::Duplicate { .. }));
        let errs = resolve_src("fn f(x, x) { x }").unwrap_err();
        assert!(matches!(&errs[0], ResolveError::DuplicateParam { .. }));
    }

    #[test]
    fn test_discard_local_is_not_readable() {
        assert!(resolve_src("fn main() { _ = 1; _ }").is_err());
    }

    #[test]
    fn test_local_shadows_function() {
        let table = resolve_src("fn add(x) { x }\nfn main(add) { add }").unwrap();
        let mut scope = Scope::default();
        scope.bind("add");
        assert_eq!(table.lookup("add", &scope), Some(NameRef::Local));
    }
}
