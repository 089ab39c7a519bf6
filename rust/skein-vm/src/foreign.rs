//! The foreign-call boundary.
//!
//! Programs reach host code only through `FOREIGN_CALL`, which the VM hands
//! to a [`Capability`]. What sits behind a capability is opaque to the
//! runtime: a closure table, a sandboxed RPC client, or nothing at all.

use parking_lot::Mutex;
use skein_compiler::ForeignFn;
use skein_core::builtins::{self, BUILTIN_MODULE};
use skein_core::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ForeignError {
    #[error("no capability provides {0}")]
    Unknown(String),
    #[error("{target} expects {expected} arguments, got {found}")]
    Arity { target: String, expected: usize, found: usize },
    #[error("{target} failed: {message}")]
    Failed { target: String, message: String },
}

/// Injected implementation of foreign functions.
pub trait Capability: Send + Sync {
    fn invoke(&self, target: &ForeignFn, args: Vec<Value>) -> Result<Value, ForeignError>;
}

/// Rejects every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoForeign;

impl Capability for NoForeign {
    fn invoke(&self, target: &ForeignFn, _args: Vec<Value>) -> Result<Value, ForeignError> {
        Err(ForeignError::Unknown(target.qualified()))
    }
}

type HostFn = dyn Fn(Vec<Value>) -> Result<Value, String> + Send + Sync;

/// Closures keyed by `module.name`.
#[derive(Default)]
pub struct FnCapability {
    functions: HashMap<String, Box<HostFn>>,
}

impl FnCapability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, qualified: &str, f: F)
    where
        F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(qualified.to_string(), Box::new(f));
    }

    /// Builder form of [`FnCapability::register`].
    pub fn with<F>(mut self, qualified: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.register(qualified, f);
        self
    }
}

impl fmt::Debug for FnCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FnCapability").field("functions", &names).finish()
    }
}

impl Capability for FnCapability {
    fn invoke(&self, target: &ForeignFn, args: Vec<Value>) -> Result<Value, ForeignError> {
        let key = target.qualified();
        let f = self.functions.get(&key).ok_or_else(|| ForeignError::Unknown(key.clone()))?;
        f(args).map_err(|message| ForeignError::Failed { target: key, message })
    }
}

// ---------------------------------------------------------------------------
// Builtins
// ---------------------------------------------------------------------------

/// Lines written by `print`, shared between threads of one session.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    lines: Arc<Mutex<Vec<String>>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: String) {
        self.lines.lock().push(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

/// Serves the `builtin` module and forwards everything else to `inner`.
pub struct Builtins {
    inner: Arc<dyn Capability>,
    output: OutputBuffer,
}

impl Builtins {
    pub fn new(inner: Arc<dyn Capability>) -> Self {
        Self::with_output(inner, OutputBuffer::new())
    }

    pub fn with_output(inner: Arc<dyn Capability>, output: OutputBuffer) -> Self {
        Builtins { inner, output }
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    fn call_builtin(&self, name: &str, args: Vec<Value>) -> Result<Value, ForeignError> {
        let target = format!("{}.{}", BUILTIN_MODULE, name);
        let sig = builtins::lookup(name).ok_or_else(|| ForeignError::Unknown(target.clone()))?;
        if let Some(expected) = sig.arity {
            if expected != args.len() {
                return Err(ForeignError::Arity { target, expected, found: args.len() });
            }
        }
        let fail = |message: String| ForeignError::Failed { target: target.clone(), message };
        let mut args = args.into_iter();
        match name {
            "print" => {
                let line = args.map(|v| v.display_pretty()).collect::<Vec<_>>().join(" ");
                tracing::debug!(target: "skein::print", "{}", line);
                self.output.push(line);
                Ok(Value::Null)
            }
            "list" => Ok(Value::List(args.collect())),
            "str" => Ok(Value::Str(args.next().map(|v| v.display_pretty()).unwrap_or_default())),
            "len" => match args.next() {
                Some(Value::List(items)) => Ok(Value::Int(items.len() as i64)),
                Some(Value::Str(s)) => Ok(Value::Int(s.chars().count() as i64)),
                other => Err(fail(format!("len of {}", type_of(&other)))),
            },
            "append" => match (args.next(), args.next()) {
                (Some(Value::List(mut items)), Some(v)) => {
                    items.push(v);
                    Ok(Value::List(items))
                }
                (other, _) => Err(fail(format!("append to {}", type_of(&other)))),
            },
            "nth" => match (args.next(), args.next()) {
                (Some(Value::List(items)), Some(Value::Int(i))) => usize::try_from(i)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .ok_or_else(|| fail(format!("index {} out of range for list of length {}", i, items.len()))),
                (list, index) => Err(fail(format!("nth({}, {})", type_of(&list), type_of(&index)))),
            },
            "first" => match args.next() {
                Some(Value::List(items)) => Ok(items.into_iter().next().unwrap_or(Value::Null)),
                other => Err(fail(format!("first of {}", type_of(&other)))),
            },
            "rest" => match args.next() {
                Some(Value::List(items)) => Ok(Value::List(items.into_iter().skip(1).collect())),
                other => Err(fail(format!("rest of {}", type_of(&other)))),
            },
            _ => Err(ForeignError::Unknown(target.clone())),
        }
    }
}

fn type_of(v: &Option<Value>) -> &'static str {
    v.as_ref().map(Value::type_name).unwrap_or("nothing")
}

impl Capability for Builtins {
    fn invoke(&self, target: &ForeignFn, args: Vec<Value>) -> Result<Value, ForeignError> {
        if target.module == BUILTIN_MODULE {
            self.call_builtin(&target.name, args)
        } else {
            self.inner.invoke(target, args)
        }
    }
}
