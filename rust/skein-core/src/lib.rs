//! Skein Core
//!
//! Shared types used across the compiler, VM, and runtime: values, thread
//! identity, failure records, and the builtin function table.

pub mod builtins;
pub mod thread;
pub mod values;

pub use thread::{ErrorKind, Settlement, ThreadFailure, ThreadId, ThreadStatus};
pub use values::Value;
