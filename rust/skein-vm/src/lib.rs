//! Skein VM
//!
//! The bytecode interpreter, the foreign-call boundary, and the two
//! executors that schedule threads over it.

pub mod config;
pub mod executor;
pub mod foreign;
pub mod session;
pub mod vm;

pub use config::{ConfigError, ExecutorKind, RuntimeConfig};
pub use executor::{DistributedExecutor, Executor, ExecutorContext, ExecutorError, LocalExecutor};
pub use foreign::{Builtins, Capability, FnCapability, ForeignError, NoForeign, OutputBuffer};
pub use session::{RunReport, Session, SessionError};
pub use vm::{entry_continuation, AwaitOutcome, Machine, RunOutcome, ThreadHost, VmError, MAX_CALL_DEPTH};
