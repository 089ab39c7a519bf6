//! Thread identity, lifecycle status, and failure records.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::values::Value;

// ---------------------------------------------------------------------------
// ThreadId
// ---------------------------------------------------------------------------

/// Identifier of one Skein thread (a unit of bytecode execution, not an OS
/// thread). Ids are minted by the ledger so that they are unique across
/// every process sharing it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(u64);

impl ThreadId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Return the raw numeric value (useful for logging and file names).
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({})", self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ThreadStatus
// ---------------------------------------------------------------------------

/// The lifecycle state of a thread.
///
/// `Running -> Suspended -> Running -> Resolved | Failed`. Spawning enters
/// `Running`; the two terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadStatus {
    Running,
    /// Blocked (local) or persisted (distributed) on an `await`.
    Suspended,
    Resolved,
    Failed,
}

impl ThreadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ThreadStatus::Resolved | ThreadStatus::Failed)
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreadStatus::Running => "running",
            ThreadStatus::Suspended => "suspended",
            ThreadStatus::Resolved => "resolved",
            ThreadStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Runtime error taxonomy carried by a failed thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    TypeError,
    ArithmeticError,
    ForeignCallError,
    StackOverflow,
    Deadlock,
    /// An invariant the compiler should have guaranteed did not hold.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ArithmeticError => "ArithmeticError",
            ErrorKind::ForeignCallError => "ForeignCallError",
            ErrorKind::StackOverflow => "StackOverflow",
            ErrorKind::Deadlock => "Deadlock",
            ErrorKind::Internal => "InternalError",
        };
        write!(f, "{}", s)
    }
}

/// The error attached to a Failed ledger record.
///
/// `origin` is the thread where the error was first raised. A thread that
/// fails because it awaited a failed thread keeps the original `origin`, so
/// the whole await chain names the same source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadFailure {
    pub origin: ThreadId,
    pub kind: ErrorKind,
    pub message: String,
}

impl ThreadFailure {
    pub fn new(origin: ThreadId, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            origin,
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ThreadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}: {}", self.kind, self.origin, self.message)
    }
}

/// The terminal outcome of a thread, as stored in the ledger and delivered
/// to resumed waiters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Settlement {
    Resolved(Value),
    Failed(ThreadFailure),
}

impl Settlement {
    pub fn status(&self) -> ThreadStatus {
        match self {
            Settlement::Resolved(_) => ThreadStatus::Resolved,
            Settlement::Failed(_) => ThreadStatus::Failed,
        }
    }

    pub fn into_result(self) -> Result<Value, ThreadFailure> {
        match self {
            Settlement::Resolved(v) => Ok(v),
            Settlement::Failed(f) => Err(f),
        }
    }
}
