//! Executors: create, suspend and resume threads.
//!
//! Both implementations share one contract and one ledger discipline; they
//! differ only in what suspension means. [`LocalExecutor`] parks an OS
//! thread on the ledger's condvar. [`DistributedExecutor`] persists the
//! continuation, ends the invocation, and relies on the settling thread to
//! trigger a fresh one.

mod distributed;
mod local;

pub use distributed::DistributedExecutor;
pub use local::LocalExecutor;

use crate::foreign::Capability;
use crate::vm::VmError;
use skein_compiler::Program;
use skein_core::{ErrorKind, Settlement, ThreadFailure, ThreadId, ThreadStatus, Value};
use skein_runtime::{ChainOutcome, FutureState, Ledger, LedgerError, StoreError, TraceSink, TriggerError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("continuation store error: {0}")]
    Store(#[from] StoreError),
    #[error("trigger error: {0}")]
    Trigger(#[from] TriggerError),
    #[error("cannot start thread: {0}")]
    Vm(#[from] VmError),
    #[error("failed to spawn OS thread: {0}")]
    Spawn(std::io::Error),
    #[error("timed out waiting for {0}")]
    Timeout(ThreadId),
}

/// Contract shared by every executor.
pub trait Executor: Send + Sync {
    /// Start `function(args)` as a new thread and return without waiting.
    fn spawn(&self, function: &str, args: Vec<Value>) -> Result<ThreadId, ExecutorError>;

    /// Block the calling OS thread until `thread` settles.
    fn wait(&self, thread: ThreadId, timeout: Option<Duration>) -> Result<Settlement, ExecutorError>;

    fn status(&self, thread: ThreadId) -> Result<ThreadStatus, ExecutorError>;

    /// Settle a pending thread as failed from outside and release its
    /// waiters. Returns the waiters that were released.
    fn force_fail(&self, thread: ThreadId, failure: ThreadFailure) -> Result<Vec<ThreadId>, ExecutorError>;

    fn ledger(&self) -> &Arc<dyn Ledger>;
}

/// Collaborators every executor runs threads with.
#[derive(Clone)]
pub struct ExecutorContext {
    pub program: Arc<Program>,
    pub capability: Arc<dyn Capability>,
    pub tracer: Arc<dyn TraceSink>,
    pub ledger: Arc<dyn Ledger>,
}

impl ExecutorContext {
    pub fn new(
        program: Arc<Program>,
        capability: Arc<dyn Capability>,
        tracer: Arc<dyn TraceSink>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        ExecutorContext { program, capability, tracer, ledger }
    }
}

pub(crate) fn ledger_status(ledger: &dyn Ledger, thread: ThreadId) -> Result<ThreadStatus, ExecutorError> {
    let status = match ledger.get(thread)?.state {
        FutureState::Resolved(_) => ThreadStatus::Resolved,
        FutureState::Failed(_) => ThreadStatus::Failed,
        FutureState::Pending if ledger.awaiting(thread).is_some() => ThreadStatus::Suspended,
        FutureState::Pending => ThreadStatus::Running,
    };
    Ok(status)
}

pub(crate) fn ledger_wait(
    ledger: &dyn Ledger,
    thread: ThreadId,
    timeout: Option<Duration>,
) -> Result<Settlement, ExecutorError> {
    ledger.wait_settled(thread, timeout)?.ok_or(ExecutorError::Timeout(thread))
}

/// Settle `thread` and return its drained waiters.
///
/// A thread that finished with another thread as its value is chained on
/// that thread instead, and nothing is drained until it settles. A record
/// that was already settled (a forced failure raced the thread's own
/// finish) keeps its first outcome; the late result is dropped.
pub(crate) fn settle(ledger: &dyn Ledger, thread: ThreadId, settlement: Settlement) -> Result<Vec<ThreadId>, LedgerError> {
    let settlement = match settlement {
        Settlement::Resolved(Value::Thread(inner)) => match ledger.chain(thread, inner) {
            Ok(ChainOutcome::Chained) => {
                tracing::debug!(thread = %thread, target = %inner, "result chained");
                return Ok(Vec::new());
            }
            Ok(ChainOutcome::Settled(s)) => s,
            Err(LedgerError::AlreadySettled(_)) => {
                tracing::debug!(thread = %thread, "late settlement dropped");
                return Ok(Vec::new());
            }
            Err(e @ LedgerError::Deadlock { .. }) => Settlement::Failed(await_error(e).into_failure(thread)),
            Err(e) => return Err(e),
        },
        other => other,
    };
    match &settlement {
        Settlement::Resolved(v) => tracing::debug!(thread = %thread, value = %v, "thread resolved"),
        Settlement::Failed(f) => tracing::warn!(thread = %thread, failure = %f, "thread failed"),
    }
    match ledger.settle(thread, settlement) {
        Ok(waiters) => Ok(waiters),
        Err(LedgerError::AlreadySettled(_)) => {
            tracing::debug!(thread = %thread, "late settlement dropped");
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

/// Failure for a thread that could not be started or resumed.
pub(crate) fn internal_failure(thread: ThreadId, message: impl std::fmt::Display) -> Settlement {
    Settlement::Failed(ThreadFailure::new(thread, ErrorKind::Internal, message.to_string()))
}

/// Map a ledger refusal at `AWAIT` onto the VM error that fails the waiter.
pub(crate) fn await_error(err: LedgerError) -> VmError {
    match err {
        LedgerError::Deadlock { waiter, target } => VmError::Deadlock { waiter, target },
        other => VmError::Host(other.to_string()),
    }
}
