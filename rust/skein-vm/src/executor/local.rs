//! In-process executor: one named OS thread per skein thread.

use super::{await_error, internal_failure, ledger_status, ledger_wait, settle, Executor, ExecutorContext, ExecutorError};
use crate::vm::{entry_continuation, AwaitOutcome, Machine, ThreadHost, VmError};
use skein_core::{Settlement, ThreadFailure, ThreadId, ThreadStatus, Value};
use skein_runtime::{Continuation, Ledger, WaitOutcome};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Runs every thread on its own OS thread. `AWAIT` on a pending thread
/// blocks in place on the ledger's condvar until the target settles.
pub struct LocalExecutor {
    ctx: Arc<ExecutorContext>,
}

impl LocalExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        LocalExecutor { ctx: Arc::new(ctx) }
    }
}

fn spawn_thread(
    ctx: &Arc<ExecutorContext>,
    parent: Option<ThreadId>,
    function: &str,
    args: Vec<Value>,
) -> Result<ThreadId, ExecutorError> {
    let id = ctx.ledger.next_thread_id();
    let cont = entry_continuation(&ctx.program, id, function, args)?;
    ctx.ledger.create_child(id, parent)?;
    tracing::debug!(thread = %id, function, "spawn");

    let worker = Arc::clone(ctx);
    let started = thread::Builder::new()
        .name(format!("skein-{}", id.as_u64()))
        .spawn(move || run_thread(&worker, cont));
    if let Err(e) = started {
        settle(ctx.ledger.as_ref(), id, internal_failure(id, &e))?;
        return Err(ExecutorError::Spawn(e));
    }
    Ok(id)
}

fn run_thread(ctx: &Arc<ExecutorContext>, mut cont: Continuation) {
    let id = cont.thread;
    let machine = Machine::new(&ctx.program, ctx.capability.as_ref(), ctx.tracer.as_ref());
    let host = LocalHost { ctx };
    let settlement = machine
        .run(&mut cont, &host)
        .into_settlement()
        .unwrap_or_else(|| internal_failure(id, "local thread suspended"));
    if let Err(e) = settle(ctx.ledger.as_ref(), id, settlement) {
        tracing::error!(thread = %id, error = %e, "cannot settle thread");
    }
}

struct LocalHost<'a> {
    ctx: &'a Arc<ExecutorContext>,
}

impl ThreadHost for LocalHost<'_> {
    fn spawn(&self, parent: ThreadId, function: &str, args: Vec<Value>) -> Result<ThreadId, VmError> {
        tracing::trace!(parent = %parent, function, "async call");
        spawn_thread(self.ctx, Some(parent), function, args).map_err(|e| match e {
            ExecutorError::Vm(vm) => vm,
            other => VmError::Host(other.to_string()),
        })
    }

    fn await_thread(&self, waiter: ThreadId, target: ThreadId) -> Result<AwaitOutcome, VmError> {
        let ledger = self.ctx.ledger.as_ref();
        match ledger.get_or_wait(target, waiter).map_err(await_error)? {
            WaitOutcome::Settled(s) => Ok(AwaitOutcome::Ready(s)),
            WaitOutcome::Registered => {
                tracing::debug!(thread = %waiter, target = %target, "suspended");
                let settled = ledger.wait_settled(target, None).map_err(await_error)?;
                tracing::debug!(thread = %waiter, target = %target, "resumed");
                settled
                    .map(AwaitOutcome::Ready)
                    .ok_or_else(|| VmError::Internal(format!("{} woke before {} settled", waiter, target)))
            }
        }
    }
}

impl Executor for LocalExecutor {
    fn spawn(&self, function: &str, args: Vec<Value>) -> Result<ThreadId, ExecutorError> {
        spawn_thread(&self.ctx, None, function, args)
    }

    fn wait(&self, thread: ThreadId, timeout: Option<Duration>) -> Result<Settlement, ExecutorError> {
        ledger_wait(self.ctx.ledger.as_ref(), thread, timeout)
    }

    fn status(&self, thread: ThreadId) -> Result<ThreadStatus, ExecutorError> {
        ledger_status(self.ctx.ledger.as_ref(), thread)
    }

    fn force_fail(&self, thread: ThreadId, failure: ThreadFailure) -> Result<Vec<ThreadId>, ExecutorError> {
        let waiters = self.ctx.ledger.settle(thread, Settlement::Failed(failure))?;
        tracing::warn!(thread = %thread, waiters = waiters.len(), "thread force-failed");
        Ok(waiters)
    }

    fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ctx.ledger
    }
}
