//! Persist-and-trigger executor.
//!
//! Nothing about a thread lives in worker memory between invocations. A
//! start or resume is an [`Invocation`] that loads the thread's continuation
//! from the store, runs it until it finishes or suspends, and then either
//! settles the ledger record (triggering a resume for every drained waiter)
//! or leaves the persisted continuation behind for a later resume.

use super::{await_error, internal_failure, ledger_status, ledger_wait, settle, Executor, ExecutorContext, ExecutorError};
use crate::vm::{entry_continuation, AwaitOutcome, Machine, RunOutcome, ThreadHost, VmError};
use skein_core::{Settlement, ThreadFailure, ThreadId, ThreadStatus, Value};
use skein_runtime::{
    Checkpointer, Invocation, InvocationQueue, Ledger, LedgerError, StoreError, Trigger, WaitOutcome,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

struct Inner {
    ctx: ExecutorContext,
    checkpointer: Checkpointer,
    trigger: Arc<dyn Trigger>,
}

pub struct DistributedExecutor {
    inner: Arc<Inner>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl DistributedExecutor {
    /// Executor with an in-process channel trigger and `workers` invoker
    /// threads.
    pub fn new(ctx: ExecutorContext, checkpointer: Checkpointer, workers: usize) -> Result<Self, ExecutorError> {
        let (trigger, queue) = skein_runtime::channel();
        Self::with_trigger(ctx, checkpointer, Arc::new(trigger), Some((queue, workers)))
    }

    /// Executor over an external trigger. With `pool` set, invocations from
    /// the queue are handled by that many worker threads; without it the
    /// caller delivers invocations through [`DistributedExecutor::handle`].
    pub fn with_trigger(
        ctx: ExecutorContext,
        checkpointer: Checkpointer,
        trigger: Arc<dyn Trigger>,
        pool: Option<(InvocationQueue, usize)>,
    ) -> Result<Self, ExecutorError> {
        let inner = Arc::new(Inner { ctx, checkpointer, trigger });
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();
        if let Some((queue, count)) = pool {
            for n in 0..count.max(1) {
                let inner = Arc::clone(&inner);
                let queue = queue.clone();
                let shutdown = Arc::clone(&shutdown);
                let handle = thread::Builder::new()
                    .name(format!("skein-invoker-{}", n))
                    .spawn(move || worker_loop(&inner, &queue, &shutdown))
                    .map_err(ExecutorError::Spawn)?;
                workers.push(handle);
            }
        }
        Ok(DistributedExecutor { inner, shutdown, workers })
    }

    /// Process one invocation on the calling OS thread.
    pub fn handle(&self, invocation: Invocation) -> Result<(), ExecutorError> {
        self.inner.invoke(invocation)
    }

    pub fn checkpointer(&self) -> &Checkpointer {
        &self.inner.checkpointer
    }
}

impl Drop for DistributedExecutor {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: &Inner, queue: &InvocationQueue, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Acquire) {
        match queue.recv_timeout(POLL_INTERVAL) {
            Ok(Some(invocation)) => {
                let thread = invocation.thread;
                if let Err(e) = inner.invoke(invocation) {
                    tracing::error!(thread = %thread, error = %e, "invocation failed");
                    inner.abandon(thread, &e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(error = %e, "invoker stopping");
                break;
            }
        }
    }
}

impl Inner {
    fn spawn_thread(
        &self,
        parent: Option<ThreadId>,
        function: &str,
        args: Vec<Value>,
    ) -> Result<ThreadId, ExecutorError> {
        let id = self.ctx.ledger.next_thread_id();
        let cont = entry_continuation(&self.ctx.program, id, function, args)?;
        self.ctx.ledger.create_child(id, parent)?;
        tracing::debug!(thread = %id, function, "spawn");
        if let Err(e) = self.checkpointer.persist(&cont).map_err(ExecutorError::from).and_then(|_| {
            self.trigger.fire(Invocation::start(id)).map_err(ExecutorError::from)
        }) {
            self.abandon(id, &e);
            return Err(e);
        }
        Ok(id)
    }

    /// Run one start or resume to its next stopping point.
    fn invoke(&self, invocation: Invocation) -> Result<(), ExecutorError> {
        let thread = invocation.thread;
        if !self.ctx.ledger.get(thread)?.state.is_pending() {
            tracing::debug!(thread = %thread, "stale invocation for settled thread");
            return self.discard(thread);
        }
        let mut cont = self.checkpointer.restore(thread)?;
        match invocation.resume {
            Some(settlement) => {
                tracing::debug!(thread = %thread, "resumed");
                cont.deliver(settlement);
            }
            None => tracing::trace!(thread = %thread, "started"),
        }

        let machine = Machine::new(&self.ctx.program, self.ctx.capability.as_ref(), self.ctx.tracer.as_ref());
        let host = DistributedHost { inner: self };
        loop {
            let target = match machine.run(&mut cont, &host) {
                RunOutcome::Suspended(target) => target,
                outcome => {
                    let settlement = outcome
                        .into_settlement()
                        .unwrap_or_else(|| internal_failure(thread, "no settlement"));
                    return self.complete(thread, settlement);
                }
            };
            // The continuation must be durable before anyone can be told
            // to resume it.
            self.checkpointer.persist(&cont)?;
            match self.ctx.ledger.get_or_wait(target, thread) {
                Ok(WaitOutcome::Registered) => {
                    tracing::debug!(thread = %thread, target = %target, "suspended");
                    // Force-failed while running: nothing will resume it.
                    if !self.ctx.ledger.get(thread)?.state.is_pending() {
                        return self.discard(thread);
                    }
                    return Ok(());
                }
                Ok(WaitOutcome::Settled(settlement)) => cont.deliver(settlement),
                Err(e @ LedgerError::Deadlock { .. }) => {
                    let failure = await_error(e).into_failure(thread);
                    return self.complete(thread, Settlement::Failed(failure));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Settle, resume every drained waiter, then drop the continuation.
    fn complete(&self, thread: ThreadId, settlement: Settlement) -> Result<(), ExecutorError> {
        let waiters = settle(self.ctx.ledger.as_ref(), thread, settlement)?;
        if !waiters.is_empty() {
            // Chaining may have replaced the outcome; waiters get the stored one.
            let settled = self.ctx.ledger.get(thread)?.state.settlement();
            let settled = settled.unwrap_or_else(|| internal_failure(thread, "drained waiters while pending"));
            self.release(&waiters, &settled)?;
        }
        self.discard(thread)
    }

    fn discard(&self, thread: ThreadId) -> Result<(), ExecutorError> {
        match self.checkpointer.discard(thread) {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn release(&self, waiters: &[ThreadId], settlement: &Settlement) -> Result<(), ExecutorError> {
        for waiter in waiters {
            self.trigger.fire(Invocation::resume(*waiter, settlement.clone()))?;
        }
        Ok(())
    }

    /// Fail a thread whose invocation could not run, so that its awaiters
    /// are not stranded.
    fn abandon(&self, thread: ThreadId, error: &ExecutorError) {
        if let Err(e) = self.complete(thread, internal_failure(thread, error)) {
            tracing::error!(thread = %thread, error = %e, "cannot settle abandoned thread");
        }
    }
}

struct DistributedHost<'a> {
    inner: &'a Inner,
}

impl ThreadHost for DistributedHost<'_> {
    fn spawn(&self, parent: ThreadId, function: &str, args: Vec<Value>) -> Result<ThreadId, VmError> {
        tracing::trace!(parent = %parent, function, "async call");
        self.inner.spawn_thread(Some(parent), function, args).map_err(|e| match e {
            ExecutorError::Vm(vm) => vm,
            other => VmError::Host(other.to_string()),
        })
    }

    fn await_thread(&self, _waiter: ThreadId, target: ThreadId) -> Result<AwaitOutcome, VmError> {
        let record = self.inner.ctx.ledger.get(target).map_err(await_error)?;
        Ok(match record.state.settlement() {
            Some(settlement) => AwaitOutcome::Ready(settlement),
            None => AwaitOutcome::Suspend,
        })
    }
}

impl Executor for DistributedExecutor {
    fn spawn(&self, function: &str, args: Vec<Value>) -> Result<ThreadId, ExecutorError> {
        self.inner.spawn_thread(None, function, args)
    }

    fn wait(&self, thread: ThreadId, timeout: Option<Duration>) -> Result<Settlement, ExecutorError> {
        ledger_wait(self.inner.ctx.ledger.as_ref(), thread, timeout)
    }

    fn status(&self, thread: ThreadId) -> Result<ThreadStatus, ExecutorError> {
        ledger_status(self.inner.ctx.ledger.as_ref(), thread)
    }

    fn force_fail(&self, thread: ThreadId, failure: ThreadFailure) -> Result<Vec<ThreadId>, ExecutorError> {
        let settlement = Settlement::Failed(failure);
        let waiters = self.inner.ctx.ledger.settle(thread, settlement.clone())?;
        tracing::warn!(thread = %thread, waiters = waiters.len(), "thread force-failed");
        self.inner.release(&waiters, &settlement)?;
        self.inner.discard(thread)?;
        Ok(waiters)
    }

    fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.inner.ctx.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreign::{Builtins, FnCapability, NoForeign};
    use skein_core::ErrorKind;
    use skein_runtime::{ChannelTrigger, MemoryContinuationStore, MemoryLedger, NoTrace};

    fn context(src: &str) -> ExecutorContext {
        let program = skein_compiler::compile(src).unwrap();
        ExecutorContext::new(
            Arc::new(program),
            Arc::new(Builtins::new(Arc::new(NoForeign))),
            Arc::new(NoTrace),
            Arc::new(MemoryLedger::new()),
        )
    }

    fn checkpointer() -> Checkpointer {
        Checkpointer::new(Arc::new(MemoryContinuationStore::new()))
    }

    /// Executor without workers; the test pumps the queue by hand.
    fn manual(src: &str) -> (DistributedExecutor, Arc<ChannelTrigger>, InvocationQueue) {
        let (trigger, queue) = skein_runtime::channel();
        let trigger = Arc::new(trigger);
        let exec = DistributedExecutor::with_trigger(context(src), checkpointer(), trigger.clone(), None).unwrap();
        (exec, trigger, queue)
    }

    fn pump(exec: &DistributedExecutor, queue: &InvocationQueue) -> usize {
        let mut handled = 0;
        while let Ok(Some(inv)) = queue.recv_timeout(Duration::from_millis(0)) {
            exec.handle(inv).unwrap();
            handled += 1;
        }
        handled
    }

    #[test]
    fn suspend_persists_then_resume_finishes() {
        let (exec, trigger, queue) = manual("fn add(x, y) { x + y }\nfn main() { x = async add(2, 3); await x }");
        let main = exec.spawn("main", vec![]).unwrap();
        assert_eq!(exec.checkpointer().stored().unwrap(), vec![main]);

        // Start main: it spawns add and suspends on it.
        let inv = queue.recv().unwrap();
        exec.handle(inv).unwrap();
        assert_eq!(exec.status(main).unwrap(), ThreadStatus::Suspended);
        let stored = exec.checkpointer().restore(main).unwrap();
        assert_eq!(stored.pending_await, Some(ThreadId::new(1)));

        // Start add; finishing it fires a resume for main.
        let inv = queue.recv().unwrap();
        assert_eq!(inv, Invocation::start(ThreadId::new(1)));
        exec.handle(inv).unwrap();
        let resume = queue.recv().unwrap();
        assert_eq!(resume, Invocation::resume(main, Settlement::Resolved(Value::Int(5))));
        exec.handle(resume).unwrap();

        assert_eq!(exec.wait(main, Some(Duration::from_secs(1))).unwrap(), Settlement::Resolved(Value::Int(5)));
        assert!(exec.checkpointer().stored().unwrap().is_empty());
        assert_eq!(trigger.fired(), 3);
    }

    #[test]
    fn await_on_settled_thread_does_not_suspend() {
        let (exec, trigger, queue) =
            manual("fn one() { 1 }\nfn main() { t = async one(); w = async one(); await w; await t }");
        let main = exec.spawn("main", vec![]).unwrap();
        // main suspends on w; t has settled by the time main resumes.
        let start_main = queue.recv().unwrap();
        exec.handle(start_main).unwrap();
        pump(&exec, &queue);
        assert_eq!(exec.wait(main, Some(Duration::from_secs(1))).unwrap(), Settlement::Resolved(Value::Int(1)));
        // main start, two child starts, at most one resume.
        assert!(trigger.fired() <= 4);
    }

    #[test]
    fn stale_resume_is_ignored() {
        let (exec, _trigger, queue) = manual("fn main() { 7 }");
        let main = exec.spawn("main", vec![]).unwrap();
        pump(&exec, &queue);
        exec.handle(Invocation::resume(main, Settlement::Resolved(Value::Null))).unwrap();
        assert_eq!(exec.wait(main, None).unwrap(), Settlement::Resolved(Value::Int(7)));
    }

    #[test]
    fn stale_invocation_drops_a_leftover_continuation() {
        let (exec, _trigger, queue) = manual("fn main() { 7 }");
        let main = exec.spawn("main", vec![]).unwrap();
        exec.ledger().settle(main, Settlement::Resolved(Value::Null)).unwrap();
        assert_eq!(exec.checkpointer().stored().unwrap(), vec![main]);
        assert_eq!(pump(&exec, &queue), 1);
        assert!(exec.checkpointer().stored().unwrap().is_empty());
    }

    #[test]
    fn failed_mid_run_then_suspending_keeps_nothing_stored() {
        // `halt` settles main from outside while it runs, like a racing force_fail.
        let ledger = Arc::new(MemoryLedger::new());
        let outside = Arc::clone(&ledger);
        let caps = FnCapability::new().with("ops.halt", move |_| {
            let main = ThreadId::new(0);
            let failure = ThreadFailure::new(main, ErrorKind::Internal, "forced failure: halt");
            outside.settle(main, Settlement::Failed(failure)).map(|_| Value::Null).map_err(|e| e.to_string())
        });
        let program = skein_compiler::compile("import(halt, ops, 0);\nfn main(t) { halt(); await t }").unwrap();
        let ctx = ExecutorContext::new(
            Arc::new(program),
            Arc::new(Builtins::new(Arc::new(caps))),
            Arc::new(NoTrace),
            ledger.clone(),
        );
        let (trigger, queue) = skein_runtime::channel();
        let exec = DistributedExecutor::with_trigger(ctx, checkpointer(), Arc::new(trigger), None).unwrap();

        let never = ThreadId::new(1);
        let main = exec.spawn("main", vec![Value::Thread(never)]).unwrap();
        ledger.create(never).unwrap();
        exec.handle(queue.recv().unwrap()).unwrap();

        assert_eq!(exec.status(main).unwrap(), ThreadStatus::Failed);
        assert!(exec.checkpointer().stored().unwrap().is_empty());
    }

    #[test]
    fn chained_result_resumes_the_outer_waiter() {
        let (exec, _trigger, queue) =
            manual("fn inner() { 5 }\nfn outer() { async inner() }\nfn main() { await async outer() }");
        let main = exec.spawn("main", vec![]).unwrap();
        pump(&exec, &queue);
        assert_eq!(exec.wait(main, Some(Duration::from_secs(1))).unwrap(), Settlement::Resolved(Value::Int(5)));
        assert_eq!(exec.status(ThreadId::new(1)).unwrap(), ThreadStatus::Resolved);
        assert!(exec.checkpointer().stored().unwrap().is_empty());
    }

    #[test]
    fn missing_continuation_is_an_error() {
        let (exec, _trigger, _queue) = manual("fn main() { 7 }");
        let ghost = exec.ledger().next_thread_id();
        exec.ledger().create(ghost).unwrap();
        assert!(matches!(exec.handle(Invocation::start(ghost)), Err(ExecutorError::Store(StoreError::NotFound(_)))));
    }

    #[test]
    fn worker_pool_runs_to_completion() {
        let exec = DistributedExecutor::new(
            context("fn add(x, y) { x + y }\nfn main() { x = async add(2, 3); await x }"),
            checkpointer(),
            2,
        )
        .unwrap();
        let main = exec.spawn("main", vec![]).unwrap();
        assert_eq!(exec.wait(main, Some(Duration::from_secs(10))).unwrap(), Settlement::Resolved(Value::Int(5)));
    }
}
