//! Sessions: one compiled program, one ledger, one executor.
//!
//! A [`Session`] wires the configured executor to a fresh ledger, a trace
//! log and the builtin capability layer, and runs top-level invocations
//! through it.

use crate::config::{ExecutorKind, RuntimeConfig};
use crate::executor::{DistributedExecutor, Executor, ExecutorContext, ExecutorError, LocalExecutor};
use crate::foreign::{Builtins, Capability, OutputBuffer};
use skein_compiler::{CompileError, Program};
use skein_core::{ErrorKind, Settlement, ThreadFailure, ThreadId, ThreadStatus, Value};
use skein_runtime::{
    Checkpointer, ContinuationStore, FileContinuationStore, Ledger, MemoryContinuationStore, MemoryLedger, NoTrace,
    StoreError, TraceEvent, TraceLog, TraceSink, TraceStore, TraceStoreError,
};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("continuation store error: {0}")]
    Store(#[from] StoreError),
    #[error("trace export failed: {0}")]
    Trace(#[from] TraceStoreError),
    #[error("{thread} did not settle within {timeout_ms}ms")]
    Timeout { thread: ThreadId, timeout_ms: u64 },
}

/// Outcome of one top-level invocation.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub session_id: String,
    pub entry: ThreadId,
    pub settlement: Settlement,
    /// Merged timeline of the entry thread and the threads it spawned,
    /// transitively.
    pub trace: Vec<TraceEvent>,
    /// Lines written by `print`.
    pub output: Vec<String>,
    /// JSONL export of `trace`, when a trace directory is configured. One
    /// file per run: `<session-id>.thread<N>.jsonl`.
    pub trace_file: Option<PathBuf>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        matches!(self.settlement, Settlement::Resolved(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.settlement {
            Settlement::Resolved(v) => Some(v),
            Settlement::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ThreadFailure> {
        match &self.settlement {
            Settlement::Resolved(_) => None,
            Settlement::Failed(f) => Some(f),
        }
    }

    /// Timestamp-free per-thread instruction sequence, for comparing runs.
    pub fn thread_trace(&self, thread: ThreadId) -> Vec<String> {
        self.trace.iter().filter(|e| e.thread == thread).map(TraceEvent::signature).collect()
    }
}

pub struct Session {
    id: String,
    program: Arc<Program>,
    config: RuntimeConfig,
    trace: Option<Arc<TraceLog>>,
    output: OutputBuffer,
    executor: Box<dyn Executor>,
}

impl Session {
    pub fn new(program: Program, config: RuntimeConfig, capability: Arc<dyn Capability>) -> Result<Self, SessionError> {
        let id = uuid::Uuid::new_v4().to_string();
        let program = Arc::new(program);
        let output = OutputBuffer::new();
        let trace = config.trace.enabled.then(|| Arc::new(TraceLog::new()));
        let tracer: Arc<dyn TraceSink> = match &trace {
            Some(log) => log.clone(),
            None => Arc::new(NoTrace),
        };
        let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
        let ctx = ExecutorContext::new(
            Arc::clone(&program),
            Arc::new(Builtins::with_output(capability, output.clone())),
            tracer,
            ledger,
        );

        let executor: Box<dyn Executor> = match config.executor.kind {
            ExecutorKind::Local => Box::new(LocalExecutor::new(ctx)),
            ExecutorKind::Distributed => {
                let store: Arc<dyn ContinuationStore> = match &config.continuations.dir {
                    Some(dir) => Arc::new(FileContinuationStore::new(dir.join(&id))?),
                    None => Arc::new(MemoryContinuationStore::new()),
                };
                let checkpointer = if config.continuations.compress {
                    Checkpointer::new_compressed(store)
                } else {
                    Checkpointer::new(store)
                };
                Box::new(DistributedExecutor::new(ctx, checkpointer, config.workers())?)
            }
        };
        tracing::info!(session = %id, executor = ?config.executor.kind, program = %program.source_hash, "session started");
        Ok(Session { id, program, config, trace, output, executor })
    }

    /// Compile `source` and open a session over it.
    pub fn from_source(
        source: &str,
        config: RuntimeConfig,
        capability: Arc<dyn Capability>,
    ) -> Result<Self, SessionError> {
        Self::new(skein_compiler::compile(source)?, config, capability)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        self.executor.ledger()
    }

    pub fn output(&self) -> Vec<String> {
        self.output.lines()
    }

    /// Merged timeline of every run so far; empty when tracing is off.
    pub fn trace(&self) -> Vec<TraceEvent> {
        self.trace.as_ref().map(|log| log.merged()).unwrap_or_default()
    }

    pub fn spawn(&self, function: &str, args: Vec<Value>) -> Result<ThreadId, SessionError> {
        Ok(self.executor.spawn(function, args)?)
    }

    pub fn status(&self, thread: ThreadId) -> Result<ThreadStatus, SessionError> {
        Ok(self.executor.status(thread)?)
    }

    /// Spawn `function(args)` as an entry thread and wait for it within
    /// the configured timeout.
    pub fn run(&self, function: &str, args: Vec<Value>) -> Result<RunReport, SessionError> {
        let entry = self.executor.spawn(function, args)?;
        let settlement = match self.executor.wait(entry, self.config.timeout()) {
            Ok(s) => s,
            Err(ExecutorError::Timeout(thread)) => {
                tracing::warn!(session = %self.id, thread = %thread, "run timed out");
                return Err(SessionError::Timeout { thread, timeout_ms: self.config.run.timeout_ms });
            }
            Err(e) => return Err(e.into()),
        };
        let trace = match &self.trace {
            Some(log) => log.merged_threads(&self.ledger().lineage(entry)),
            None => Vec::new(),
        };
        let trace_file = match &self.config.trace.dir {
            Some(dir) if self.trace.is_some() => {
                let mut store = TraceStore::new(dir)?;
                let run = format!("thread{}", entry.as_u64());
                Some(store.export_run(&self.id, &run, &self.program.source_hash, &trace, &summary(&settlement))?)
            }
            _ => None,
        };
        tracing::info!(session = %self.id, thread = %entry, outcome = %summary(&settlement), "run finished");
        Ok(RunReport { session_id: self.id.clone(), entry, settlement, trace, output: self.output(), trace_file })
    }

    /// Fail a pending thread from outside, releasing everything awaiting
    /// it. The hook for external timeouts.
    pub fn force_fail(&self, thread: ThreadId, message: &str) -> Result<Vec<ThreadId>, SessionError> {
        let failure = ThreadFailure::new(thread, ErrorKind::Internal, format!("forced failure: {}", message));
        Ok(self.executor.force_fail(thread, failure)?)
    }
}

fn summary(settlement: &Settlement) -> String {
    match settlement {
        Settlement::Resolved(v) => format!("resolved {}", v),
        Settlement::Failed(f) => format!("failed {}", f),
    }
}
