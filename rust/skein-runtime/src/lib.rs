//! Skein Runtime
//!
//! Coordination infrastructure shared by the executors: the future ledger,
//! persisted continuations and their stores, the invocation trigger, and
//! the instruction tracer.

pub mod continuation;
pub mod ledger;
pub mod store;
pub mod trace;
pub mod trigger;

pub use continuation::{Continuation, ContinuationError, Frame, CONTINUATION_VERSION};
pub use ledger::{ChainOutcome, FutureRecord, FutureState, Ledger, LedgerError, MemoryLedger, WaitOutcome};
pub use store::{Checkpointer, ContinuationStore, FileContinuationStore, MemoryContinuationStore, StoreError};
pub use trigger::{channel, ChannelTrigger, Invocation, InvocationQueue, Trigger, TriggerError};
pub use trace::{
    read_trace, verify_chain, NoTrace, TraceEvent, TraceLog, TraceRecord, TraceRecordKind, TraceSink,
    TraceStore, TraceStoreError,
};
