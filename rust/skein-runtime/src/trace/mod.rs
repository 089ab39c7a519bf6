//! Instruction tracing.
//!
//! The VM reports one [`TraceEvent`] per instruction to a [`TraceSink`].
//! [`TraceLog`] keeps the events per thread and merges them into a single
//! timeline; [`TraceStore`] exports a merged timeline as a hash-chained
//! JSONL file.

pub mod events;
pub mod hasher;
pub mod log;
pub mod store;

pub use events::{TraceEvent, TraceRecord, TraceRecordKind};
pub use log::{NoTrace, TraceLog, TraceSink};
pub use store::{read_trace, verify_chain, TraceStore, TraceStoreError};
