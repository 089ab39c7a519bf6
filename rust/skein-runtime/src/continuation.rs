//! Continuation format for suspended threads.
//!
//! A [`Continuation`] is a thread's entire call stack as plain data: every
//! frame with its instruction pointer, bound locals and operand stack. The
//! VM runs directly on this structure, so persisting a suspended thread is
//! just serializing it. The format is versioned and remembers the hash of
//! the program it was captured against.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use skein_core::{Settlement, ThreadId, Value};
use std::io::{Read, Write};

/// Current continuation format version. Bump on layout changes.
pub const CONTINUATION_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ContinuationError {
    #[error("serialization failed: {0}")]
    Serialize(String),
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One function activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub function: String,
    /// Index of the next instruction to execute.
    pub ip: usize,
    /// Bound locals in binding order.
    pub locals: Vec<(String, Value)>,
    /// This frame's segment of the operand stack.
    pub stack: Vec<Value>,
}

impl Frame {
    pub fn new(function: impl Into<String>, locals: Vec<(String, Value)>) -> Self {
        Self { function: function.into(), ip: 0, locals, stack: Vec::new() }
    }

    pub fn local(&self, name: &str) -> Option<&Value> {
        self.locals.iter().rev().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Bind or rebind a local.
    pub fn set_local(&mut self, name: &str, value: Value) {
        match self.locals.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.locals.push((name.to_string(), value)),
        }
    }
}

// ---------------------------------------------------------------------------
// Continuation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Continuation {
    pub version: u32,
    pub thread: ThreadId,
    pub program_hash: String,
    /// Call stack, innermost last.
    pub frames: Vec<Frame>,
    /// Target of the `AWAIT` this thread is suspended on.
    pub pending_await: Option<ThreadId>,
    /// Settlement delivered for `pending_await`, consumed on resume.
    pub inbox: Option<Settlement>,
    /// Next per-thread trace sequence number.
    pub trace_seq: u64,
}

impl Continuation {
    pub fn new(thread: ThreadId, program_hash: impl Into<String>, entry: Frame) -> Self {
        Self {
            version: CONTINUATION_VERSION,
            thread,
            program_hash: program_hash.into(),
            frames: vec![entry],
            pending_await: None,
            inbox: None,
            trace_seq: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_suspended(&self) -> bool {
        self.pending_await.is_some()
    }

    /// Hand the awaited thread's outcome to a suspended continuation.
    pub fn deliver(&mut self, settlement: Settlement) {
        self.inbox = Some(settlement);
    }

    /// Serialize to bincode.
    pub fn encode(&self) -> Result<Vec<u8>, ContinuationError> {
        bincode::serialize(self).map_err(|e| ContinuationError::Serialize(e.to_string()))
    }

    /// Deserialize from bincode, checking the version tag.
    pub fn decode(bytes: &[u8]) -> Result<Self, ContinuationError> {
        let cont: Continuation =
            bincode::deserialize(bytes).map_err(|e| ContinuationError::Deserialize(e.to_string()))?;
        if cont.version != CONTINUATION_VERSION {
            return Err(ContinuationError::VersionMismatch { expected: CONTINUATION_VERSION, found: cont.version });
        }
        Ok(cont)
    }

    /// Serialize and gzip-compress.
    pub fn encode_compressed(&self) -> Result<Vec<u8>, ContinuationError> {
        let raw = self.encode()?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        Ok(encoder.finish()?)
    }

    pub fn decode_compressed(bytes: &[u8]) -> Result<Self, ContinuationError> {
        let mut raw = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut raw)?;
        Self::decode(&raw)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
