//! Trace event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skein_core::ThreadId;

/// One executed instruction, recorded just before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub thread: ThreadId,
    /// Per-thread sequence number, starting at 0.
    pub seq: u64,
    pub function: String,
    pub ip: usize,
    pub opcode: String,
    /// Call-stack depth, 1 for the entry frame.
    pub depth: usize,
    pub timestamp: DateTime<Utc>,
}

impl TraceEvent {
    /// Sort key of the merged timeline.
    pub fn order_key(&self) -> (DateTime<Utc>, ThreadId, u64) {
        (self.timestamp, self.thread, self.seq)
    }

    /// Timestamp-free identity, for comparing runs.
    pub fn signature(&self) -> String {
        format!("{}#{} {}@{} {} d{}", self.thread, self.seq, self.function, self.ip, self.opcode, self.depth)
    }
}

/// One line of an exported trace file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Line number within the file, starting at 1.
    pub seq: u64,
    pub kind: TraceRecordKind,
    pub session_id: String,
    pub prev_hash: String,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<TraceEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TraceRecord {
    /// Text the record's hash is computed over.
    pub fn digest_input(&self) -> String {
        let body = match (&self.event, &self.program_hash, &self.message) {
            (Some(ev), _, _) => ev.signature(),
            (None, Some(program), Some(run)) => format!("{}|{}", program, run),
            (None, Some(program), None) => program.clone(),
            (None, None, Some(message)) => message.clone(),
            (None, None, None) => String::new(),
        };
        format!("{}:{}:{}:{}:{}", self.seq, self.kind.as_str(), self.session_id, body, self.prev_hash)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TraceRecordKind {
    SessionStart,
    Step,
    SessionEnd,
}

impl TraceRecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TraceRecordKind::SessionStart => "session_start",
            TraceRecordKind::Step => "step",
            TraceRecordKind::SessionEnd => "session_end",
        }
    }
}
