//! In-memory trace collection.

use crate::trace::events::TraceEvent;
use parking_lot::Mutex;
use skein_core::ThreadId;
use std::collections::BTreeMap;

/// Receives instruction events from the VM. Implementations must not
/// influence execution.
pub trait TraceSink: Send + Sync {
    fn record(&self, event: TraceEvent);

    /// When false the VM skips building events entirely.
    fn enabled(&self) -> bool {
        true
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTrace;

impl TraceSink for NoTrace {
    fn record(&self, _event: TraceEvent) {}

    fn enabled(&self) -> bool {
        false
    }
}

/// Append-only per-thread event lists.
#[derive(Debug, Default)]
pub struct TraceLog {
    threads: Mutex<BTreeMap<ThreadId, Vec<TraceEvent>>>,
}

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events of one thread in sequence order.
    pub fn thread(&self, id: ThreadId) -> Vec<TraceEvent> {
        self.threads.lock().get(&id).cloned().unwrap_or_default()
    }

    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All events ordered by timestamp, then thread id, then sequence.
    pub fn merged(&self) -> Vec<TraceEvent> {
        let mut all: Vec<TraceEvent> = self.threads.lock().values().flatten().cloned().collect();
        all.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        all
    }

    /// [`TraceLog::merged`] restricted to `threads`.
    pub fn merged_threads(&self, threads: &[ThreadId]) -> Vec<TraceEvent> {
        let log = self.threads.lock();
        let mut all: Vec<TraceEvent> =
            threads.iter().filter_map(|id| log.get(id)).flatten().cloned().collect();
        drop(log);
        all.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        all
    }
}

impl TraceSink for TraceLog {
    fn record(&self, event: TraceEvent) {
        self.threads.lock().entry(event.thread).or_default().push(event);
    }
}
