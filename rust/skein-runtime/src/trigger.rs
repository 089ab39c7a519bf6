//! Invocation trigger for the distributed executor.
//!
//! Every start or resume of a thread under the distributed executor is an
//! [`Invocation`] message. Messages travel as JSON text so that nothing but
//! the thread id and the delivered settlement crosses the boundary; the
//! receiving side rebuilds everything else from the ledger and the
//! continuation store.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use skein_core::{Settlement, ThreadId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("invocation encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("trigger channel closed")]
    Closed,
}

/// One start-or-resume message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub thread: ThreadId,
    /// `None` starts the thread from its entry continuation; `Some` resumes
    /// a suspended continuation with the awaited outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<Settlement>,
}

impl Invocation {
    pub fn start(thread: ThreadId) -> Self {
        Invocation { thread, resume: None }
    }

    pub fn resume(thread: ThreadId, settlement: Settlement) -> Self {
        Invocation { thread, resume: Some(settlement) }
    }

    pub fn encode(&self) -> Result<String, TriggerError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, TriggerError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Issues fresh invocations.
pub trait Trigger: Send + Sync {
    fn fire(&self, invocation: Invocation) -> Result<(), TriggerError>;
}

/// In-process trigger backed by a crossbeam channel.
pub struct ChannelTrigger {
    tx: Sender<String>,
    fired: AtomicU64,
}

impl ChannelTrigger {
    /// Total invocations fired so far.
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }
}

impl Trigger for ChannelTrigger {
    fn fire(&self, invocation: Invocation) -> Result<(), TriggerError> {
        let text = invocation.encode()?;
        self.tx.send(text).map_err(|_| TriggerError::Closed)?;
        self.fired.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(thread = %invocation.thread, resume = invocation.resume.is_some(), "invocation fired");
        Ok(())
    }
}

/// Receiving end; clone it once per worker.
#[derive(Clone)]
pub struct InvocationQueue {
    rx: Receiver<String>,
}

impl InvocationQueue {
    pub fn recv(&self) -> Result<Invocation, TriggerError> {
        let text = self.rx.recv().map_err(|_| TriggerError::Closed)?;
        Invocation::decode(&text)
    }

    /// Wait up to `timeout`; `Ok(None)` when nothing arrived in time.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Invocation>, TriggerError> {
        match self.rx.recv_timeout(timeout) {
            Ok(text) => Ok(Some(Invocation::decode(&text)?)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TriggerError::Closed),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create a connected trigger/queue pair.
pub fn channel() -> (ChannelTrigger, InvocationQueue) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (ChannelTrigger { tx, fired: AtomicU64::new(0) }, InvocationQueue { rx })
}
