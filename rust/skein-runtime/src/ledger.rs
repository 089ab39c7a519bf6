//! The future ledger: shared status and result of every thread.
//!
//! The ledger is the only cross-thread coordination point. A record is
//! created `Pending` when its thread is spawned and moves to `Resolved` or
//! `Failed` exactly once, through [`Ledger::settle`]. Registering a waiter
//! and settling run under the same lock, so a waiter either observes the
//! settled value or is handed back in the drained waiter list; it is never
//! dropped in between.
//!
//! A thread that finishes with another thread as its value does not settle
//! on that reference. Its record is chained on the inner thread instead and
//! settles with the inner thread's outcome.

use parking_lot::{Condvar, Mutex};
use skein_core::{Settlement, ThreadFailure, ThreadId, Value};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum FutureState {
    Pending,
    Resolved(Value),
    Failed(ThreadFailure),
}

impl FutureState {
    pub fn is_pending(&self) -> bool {
        matches!(self, FutureState::Pending)
    }

    pub fn settlement(&self) -> Option<Settlement> {
        match self {
            FutureState::Pending => None,
            FutureState::Resolved(v) => Some(Settlement::Resolved(v.clone())),
            FutureState::Failed(f) => Some(Settlement::Failed(f.clone())),
        }
    }
}

impl From<Settlement> for FutureState {
    fn from(s: Settlement) -> Self {
        match s {
            Settlement::Resolved(v) => FutureState::Resolved(v),
            Settlement::Failed(f) => FutureState::Failed(f),
        }
    }
}

/// Point-in-time copy of one ledger entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FutureRecord {
    pub thread: ThreadId,
    /// The thread whose `async` call created this one.
    pub parent: Option<ThreadId>,
    pub state: FutureState,
    pub waiters: Vec<ThreadId>,
    /// Records that settle when this one does, with the same outcome.
    pub chained: Vec<ThreadId>,
}

/// Result of [`Ledger::chain`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    /// The inner thread had already settled; settle with this instead.
    Settled(Settlement),
    /// The record now follows the inner thread.
    Chained,
}

/// Result of [`Ledger::get_or_wait`].
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// The target had already settled; no registration happened.
    Settled(Settlement),
    /// The waiter is now in the target's waiter list.
    Registered,
}

#[derive(Debug, Error, PartialEq)]
pub enum LedgerError {
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),
    #[error("ledger record for {0} already exists")]
    AlreadyExists(ThreadId),
    #[error("{0} is already settled")]
    AlreadySettled(ThreadId),
    #[error("{0} is still pending")]
    StillPending(ThreadId),
    #[error("{waiter} is already waiting on {target}")]
    AlreadyWaiting { waiter: ThreadId, target: ThreadId },
    #[error("{waiter} awaiting {target} would wait on itself")]
    Deadlock { waiter: ThreadId, target: ThreadId },
}

// ---------------------------------------------------------------------------
// Ledger trait
// ---------------------------------------------------------------------------

/// Storage contract for future records.
///
/// Implementations must make `get_or_wait` and `settle` linearizable per
/// record: both observe and mutate the record and its waiter list as one
/// atomic step.
pub trait Ledger: Send + Sync {
    /// Mint a fresh thread id, unique across every user of this ledger.
    fn next_thread_id(&self) -> ThreadId;

    /// Create a `Pending` record for a thread spawned by `parent`.
    fn create_child(&self, id: ThreadId, parent: Option<ThreadId>) -> Result<(), LedgerError>;

    /// Create a `Pending` top-level record.
    fn create(&self, id: ThreadId) -> Result<(), LedgerError> {
        self.create_child(id, None)
    }

    fn get(&self, id: ThreadId) -> Result<FutureRecord, LedgerError>;

    /// Return the settlement of `target`, or register `waiter` on it.
    fn get_or_wait(&self, target: ThreadId, waiter: ThreadId) -> Result<WaitOutcome, LedgerError>;

    /// Move `id` out of `Pending` and return the drained waiter list. Only
    /// one call per id can succeed. Records chained on `id` settle in the
    /// same step and their waiters are part of the returned list.
    fn settle(&self, id: ThreadId, outcome: Settlement) -> Result<Vec<ThreadId>, LedgerError>;

    /// Make pending `id` follow `target`: it settles when `target` does,
    /// with the same outcome. Closing a wait cycle is a deadlock.
    fn chain(&self, id: ThreadId, target: ThreadId) -> Result<ChainOutcome, LedgerError>;

    /// The thread `waiter` is currently registered on, if any.
    fn awaiting(&self, waiter: ThreadId) -> Option<ThreadId>;

    /// Drop a settled record. Retention is the caller's policy; execution
    /// never removes records on its own.
    fn remove(&self, id: ThreadId) -> Result<FutureRecord, LedgerError>;

    /// Every thread id with a record, ascending.
    fn threads(&self) -> Vec<ThreadId>;

    /// `root` and every thread spawned under it, transitively, ascending.
    fn lineage(&self, root: ThreadId) -> Vec<ThreadId> {
        // Children are always minted after their parent.
        let mut family = BTreeSet::from([root]);
        for id in self.threads() {
            if id <= root {
                continue;
            }
            if let Ok(record) = self.get(id) {
                if record.parent.is_some_and(|p| family.contains(&p)) {
                    family.insert(id);
                }
            }
        }
        family.into_iter().collect()
    }

    /// Block the calling OS thread until `id` settles or `timeout` elapses.
    ///
    /// The default polls; in-memory ledgers override it with a condvar.
    fn wait_settled(&self, id: ThreadId, timeout: Option<Duration>) -> Result<Option<Settlement>, LedgerError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(s) = self.get(id)?.state.settlement() {
                return Ok(Some(s));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory ledger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Entry {
    parent: Option<ThreadId>,
    state: FutureState,
    waiters: Vec<ThreadId>,
    chained: Vec<ThreadId>,
}

impl Entry {
    fn record(&self, thread: ThreadId) -> FutureRecord {
        FutureRecord {
            thread,
            parent: self.parent,
            state: self.state.clone(),
            waiters: self.waiters.clone(),
            chained: self.chained.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    next_id: u64,
    entries: HashMap<ThreadId, Entry>,
    /// waiter -> target, for every registered waiter and chained record.
    waiting_on: HashMap<ThreadId, ThreadId>,
}

impl LedgerState {
    fn entry(&self, id: ThreadId) -> Result<&Entry, LedgerError> {
        self.entries.get(&id).ok_or(LedgerError::UnknownThread(id))
    }

    /// Would `waiter` waiting on `target` close a cycle?
    fn closes_cycle(&self, waiter: ThreadId, target: ThreadId) -> bool {
        let mut cur = target;
        loop {
            if cur == waiter {
                return true;
            }
            match self.waiting_on.get(&cur) {
                Some(next) => cur = *next,
                None => return false,
            }
        }
    }

    /// Unregister `id` from whatever it was waiting or chained on.
    fn detach(&mut self, id: ThreadId) {
        if let Some(target) = self.waiting_on.remove(&id) {
            if let Some(entry) = self.entries.get_mut(&target) {
                entry.waiters.retain(|w| *w != id);
                entry.chained.retain(|c| *c != id);
            }
        }
    }

    /// Settle `id` and everything chained on it; returns all their waiters.
    fn settle_chain(&mut self, id: ThreadId, outcome: Settlement) -> Result<Vec<ThreadId>, LedgerError> {
        if !self.entry(id)?.state.is_pending() {
            return Err(LedgerError::AlreadySettled(id));
        }
        self.detach(id);
        let mut drained = Vec::new();
        let mut queue = vec![id];
        while let Some(cur) = queue.pop() {
            let Some(entry) = self.entries.get_mut(&cur) else { continue };
            if !entry.state.is_pending() {
                continue;
            }
            entry.state = outcome.clone().into();
            let waiters = std::mem::take(&mut entry.waiters);
            let chained = std::mem::take(&mut entry.chained);
            for w in waiters.iter().chain(&chained) {
                self.waiting_on.remove(w);
            }
            drained.extend(waiters);
            queue.extend(chained);
        }
        Ok(drained)
    }
}

/// Ledger held in process memory behind a single mutex.
///
/// Settling notifies a condvar, which is what the local executor blocks on
/// while a thread is suspended.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    settled: Condvar,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for MemoryLedger {
    fn next_thread_id(&self) -> ThreadId {
        let mut state = self.state.lock();
        let id = ThreadId::new(state.next_id);
        state.next_id += 1;
        id
    }

    fn create_child(&self, id: ThreadId, parent: Option<ThreadId>) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        if state.entries.contains_key(&id) {
            return Err(LedgerError::AlreadyExists(id));
        }
        let entry = Entry { parent, state: FutureState::Pending, waiters: Vec::new(), chained: Vec::new() };
        state.entries.insert(id, entry);
        Ok(())
    }

    fn get(&self, id: ThreadId) -> Result<FutureRecord, LedgerError> {
        Ok(self.state.lock().entry(id)?.record(id))
    }

    fn get_or_wait(&self, target: ThreadId, waiter: ThreadId) -> Result<WaitOutcome, LedgerError> {
        let mut state = self.state.lock();
        if let Some(s) = state.entry(target)?.state.settlement() {
            return Ok(WaitOutcome::Settled(s));
        }
        if let Some(current) = state.waiting_on.get(&waiter) {
            return Err(LedgerError::AlreadyWaiting { waiter, target: *current });
        }
        if state.closes_cycle(waiter, target) {
            return Err(LedgerError::Deadlock { waiter, target });
        }
        state.waiting_on.insert(waiter, target);
        if let Some(entry) = state.entries.get_mut(&target) {
            entry.waiters.push(waiter);
        }
        Ok(WaitOutcome::Registered)
    }

    fn settle(&self, id: ThreadId, outcome: Settlement) -> Result<Vec<ThreadId>, LedgerError> {
        let waiters = self.state.lock().settle_chain(id, outcome)?;
        self.settled.notify_all();
        tracing::trace!(thread = %id, waiters = waiters.len(), "settled");
        Ok(waiters)
    }

    fn chain(&self, id: ThreadId, target: ThreadId) -> Result<ChainOutcome, LedgerError> {
        let mut state = self.state.lock();
        if !state.entry(id)?.state.is_pending() {
            return Err(LedgerError::AlreadySettled(id));
        }
        if let Some(s) = state.entry(target)?.state.settlement() {
            return Ok(ChainOutcome::Settled(s));
        }
        if let Some(current) = state.waiting_on.get(&id) {
            return Err(LedgerError::AlreadyWaiting { waiter: id, target: *current });
        }
        if state.closes_cycle(id, target) {
            return Err(LedgerError::Deadlock { waiter: id, target });
        }
        state.waiting_on.insert(id, target);
        if let Some(entry) = state.entries.get_mut(&target) {
            entry.chained.push(id);
        }
        tracing::trace!(thread = %id, target = %target, "chained");
        Ok(ChainOutcome::Chained)
    }

    fn awaiting(&self, waiter: ThreadId) -> Option<ThreadId> {
        self.state.lock().waiting_on.get(&waiter).copied()
    }

    fn remove(&self, id: ThreadId) -> Result<FutureRecord, LedgerError> {
        let mut state = self.state.lock();
        if state.entry(id)?.state.is_pending() {
            return Err(LedgerError::StillPending(id));
        }
        let entry = state.entries.remove(&id).ok_or(LedgerError::UnknownThread(id))?;
        Ok(entry.record(id))
    }

    fn threads(&self) -> Vec<ThreadId> {
        let mut ids: Vec<ThreadId> = self.state.lock().entries.keys().copied().collect();
        ids.sort();
        ids
    }

    fn wait_settled(&self, id: ThreadId, timeout: Option<Duration>) -> Result<Option<Settlement>, LedgerError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(s) = state.entry(id)?.state.settlement() {
                return Ok(Some(s));
            }
            match deadline {
                Some(d) => {
                    if self.settled.wait_until(&mut state, d).timed_out() {
                        return Ok(state.entry(id)?.state.settlement());
                    }
                }
                None => self.settled.wait(&mut state),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
