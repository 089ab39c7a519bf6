//! Durable storage for suspended continuations.
//!
//! [`ContinuationStore`] abstracts the storage backend. [`FileContinuationStore`]
//! writes one file per thread atomically via write-to-tmp + rename;
//! [`MemoryContinuationStore`] keeps bytes in a map for tests and
//! single-process runs. [`Checkpointer`] wraps a store with the encoding
//! choice (plain or gzip).

use crate::continuation::{Continuation, ContinuationError};
use parking_lot::RwLock;
use skein_core::ThreadId;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("continuation error: {0}")]
    Continuation(#[from] ContinuationError),
    #[error("no continuation stored for {0}")]
    NotFound(ThreadId),
}

// ---------------------------------------------------------------------------
// Storage trait
// ---------------------------------------------------------------------------

/// Byte storage keyed by thread id. Saving overwrites.
pub trait ContinuationStore: Send + Sync {
    fn save(&self, id: ThreadId, data: &[u8]) -> Result<(), StoreError>;
    fn load(&self, id: ThreadId) -> Result<Vec<u8>, StoreError>;
    fn list(&self) -> Result<Vec<ThreadId>, StoreError>;
    fn delete(&self, id: ThreadId) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryContinuationStore {
    entries: RwLock<HashMap<ThreadId, Vec<u8>>>,
}

impl MemoryContinuationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContinuationStore for MemoryContinuationStore {
    fn save(&self, id: ThreadId, data: &[u8]) -> Result<(), StoreError> {
        self.entries.write().insert(id, data.to_vec());
        Ok(())
    }

    fn load(&self, id: ThreadId) -> Result<Vec<u8>, StoreError> {
        self.entries.read().get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    fn list(&self) -> Result<Vec<ThreadId>, StoreError> {
        let mut ids: Vec<ThreadId> = self.entries.read().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn delete(&self, id: ThreadId) -> Result<(), StoreError> {
        self.entries.write().remove(&id).map(|_| ()).ok_or(StoreError::NotFound(id))
    }
}

// ---------------------------------------------------------------------------
// Filesystem store
// ---------------------------------------------------------------------------

pub struct FileContinuationStore {
    dir: PathBuf,
}

impl FileContinuationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileContinuationStore { dir })
    }

    fn cont_path(&self, id: ThreadId) -> PathBuf {
        self.dir.join(format!("{}.cont", id.as_u64()))
    }

    fn tmp_path(&self, id: ThreadId) -> PathBuf {
        self.dir.join(format!("{}.cont.tmp", id.as_u64()))
    }
}

impl ContinuationStore for FileContinuationStore {
    fn save(&self, id: ThreadId, data: &[u8]) -> Result<(), StoreError> {
        let tmp = self.tmp_path(id);
        fs::write(&tmp, data)?;
        fs::rename(&tmp, self.cont_path(id))?;
        Ok(())
    }

    fn load(&self, id: ThreadId) -> Result<Vec<u8>, StoreError> {
        let path = self.cont_path(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id));
        }
        Ok(fs::read(path)?)
    }

    fn list(&self) -> Result<Vec<ThreadId>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".cont") {
                if let Ok(n) = stem.parse::<u64>() {
                    ids.push(ThreadId::new(n));
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn delete(&self, id: ThreadId) -> Result<(), StoreError> {
        let path = self.cont_path(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id));
        }
        fs::remove_file(path)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Checkpointer
// ---------------------------------------------------------------------------

/// Encodes continuations into a store and decodes them back out.
#[derive(Clone)]
pub struct Checkpointer {
    store: Arc<dyn ContinuationStore>,
    compressed: bool,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn ContinuationStore>) -> Self {
        Checkpointer { store, compressed: false }
    }

    pub fn new_compressed(store: Arc<dyn ContinuationStore>) -> Self {
        Checkpointer { store, compressed: true }
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn persist(&self, cont: &Continuation) -> Result<(), StoreError> {
        let bytes = if self.compressed { cont.encode_compressed()? } else { cont.encode()? };
        self.store.save(cont.thread, &bytes)
    }

    pub fn restore(&self, id: ThreadId) -> Result<Continuation, StoreError> {
        let bytes = self.store.load(id)?;
        if self.compressed {
            Ok(Continuation::decode_compressed(&bytes)?)
        } else {
            Ok(Continuation::decode(&bytes)?)
        }
    }

    pub fn discard(&self, id: ThreadId) -> Result<(), StoreError> {
        self.store.delete(id)
    }

    /// Threads that currently have a stored continuation.
    pub fn stored(&self) -> Result<Vec<ThreadId>, StoreError> {
        self.store.list()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::Frame;
    use skein_core::Value;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("skein-store-test-{}", uuid::Uuid::new_v4()))
    }

    fn sample(thread: u64) -> Continuation {
        let frame = Frame::new("main", vec![("x".into(), Value::Int(thread as i64))]);
        Continuation::new(ThreadId::new(thread), "sha256:test", frame)
    }

    #[test]
    fn file_store_save_load_list_delete() {
        let dir = temp_dir();
        let store = FileContinuationStore::new(&dir).unwrap();
        store.save(ThreadId::new(3), b"three").unwrap();
        store.save(ThreadId::new(1), b"one").unwrap();
        store.save(ThreadId::new(3), b"three again").unwrap();

        assert_eq!(store.load(ThreadId::new(3)).unwrap(), b"three again");
        assert_eq!(store.list().unwrap(), vec![ThreadId::new(1), ThreadId::new(3)]);
        assert!(!dir.join("3.cont.tmp").exists());

        store.delete(ThreadId::new(1)).unwrap();
        assert!(matches!(store.load(ThreadId::new(1)), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete(ThreadId::new(1)), Err(StoreError::NotFound(_))));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn memory_store_not_found() {
        let store = MemoryContinuationStore::new();
        assert!(matches!(store.load(ThreadId::new(0)), Err(StoreError::NotFound(_))));
        store.save(ThreadId::new(0), b"x").unwrap();
        assert_eq!(store.list().unwrap(), vec![ThreadId::new(0)]);
    }

    #[test]
    fn checkpointer_persist_and_restore() {
        for compressed in [false, true] {
            let store: Arc<dyn ContinuationStore> = Arc::new(MemoryContinuationStore::new());
            let cp = if compressed { Checkpointer::new_compressed(store) } else { Checkpointer::new(store) };
            let cont = sample(4);
            cp.persist(&cont).unwrap();
            assert_eq!(cp.restore(ThreadId::new(4)).unwrap(), cont);
            assert_eq!(cp.stored().unwrap(), vec![ThreadId::new(4)]);
            cp.discard(ThreadId::new(4)).unwrap();
            assert!(cp.stored().unwrap().is_empty());
        }
    }

    #[test]
    fn checkpointer_over_files_reads_across_instances() {
        let dir = temp_dir();
        let cont = sample(9);
        Checkpointer::new(Arc::new(FileContinuationStore::new(&dir).unwrap())).persist(&cont).unwrap();
        let fresh = Checkpointer::new(Arc::new(FileContinuationStore::new(&dir).unwrap()));
        assert_eq!(fresh.restore(ThreadId::new(9)).unwrap(), cont);
        let _ = fs::remove_dir_all(dir);
    }
}
