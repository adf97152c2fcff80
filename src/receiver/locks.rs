//! Per-upload locks.
//!
//! Chunk writes for one upload share its gate; finalize and the staging
//! sweep take it exclusively. Different uploads never wait on each other.
//! A table entry lives only while some handle for it is alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct UploadLock {
    gate: RwLock<()>,
    manifest: AsyncMutex<()>,
}

/// Lock table keyed by upload id.
#[derive(Debug, Default)]
pub struct UploadLocks {
    table: Mutex<HashMap<String, Arc<UploadLock>>>,
}

impl UploadLocks {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle on the lock for `upload_id`, creating it on first use.
    pub fn acquire(&self, upload_id: &str) -> UploadLockHandle<'_> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(table.entry(upload_id.to_owned()).or_default())
        };
        UploadLockHandle {
            table: &self.table,
            upload_id: upload_id.to_owned(),
            lock,
        }
    }

    /// Uploads with a live handle.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True when no handle is alive.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Live reference to one upload's lock. Guards borrow from it, so they are
/// released before the handle.
#[derive(Debug)]
pub struct UploadLockHandle<'a> {
    table: &'a Mutex<HashMap<String, Arc<UploadLock>>>,
    upload_id: String,
    lock: Arc<UploadLock>,
}

impl UploadLockHandle<'_> {
    /// Shared access, held while a chunk is stored.
    pub async fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.gate.read().await
    }

    /// Exclusive access, held while the upload is assembled or discarded.
    pub async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.gate.write().await
    }

    /// Serializes manifest reads and writes among concurrent chunks.
    pub async fn manifest(&self) -> MutexGuard<'_, ()> {
        self.lock.manifest.lock().await
    }
}

impl Drop for UploadLockHandle<'_> {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        // Clones are only taken under the table lock, so a count of two
        // (the table and this handle) cannot grow while it is held.
        if Arc::strong_count(&self.lock) == 2 {
            table.remove(&self.upload_id);
        }
    }
}
