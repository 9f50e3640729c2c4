//! Per-upload mutual exclusion.

use dashmap::DashMap;
use spool_core::UploadId;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Table of per-upload async locks.
///
/// Entries are created on first use and dropped again when the last holder
/// or waiter releases them, so the table only grows with in-flight uploads.
#[derive(Clone, Default)]
pub struct LockTable {
    locks: Arc<DashMap<UploadId, Arc<Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to one upload.
    pub async fn lock(&self, id: &UploadId) -> UploadLock {
        let mutex = self
            .locks
            .entry(*id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        UploadLock {
            id: *id,
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of uploads with a holder or waiter.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one upload, released on drop.
pub struct UploadLock {
    id: UploadId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<UploadId, Arc<Mutex<()>>>>,
}

impl UploadLock {
    pub fn id(&self) -> &UploadId {
        &self.id
    }
}

impl Drop for UploadLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table itself still references the mutex: nobody is waiting
        self.locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl std::fmt::Debug for UploadLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadLock").field("id", &self.id).finish()
    }
}
