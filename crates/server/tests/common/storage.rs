//! In-memory storage backend with failure injection.

use async_trait::async_trait;
use bytes::Bytes;
use spool_core::{BackendRef, UploadId, UploadMetadata};
use spool_storage::{BackendStatus, ByteStream, StorageBackend, StorageError, StorageResult};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
struct Entry {
    data: Vec<u8>,
    length: Option<u64>,
    finalized: bool,
}

/// Storage backend keeping bytes in memory.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
#[derive(Default)]
pub struct TestBackend {
    entries: Mutex<HashMap<String, Entry>>,
    /// Make every append fail with a transient error.
    pub fail_appends: AtomicBool,
    /// Make every finalize fail with a transient error.
    pub fail_finalize: AtomicBool,
    pub finalize_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
}

#[allow(dead_code)]
impl TestBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self, backend_ref: &BackendRef) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap()
            .get(backend_ref.as_str())
            .map(|entry| entry.data.clone())
    }

    pub fn is_finalized(&self, backend_ref: &BackendRef) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(backend_ref.as_str())
            .is_some_and(|entry| entry.finalized)
    }

    pub fn contains(&self, backend_ref: &BackendRef) -> bool {
        self.entries
            .lock()
            .unwrap()
            .contains_key(backend_ref.as_str())
    }

    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_finalize(&self, fail: bool) {
        self.fail_finalize.store(fail, Ordering::SeqCst);
    }

    pub fn finalize_count(&self) -> usize {
        self.finalize_calls.load(Ordering::SeqCst)
    }
}

fn injected(what: &str) -> StorageError {
    StorageError::Io(std::io::Error::other(format!("injected {what} failure")))
}

#[async_trait]
impl StorageBackend for TestBackend {
    async fn create(
        &self,
        id: &UploadId,
        length: Option<u64>,
        _metadata: &UploadMetadata,
    ) -> StorageResult<BackendRef> {
        let key = id.to_string();
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&key) {
            return Err(StorageError::AlreadyExists(key));
        }
        entries.insert(
            key.clone(),
            Entry {
                length,
                ..Default::default()
            },
        );
        Ok(BackendRef::new(key))
    }

    async fn append(&self, backend_ref: &BackendRef, offset: u64, data: Bytes) -> StorageResult<u64> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(injected("append"));
        }
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(backend_ref.as_str())
            .ok_or_else(|| StorageError::NotFound(backend_ref.to_string()))?;

        let stored = entry.data.len() as u64;
        if stored != offset {
            return Err(StorageError::OffsetMismatch {
                stored,
                requested: offset,
            });
        }
        let size = data.len() as u64;
        if let Some(length) = entry.length
            && offset + size > length
        {
            return Err(StorageError::LengthExceeded {
                offset,
                size,
                length,
            });
        }
        entry.data.extend_from_slice(&data);
        Ok(offset + size)
    }

    async fn declare_length(&self, backend_ref: &BackendRef, length: u64) -> StorageResult<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(backend_ref.as_str())
            .ok_or_else(|| StorageError::NotFound(backend_ref.to_string()))?;
        entry.length = Some(length);
        Ok(())
    }

    async fn read_metadata(&self, backend_ref: &BackendRef) -> StorageResult<BackendStatus> {
        let entries = self.entries.lock().unwrap();
        let entry = entries
            .get(backend_ref.as_str())
            .ok_or_else(|| StorageError::NotFound(backend_ref.to_string()))?;
        Ok(BackendStatus {
            offset: entry.data.len() as u64,
            length: entry.length,
        })
    }

    async fn read(&self, backend_ref: &BackendRef) -> StorageResult<ByteStream> {
        let data = self
            .bytes(backend_ref)
            .ok_or_else(|| StorageError::NotFound(backend_ref.to_string()))?;
        Ok(Box::pin(futures::stream::once(async move {
            Ok(Bytes::from(data))
        })))
    }

    async fn delete(&self, backend_ref: &BackendRef) -> StorageResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().remove(backend_ref.as_str());
        Ok(())
    }

    async fn finalize(&self, backend_ref: &BackendRef) -> StorageResult<()> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_finalize.load(Ordering::SeqCst) {
            return Err(injected("finalize"));
        }
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(backend_ref.as_str())
            .ok_or_else(|| StorageError::NotFound(backend_ref.to_string()))?;
        let offset = entry.data.len() as u64;
        if entry.length != Some(offset) {
            return Err(StorageError::Incomplete {
                offset,
                length: entry.length,
            });
        }
        entry.finalized = true;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
