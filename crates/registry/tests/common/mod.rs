#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use spool_core::{BackendRef, UploadId, UploadMetadata, UploadRecord};
use spool_registry::{MemoryRegistry, SqliteRegistry, UploadRegistry};
use spool_storage::{BackendStatus, ByteStream, StorageBackend, StorageError, StorageResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};

/// Both registry implementations, keeping the temp dir alive for SQLite.
pub async fn registries() -> (TempDir, Vec<Arc<dyn UploadRegistry>>) {
    let temp_dir = TempDir::new().unwrap();
    let sqlite = SqliteRegistry::new(temp_dir.path().join("registry.db"))
        .await
        .unwrap();
    let registries: Vec<Arc<dyn UploadRegistry>> =
        vec![Arc::new(MemoryRegistry::new()), Arc::new(sqlite)];
    (temp_dir, registries)
}

pub fn record(length: Option<u64>, ttl: Option<Duration>) -> UploadRecord {
    let id = UploadId::new();
    let mut metadata = UploadMetadata::new();
    metadata.insert("filename", Some("world.txt".to_string()));
    UploadRecord::new(
        id,
        length,
        metadata,
        BackendRef::new(id.to_string()),
        OffsetDateTime::now_utc(),
        ttl,
    )
}

/// Storage stub that counts deletes and can be told to fail them.
#[derive(Default)]
pub struct CountingBackend {
    pub deletes: AtomicUsize,
    pub fail_deletes: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl StorageBackend for CountingBackend {
    async fn create(
        &self,
        id: &UploadId,
        _length: Option<u64>,
        _metadata: &UploadMetadata,
    ) -> StorageResult<BackendRef> {
        Ok(BackendRef::new(id.to_string()))
    }

    async fn append(&self, _backend_ref: &BackendRef, offset: u64, data: Bytes) -> StorageResult<u64> {
        Ok(offset + data.len() as u64)
    }

    async fn declare_length(&self, _backend_ref: &BackendRef, _length: u64) -> StorageResult<()> {
        Ok(())
    }

    async fn read_metadata(&self, _backend_ref: &BackendRef) -> StorageResult<BackendStatus> {
        Ok(BackendStatus {
            offset: 0,
            length: None,
        })
    }

    async fn read(&self, backend_ref: &BackendRef) -> StorageResult<ByteStream> {
        Err(StorageError::NotFound(backend_ref.to_string()))
    }

    async fn delete(&self, _backend_ref: &BackendRef) -> StorageResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("disk unavailable")));
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "counting"
    }
}
