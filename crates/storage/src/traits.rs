//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use spool_core::{BackendRef, UploadId, UploadMetadata};
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Durable state of an upload as seen by its backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendStatus {
    /// Bytes durably committed.
    pub offset: u64,
    /// Declared total length, if known.
    pub length: Option<u64>,
}

/// Byte storage for resumable uploads.
///
/// Every write is gated on the caller's view of the current offset, so a
/// retried or racing request can never leave a gap or overwrite bytes.
/// Callers serialize operations per upload; implementations only have to
/// detect (not resolve) a stale offset.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Allocate storage for a new upload and return the handle used by
    /// every later call.
    async fn create(
        &self,
        id: &UploadId,
        length: Option<u64>,
        metadata: &UploadMetadata,
    ) -> StorageResult<BackendRef>;

    /// Write `data` starting at `offset` and return the new durable offset.
    ///
    /// Fails with `OffsetMismatch` if `offset` is not the current durable
    /// offset. A failed write leaves no bytes past the previous offset
    /// visible through [`read_metadata`](Self::read_metadata).
    async fn append(
        &self,
        backend_ref: &BackendRef,
        offset: u64,
        data: Bytes,
    ) -> StorageResult<u64>;

    /// Record the total length of an upload created with a deferred length.
    async fn declare_length(&self, backend_ref: &BackendRef, length: u64) -> StorageResult<()>;

    /// Latest durably committed offset and declared length.
    async fn read_metadata(&self, backend_ref: &BackendRef) -> StorageResult<BackendStatus>;

    /// Stream the stored bytes of an upload.
    async fn read(&self, backend_ref: &BackendRef) -> StorageResult<ByteStream>;

    /// Remove every byte and the info record of an upload.
    ///
    /// Deleting an upload that does not exist succeeds.
    async fn delete(&self, backend_ref: &BackendRef) -> StorageResult<()>;

    /// Commit an upload once all of its bytes are stored.
    ///
    /// The default implementation does nothing, which suits backends that
    /// write straight into the final object.
    async fn finalize(&self, _backend_ref: &BackendRef) -> StorageResult<()> {
        Ok(())
    }

    /// Get the name of this storage backend.
    ///
    /// Returns a static string identifier for the backend type (e.g., "s3", "filesystem").
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// Called during server startup so the server refuses to start when
    /// storage is unreachable. The default implementation returns Ok(()).
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
