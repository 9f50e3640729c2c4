//! Upload protocol engine.
//!
//! Validates every request against the registry record, drives the storage
//! backend, commits the new state to the registry and publishes events.
//! Every mutating operation runs under the upload's lock from the shared
//! [`LockTable`], so appends to one upload are strictly sequential while
//! different uploads proceed in parallel.

pub mod error;

pub use error::{EngineError, EngineResult};

use crate::events::{EventHub, EventKind, UploadEvent};
use crate::metrics::{APPEND_DURATION, BYTES_RECEIVED, FINALIZE_DURATION, UPLOADS_EXPIRED};
use bytes::Bytes;
use spool_core::config::{ExpirationConfig, ProtocolConfig};
use spool_core::protocol::OFFSET_OCTET_STREAM;
use spool_core::{Capabilities, ChunkChecksum, Extension, UploadId, UploadMetadata, UploadRecord};
use spool_registry::{LockTable, UploadRegistry, sweep_expired};
use spool_storage::{ByteStream, StorageBackend, StorageError, StorageResult};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::instrument;

/// A creation request.
#[derive(Clone, Debug, Default)]
pub struct CreateRequest {
    /// Total length, or `None` to defer it.
    pub length: Option<u64>,
    pub metadata: UploadMetadata,
    /// Extensions the request relies on.
    pub requested: Vec<Extension>,
}

/// A chunk to append.
#[derive(Clone, Debug, Default)]
pub struct AppendRequest {
    /// Offset the client believes the upload is at.
    pub offset: u64,
    pub content_type: Option<String>,
    pub checksum: Option<ChunkChecksum>,
    /// Length declared alongside the chunk, for deferred uploads.
    pub length: Option<u64>,
    pub data: Bytes,
}

/// Whether a `Content-Type` value names the chunk media type (parameters ignored).
pub fn is_offset_octet_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(OFFSET_OCTET_STREAM))
}

/// The resumable upload state machine.
pub struct UploadEngine {
    registry: Arc<dyn UploadRegistry>,
    storage: Arc<dyn StorageBackend>,
    events: Arc<EventHub>,
    locks: LockTable,
    capabilities: Capabilities,
    ttl: Option<time::Duration>,
    append_timeout: Duration,
    finalize_timeout: Duration,
    sweep_batch_size: u32,
}

impl UploadEngine {
    pub fn new(
        registry: Arc<dyn UploadRegistry>,
        storage: Arc<dyn StorageBackend>,
        events: Arc<EventHub>,
        protocol: &ProtocolConfig,
        expiration: &ExpirationConfig,
    ) -> Self {
        Self {
            registry,
            storage,
            events,
            locks: LockTable::new(),
            capabilities: Capabilities::from_config(protocol, expiration),
            ttl: expiration.ttl(),
            append_timeout: protocol.append_timeout(),
            finalize_timeout: protocol.finalize_timeout(),
            sweep_batch_size: expiration.sweep_batch_size,
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<dyn UploadRegistry> {
        &self.registry
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Run a storage call under a timeout.
    async fn storage_call<T>(
        &self,
        limit: Duration,
        call: impl Future<Output = StorageResult<T>>,
    ) -> EngineResult<T> {
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(EngineError::from),
            Err(_) => Err(StorageError::Timeout(limit).into()),
        }
    }

    fn publish(&self, kind: EventKind, record: &UploadRecord) {
        self.events.publish(&UploadEvent::new(kind, record.clone()));
    }

    fn ensure_live(record: &UploadRecord, now: OffsetDateTime) -> EngineResult<()> {
        if record.is_expired(now) {
            return Err(EngineError::Expired(record.id.to_string()));
        }
        Ok(())
    }

    fn check_max_size(&self, length: u64) -> EngineResult<()> {
        if let Some(max) = self.capabilities.max_size()
            && length > max
        {
            return Err(EngineError::LengthExceeded(format!(
                "{length} bytes exceeds the maximum upload size of {max}"
            )));
        }
        Ok(())
    }

    async fn finalize(&self, record: &UploadRecord) -> EngineResult<()> {
        let start = Instant::now();
        self.storage_call(
            self.finalize_timeout,
            self.storage.finalize(&record.backend_ref),
        )
        .await?;
        FINALIZE_DURATION.observe(start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Push the expiry of an incomplete upload forward.
    async fn refresh_expiry(&self, mut record: UploadRecord) -> EngineResult<UploadRecord> {
        if let Some(ttl) = self.ttl
            && !record.is_complete()
        {
            let expires_at = OffsetDateTime::now_utc() + ttl;
            self.registry.set_expiry(&record.id, Some(expires_at)).await?;
            record.expires_at = Some(expires_at);
        }
        Ok(record)
    }

    /// Create a new upload.
    #[instrument(skip(self, request), fields(length = ?request.length))]
    pub async fn handle_create(&self, request: CreateRequest) -> EngineResult<UploadRecord> {
        if let Some(ext) = request
            .requested
            .iter()
            .find(|ext| !self.capabilities.supports(**ext))
        {
            return Err(EngineError::UnsupportedCapability(format!(
                "extension '{ext}' is not enabled"
            )));
        }
        match request.length {
            Some(length) => self.check_max_size(length)?,
            None if !self.capabilities.supports(Extension::CreationDeferLength) => {
                return Err(EngineError::UnsupportedCapability(
                    "extension 'creation-defer-length' is not enabled".to_string(),
                ));
            }
            None => {}
        }

        let id = UploadId::new();
        // Held until the record is in its final state
        let _lock = self.locks.lock(&id).await;
        let backend_ref = self
            .storage_call(
                self.append_timeout,
                self.storage.create(&id, request.length, &request.metadata),
            )
            .await?;

        let record = UploadRecord::new(
            id,
            request.length,
            request.metadata,
            backend_ref,
            OffsetDateTime::now_utc(),
            self.ttl,
        );
        if let Err(e) = self.registry.register(&record).await {
            if let Err(cleanup) = self.storage.delete(&record.backend_ref).await {
                tracing::warn!(
                    upload_id = %id,
                    error = %cleanup,
                    "Failed to remove storage for unregistered upload"
                );
            }
            return Err(e.into());
        }

        tracing::debug!(upload_id = %id, "Upload created");
        self.publish(EventKind::Created, &record);

        if record.length == Some(0) {
            self.finalize(&record).await?;
            self.publish(EventKind::Complete, &record);
        }

        Ok(record)
    }

    /// Current state of an upload, reconciled with the storage backend.
    ///
    /// If a previous append reached storage but its registry update was lost,
    /// the registry is moved forward to the backend's durable offset.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn handle_head(&self, id: &UploadId) -> EngineResult<UploadRecord> {
        let _lock = self.locks.lock(id).await;
        let record = self.registry.get(id).await?;
        Self::ensure_live(&record, OffsetDateTime::now_utc())?;
        if record.is_complete() {
            return Ok(record);
        }
        self.reconcile(record).await
    }

    async fn reconcile(&self, record: UploadRecord) -> EngineResult<UploadRecord> {
        let status = self
            .storage_call(
                self.append_timeout,
                self.storage.read_metadata(&record.backend_ref),
            )
            .await?;

        if status.offset == record.offset {
            return Ok(record);
        }
        if status.offset < record.offset {
            tracing::error!(
                upload_id = %record.id,
                registry_offset = record.offset,
                backend_offset = status.offset,
                "Storage holds fewer bytes than the registry recorded"
            );
            return Err(EngineError::OffsetRegression {
                current: record.offset,
                requested: status.offset,
            });
        }
        if let Some(length) = record.length
            && status.offset > length
        {
            return Err(EngineError::Internal(format!(
                "storage holds {} bytes for an upload of length {length}",
                status.offset
            )));
        }

        tracing::warn!(
            upload_id = %record.id,
            registry_offset = record.offset,
            backend_offset = status.offset,
            "Registry offset behind storage, moving it forward"
        );

        let completes = record.length == Some(status.offset);
        if completes {
            self.finalize(&record).await?;
        }
        let updated = self.registry.update_offset(&record.id, status.offset).await?;
        let updated = self.refresh_expiry(updated).await?;

        self.publish(EventKind::ChunkAppended, &updated);
        if completes {
            self.publish(EventKind::Complete, &updated);
        }
        Ok(updated)
    }

    /// Append one chunk at the client's offset.
    #[instrument(
        skip(self, request),
        fields(upload_id = %id, offset = request.offset, size = request.data.len())
    )]
    pub async fn handle_append(
        &self,
        id: &UploadId,
        request: AppendRequest,
    ) -> EngineResult<UploadRecord> {
        let content_type = request.content_type.as_deref().unwrap_or_default();
        if !is_offset_octet_stream(content_type) {
            let shown = if content_type.is_empty() {
                "<none>"
            } else {
                content_type
            };
            return Err(EngineError::ContentTypeInvalid(shown.to_string()));
        }
        if let Some(checksum) = &request.checksum
            && !self.capabilities.supports_checksum(checksum.algorithm())
        {
            return Err(EngineError::UnsupportedCapability(format!(
                "checksum algorithm '{}' is not enabled",
                checksum.algorithm()
            )));
        }

        let _lock = self.locks.lock(id).await;
        let mut record = self.registry.get(id).await?;
        Self::ensure_live(&record, OffsetDateTime::now_utc())?;

        if request.offset != record.offset {
            return Err(EngineError::OffsetConflict {
                current: record.offset,
                requested: request.offset,
            });
        }
        if record.is_complete() {
            return Err(EngineError::InvalidState(
                "upload is already complete".to_string(),
            ));
        }

        // Length this request declares, validated but not yet applied
        let declared = match (request.length, record.length) {
            (None, _) => None,
            (Some(length), None) => {
                if length < record.offset {
                    return Err(EngineError::LengthTooSmall {
                        length,
                        offset: record.offset,
                    });
                }
                self.check_max_size(length)?;
                Some(length)
            }
            (Some(length), Some(existing)) if existing == length => None,
            (Some(_), Some(existing)) => {
                return Err(EngineError::InvalidState(format!(
                    "upload length is already set to {existing}"
                )));
            }
        };

        let size = request.data.len() as u64;
        let end = record
            .offset
            .checked_add(size)
            .ok_or_else(|| EngineError::LengthExceeded("offset overflow".to_string()))?;
        match declared.or(record.length) {
            Some(length) if end > length => {
                return Err(EngineError::LengthExceeded(format!(
                    "chunk of {size} bytes at offset {} exceeds upload length {length}",
                    record.offset
                )));
            }
            Some(_) => {}
            None => self.check_max_size(end)?,
        }

        if let Some(checksum) = &request.checksum {
            checksum.verify(&request.data)?;
        }

        if let Some(length) = declared {
            record = self.declare_length_locked(record, length).await?;
        }

        if size == 0 {
            return Ok(record);
        }

        let start = Instant::now();
        let new_offset = self
            .storage_call(
                self.append_timeout,
                self.storage
                    .append(&record.backend_ref, record.offset, request.data),
            )
            .await?;
        APPEND_DURATION.observe(start.elapsed().as_secs_f64());
        BYTES_RECEIVED.inc_by(new_offset.saturating_sub(record.offset));

        // Finalize before recording the last offset: if it fails the registry
        // stays behind and the next HEAD reconciles and retries it.
        let completes = record.length == Some(new_offset);
        if completes {
            self.finalize(&record).await?;
        }
        let updated = self.registry.update_offset(id, new_offset).await?;
        let updated = self.refresh_expiry(updated).await?;

        self.publish(EventKind::ChunkAppended, &updated);
        if completes {
            self.publish(EventKind::Complete, &updated);
        }
        Ok(updated)
    }

    /// Set the length of an upload created with a deferred length.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn handle_declare_length(
        &self,
        id: &UploadId,
        length: u64,
    ) -> EngineResult<UploadRecord> {
        let _lock = self.locks.lock(id).await;
        let record = self.registry.get(id).await?;
        Self::ensure_live(&record, OffsetDateTime::now_utc())?;
        self.declare_length_locked(record, length).await
    }

    async fn declare_length_locked(
        &self,
        record: UploadRecord,
        length: u64,
    ) -> EngineResult<UploadRecord> {
        if !record.is_deferred() {
            return Err(EngineError::InvalidState(
                "upload length is already set".to_string(),
            ));
        }
        if length < record.offset {
            return Err(EngineError::LengthTooSmall {
                length,
                offset: record.offset,
            });
        }
        self.check_max_size(length)?;

        self.storage_call(
            self.append_timeout,
            self.storage.declare_length(&record.backend_ref, length),
        )
        .await?;

        let completes = length == record.offset;
        if completes {
            self.finalize(&record).await?;
        }
        let updated = self.registry.set_length(&record.id, length).await?;
        if completes {
            self.publish(EventKind::Complete, &updated);
        }
        Ok(updated)
    }

    /// Remove an upload and its bytes.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn handle_delete(&self, id: &UploadId) -> EngineResult<UploadRecord> {
        let _lock = self.locks.lock(id).await;
        let record = self.registry.get(id).await?;

        self.storage_call(
            self.append_timeout,
            self.storage.delete(&record.backend_ref),
        )
        .await?;
        self.registry.remove(id).await?;

        self.publish(EventKind::Deleted, &record);
        Ok(record)
    }

    /// Stream the bytes of a completed upload.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn handle_read(&self, id: &UploadId) -> EngineResult<(UploadRecord, ByteStream)> {
        let record = self.registry.get(id).await?;
        if !record.is_complete() {
            return Err(EngineError::InvalidState(format!(
                "upload is incomplete: {} of {} bytes received",
                record.offset,
                record
                    .length
                    .map_or_else(|| "unknown".to_string(), |l| l.to_string())
            )));
        }
        let stream = self
            .storage_call(self.append_timeout, self.storage.read(&record.backend_ref))
            .await?;
        Ok((record, stream))
    }

    /// Remove expired uploads and publish a `deleted` event for each.
    pub async fn sweep_expired(&self, now: OffsetDateTime) -> EngineResult<usize> {
        let report = sweep_expired(
            self.registry.as_ref(),
            self.storage.as_ref(),
            &self.locks,
            now,
            self.sweep_batch_size,
        )
        .await?;

        for record in &report.removed {
            UPLOADS_EXPIRED.inc();
            self.publish(EventKind::Deleted, record);
        }
        if report.failed > 0 {
            tracing::warn!(
                failed = report.failed,
                "Some expired uploads could not be removed"
            );
        }
        Ok(report.removed.len())
    }
}
