//! Database models mapping to the registry schema.

use crate::error::{RegistryError, RegistryResult};
use spool_core::{BackendRef, UploadId, UploadMetadata, UploadRecord};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Row of the `uploads` table.
#[derive(Debug, Clone, FromRow)]
pub struct UploadRow {
    pub upload_id: Uuid,
    /// Declared length; NULL while deferred.
    pub upload_length: Option<i64>,
    pub upload_offset: i64,
    /// Metadata map serialized as JSON.
    pub metadata: String,
    pub backend_ref: String,
    pub created_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
}

impl UploadRow {
    pub fn from_record(record: &UploadRecord) -> RegistryResult<Self> {
        let metadata = serde_json::to_string(&record.metadata)
            .map_err(|e| RegistryError::Internal(format!("failed to encode metadata: {e}")))?;
        Ok(Self {
            upload_id: *record.id.as_uuid(),
            upload_length: record.length.map(to_db_int).transpose()?,
            upload_offset: to_db_int(record.offset)?,
            metadata,
            backend_ref: record.backend_ref.as_str().to_string(),
            created_at: record.created_at,
            expires_at: record.expires_at,
        })
    }

    pub fn into_record(self) -> RegistryResult<UploadRecord> {
        let metadata: UploadMetadata = serde_json::from_str(&self.metadata).map_err(|e| {
            RegistryError::Internal(format!(
                "corrupt metadata for upload {}: {e}",
                self.upload_id
            ))
        })?;
        Ok(UploadRecord {
            id: UploadId::from_uuid(self.upload_id),
            length: self.upload_length.map(from_db_int).transpose()?,
            offset: from_db_int(self.upload_offset)?,
            metadata,
            backend_ref: BackendRef::new(self.backend_ref),
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}

/// SQLite integers are signed 64-bit.
pub(crate) fn to_db_int(value: u64) -> RegistryResult<i64> {
    i64::try_from(value)
        .map_err(|_| RegistryError::Internal(format!("value {value} exceeds database range")))
}

pub(crate) fn from_db_int(value: i64) -> RegistryResult<u64> {
    u64::try_from(value)
        .map_err(|_| RegistryError::Internal(format!("negative value {value} in database")))
}
