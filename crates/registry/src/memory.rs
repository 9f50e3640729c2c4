//! In-process upload registry.

use crate::error::{RegistryError, RegistryResult};
use crate::store::UploadRegistry;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use spool_core::{UploadId, UploadRecord};
use time::OffsetDateTime;

/// Registry held in a concurrent map. Records are lost on restart.
#[derive(Default)]
pub struct MemoryRegistry {
    records: DashMap<UploadId, UploadRecord>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UploadRegistry for MemoryRegistry {
    async fn register(&self, record: &UploadRecord) -> RegistryResult<()> {
        match self.records.entry(record.id) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateId(record.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &UploadId) -> RegistryResult<UploadRecord> {
        self.records
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    async fn update_offset(&self, id: &UploadId, new_offset: u64) -> RegistryResult<UploadRecord> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if new_offset < record.offset {
            return Err(RegistryError::OffsetRegression {
                current: record.offset,
                requested: new_offset,
            });
        }
        record.offset = new_offset;
        Ok(record.clone())
    }

    async fn set_length(&self, id: &UploadId, length: u64) -> RegistryResult<UploadRecord> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if record.length.is_some() {
            return Err(RegistryError::LengthAlreadySet(id.to_string()));
        }
        record.length = Some(length);
        Ok(record.clone())
    }

    async fn set_expiry(
        &self,
        id: &UploadId,
        expires_at: Option<OffsetDateTime>,
    ) -> RegistryResult<()> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        record.expires_at = expires_at;
        Ok(())
    }

    async fn remove(&self, id: &UploadId) -> RegistryResult<()> {
        self.records
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    async fn list_expired(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> RegistryResult<Vec<UploadRecord>> {
        let mut expired: Vec<UploadRecord> = self
            .records
            .iter()
            .filter(|r| r.is_expired(now))
            .map(|r| r.value().clone())
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        expired.truncate(limit as usize);
        Ok(expired)
    }

    async fn count(&self) -> RegistryResult<u64> {
        Ok(self.records.len() as u64)
    }

    async fn health_check(&self) -> RegistryResult<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
