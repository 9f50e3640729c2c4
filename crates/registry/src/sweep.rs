//! Expiration sweep: remove incomplete uploads past their expiry.

use crate::error::{RegistryError, RegistryResult};
use crate::locks::LockTable;
use crate::store::UploadRegistry;
use spool_core::UploadRecord;
use spool_storage::StorageBackend;
use time::OffsetDateTime;
use tracing::{debug, warn};

/// Outcome of one sweep pass.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Records removed from the registry together with their bytes.
    pub removed: Vec<UploadRecord>,
    /// Uploads whose backend delete failed; kept for the next sweep.
    pub failed: usize,
}

/// Remove up to `limit` expired uploads.
///
/// Each upload is deleted under its per-id lock: backend bytes first, then the
/// record. A backend failure is logged and the record kept so the next pass
/// retries it. An upload that was completed, extended or deleted while the
/// sweep waited for its lock is skipped.
pub async fn sweep_expired(
    registry: &dyn UploadRegistry,
    storage: &dyn StorageBackend,
    locks: &LockTable,
    now: OffsetDateTime,
    limit: u32,
) -> RegistryResult<SweepReport> {
    let candidates = registry.list_expired(now, limit).await?;
    let mut report = SweepReport::default();

    for candidate in candidates {
        let _lock = locks.lock(&candidate.id).await;

        let record = match registry.get(&candidate.id).await {
            Ok(record) => record,
            Err(RegistryError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        if !record.is_expired(now) {
            debug!(upload_id = %record.id, "Upload no longer expired, skipping");
            continue;
        }

        if let Err(e) = storage.delete(&record.backend_ref).await {
            warn!(
                upload_id = %record.id,
                error = %e,
                "Failed to delete expired upload from storage, will retry"
            );
            report.failed += 1;
            continue;
        }

        match registry.remove(&record.id).await {
            Ok(()) | Err(RegistryError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        debug!(upload_id = %record.id, "Removed expired upload");
        report.removed.push(record);
    }

    Ok(report)
}
