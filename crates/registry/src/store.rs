//! Upload registry trait and SQLite implementation.

use crate::error::{RegistryError, RegistryResult};
use crate::models::{UploadRow, to_db_int};
use async_trait::async_trait;
use spool_core::{UploadId, UploadRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// Source of truth for upload records.
///
/// Implementations only enforce per-record invariants (unique ids, monotonic
/// offsets, write-once lengths). Serializing operations on one upload is the
/// caller's job, see [`crate::LockTable`].
#[async_trait]
pub trait UploadRegistry: Send + Sync {
    /// Store a new record. Fails with `DuplicateId` if the id is taken.
    async fn register(&self, record: &UploadRecord) -> RegistryResult<()>;

    /// Fetch a record by id.
    async fn get(&self, id: &UploadId) -> RegistryResult<UploadRecord>;

    /// Move the offset forward and return the updated record.
    ///
    /// Fails with `OffsetRegression` if `new_offset` is below the stored offset.
    async fn update_offset(&self, id: &UploadId, new_offset: u64) -> RegistryResult<UploadRecord>;

    /// Set the length of a deferred upload and return the updated record.
    async fn set_length(&self, id: &UploadId, length: u64) -> RegistryResult<UploadRecord>;

    /// Replace the expiry timestamp.
    async fn set_expiry(
        &self,
        id: &UploadId,
        expires_at: Option<OffsetDateTime>,
    ) -> RegistryResult<()>;

    /// Remove a record. Fails with `NotFound` if it does not exist.
    async fn remove(&self, id: &UploadId) -> RegistryResult<()>;

    /// Incomplete uploads whose expiry is at or before `now`, oldest first.
    async fn list_expired(&self, now: OffsetDateTime, limit: u32)
    -> RegistryResult<Vec<UploadRecord>>;

    /// Number of registered uploads.
    async fn count(&self) -> RegistryResult<u64>;

    /// Check connectivity.
    async fn health_check(&self) -> RegistryResult<()>;

    /// Short name for logs ("memory", "sqlite").
    fn kind(&self) -> &'static str;
}

/// SQLite-backed upload registry.
pub struct SqliteRegistry {
    pool: Pool<Sqlite>,
}

impl SqliteRegistry {
    /// Open (or create) the registry database at `path`.
    pub async fn new(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; using a single connection avoids
            // persistent "database is locked" failures under axum concurrency.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let registry = Self { pool };
        registry.migrate().await?;
        Ok(registry)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn migrate(&self) -> RegistryResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch_row(
        &self,
        executor: impl sqlx::SqliteExecutor<'_>,
        id: &UploadId,
    ) -> RegistryResult<UploadRow> {
        sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE upload_id = ?")
            .bind(id.as_uuid())
            .fetch_optional(executor)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl UploadRegistry for SqliteRegistry {
    async fn register(&self, record: &UploadRecord) -> RegistryResult<()> {
        let row = UploadRow::from_record(record)?;
        let result = sqlx::query(
            r#"
            INSERT INTO uploads (
                upload_id, upload_length, upload_offset, metadata,
                backend_ref, created_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.upload_id)
        .bind(row.upload_length)
        .bind(row.upload_offset)
        .bind(&row.metadata)
        .bind(&row.backend_ref)
        .bind(row.created_at)
        .bind(row.expires_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(RegistryError::DuplicateId(record.id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &UploadId) -> RegistryResult<UploadRecord> {
        self.fetch_row(&self.pool, id).await?.into_record()
    }

    async fn update_offset(&self, id: &UploadId, new_offset: u64) -> RegistryResult<UploadRecord> {
        // Read-compare-write inside one transaction so a concurrent writer on
        // another connection cannot slip a smaller offset in between.
        let mut tx = self.pool.begin().await?;

        let mut record = self.fetch_row(&mut *tx, id).await?.into_record()?;
        if new_offset < record.offset {
            return Err(RegistryError::OffsetRegression {
                current: record.offset,
                requested: new_offset,
            });
        }

        sqlx::query("UPDATE uploads SET upload_offset = ? WHERE upload_id = ?")
            .bind(to_db_int(new_offset)?)
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        record.offset = new_offset;
        Ok(record)
    }

    async fn set_length(&self, id: &UploadId, length: u64) -> RegistryResult<UploadRecord> {
        let result = sqlx::query(
            "UPDATE uploads SET upload_length = ? WHERE upload_id = ? AND upload_length IS NULL",
        )
        .bind(to_db_int(length)?)
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing record from one whose length is already set
            self.fetch_row(&self.pool, id).await?;
            return Err(RegistryError::LengthAlreadySet(id.to_string()));
        }

        self.get(id).await
    }

    async fn set_expiry(
        &self,
        id: &UploadId,
        expires_at: Option<OffsetDateTime>,
    ) -> RegistryResult<()> {
        let result = sqlx::query("UPDATE uploads SET expires_at = ? WHERE upload_id = ?")
            .bind(expires_at)
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn remove(&self, id: &UploadId) -> RegistryResult<()> {
        let result = sqlx::query("DELETE FROM uploads WHERE upload_id = ?")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_expired(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> RegistryResult<Vec<UploadRecord>> {
        let rows = sqlx::query_as::<_, UploadRow>(
            r#"
            SELECT * FROM uploads
            WHERE expires_at IS NOT NULL
              AND expires_at <= ?
              AND (upload_length IS NULL OR upload_offset < upload_length)
            ORDER BY expires_at
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(UploadRow::into_record).collect()
    }

    async fn count(&self) -> RegistryResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM uploads")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn health_check(&self) -> RegistryResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "sqlite"
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS uploads (
    upload_id BLOB PRIMARY KEY,
    upload_length INTEGER,
    upload_offset INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL,
    backend_ref TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_uploads_expires_at ON uploads(expires_at) WHERE expires_at IS NOT NULL;
"#;
