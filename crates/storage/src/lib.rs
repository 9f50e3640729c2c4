//! Upload storage backends for spool.
//!
//! This crate provides:
//! - The `StorageBackend` contract for resumable, offset-checked appends
//! - A JSON info record stored next to each upload
//! - Backends: local filesystem, Google Cloud Storage and S3 multipart

pub mod backends;
pub mod error;
pub mod info;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, gcs::GcsBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use info::{CommittedParts, UploadInfo};
pub use traits::{BackendStatus, ByteStream, StorageBackend};

use spool_core::config::StorageConfig;
use std::sync::Arc;

/// Create a storage backend from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::Gcs {
            bucket,
            prefix,
            endpoint,
            access_token,
        } => {
            let backend = GcsBackend::new(
                bucket,
                prefix.clone(),
                endpoint.clone(),
                access_token.clone(),
            )?;
            Ok(Arc::new(backend))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            prefix,
            force_path_style,
            part_size,
            ..
        } => {
            let credentials = config
                .s3_credentials()
                .map_err(StorageError::Config)?
                .ok_or_else(|| StorageError::Config("s3 credentials missing".to_string()))?;
            let region = config
                .s3_region()
                .ok_or_else(|| StorageError::Config("s3 region missing".to_string()))?;
            let backend = S3Backend::new(
                bucket,
                endpoint.clone(),
                region,
                prefix.clone(),
                credentials,
                *force_path_style,
                *part_size,
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}
