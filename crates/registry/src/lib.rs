//! Upload registry for spool.
//!
//! This crate provides:
//! - The `UploadRegistry` trait, the source of truth for upload records
//! - SQLite and in-memory implementations
//! - The per-upload lock table shared by request handlers and the reaper
//! - The expiration sweep

pub mod error;
pub mod locks;
pub mod memory;
pub mod models;
pub mod store;
pub mod sweep;

pub use error::{RegistryError, RegistryResult};
pub use locks::{LockTable, UploadLock};
pub use memory::MemoryRegistry;
pub use store::{SqliteRegistry, UploadRegistry};
pub use sweep::{SweepReport, sweep_expired};

use spool_core::config::RegistryConfig;
use std::sync::Arc;

/// Create an upload registry from configuration.
pub async fn from_config(config: &RegistryConfig) -> RegistryResult<Arc<dyn UploadRegistry>> {
    match config {
        RegistryConfig::Memory => {
            tracing::warn!("Using in-memory upload registry, uploads will not survive a restart");
            Ok(Arc::new(MemoryRegistry::new()) as Arc<dyn UploadRegistry>)
        }
        RegistryConfig::Sqlite { path } => {
            let registry = SqliteRegistry::new(path).await?;
            Ok(Arc::new(registry) as Arc<dyn UploadRegistry>)
        }
    }
}
