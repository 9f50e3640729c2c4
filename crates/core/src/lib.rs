//! Core domain types for the spool resumable upload server.
//!
//! This crate defines the data model shared by the other crates:
//! - Upload identifiers, records and lifecycle state
//! - `Upload-Metadata` and `Upload-Checksum` codecs
//! - Protocol constants and capability negotiation
//! - Configuration

pub mod checksum;
pub mod config;
pub mod error;
pub mod metadata;
pub mod protocol;
pub mod upload;

pub use checksum::{ChecksumAlgorithm, ChunkChecksum};
pub use error::{Error, Result};
pub use metadata::UploadMetadata;
pub use protocol::{Capabilities, Extension, TUS_VERSION};
pub use upload::{BackendRef, UploadId, UploadRecord, UploadState};

/// Default request body limit for a single chunk: 64 MiB
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;
