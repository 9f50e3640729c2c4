//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid upload id: {0}")]
    InvalidUploadId(String),

    #[error("invalid upload metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid checksum header: {0}")]
    InvalidChecksum(String),

    #[error("unsupported checksum algorithm: {0}")]
    UnsupportedChecksum(String),

    #[error("checksum mismatch ({algorithm}): expected {expected}, got {actual}")]
    ChecksumMismatch {
        algorithm: String,
        expected: String,
        actual: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
