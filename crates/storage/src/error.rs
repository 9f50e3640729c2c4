//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("upload already exists: {0}")]
    AlreadyExists(String),

    #[error("offset mismatch: stored offset is {stored}, write requested at {requested}")]
    OffsetMismatch { stored: u64, requested: u64 },

    #[error("write of {size} bytes at offset {offset} exceeds declared length {length}")]
    LengthExceeded { offset: u64, size: u64, length: u64 },

    #[error("upload is incomplete: {offset} of {length:?} bytes stored")]
    Incomplete { offset: u64, length: Option<u64> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote storage returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid backend reference: {0}")]
    InvalidRef(String),

    #[error("corrupt upload info: {0}")]
    CorruptInfo(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether the caller may retry the same request later.
    ///
    /// Offset mismatches are never retryable as-is: the client has to
    /// re-query the offset first.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::S3(_) | Self::Http(_) | Self::Remote { .. } | Self::Timeout(_)
        )
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
