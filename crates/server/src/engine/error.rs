//! Protocol engine error types.

use spool_registry::RegistryError;
use spool_storage::StorageError;
use thiserror::Error;

/// Errors raised by the upload protocol engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("upload id already exists: {0}")]
    DuplicateId(String),

    #[error("offset conflict: upload is at {current}, request sent {requested}")]
    OffsetConflict { current: u64, requested: u64 },

    #[error("offset regression: registry is at {current}, backend reported {requested}")]
    OffsetRegression { current: u64, requested: u64 },

    #[error("declared length {length} is smaller than the {offset} bytes already stored")]
    LengthTooSmall { length: u64, offset: u64 },

    #[error("upload size limit exceeded: {0}")]
    LengthExceeded(String),

    #[error("invalid upload state: {0}")]
    InvalidState(String),

    #[error("unsupported capability: {0}")]
    UnsupportedCapability(String),

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("invalid content type: expected application/offset+octet-stream, got {0}")]
    ContentTypeInvalid(String),

    #[error("upload expired: {0}")]
    Expired(String),

    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable error code for logs, metrics and response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::DuplicateId(_) => "duplicate_id",
            Self::OffsetConflict { .. } => "offset_conflict",
            Self::OffsetRegression { .. } => "offset_regression",
            Self::LengthTooSmall { .. } => "length_too_small",
            Self::LengthExceeded(_) => "length_exceeded",
            Self::InvalidState(_) => "invalid_state",
            Self::UnsupportedCapability(_) => "unsupported_capability",
            Self::ChecksumMismatch(_) => "checksum_mismatch",
            Self::ContentTypeInvalid(_) => "content_type_invalid",
            Self::Expired(_) => "expired",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => Self::NotFound(key),
            StorageError::AlreadyExists(key) => Self::DuplicateId(key),
            StorageError::OffsetMismatch { stored, requested } => Self::OffsetConflict {
                current: stored,
                requested,
            },
            e @ StorageError::LengthExceeded { .. } => Self::LengthExceeded(e.to_string()),
            e @ StorageError::Incomplete { .. } => Self::InvalidState(e.to_string()),
            e if e.is_transient() => Self::BackendUnavailable(e.to_string()),
            e => Self::Internal(e.to_string()),
        }
    }
}

impl From<RegistryError> for EngineError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => Self::NotFound(id),
            RegistryError::DuplicateId(id) => Self::DuplicateId(id),
            RegistryError::OffsetRegression { current, requested } => {
                Self::OffsetRegression { current, requested }
            }
            RegistryError::LengthAlreadySet(id) => {
                Self::InvalidState(format!("upload {id} already has a length"))
            }
            e => Self::Internal(e.to_string()),
        }
    }
}

impl From<spool_core::Error> for EngineError {
    fn from(err: spool_core::Error) -> Self {
        match err {
            e @ spool_core::Error::ChecksumMismatch { .. } => Self::ChecksumMismatch(e.to_string()),
            e @ spool_core::Error::UnsupportedChecksum(_) => {
                Self::UnsupportedCapability(e.to_string())
            }
            e => Self::Internal(e.to_string()),
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
