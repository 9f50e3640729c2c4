//! Registry error types.

use thiserror::Error;

/// Upload registry operation errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("upload id already registered: {0}")]
    DuplicateId(String),

    #[error("offset regression: current offset is {current}, update requested {requested}")]
    OffsetRegression { current: u64, requested: u64 },

    #[error("upload length already set: {0}")]
    LengthAlreadySet(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
