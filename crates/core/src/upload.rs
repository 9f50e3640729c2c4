//! Upload records and lifecycle.

use crate::metadata::UploadMetadata;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Unique identifier for an upload.
///
/// Rendered as 32 lowercase hex characters so it can be used directly as a
/// URL path segment and as a storage key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse from a string (simple or hyphenated form).
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidUploadId(format!("{s}: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0.simple())
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Opaque handle a storage backend uses to locate an upload's bytes.
///
/// Only the backend that produced it interprets the contents.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendRef(String);

impl BackendRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BackendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackendRef({})", self.0)
    }
}

impl fmt::Display for BackendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upload lifecycle state, derived from a record's length and offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    /// Length known, no bytes received yet.
    Created,
    /// Length not declared yet. Appends are accepted, completion is not.
    Deferred,
    /// Some bytes received, more expected.
    InProgress,
    /// All declared bytes received.
    Complete,
}

impl UploadState {
    /// Check if the upload can still receive bytes.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Check if the upload reached its terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// One in-progress or completed upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    /// Unique upload identifier.
    pub id: UploadId,
    /// Declared total length. `None` while the length is deferred.
    pub length: Option<u64>,
    /// Bytes durably stored so far.
    pub offset: u64,
    /// Client-supplied metadata, immutable after creation.
    pub metadata: UploadMetadata,
    /// Storage backend handle.
    pub backend_ref: BackendRef,
    /// When the upload was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// When an incomplete upload becomes eligible for removal.
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl UploadRecord {
    /// Create a record for a freshly allocated upload.
    pub fn new(
        id: UploadId,
        length: Option<u64>,
        metadata: UploadMetadata,
        backend_ref: BackendRef,
        now: OffsetDateTime,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            id,
            length,
            offset: 0,
            metadata,
            backend_ref,
            created_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> UploadState {
        match self.length {
            None => UploadState::Deferred,
            Some(length) if self.offset >= length => UploadState::Complete,
            Some(_) if self.offset == 0 => UploadState::Created,
            Some(_) => UploadState::InProgress,
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.length.is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.state() == UploadState::Complete
    }

    /// Bytes still expected, or `None` while the length is deferred.
    pub fn remaining(&self) -> Option<u64> {
        self.length.map(|length| length.saturating_sub(self.offset))
    }

    /// Check if the upload has expired. Completed uploads never expire.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        !self.is_complete() && self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}
