//! Per-upload info record persisted next to the upload bytes.
//!
//! Every backend keeps a small JSON document beside the data so the
//! declared length and metadata can be recovered from storage alone.

use crate::error::{StorageError, StorageResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use spool_core::{UploadId, UploadMetadata};
use time::OffsetDateTime;

/// Suffix of the info object for an upload.
pub const INFO_SUFFIX: &str = ".info";

/// Stored description of an upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInfo {
    pub id: String,
    /// Declared total length, `None` while deferred.
    pub length: Option<u64>,
    #[serde(default)]
    pub metadata: UploadMetadata,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Backend-specific handle (e.g., the S3 multipart upload id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipart_id: Option<String>,
    /// Multipart progress that is visible to readers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed: Option<CommittedParts>,
}

/// Durable progress of a multipart upload.
///
/// Rewriting the info object is the commit point of an append: parts and
/// buffered bytes written before it are ignored until it lands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedParts {
    /// Parts `1..=parts` belong to the upload.
    pub parts: usize,
    /// Bytes committed, including the buffered tail.
    pub offset: u64,
    /// Size of the tail object not yet uploaded as a part.
    pub buffered: u64,
}

impl UploadInfo {
    pub fn new(id: &UploadId, length: Option<u64>, metadata: &UploadMetadata) -> Self {
        Self {
            id: id.to_string(),
            length,
            metadata: metadata.clone(),
            created_at: OffsetDateTime::now_utc(),
            multipart_id: None,
            committed: None,
        }
    }

    pub fn to_bytes(&self) -> StorageResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| StorageError::CorruptInfo(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> StorageResult<Self> {
        serde_json::from_slice(data).map_err(|e| StorageError::CorruptInfo(e.to_string()))
    }

    /// Reject a write that would run past the declared length.
    pub fn check_fits(&self, offset: u64, size: u64) -> StorageResult<()> {
        if let Some(length) = self.length
            && offset.saturating_add(size) > length
        {
            return Err(StorageError::LengthExceeded {
                offset,
                size,
                length,
            });
        }
        Ok(())
    }

    /// Content type recorded by the client, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.metadata
            .get("filetype")
            .or_else(|| self.metadata.get("contentType"))
    }
}

/// Validate that a backend reference is a single safe key segment.
pub fn validate_key_segment(key: &str) -> StorageResult<()> {
    if key.is_empty()
        || key.contains("..")
        || key.contains('/')
        || key.contains('\\')
        || key.chars().any(|c| c.is_control())
    {
        return Err(StorageError::InvalidKey(format!(
            "unsafe key segment: {key:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_json_roundtrip() {
        let mut metadata = UploadMetadata::new();
        metadata.insert("filetype", Some("image/png".to_string()));
        let info = UploadInfo::new(&UploadId::new(), Some(42), &metadata);

        let decoded = UploadInfo::from_bytes(&info.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, info);
        assert_eq!(decoded.content_type(), Some("image/png"));
    }

    #[test]
    fn test_corrupt_info_is_reported() {
        assert!(matches!(
            UploadInfo::from_bytes(b"{not json"),
            Err(StorageError::CorruptInfo(_))
        ));
    }

    #[test]
    fn test_check_fits() {
        let info = UploadInfo::new(&UploadId::new(), Some(10), &UploadMetadata::new());
        assert!(info.check_fits(0, 10).is_ok());
        assert!(info.check_fits(5, 6).is_err());

        let deferred = UploadInfo::new(&UploadId::new(), None, &UploadMetadata::new());
        assert!(deferred.check_fits(u64::MAX - 1, 1).is_ok());
    }

    #[test]
    fn test_validate_key_segment() {
        assert!(validate_key_segment("0123abcd").is_ok());
        assert!(validate_key_segment("").is_err());
        assert!(validate_key_segment("../etc").is_err());
        assert!(validate_key_segment("a/b").is_err());
        assert!(validate_key_segment("a\\b").is_err());
    }
}
