// Filesystem backend behaviour across chunked appends, restarts and deletes

mod common;

use common::{collect_stream, seeded_bytes, sha256_hash};
use spool_core::{UploadId, UploadMetadata};
use spool_storage::{FilesystemBackend, StorageBackend, StorageError};
use tempfile::TempDir;

#[tokio::test]
async fn test_chunked_upload_reassembles_bytes() {
    let temp_dir = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(temp_dir.path()).await.unwrap();

    let data = seeded_bytes(7, 300_000);
    let backend_ref = backend
        .create(
            &UploadId::new(),
            Some(data.len() as u64),
            &UploadMetadata::default(),
        )
        .await
        .unwrap();

    let mut offset = 0u64;
    for chunk in data.chunks(65_537) {
        offset = backend
            .append(&backend_ref, offset, bytes::Bytes::copy_from_slice(chunk))
            .await
            .unwrap();
    }
    assert_eq!(offset, data.len() as u64);

    let status = backend.read_metadata(&backend_ref).await.unwrap();
    assert_eq!(status.offset, data.len() as u64);
    assert_eq!(status.length, Some(data.len() as u64));

    backend.finalize(&backend_ref).await.unwrap();
    let stored = collect_stream(backend.read(&backend_ref).await.unwrap())
        .await
        .unwrap();
    assert_eq!(sha256_hash(&stored), sha256_hash(&data));
}

#[tokio::test]
async fn test_offset_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let data = seeded_bytes(11, 4096);

    let backend_ref = {
        let backend = FilesystemBackend::new(temp_dir.path()).await.unwrap();
        let backend_ref = backend
            .create(&UploadId::new(), Some(4096), &UploadMetadata::default())
            .await
            .unwrap();
        backend
            .append(&backend_ref, 0, data.slice(..1000))
            .await
            .unwrap();
        backend_ref
    };

    // A fresh instance over the same directory sees the durable offset
    let backend = FilesystemBackend::new(temp_dir.path()).await.unwrap();
    let status = backend.read_metadata(&backend_ref).await.unwrap();
    assert_eq!(status.offset, 1000);

    let offset = backend
        .append(&backend_ref, 1000, data.slice(1000..))
        .await
        .unwrap();
    assert_eq!(offset, 4096);
}

#[tokio::test]
async fn test_resend_of_committed_chunk_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(temp_dir.path()).await.unwrap();
    let data = seeded_bytes(3, 200);

    let backend_ref = backend
        .create(&UploadId::new(), Some(200), &UploadMetadata::default())
        .await
        .unwrap();
    backend
        .append(&backend_ref, 0, data.slice(..100))
        .await
        .unwrap();

    match backend.append(&backend_ref, 0, data.slice(..100)).await {
        Err(StorageError::OffsetMismatch { stored, requested }) => {
            assert_eq!(stored, 100);
            assert_eq!(requested, 0);
        }
        other => panic!("expected offset mismatch, got {other:?}"),
    }

    // The rejected write left nothing behind
    let status = backend.read_metadata(&backend_ref).await.unwrap();
    assert_eq!(status.offset, 100);
}

#[tokio::test]
async fn test_deferred_length_then_declared() {
    let temp_dir = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(temp_dir.path()).await.unwrap();

    let backend_ref = backend
        .create(&UploadId::new(), None, &UploadMetadata::default())
        .await
        .unwrap();
    backend
        .append(&backend_ref, 0, bytes::Bytes::from_static(b"abc"))
        .await
        .unwrap();
    assert_eq!(backend.read_metadata(&backend_ref).await.unwrap().length, None);

    backend.declare_length(&backend_ref, 5).await.unwrap();
    assert!(matches!(
        backend
            .append(&backend_ref, 3, bytes::Bytes::from_static(b"defg"))
            .await,
        Err(StorageError::LengthExceeded { .. })
    ));
    let offset = backend
        .append(&backend_ref, 3, bytes::Bytes::from_static(b"de"))
        .await
        .unwrap();
    assert_eq!(offset, 5);
}

#[tokio::test]
async fn test_delete_then_read_is_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(temp_dir.path()).await.unwrap();

    let backend_ref = backend
        .create(&UploadId::new(), Some(1), &UploadMetadata::default())
        .await
        .unwrap();
    backend.delete(&backend_ref).await.unwrap();
    backend.delete(&backend_ref).await.unwrap();

    assert!(matches!(
        backend.read_metadata(&backend_ref).await,
        Err(StorageError::NotFound(_))
    ));
    assert!(matches!(
        backend.read(&backend_ref).await,
        Err(StorageError::NotFound(_))
    ));
}
