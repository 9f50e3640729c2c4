// S3 multipart backend against a MinIO container. Set SKIP_S3_TESTS to skip.

mod common;

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Credentials;
use bytes::Bytes;
use common::{collect_stream, seeded_bytes, sha256_hash};
use spool_core::config::{S3_MIN_PART_SIZE, S3Credentials};
use spool_core::{UploadId, UploadMetadata};
use spool_storage::{S3Backend, StorageBackend, StorageError};
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::{ContainerAsync, GenericImage, ImageExt, runners::AsyncRunner};

const MINIO_IMAGE: &str = "minio/minio";
const MINIO_TAG: &str = "RELEASE.2024-02-12T21-36-45Z";
const BUCKET: &str = "spool-test";
const PART_SIZE: u64 = S3_MIN_PART_SIZE;

fn should_skip_s3_tests() -> bool {
    std::env::var("SKIP_S3_TESTS").is_ok()
}

struct MinioContext {
    _container: ContainerAsync<GenericImage>,
    endpoint: String,
    access_key: String,
    secret_key: String,
}

impl MinioContext {
    async fn new() -> Result<Self, String> {
        let access_key = "minio-access-key".to_string();
        let secret_key = "minio-secret-key".to_string();

        let container: ContainerAsync<GenericImage> = GenericImage::new(MINIO_IMAGE, MINIO_TAG)
            .with_exposed_port(9000.tcp())
            .with_wait_for(WaitFor::message_on_stdout("API:"))
            .with_env_var("MINIO_ROOT_USER", access_key.clone())
            .with_env_var("MINIO_ROOT_PASSWORD", secret_key.clone())
            .with_cmd(vec!["server", "/data"])
            .start()
            .await
            .map_err(|e| format!("failed to start MinIO container: {e}"))?;

        let host = container
            .get_host()
            .await
            .map_err(|e| format!("failed to get host: {e}"))?;
        let port = container
            .get_host_port_ipv4(9000.tcp())
            .await
            .map_err(|e| format!("failed to get port: {e}"))?;

        Ok(Self {
            _container: container,
            endpoint: format!("http://{host}:{port}"),
            access_key,
            secret_key,
        })
    }

    fn client(&self) -> Client {
        let credentials = Credentials::new(
            self.access_key.clone(),
            self.secret_key.clone(),
            None,
            None,
            "test",
        );
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new("us-east-1"))
            .credentials_provider(credentials)
            .endpoint_url(self.endpoint.clone())
            .force_path_style(true)
            .build();
        Client::from_conf(config)
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), String> {
        self.client()
            .create_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| format!("failed to create bucket: {e}"))?;
        Ok(())
    }
}

struct S3TestHarness {
    context: MinioContext,
    backend: S3Backend,
}

impl S3TestHarness {
    async fn new(prefix: Option<String>) -> Result<Self, String> {
        let context = MinioContext::new().await?;
        context.create_bucket(BUCKET).await?;

        let backend = S3Backend::new(
            BUCKET,
            Some(context.endpoint.clone()),
            "us-east-1".to_string(),
            prefix,
            S3Credentials {
                access_key_id: context.access_key.clone(),
                secret_access_key: context.secret_key.clone(),
            },
            true,
            PART_SIZE,
        )
        .await
        .map_err(|e| format!("failed to create S3 backend: {e}"))?;

        Ok(Self {
            context,
            backend,
        })
    }
}

#[tokio::test]
async fn test_s3_chunked_upload_spanning_parts() {
    if should_skip_s3_tests() {
        return;
    }
    let harness = S3TestHarness::new(Some("uploads/".to_string()))
        .await
        .expect("failed to start S3 harness");
    let backend = &harness.backend;

    // One full part plus a short tail, sent in chunks that straddle the part boundary
    let data = seeded_bytes(11, PART_SIZE as usize + 300_000);
    let backend_ref = backend
        .create(
            &UploadId::new(),
            Some(data.len() as u64),
            &UploadMetadata::default(),
        )
        .await
        .unwrap();

    let chunk_size = 3 * 1024 * 1024;
    let mut offset = 0u64;
    for chunk in data.chunks(chunk_size) {
        offset = backend
            .append(&backend_ref, offset, Bytes::copy_from_slice(chunk))
            .await
            .unwrap();
        let status = backend.read_metadata(&backend_ref).await.unwrap();
        assert_eq!(status.offset, offset);
    }
    assert_eq!(offset, data.len() as u64);

    backend.finalize(&backend_ref).await.unwrap();
    // Finalize is idempotent once the multipart upload is completed
    backend.finalize(&backend_ref).await.unwrap();

    let stored = collect_stream(backend.read(&backend_ref).await.unwrap())
        .await
        .unwrap();
    assert_eq!(stored.len(), data.len());
    assert_eq!(sha256_hash(&stored), sha256_hash(&data));
}

#[tokio::test]
async fn test_s3_rejects_stale_offset() {
    if should_skip_s3_tests() {
        return;
    }
    let harness = S3TestHarness::new(None)
        .await
        .expect("failed to start S3 harness");
    let backend = &harness.backend;

    let backend_ref = backend
        .create(&UploadId::new(), Some(64), &UploadMetadata::default())
        .await
        .unwrap();
    backend
        .append(&backend_ref, 0, seeded_bytes(1, 16))
        .await
        .unwrap();

    let err = backend
        .append(&backend_ref, 0, seeded_bytes(2, 16))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::OffsetMismatch {
            stored: 16,
            requested: 0
        }
    ));

    let err = backend
        .append(&backend_ref, 16, seeded_bytes(3, 100))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::LengthExceeded { .. }));

    let err = backend.finalize(&backend_ref).await.unwrap_err();
    assert!(matches!(err, StorageError::Incomplete { offset: 16, .. }));
}

#[tokio::test]
async fn test_s3_deferred_length_and_delete() {
    if should_skip_s3_tests() {
        return;
    }
    let harness = S3TestHarness::new(None)
        .await
        .expect("failed to start S3 harness");
    let backend = &harness.backend;

    let backend_ref = backend
        .create(&UploadId::new(), None, &UploadMetadata::default())
        .await
        .unwrap();
    let data = seeded_bytes(5, 1000);
    backend
        .append(&backend_ref, 0, data.clone())
        .await
        .unwrap();
    assert_eq!(
        backend.read_metadata(&backend_ref).await.unwrap().length,
        None
    );

    backend.declare_length(&backend_ref, 1000).await.unwrap();
    backend.finalize(&backend_ref).await.unwrap();
    let stored = collect_stream(backend.read(&backend_ref).await.unwrap())
        .await
        .unwrap();
    assert_eq!(stored, data);

    backend.delete(&backend_ref).await.unwrap();
    assert!(matches!(
        backend.read(&backend_ref).await,
        Err(StorageError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_s3_zero_length_upload() {
    if should_skip_s3_tests() {
        return;
    }
    let harness = S3TestHarness::new(None)
        .await
        .expect("failed to start S3 harness");
    let backend = &harness.backend;

    let backend_ref = backend
        .create(&UploadId::new(), Some(0), &UploadMetadata::default())
        .await
        .unwrap();
    backend.finalize(&backend_ref).await.unwrap();

    let stored = collect_stream(backend.read(&backend_ref).await.unwrap())
        .await
        .unwrap();
    assert!(stored.is_empty());
}

#[tokio::test]
async fn test_s3_uncommitted_append_is_invisible() {
    if should_skip_s3_tests() {
        return;
    }
    let harness = S3TestHarness::new(None)
        .await
        .expect("failed to start S3 harness");
    let backend = &harness.backend;
    let client = harness.context.client();

    let backend_ref = backend
        .create(&UploadId::new(), None, &UploadMetadata::default())
        .await
        .unwrap();
    let (key, upload_id) = backend_ref.as_str().split_once('+').unwrap();

    let head = seeded_bytes(21, 1000);
    backend.append(&backend_ref, 0, head.clone()).await.unwrap();

    // Leftovers of an append that uploaded a part and a tail but never
    // rewrote the info object
    client
        .upload_part()
        .bucket(BUCKET)
        .key(key)
        .upload_id(upload_id)
        .part_number(1)
        .body(seeded_bytes(22, PART_SIZE as usize).into())
        .send()
        .await
        .unwrap();
    client
        .put_object()
        .bucket(BUCKET)
        .key(format!("{key}.tail.{}", 1000 + PART_SIZE + 7))
        .body(seeded_bytes(23, 7).into())
        .send()
        .await
        .unwrap();

    let status = backend.read_metadata(&backend_ref).await.unwrap();
    assert_eq!(status.offset, 1000);
    let err = backend
        .append(&backend_ref, 1000 + PART_SIZE + 7, seeded_bytes(24, 8))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::OffsetMismatch { stored: 1000, .. }));

    // The retried append replaces the stray part
    let rest = seeded_bytes(25, PART_SIZE as usize);
    let offset = backend
        .append(&backend_ref, 1000, rest.clone())
        .await
        .unwrap();
    assert_eq!(offset, 1000 + PART_SIZE);

    backend.declare_length(&backend_ref, offset).await.unwrap();
    backend.finalize(&backend_ref).await.unwrap();
    let stored = collect_stream(backend.read(&backend_ref).await.unwrap())
        .await
        .unwrap();
    let mut expected = head.to_vec();
    expected.extend_from_slice(&rest);
    assert_eq!(sha256_hash(&stored), sha256_hash(&expected));
}
