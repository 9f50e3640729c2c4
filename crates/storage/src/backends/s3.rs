//! S3-compatible storage backend using multipart uploads.
//!
//! Layout for an upload with key `{id}` (all under the optional prefix):
//! - `{id}`              the final object, created by CompleteMultipartUpload
//! - `{id}.info`         JSON info record: multipart upload id and committed progress
//! - `{id}.tail.{off}`   buffered bytes ending at committed offset `off`
//!
//! S3 rejects parts smaller than 5 MiB (except the last), so chunks are
//! merged with the buffered bytes and only whole `part_size` parts are
//! uploaded. An append uploads its parts and its new tail first and then
//! rewrites `{id}.info`; until that single write lands the previous commit
//! stays authoritative, so a failed append never exposes a partial offset.
//! Parts numbered past the committed count and tails for other offsets are
//! leftovers of failed appends and are ignored.

use crate::error::{StorageError, StorageResult};
use crate::info::{CommittedParts, INFO_SUFFIX, UploadInfo, validate_key_segment};
use crate::traits::{BackendStatus, ByteStream, StorageBackend};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Part};
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use spool_core::config::{S3_MIN_PART_SIZE, S3Credentials};
use spool_core::{BackendRef, UploadId, UploadMetadata};
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// S3 allows at most 10,000 parts per multipart upload.
const MAX_PARTS: usize = 10_000;

/// Separator between the object key and the multipart upload id in a backend ref.
const REF_SEPARATOR: char = '+';

fn map_s3_operation_error<E>(err: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StorageError::S3(Box::new(err))
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    if let SdkError::ServiceError(service_err) = err {
        return service_err.raw().status().as_u16() == 404;
    }
    false
}

/// Split `data` into whole parts of `part_size` bytes and the remainder.
pub fn split_parts(data: Bytes, part_size: usize) -> (Vec<Bytes>, Bytes) {
    let full = data.len() / part_size;
    let parts = (0..full)
        .map(|i| data.slice(i * part_size..(i + 1) * part_size))
        .collect();
    let remainder = data.slice(full * part_size..);
    (parts, remainder)
}

/// The committed parts out of everything S3 lists for the upload.
pub fn committed_parts(mut parts: Vec<Part>, commit: &CommittedParts) -> StorageResult<Vec<Part>> {
    parts.retain(|p| {
        p.part_number()
            .is_some_and(|n| n >= 1 && n as usize <= commit.parts)
    });
    parts.sort_by_key(|p| p.part_number().unwrap_or(0));
    if parts.len() != commit.parts {
        return Err(StorageError::CorruptInfo(format!(
            "{} committed parts recorded but {} found",
            commit.parts,
            parts.len()
        )));
    }
    Ok(parts)
}

/// Durable multipart state of one upload.
struct MultipartState {
    /// Committed parts, ordered by part number.
    parts: Vec<Part>,
    /// Size of the committed tail object.
    buffered: u64,
    /// The multipart upload is gone and the final object exists.
    completed: bool,
    offset: u64,
}

impl MultipartState {
    fn next_part_number(&self) -> usize {
        self.parts.len() + 1
    }
}

/// S3-compatible upload store using multipart uploads.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    /// Stored endpoint for logging (normalized).
    endpoint: String,
    region: String,
    part_size: u64,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("part_size", &self.part_size)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// # Arguments
    /// * `force_path_style` - Use path-style URLs (`endpoint/bucket/key`) instead of
    ///   virtual-hosted style (`bucket.endpoint/key`). Required for MinIO and some
    ///   S3-compatible services.
    /// * `part_size` - Size of every multipart part except the last. At least 5 MiB.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: String,
        prefix: Option<String>,
        credentials: S3Credentials,
        force_path_style: bool,
        part_size: u64,
    ) -> StorageResult<Self> {
        if part_size < S3_MIN_PART_SIZE {
            return Err(StorageError::Config(format!(
                "s3 part_size {part_size} is below the {S3_MIN_PART_SIZE} byte minimum"
            )));
        }

        let mut s3_config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()))
            .credentials_provider(aws_sdk_s3::config::Credentials::new(
                credentials.access_key_id,
                credentials.secret_access_key,
                None, // session token
                None, // expiration
                "spool-config",
            ));

        let normalized_endpoint = endpoint.as_ref().map(|endpoint_url| {
            // Handle bare host:port endpoints (e.g., "minio:9000") by prepending http://
            let endpoint_lower = endpoint_url.to_lowercase();
            if endpoint_lower.starts_with("http://") || endpoint_lower.starts_with("https://") {
                endpoint_url.clone()
            } else {
                format!("http://{}", endpoint_url)
            }
        });

        if let Some(endpoint_url) = &normalized_endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        let stored_endpoint = match &normalized_endpoint {
            Some(url) => url.clone(),
            None => format!("s3.{}.amazonaws.com", region),
        };

        // Normalize prefix: strip trailing slashes to avoid double-slash keys like "prefix//key"
        let normalized_prefix = prefix.map(|p| p.trim_end_matches('/').to_string());

        Ok(Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalized_prefix,
            endpoint: stored_endpoint,
            region,
            part_size,
        })
    }

    /// Get the full object key for a key (applies prefix if configured).
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, key),
            None => key.to_string(),
        }
    }

    fn info_key(&self, key: &str) -> String {
        self.full_key(&format!("{key}{INFO_SUFFIX}"))
    }

    fn tail_prefix(&self, key: &str) -> String {
        self.full_key(&format!("{key}.tail."))
    }

    fn tail_key(&self, key: &str, offset: u64) -> String {
        format!("{}{offset}", self.tail_prefix(key))
    }

    /// Split a backend ref into the upload key and the multipart upload id.
    fn parse_ref<'a>(&self, backend_ref: &'a BackendRef) -> StorageResult<(&'a str, &'a str)> {
        let (key, upload_id) = backend_ref
            .as_str()
            .split_once(REF_SEPARATOR)
            .ok_or_else(|| StorageError::InvalidRef(backend_ref.to_string()))?;
        validate_key_segment(key)?;
        if upload_id.is_empty() {
            return Err(StorageError::InvalidRef(backend_ref.to_string()));
        }
        Ok((key, upload_id))
    }

    async fn get_bytes(&self, full_key: &str) -> StorageResult<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(full_key)
            .send()
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    StorageError::NotFound(full_key.to_string())
                } else {
                    map_s3_operation_error(e)
                }
            })?;
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?;
        Ok(data.into_bytes())
    }

    async fn put_bytes(&self, full_key: &str, data: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(full_key)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    async fn delete_key(&self, full_key: &str) -> StorageResult<()> {
        // delete_object succeeds on missing keys
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(full_key)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    /// Object size, or `None` if the object does not exist.
    async fn head_size(&self, full_key: &str) -> StorageResult<Option<u64>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(full_key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(output.content_length().unwrap_or(0).max(0) as u64)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(map_s3_operation_error(err)),
        }
    }

    async fn read_info(&self, key: &str) -> StorageResult<UploadInfo> {
        let data = self.get_bytes(&self.info_key(key)).await.map_err(|e| match e {
            StorageError::NotFound(_) => StorageError::NotFound(key.to_string()),
            other => other,
        })?;
        UploadInfo::from_bytes(&data)
    }

    /// All parts of a multipart upload, or `None` once it was completed or aborted.
    async fn list_parts(&self, key: &str, upload_id: &str) -> StorageResult<Option<Vec<Part>>> {
        let object_key = self.full_key(key);
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(&object_key)
                .upload_id(upload_id);
            if let Some(marker) = &marker {
                request = request.part_number_marker(marker);
            }

            let output = match request.send().await {
                Ok(output) => output,
                Err(err) if is_not_found(&err) => return Ok(None),
                Err(err) => return Err(map_s3_operation_error(err)),
            };

            parts.extend(output.parts().iter().cloned());

            marker = match (output.is_truncated(), output.next_part_number_marker()) {
                (Some(true), Some(next)) => Some(next.to_string()),
                _ => break,
            };
        }

        parts.sort_by_key(|p| p.part_number().unwrap_or(0));
        Ok(Some(parts))
    }

    async fn load_state(
        &self,
        key: &str,
        upload_id: &str,
        info: &UploadInfo,
    ) -> StorageResult<MultipartState> {
        match self.list_parts(key, upload_id).await? {
            Some(parts) => {
                let commit = info.committed.unwrap_or_default();
                Ok(MultipartState {
                    parts: committed_parts(parts, &commit)?,
                    buffered: commit.buffered,
                    completed: false,
                    offset: commit.offset,
                })
            }
            None => {
                let size = self
                    .head_size(&self.full_key(key))
                    .await?
                    .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
                Ok(MultipartState {
                    parts: Vec::new(),
                    buffered: 0,
                    completed: true,
                    offset: size,
                })
            }
        }
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: usize,
        data: Bytes,
    ) -> StorageResult<CompletedPart> {
        if part_number > MAX_PARTS {
            return Err(StorageError::Config(format!(
                "upload exceeds the S3 limit of {MAX_PARTS} parts; raise part_size"
            )));
        }
        let part_number = part_number as i32;

        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(upload_id)
            .part_number(part_number)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(CompletedPart::builder()
            .e_tag(output.e_tag().unwrap_or_default())
            .part_number(part_number)
            .build())
    }

    /// Remove every tail object, committed or left over.
    async fn delete_tails(&self, key: &str) -> StorageResult<()> {
        let prefix = self.tail_prefix(key);
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        for object in output.contents() {
            if let Some(object_key) = object.key() {
                self.delete_key(object_key).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    #[instrument(skip(self, metadata), fields(backend = "s3"))]
    async fn create(
        &self,
        id: &UploadId,
        length: Option<u64>,
        metadata: &UploadMetadata,
    ) -> StorageResult<BackendRef> {
        let key = id.to_string();
        let mut info = UploadInfo::new(id, length, metadata);

        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(&key));
        if let Some(content_type) = info.content_type() {
            request = request.content_type(content_type);
        }
        let output = request.send().await.map_err(map_s3_operation_error)?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))?
            .to_string();

        info.multipart_id = Some(upload_id.clone());
        if let Err(e) = self.put_bytes(&self.info_key(&key), info.to_bytes()?).await {
            // Best-effort cleanup of the multipart upload we just started
            let _ = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(self.full_key(&key))
                .upload_id(&upload_id)
                .send()
                .await;
            return Err(e);
        }

        Ok(BackendRef::new(format!("{key}{REF_SEPARATOR}{upload_id}")))
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn append(
        &self,
        backend_ref: &BackendRef,
        offset: u64,
        data: Bytes,
    ) -> StorageResult<u64> {
        let (key, upload_id) = self.parse_ref(backend_ref)?;
        let mut info = self.read_info(key).await?;
        info.check_fits(offset, data.len() as u64)?;

        let state = self.load_state(key, upload_id, &info).await?;
        if state.offset != offset {
            return Err(StorageError::OffsetMismatch {
                stored: state.offset,
                requested: offset,
            });
        }
        if data.is_empty() {
            return Ok(offset);
        }

        let size = data.len() as u64;
        let next = state.next_part_number();
        let old_tail_key = self.tail_key(key, state.offset);

        let combined = if state.buffered > 0 {
            let previous = self.get_bytes(&old_tail_key).await?;
            let mut combined = BytesMut::with_capacity(previous.len() + data.len());
            combined.extend_from_slice(&previous);
            combined.extend_from_slice(&data);
            combined.freeze()
        } else {
            data
        };

        let (parts, remainder) = split_parts(combined, self.part_size as usize);
        let uploaded = parts.len();
        for (i, part) in parts.into_iter().enumerate() {
            self.upload_part(key, upload_id, next + i, part).await?;
        }

        let new_offset = offset + size;
        let buffered = remainder.len() as u64;
        if buffered > 0 {
            self.put_bytes(&self.tail_key(key, new_offset), remainder)
                .await?;
        }

        info.committed = Some(CommittedParts {
            parts: state.parts.len() + uploaded,
            offset: new_offset,
            buffered,
        });
        self.put_bytes(&self.info_key(key), info.to_bytes()?).await?;

        if state.buffered > 0
            && let Err(e) = self.delete_key(&old_tail_key).await
        {
            tracing::warn!(
                key = %old_tail_key,
                error = %e,
                "Failed to delete superseded tail object"
            );
        }

        tracing::debug!(
            key = %key,
            parts_uploaded = uploaded,
            offset = new_offset,
            "S3 append committed"
        );
        Ok(new_offset)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn declare_length(&self, backend_ref: &BackendRef, length: u64) -> StorageResult<()> {
        let (key, _) = self.parse_ref(backend_ref)?;
        let mut info = self.read_info(key).await?;
        info.length = Some(length);
        self.put_bytes(&self.info_key(key), info.to_bytes()?).await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn read_metadata(&self, backend_ref: &BackendRef) -> StorageResult<BackendStatus> {
        let (key, upload_id) = self.parse_ref(backend_ref)?;
        let info = self.read_info(key).await?;
        let state = self.load_state(key, upload_id, &info).await?;
        Ok(BackendStatus {
            offset: state.offset,
            length: info.length,
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn read(&self, backend_ref: &BackendRef) -> StorageResult<ByteStream> {
        let (key, _) = self.parse_ref(backend_ref)?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    StorageError::NotFound(key.to_string())
                } else {
                    map_s3_operation_error(e)
                }
            })?;

        let stream = ReaderStream::new(output.body.into_async_read()).map_err(StorageError::Io);
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, backend_ref: &BackendRef) -> StorageResult<()> {
        let (key, upload_id) = self.parse_ref(backend_ref)?;

        match self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(upload_id)
            .send()
            .await
        {
            Ok(_) => {}
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(map_s3_operation_error(err)),
        }

        self.delete_tails(key).await?;
        self.delete_key(&self.full_key(key)).await?;
        self.delete_key(&self.info_key(key)).await
    }

    /// Upload the buffered tail as the last part and complete the multipart upload.
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn finalize(&self, backend_ref: &BackendRef) -> StorageResult<()> {
        let (key, upload_id) = self.parse_ref(backend_ref)?;
        let info = self.read_info(key).await?;
        let state = self.load_state(key, upload_id, &info).await?;
        if state.completed {
            return Ok(());
        }
        if info.length != Some(state.offset) {
            return Err(StorageError::Incomplete {
                offset: state.offset,
                length: info.length,
            });
        }

        let mut completed_parts: Vec<CompletedPart> = state
            .parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .set_e_tag(p.e_tag().map(str::to_string))
                    .set_part_number(p.part_number())
                    .build()
            })
            .collect();

        let next = state.next_part_number();
        if state.buffered > 0 {
            // The last part may be any size
            let tail = self.get_bytes(&self.tail_key(key, state.offset)).await?;
            completed_parts.push(self.upload_part(key, upload_id, next, tail).await?);
        }

        // Handle zero-byte uploads: S3 multipart requires at least one part,
        // so we abort the multipart upload and use PutObject instead for empty files.
        if completed_parts.is_empty() {
            if let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(self.full_key(key))
                .upload_id(upload_id)
                .send()
                .await
            {
                tracing::warn!(
                    key = %key,
                    upload_id = %upload_id,
                    error = %e,
                    "Failed to abort multipart upload for zero-byte file, orphaned parts may remain"
                );
            }

            self.put_bytes(&self.full_key(key), Bytes::new()).await?;
            return Ok(());
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        if let Err(e) = self.delete_tails(key).await {
            tracing::warn!(key = %key, error = %e, "Failed to clean up buffered parts");
        }

        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                StorageError::Config(format!(
                    "S3 bucket {} is not reachable: {}",
                    self.bucket,
                    map_s3_operation_error(e)
                ))
            })?;
        Ok(())
    }
}
