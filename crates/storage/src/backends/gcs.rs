//! Google Cloud Storage backend using the JSON API.
//!
//! GCS objects are immutable, so an append uploads the chunk as a
//! temporary part object and composes `main + part` back into the main
//! object. The compose is conditional on the generation observed before the
//! write, which turns a lost race into an offset mismatch instead of a
//! silent overwrite.

use crate::error::{StorageError, StorageResult};
use crate::info::{INFO_SUFFIX, UploadInfo, validate_key_segment};
use crate::traits::{BackendStatus, ByteStream, StorageBackend};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use spool_core::{BackendRef, UploadId, UploadMetadata};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::instrument;

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh metadata-server tokens this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Object resource fields used by this backend. GCS encodes 64-bit
/// integers as strings.
#[derive(Debug, Deserialize)]
struct ObjectResource {
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    generation: Option<String>,
}

impl ObjectResource {
    fn size(&self) -> StorageResult<u64> {
        self.size
            .as_deref()
            .unwrap_or("0")
            .parse()
            .map_err(|e| StorageError::CorruptInfo(format!("invalid object size: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Where bearer tokens come from.
enum TokenSource {
    Static(String),
    /// No Authorization header, for local emulators.
    Anonymous,
    /// GCE/GKE metadata server, fetched lazily and cached until near expiry.
    MetadataServer(RwLock<Option<CachedToken>>),
}

/// Google Cloud Storage upload store.
pub struct GcsBackend {
    client: reqwest::Client,
    bucket: String,
    prefix: Option<String>,
    endpoint: String,
    token: TokenSource,
}

impl std::fmt::Debug for GcsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsBackend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Everything except RFC 3986 unreserved characters.
const OBJECT_NAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, OBJECT_NAME).to_string()
}

impl GcsBackend {
    /// Create a new GCS backend.
    ///
    /// Token resolution order: explicit `access_token`, the
    /// `GOOGLE_OAUTH_ACCESS_TOKEN` env var, anonymous access when a custom
    /// endpoint (emulator) is configured, and finally the metadata server.
    pub fn new(
        bucket: &str,
        prefix: Option<String>,
        endpoint: Option<String>,
        access_token: Option<String>,
    ) -> StorageResult<Self> {
        if bucket.is_empty() {
            return Err(StorageError::Config("gcs storage requires a bucket".to_string()));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| StorageError::Config(format!("failed to build HTTP client: {e}")))?;

        let env_token = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());
        let token = match (access_token.or(env_token), endpoint.is_some()) {
            (Some(token), _) => TokenSource::Static(token),
            (None, true) => TokenSource::Anonymous,
            (None, false) => TokenSource::MetadataServer(RwLock::new(None)),
        };

        let endpoint = endpoint
            .map(|e| e.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        Ok(Self {
            client,
            bucket: bucket.to_string(),
            prefix: prefix.map(|p| p.trim_end_matches('/').to_string()),
            endpoint,
            token,
        })
    }

    /// Object name for a key (applies prefix if configured).
    fn object_name(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    fn info_name(&self, key: &str) -> String {
        self.object_name(&format!("{key}{INFO_SUFFIX}"))
    }

    fn bucket_url(&self) -> String {
        format!("{}/storage/v1/b/{}", self.endpoint, encode(&self.bucket))
    }

    fn object_url(&self, name: &str) -> String {
        format!("{}/o/{}", self.bucket_url(), encode(name))
    }

    fn upload_url(&self, name: &str, if_generation_match: Option<&str>) -> String {
        let mut url = format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.endpoint,
            encode(&self.bucket),
            encode(name)
        );
        if let Some(generation) = if_generation_match {
            url.push_str("&ifGenerationMatch=");
            url.push_str(generation);
        }
        url
    }

    fn compose_url(&self, destination: &str, if_generation_match: &str) -> String {
        format!(
            "{}/compose?ifGenerationMatch={}",
            self.object_url(destination),
            if_generation_match
        )
    }

    async fn bearer_token(&self) -> StorageResult<Option<String>> {
        match &self.token {
            TokenSource::Static(token) => Ok(Some(token.clone())),
            TokenSource::Anonymous => Ok(None),
            TokenSource::MetadataServer(cache) => {
                if let Some(cached) = cache.read().await.as_ref()
                    && Instant::now() < cached.refresh_at
                {
                    return Ok(Some(cached.token.clone()));
                }

                let mut guard = cache.write().await;
                if let Some(cached) = guard.as_ref()
                    && Instant::now() < cached.refresh_at
                {
                    return Ok(Some(cached.token.clone()));
                }

                let response = self
                    .client
                    .get(METADATA_TOKEN_URL)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|e| {
                        StorageError::Config(format!(
                            "GCS credentials unavailable: no access token configured and \
                             the metadata server is unreachable: {e}"
                        ))
                    })?;
                let response = Self::check(response, "metadata token").await?;
                let token: MetadataToken = response.json().await?;

                let lifetime = Duration::from_secs(token.expires_in);
                let refresh_at = Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN);
                *guard = Some(CachedToken {
                    token: token.access_token.clone(),
                    refresh_at,
                });
                tracing::debug!(expires_in = token.expires_in, "Refreshed GCS access token");
                Ok(Some(token.access_token))
            }
        }
    }

    async fn authorized(
        &self,
        request: reqwest::RequestBuilder,
    ) -> StorageResult<reqwest::RequestBuilder> {
        Ok(match self.bearer_token().await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    /// Map non-success responses to storage errors.
    async fn check(response: reqwest::Response, name: &str) -> StorageResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(name.to_string()));
        }
        let message = response.text().await.unwrap_or_default();
        Err(StorageError::Remote {
            status: status.as_u16(),
            message,
        })
    }

    async fn stat(&self, name: &str) -> StorageResult<ObjectResource> {
        let request = self.authorized(self.client.get(self.object_url(name))).await?;
        let response = Self::check(request.send().await?, name).await?;
        Ok(response.json().await?)
    }

    async fn upload(
        &self,
        name: &str,
        data: Bytes,
        content_type: &str,
        if_generation_match: Option<&str>,
    ) -> StorageResult<ObjectResource> {
        let request = self
            .authorized(
                self.client
                    .post(self.upload_url(name, if_generation_match))
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(data),
            )
            .await?;
        let response = Self::check(request.send().await?, name).await?;
        Ok(response.json().await?)
    }

    async fn download(&self, name: &str) -> StorageResult<reqwest::Response> {
        let request = self
            .authorized(self.client.get(format!("{}?alt=media", self.object_url(name))))
            .await?;
        Self::check(request.send().await?, name).await
    }

    async fn delete_object(&self, name: &str) -> StorageResult<()> {
        let request = self
            .authorized(self.client.delete(self.object_url(name)))
            .await?;
        match Self::check(request.send().await?, name).await {
            Ok(_) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn compose(
        &self,
        destination: &str,
        sources: &[&str],
        content_type: &str,
        if_generation_match: &str,
    ) -> StorageResult<ObjectResource> {
        let body = serde_json::json!({
            "sourceObjects": sources.iter().map(|name| serde_json::json!({ "name": name })).collect::<Vec<_>>(),
            "destination": { "contentType": content_type },
        });
        let request = self
            .authorized(
                self.client
                    .post(self.compose_url(destination, if_generation_match))
                    .json(&body),
            )
            .await?;
        let response = Self::check(request.send().await?, destination).await?;
        Ok(response.json().await?)
    }

    async fn read_info(&self, key: &str) -> StorageResult<UploadInfo> {
        let data = self.download(&self.info_name(key)).await?.bytes().await?;
        UploadInfo::from_bytes(&data)
    }

    fn key<'a>(&self, backend_ref: &'a BackendRef) -> StorageResult<&'a str> {
        let key = backend_ref.as_str();
        validate_key_segment(key)?;
        Ok(key)
    }
}

fn is_precondition_failed(err: &StorageError) -> bool {
    matches!(err, StorageError::Remote { status: 412, .. })
}

#[async_trait]
impl StorageBackend for GcsBackend {
    #[instrument(skip(self, metadata), fields(backend = "gcs"))]
    async fn create(
        &self,
        id: &UploadId,
        length: Option<u64>,
        metadata: &UploadMetadata,
    ) -> StorageResult<BackendRef> {
        let backend_ref = BackendRef::new(id.to_string());
        let key = self.key(&backend_ref)?;
        let info = UploadInfo::new(id, length, metadata);
        let content_type = info
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();

        // ifGenerationMatch=0 only succeeds if the object does not exist yet
        self.upload(
            &self.info_name(key),
            info.to_bytes()?,
            "application/json",
            Some("0"),
        )
        .await
        .map_err(|e| {
            if is_precondition_failed(&e) {
                StorageError::AlreadyExists(key.to_string())
            } else {
                e
            }
        })?;

        self.upload(&self.object_name(key), Bytes::new(), &content_type, Some("0"))
            .await?;

        Ok(backend_ref)
    }

    #[instrument(skip(self, data), fields(backend = "gcs", size = data.len()))]
    async fn append(
        &self,
        backend_ref: &BackendRef,
        offset: u64,
        data: Bytes,
    ) -> StorageResult<u64> {
        let key = self.key(backend_ref)?;
        let info = self.read_info(key).await?;
        info.check_fits(offset, data.len() as u64)?;

        let main = self.object_name(key);
        let current = self.stat(&main).await?;
        let stored = current.size()?;
        if stored != offset {
            return Err(StorageError::OffsetMismatch {
                stored,
                requested: offset,
            });
        }
        if data.is_empty() {
            return Ok(offset);
        }
        let generation = current
            .generation
            .ok_or_else(|| StorageError::CorruptInfo(format!("{main} has no generation")))?;

        let size = data.len() as u64;
        let content_type = info.content_type().unwrap_or("application/octet-stream");
        let part = self.object_name(&format!("{key}.part.{offset}"));
        self.upload(&part, data, "application/octet-stream", None)
            .await?;

        let composed = self
            .compose(&main, &[&main, &part], content_type, &generation)
            .await;

        if let Err(e) = self.delete_object(&part).await {
            tracing::warn!(
                object = %part,
                error = %e,
                "Failed to delete temporary part object"
            );
        }

        let new_offset = match composed {
            Ok(resource) => resource.size()?,
            Err(e) if is_precondition_failed(&e) => {
                // Someone else wrote between our stat and the compose
                let stored = self.stat(&main).await?.size()?;
                return Err(StorageError::OffsetMismatch {
                    stored,
                    requested: offset,
                });
            }
            Err(e) => return Err(e),
        };

        if new_offset != offset + size {
            return Err(StorageError::CorruptInfo(format!(
                "compose produced {new_offset} bytes, expected {}",
                offset + size
            )));
        }
        Ok(new_offset)
    }

    #[instrument(skip(self), fields(backend = "gcs"))]
    async fn declare_length(&self, backend_ref: &BackendRef, length: u64) -> StorageResult<()> {
        let key = self.key(backend_ref)?;
        let mut info = self.read_info(key).await?;
        info.length = Some(length);
        self.upload(
            &self.info_name(key),
            info.to_bytes()?,
            "application/json",
            None,
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "gcs"))]
    async fn read_metadata(&self, backend_ref: &BackendRef) -> StorageResult<BackendStatus> {
        let key = self.key(backend_ref)?;
        let info = self.read_info(key).await?;
        let offset = self.stat(&self.object_name(key)).await?.size()?;
        Ok(BackendStatus {
            offset,
            length: info.length,
        })
    }

    #[instrument(skip(self), fields(backend = "gcs"))]
    async fn read(&self, backend_ref: &BackendRef) -> StorageResult<ByteStream> {
        let key = self.key(backend_ref)?;
        let response = self.download(&self.object_name(key)).await?;
        Ok(Box::pin(response.bytes_stream().map_err(StorageError::Http)))
    }

    #[instrument(skip(self), fields(backend = "gcs"))]
    async fn delete(&self, backend_ref: &BackendRef) -> StorageResult<()> {
        let key = self.key(backend_ref)?;
        self.delete_object(&self.object_name(key)).await?;
        self.delete_object(&self.info_name(key)).await
    }

    fn backend_name(&self) -> &'static str {
        "gcs"
    }

    async fn health_check(&self) -> StorageResult<()> {
        let request = self.authorized(self.client.get(self.bucket_url())).await?;
        Self::check(request.send().await?, &self.bucket).await?;
        Ok(())
    }
}
