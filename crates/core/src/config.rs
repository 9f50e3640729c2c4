//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Minimum part size accepted by S3 multipart uploads (5 MiB).
pub const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum part size accepted by S3 multipart uploads (5 GiB).
pub const S3_MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:1080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// Allowed CORS origins. Empty means any origin.
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
}

fn default_bind() -> String {
    "127.0.0.1:1080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
            cors_allowed_origins: Vec::new(),
        }
    }
}

/// Upload protocol configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Path the upload collection is mounted at (e.g., "/files").
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Absolute URL prefix used when building `Location` headers
    /// (e.g., "https://uploads.example.com"). Falls back to the request `Host`.
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// Largest upload accepted, in bytes. `None` means unlimited.
    #[serde(default)]
    pub max_size: Option<u64>,
    /// Largest request body accepted for a single chunk, in bytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Accept `Upload-Defer-Length` on creation.
    #[serde(default = "default_true")]
    pub allow_defer_length: bool,
    /// Accept `DELETE` requests.
    #[serde(default = "default_true")]
    pub enable_termination: bool,
    /// Accept a first chunk in the body of the creation request.
    #[serde(default = "default_true")]
    pub enable_creation_with_upload: bool,
    /// Checksum algorithms advertised in `Tus-Checksum-Algorithm`.
    /// An empty list disables the checksum extension.
    #[serde(default = "default_checksum_algorithms")]
    pub checksum_algorithms: Vec<String>,
    /// Timeout for a single chunk write to the storage backend, in seconds.
    #[serde(default = "default_append_timeout_secs")]
    pub append_timeout_secs: u64,
    /// Timeout for finalizing a completed upload, in seconds.
    /// Multipart commits can take far longer than a single chunk write.
    #[serde(default = "default_finalize_timeout_secs")]
    pub finalize_timeout_secs: u64,
}

fn default_base_path() -> String {
    "/files".to_string()
}

fn default_max_chunk_size() -> u64 {
    crate::DEFAULT_MAX_CHUNK_SIZE
}

fn default_true() -> bool {
    true
}

fn default_checksum_algorithms() -> Vec<String> {
    vec!["sha1".to_string(), "sha256".to_string()]
}

fn default_append_timeout_secs() -> u64 {
    300 // 5 minutes
}

fn default_finalize_timeout_secs() -> u64 {
    1800 // 30 minutes
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            public_base_url: None,
            max_size: None,
            max_chunk_size: default_max_chunk_size(),
            allow_defer_length: true,
            enable_termination: true,
            enable_creation_with_upload: true,
            checksum_algorithms: default_checksum_algorithms(),
            append_timeout_secs: default_append_timeout_secs(),
            finalize_timeout_secs: default_finalize_timeout_secs(),
        }
    }
}

impl ProtocolConfig {
    /// Get the append timeout as a std::time::Duration.
    pub fn append_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.append_timeout_secs)
    }

    /// Get the finalize timeout as a std::time::Duration.
    pub fn finalize_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.finalize_timeout_secs)
    }

    /// Validate protocol configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if !self.base_path.starts_with('/') {
            return Err(format!(
                "protocol.base_path must start with '/': {}",
                self.base_path
            ));
        }
        if self.base_path.len() > 1 && self.base_path.ends_with('/') {
            return Err(format!(
                "protocol.base_path must not end with '/': {}",
                self.base_path
            ));
        }
        if self.max_chunk_size == 0 {
            return Err("protocol.max_chunk_size cannot be 0".to_string());
        }
        if self.append_timeout_secs == 0 || self.finalize_timeout_secs == 0 {
            return Err("protocol timeouts cannot be 0".to_string());
        }
        for name in &self.checksum_algorithms {
            crate::checksum::ChecksumAlgorithm::parse(name)
                .map_err(|_| format!("protocol.checksum_algorithms: unsupported '{name}'"))?;
        }
        Ok(())
    }
}

/// Expiration of abandoned uploads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExpirationConfig {
    /// Expire incomplete uploads and run the background reaper (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Lifetime of an incomplete upload since its last successful append, in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Interval between reaper sweeps, in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Maximum number of uploads removed per sweep.
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: u32,
}

fn default_ttl_secs() -> u64 {
    86400 // 24 hours
}

fn default_sweep_interval_secs() -> u64 {
    3600 // 1 hour
}

fn default_sweep_batch_size() -> u32 {
    500
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_batch_size: default_sweep_batch_size(),
        }
    }
}

impl ExpirationConfig {
    /// Upload lifetime, or `None` when expiration is disabled.
    pub fn ttl(&self) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        let secs = i64::try_from(self.ttl_secs).unwrap_or(i64::MAX);
        Some(Duration::seconds(secs))
    }

    /// Get the sweep interval as a std::time::Duration.
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    /// Validate expiration configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        // tokio::time::interval panics on a zero period
        if self.sweep_interval_secs == 0 {
            return Err("expiration.sweep_interval_secs cannot be 0".to_string());
        }
        if self.ttl_secs == 0 {
            return Err("expiration.ttl_secs cannot be 0".to_string());
        }
        if self.sweep_batch_size == 0 {
            return Err("expiration.sweep_batch_size cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Directory holding upload data and info files.
        path: PathBuf,
    },
    /// Google Cloud Storage (or compatible JSON API), appending via object compose.
    Gcs {
        /// Bucket name.
        bucket: String,
        /// Optional object name prefix.
        prefix: Option<String>,
        /// API endpoint override (default: https://storage.googleapis.com).
        endpoint: Option<String>,
        /// OAuth2 bearer token. Falls back to GOOGLE_OAUTH_ACCESS_TOKEN, then to
        /// the GCE metadata server.
        /// WARNING: Prefer env vars or workload identity over storing tokens in config files.
        access_token: Option<String>,
    },
    /// S3-compatible storage using multipart uploads.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region. Falls back to AWS_REGION env var if not set.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to AWS_ACCESS_KEY_ID env var if not set.
        /// WARNING: Prefer env vars over storing secrets in config files.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to AWS_SECRET_ACCESS_KEY env var if not set.
        /// WARNING: Prefer env vars over storing secrets in config files.
        secret_access_key: Option<String>,
        /// Force path-style URLs (e.g., `endpoint/bucket/key` instead of `bucket.endpoint/key`).
        /// Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
        /// Size of each multipart part in bytes (default: 8 MiB, minimum: 5 MiB).
        /// Smaller chunks are buffered until a full part is available.
        #[serde(default = "default_part_size")]
        part_size: u64,
    },
}

fn default_part_size() -> u64 {
    8 * 1024 * 1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/files"),
        }
    }
}

/// Read an environment variable, treating empty values as unset.
fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Explicit S3 settings after applying the AWS_* environment fallbacks.
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

impl StorageConfig {
    /// Short name of the configured backend, as used in logs and metrics.
    pub fn backend_name(&self) -> &'static str {
        match self {
            StorageConfig::Filesystem { .. } => "filesystem",
            StorageConfig::Gcs { .. } => "gcs",
            StorageConfig::S3 { .. } => "s3",
        }
    }

    /// Resolve S3 credentials from config, falling back to AWS_ACCESS_KEY_ID
    /// and AWS_SECRET_ACCESS_KEY. Returns `None` for other backends.
    pub fn s3_credentials(&self) -> Result<Option<S3Credentials>, String> {
        let StorageConfig::S3 {
            access_key_id,
            secret_access_key,
            ..
        } = self
        else {
            return Ok(None);
        };

        match (access_key_id, secret_access_key) {
            (Some(id), Some(secret)) => Ok(Some(S3Credentials {
                access_key_id: id.clone(),
                secret_access_key: secret.clone(),
            })),
            (None, None) => {
                match (
                    env_nonempty("AWS_ACCESS_KEY_ID"),
                    env_nonempty("AWS_SECRET_ACCESS_KEY"),
                ) {
                    (Some(id), Some(secret)) => Ok(Some(S3Credentials {
                        access_key_id: id,
                        secret_access_key: secret,
                    })),
                    _ => Err("s3 storage requires credentials: set access_key_id and \
                         secret_access_key or AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY"
                        .to_string()),
                }
            }
            _ => Err(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ),
        }
    }

    /// Resolve the S3 region from config, falling back to AWS_REGION.
    pub fn s3_region(&self) -> Option<String> {
        match self {
            StorageConfig::S3 { region, .. } => {
                region.clone().or_else(|| env_nonempty("AWS_REGION"))
            }
            _ => None,
        }
    }

    /// Validate storage configuration invariants.
    ///
    /// Missing credentials for the S3 backend are reported here so the
    /// process can refuse to start before binding a socket.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { path } => {
                if path.as_os_str().is_empty() {
                    return Err("filesystem storage requires a path".to_string());
                }
                Ok(())
            }
            StorageConfig::Gcs { bucket, .. } => {
                if bucket.is_empty() {
                    return Err("gcs storage requires a bucket".to_string());
                }
                Ok(())
            }
            StorageConfig::S3 {
                bucket, part_size, ..
            } => {
                if bucket.is_empty() {
                    return Err("s3 storage requires a bucket".to_string());
                }
                if self.s3_region().is_none() {
                    return Err("s3 storage requires a region (or AWS_REGION)".to_string());
                }
                if *part_size < S3_MIN_PART_SIZE || *part_size > S3_MAX_PART_SIZE {
                    return Err(format!(
                        "s3 part_size {part_size} must be between {S3_MIN_PART_SIZE} and {S3_MAX_PART_SIZE} bytes"
                    ));
                }
                self.s3_credentials().map(|_| ())
            }
        }
    }
}

/// Upload registry configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RegistryConfig {
    /// In-process registry. Uploads do not survive a restart.
    Memory,
    /// SQLite database.
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/registry.db"),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Upload protocol configuration.
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Upload registry configuration.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Expiration configuration.
    #[serde(default)]
    pub expiration: ExpirationConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses filesystem storage and an in-memory registry.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            protocol: ProtocolConfig::default(),
            storage: StorageConfig::default(),
            registry: RegistryConfig::Memory,
            expiration: ExpirationConfig::default(),
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.protocol.validate()?;
        self.expiration.validate()?;
        self.storage.validate()
    }
}
