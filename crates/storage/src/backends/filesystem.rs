//! Local filesystem storage backend.
//!
//! Each upload is a flat pair of files under the root directory:
//! `{id}` holds the bytes received so far and `{id}.info` the JSON info
//! record. The durable offset is the size of the data file.

use crate::error::{StorageError, StorageResult};
use crate::info::{INFO_SUFFIX, UploadInfo, validate_key_segment};
use crate::traits::{BackendStatus, ByteStream, StorageBackend};
use async_trait::async_trait;
use bytes::Bytes;
use spool_core::{BackendRef, UploadId, UploadMetadata};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;

/// Default chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Local filesystem upload store.
#[derive(Debug)]
pub struct FilesystemBackend {
    root: PathBuf,
}

fn map_not_found(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Root directory of this backend.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Data and info paths for a backend reference.
    fn paths(&self, backend_ref: &BackendRef) -> StorageResult<(PathBuf, PathBuf)> {
        let key = backend_ref.as_str();
        validate_key_segment(key)?;
        Ok((
            self.root.join(key),
            self.root.join(format!("{key}{INFO_SUFFIX}")),
        ))
    }

    async fn read_info(&self, backend_ref: &BackendRef) -> StorageResult<UploadInfo> {
        let (_, info_path) = self.paths(backend_ref)?;
        let data = fs::read(&info_path)
            .await
            .map_err(map_not_found(backend_ref.as_str()))?;
        UploadInfo::from_bytes(&data)
    }

    /// Write the info file atomically: temp file, fsync, rename.
    async fn write_info(&self, info_path: &Path, info: &UploadInfo) -> StorageResult<()> {
        let data = info.to_bytes()?;
        let temp_path = info_path.with_extension("info.tmp");
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            // Ensure data is flushed to disk before rename
            file.sync_all().await?;
        }
        fs::rename(&temp_path, info_path).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    #[instrument(skip(self, metadata), fields(backend = "filesystem"))]
    async fn create(
        &self,
        id: &UploadId,
        length: Option<u64>,
        metadata: &UploadMetadata,
    ) -> StorageResult<BackendRef> {
        let backend_ref = BackendRef::new(id.to_string());
        let (data_path, info_path) = self.paths(&backend_ref)?;

        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&data_path)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    StorageError::AlreadyExists(backend_ref.to_string())
                } else {
                    StorageError::Io(e)
                }
            })?;

        let info = UploadInfo::new(id, length, metadata);
        if let Err(e) = self.write_info(&info_path, &info).await {
            let _ = fs::remove_file(&data_path).await;
            return Err(e);
        }

        Ok(backend_ref)
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn append(
        &self,
        backend_ref: &BackendRef,
        offset: u64,
        data: Bytes,
    ) -> StorageResult<u64> {
        let (data_path, _) = self.paths(backend_ref)?;
        let info = self.read_info(backend_ref).await?;
        info.check_fits(offset, data.len() as u64)?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&data_path)
            .await
            .map_err(map_not_found(backend_ref.as_str()))?;

        let stored = file.metadata().await?.len();
        if stored != offset {
            return Err(StorageError::OffsetMismatch {
                stored,
                requested: offset,
            });
        }
        if data.is_empty() {
            return Ok(offset);
        }

        file.seek(SeekFrom::Start(offset)).await?;
        let written = async {
            file.write_all(&data).await?;
            file.sync_data().await
        }
        .await;

        if let Err(e) = written {
            // Drop any partial write so the durable offset stays put
            if let Err(truncate_err) = file.set_len(offset).await {
                tracing::error!(
                    backend_ref = %backend_ref,
                    offset,
                    error = %truncate_err,
                    "Failed to roll back partial write"
                );
            }
            return Err(StorageError::Io(e));
        }

        Ok(offset + data.len() as u64)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn declare_length(&self, backend_ref: &BackendRef, length: u64) -> StorageResult<()> {
        let (_, info_path) = self.paths(backend_ref)?;
        let mut info = self.read_info(backend_ref).await?;
        info.length = Some(length);
        self.write_info(&info_path, &info).await
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn read_metadata(&self, backend_ref: &BackendRef) -> StorageResult<BackendStatus> {
        let (data_path, _) = self.paths(backend_ref)?;
        let info = self.read_info(backend_ref).await?;
        let offset = fs::metadata(&data_path)
            .await
            .map_err(map_not_found(backend_ref.as_str()))?
            .len();

        Ok(BackendStatus {
            offset,
            length: info.length,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn read(&self, backend_ref: &BackendRef) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let (data_path, _) = self.paths(backend_ref)?;
        let file = fs::File::open(&data_path)
            .await
            .map_err(map_not_found(backend_ref.as_str()))?;

        // Stream the file in chunks instead of loading entirely into memory
        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, backend_ref: &BackendRef) -> StorageResult<()> {
        let (data_path, info_path) = self.paths(backend_ref)?;
        for path in [&data_path, &info_path] {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    async fn health_check(&self) -> StorageResult<()> {
        let meta = fs::metadata(&self.root).await?;
        if !meta.is_dir() {
            return Err(StorageError::Config(format!(
                "storage root is not a directory: {}",
                self.root.display()
            )));
        }
        Ok(())
    }
}
