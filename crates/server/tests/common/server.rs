//! Server test utilities.

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use spool_core::config::{AppConfig, RegistryConfig, StorageConfig};
use spool_server::{AppState, create_router};
use tempfile::TempDir;
use tower::ServiceExt;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    temp_dir: TempDir,
}

/// Response captured from the router.
#[allow(dead_code)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[allow(dead_code)]
impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn offset(&self) -> u64 {
        self.header("upload-offset")
            .expect("missing Upload-Offset")
            .parse()
            .expect("Upload-Offset is not a number")
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

/// Request builder carrying `Tus-Resumable: 1.0.0`.
#[allow(dead_code)]
pub fn tus_request(method: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("tus-resumable", "1.0.0")
}

#[allow(dead_code)]
impl TestServer {
    /// Filesystem storage in a temp directory and an in-memory registry.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let mut config = AppConfig::for_testing();
        config.storage = StorageConfig::Filesystem {
            path: temp_dir.path().join("files"),
        };
        modifier(&mut config);

        Self::build(config, temp_dir).await
    }

    /// Like [`TestServer::new`] but with a SQLite registry in the temp directory.
    pub async fn with_sqlite() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let mut config = AppConfig::for_testing();
        config.storage = StorageConfig::Filesystem {
            path: temp_dir.path().join("files"),
        };
        config.registry = RegistryConfig::Sqlite {
            path: temp_dir.path().join("registry.db"),
        };

        Self::build(config, temp_dir).await
    }

    /// Rebuild the server over the same storage and registry files.
    pub async fn restart(self) -> Self {
        let config = (*self.state.config).clone();
        let Self {
            router,
            state,
            temp_dir,
        } = self;
        drop(router);
        drop(state);
        Self::build(config, temp_dir).await
    }

    async fn build(config: AppConfig, temp_dir: TempDir) -> Self {
        let storage = spool_storage::from_config(&config.storage)
            .await
            .expect("Failed to create storage backend");
        let registry = spool_registry::from_config(&config.registry)
            .await
            .expect("Failed to create upload registry");

        let state = AppState::new(config, storage, registry);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            temp_dir,
        }
    }

    pub fn temp_path(&self) -> &std::path::Path {
        self.temp_dir.path()
    }

    /// Send a request through the router.
    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// Create an upload of known length and return its path.
    pub async fn create(&self, length: u64) -> String {
        let response = self
            .send(
                tus_request("POST", "/files")
                    .header("upload-length", length.to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED);
        response
            .header("location")
            .expect("missing Location")
            .to_string()
    }

    /// Append a chunk at `offset`.
    pub async fn patch(&self, path: &str, offset: u64, data: impl Into<Bytes>) -> TestResponse {
        self.send(
            tus_request("PATCH", path)
                .header("upload-offset", offset.to_string())
                .header("content-type", "application/offset+octet-stream")
                .body(Body::from(data.into()))
                .unwrap(),
        )
        .await
    }

    pub async fn head(&self, path: &str) -> TestResponse {
        self.send(tus_request("HEAD", path).body(Body::empty()).unwrap())
            .await
    }
}
