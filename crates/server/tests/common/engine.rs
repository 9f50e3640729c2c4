//! Engine test harness over the in-memory backend.

use super::fixtures::{EventLog, record_events};
use super::storage::TestBackend;
use bytes::Bytes;
use spool_core::config::{ExpirationConfig, ProtocolConfig};
use spool_core::{UploadId, UploadRecord};
use spool_registry::{MemoryRegistry, UploadRegistry};
use spool_server::{AppendRequest, CreateRequest, EventHub, UploadEngine};
use std::sync::Arc;

/// Engine wired to an in-memory registry and backend.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestEngine {
    pub engine: Arc<UploadEngine>,
    pub backend: Arc<TestBackend>,
    pub registry: Arc<MemoryRegistry>,
    pub events: EventLog,
}

#[allow(dead_code)]
impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(|_, _| {})
    }

    pub fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut ProtocolConfig, &mut ExpirationConfig),
    {
        let mut protocol = ProtocolConfig::default();
        let mut expiration = ExpirationConfig::default();
        modifier(&mut protocol, &mut expiration);

        let backend = Arc::new(TestBackend::new());
        let registry = Arc::new(MemoryRegistry::new());
        let hub = Arc::new(EventHub::new());
        let events = record_events(&hub);

        let engine = Arc::new(UploadEngine::new(
            registry.clone() as Arc<dyn UploadRegistry>,
            backend.clone(),
            hub,
            &protocol,
            &expiration,
        ));

        Self {
            engine,
            backend,
            registry,
            events,
        }
    }

    pub async fn create(&self, length: Option<u64>) -> UploadRecord {
        self.engine
            .handle_create(CreateRequest {
                length,
                ..Default::default()
            })
            .await
            .expect("create failed")
    }
}

/// A well-formed append request.
#[allow(dead_code)]
pub fn chunk(offset: u64, data: impl Into<Bytes>) -> AppendRequest {
    AppendRequest {
        offset,
        content_type: Some("application/offset+octet-stream".to_string()),
        data: data.into(),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub async fn registry_offset(test: &TestEngine, id: &UploadId) -> u64 {
    test.registry.get(id).await.expect("record missing").offset
}
