//! Application state shared across handlers.

use crate::engine::UploadEngine;
use crate::events::{EventHub, LogListener};
use crate::metrics::MetricsListener;
use spool_core::config::AppConfig;
use spool_registry::UploadRegistry;
use spool_storage::StorageBackend;
use std::sync::Arc;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Upload protocol engine.
    pub engine: Arc<UploadEngine>,
}

impl AppState {
    /// Create new application state.
    ///
    /// The event hub starts with the log and metrics listeners subscribed.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn StorageBackend>,
        registry: Arc<dyn UploadRegistry>,
    ) -> Self {
        let events = Arc::new(EventHub::new());
        events.subscribe(Arc::new(LogListener));
        events.subscribe(Arc::new(MetricsListener));

        let engine = Arc::new(UploadEngine::new(
            registry,
            storage,
            events,
            &config.protocol,
            &config.expiration,
        ));

        Self {
            config: Arc::new(config),
            engine,
        }
    }

    /// Event hub for registering additional listeners.
    pub fn events(&self) -> &Arc<EventHub> {
        self.engine.events()
    }
}
