//! Upload lifecycle events.
//!
//! Listeners run synchronously on the task that performed the operation,
//! after the change is committed, so events for one upload arrive in commit
//! order. A listener that returns an error or panics is logged and skipped;
//! it never fails the request that triggered it.

use spool_core::UploadRecord;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Kind of lifecycle change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    ChunkAppended,
    Complete,
    Deleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::ChunkAppended => "chunk_appended",
            Self::Complete => "complete",
            Self::Deleted => "deleted",
        }
    }
}

/// An event with a snapshot of the record after the change.
#[derive(Clone, Debug)]
pub struct UploadEvent {
    pub kind: EventKind,
    pub record: UploadRecord,
}

impl UploadEvent {
    pub fn new(kind: EventKind, record: UploadRecord) -> Self {
        Self { kind, record }
    }
}

pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Receives upload events.
pub trait UploadListener: Send + Sync {
    fn on_event(&self, event: &UploadEvent) -> ListenerResult;

    /// Name used when logging listener failures.
    fn name(&self) -> &str {
        "listener"
    }
}

/// Handle returned by [`EventHub::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Synchronous publish/subscribe hub.
#[derive(Default)]
pub struct EventHub {
    listeners: RwLock<Vec<(SubscriptionId, Arc<dyn UploadListener>)>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn UploadListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, listener));
        id
    }

    /// Remove a listener. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = listeners.len();
        listeners.retain(|(sub, _)| *sub != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Deliver an event to every listener in subscription order.
    pub fn publish(&self, event: &UploadEvent) {
        // Snapshot so a listener may (un)subscribe without deadlocking
        let listeners: Vec<Arc<dyn UploadListener>> = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    crate::metrics::LISTENER_FAILURES.inc();
                    tracing::warn!(
                        listener = listener.name(),
                        event = event.kind.as_str(),
                        upload_id = %event.record.id,
                        error = %e,
                        "Upload event listener failed"
                    );
                }
                Err(_) => {
                    crate::metrics::LISTENER_FAILURES.inc();
                    tracing::error!(
                        listener = listener.name(),
                        event = event.kind.as_str(),
                        upload_id = %event.record.id,
                        "Upload event listener panicked"
                    );
                }
            }
        }
    }
}

/// Writes a log line when an upload completes or is deleted.
pub struct LogListener;

impl UploadListener for LogListener {
    fn on_event(&self, event: &UploadEvent) -> ListenerResult {
        match event.kind {
            EventKind::Complete => {
                tracing::info!(
                    upload_id = %event.record.id,
                    length = event.record.offset,
                    "Upload complete for file {}",
                    event.record.id
                );
            }
            EventKind::Deleted => {
                tracing::info!(
                    upload_id = %event.record.id,
                    "Upload deleted for file {}",
                    event.record.id
                );
            }
            EventKind::Created | EventKind::ChunkAppended => {}
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Adapts a closure into a listener.
pub struct FnListener<F> {
    name: String,
    f: F,
}

impl<F> FnListener<F>
where
    F: Fn(&UploadEvent) -> ListenerResult + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> UploadListener for FnListener<F>
where
    F: Fn(&UploadEvent) -> ListenerResult + Send + Sync,
{
    fn on_event(&self, event: &UploadEvent) -> ListenerResult {
        (self.f)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Forwards events to a broadcast channel for async consumers.
///
/// Slow receivers lag and lose events rather than blocking the request path.
pub struct BroadcastListener {
    tx: broadcast::Sender<UploadEvent>,
}

impl BroadcastListener {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.tx.subscribe()
    }
}

impl UploadListener for BroadcastListener {
    fn on_event(&self, event: &UploadEvent) -> ListenerResult {
        // No receivers is not an error
        let _ = self.tx.send(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "broadcast"
    }
}
