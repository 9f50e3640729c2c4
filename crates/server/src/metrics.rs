//! Prometheus metrics for the spool server.
//!
//! Lifecycle counters are fed by [`MetricsListener`] from the event hub;
//! durations and error counts are recorded where the work happens.
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! Restrict it at the network level when the server is exposed publicly.

use crate::events::{EventKind, ListenerResult, UploadEvent, UploadListener};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Upload lifecycle metrics
pub static UPLOADS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("spool_uploads_created_total", "Total number of uploads created")
        .expect("metric creation failed")
});

pub static UPLOADS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "spool_uploads_completed_total",
        "Total number of uploads that received all of their bytes",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "spool_uploads_deleted_total",
        "Total number of uploads terminated or expired",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "spool_uploads_expired_total",
        "Total number of uploads removed by the expiration reaper",
    )
    .expect("metric creation failed")
});

// Chunk metrics
pub static CHUNKS_APPENDED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "spool_chunks_appended_total",
        "Total number of chunks appended",
    )
    .expect("metric creation failed")
});

pub static BYTES_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "spool_bytes_received_total",
        "Total bytes durably appended",
    )
    .expect("metric creation failed")
});

// Timing metrics
pub static APPEND_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "spool_append_duration_seconds",
            "Time taken to write a single chunk to storage",
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
    )
    .expect("metric creation failed")
});

pub static FINALIZE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "spool_finalize_duration_seconds",
            "Time taken to finalize a completed upload",
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )
    .expect("metric creation failed")
});

// Error metrics
pub static UPLOAD_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("spool_upload_errors_total", "Total upload errors by error code"),
        &["code"],
    )
    .expect("metric creation failed")
});

pub static LISTENER_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "spool_listener_failures_total",
        "Total number of event listener errors and panics",
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// This function is idempotent - subsequent calls after the first are no-ops.
/// This allows safe use in integration tests or when embedding multiple routers.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(UPLOADS_CREATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_COMPLETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_DELETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_EXPIRED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_APPENDED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_RECEIVED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(APPEND_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FINALIZE_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_ERRORS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(LISTENER_FAILURES.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Helper to record upload errors by code.
pub fn record_upload_error(code: &str) {
    UPLOAD_ERRORS.with_label_values(&[code]).inc();
}

/// Counts lifecycle events.
pub struct MetricsListener;

impl UploadListener for MetricsListener {
    fn on_event(&self, event: &UploadEvent) -> ListenerResult {
        match event.kind {
            EventKind::Created => UPLOADS_CREATED.inc(),
            EventKind::ChunkAppended => CHUNKS_APPENDED.inc(),
            EventKind::Complete => UPLOADS_COMPLETED.inc(),
            EventKind::Deleted => UPLOADS_DELETED.inc(),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "metrics"
    }
}
