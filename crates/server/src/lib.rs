//! HTTP server for spool, a tus 1.0.0 resumable upload server.
//!
//! This crate provides:
//! - The upload protocol engine
//! - The tus HTTP binding (creation, offset queries, chunk appends,
//!   termination, downloads)
//! - Upload lifecycle events and metrics
//! - The background expiration reaper

pub mod engine;
pub mod error;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod negotiation;
pub mod reaper;
pub mod routes;
pub mod state;

pub use engine::{AppendRequest, CreateRequest, EngineError, UploadEngine};
pub use error::ApiError;
pub use events::{
    BroadcastListener, EventHub, EventKind, FnListener, UploadEvent, UploadListener,
};
pub use routes::create_router;
pub use state::AppState;
