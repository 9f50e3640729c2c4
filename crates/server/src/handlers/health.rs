//! Health endpoint.

use crate::engine::EngineError;
use crate::error::ApiResult;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backend: &'static str,
    pub registry: &'static str,
    pub version: &'static str,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let storage = state.engine.storage();
    storage.health_check().await.map_err(EngineError::from)?;

    let registry = state.engine.registry();
    registry.health_check().await.map_err(EngineError::from)?;

    Ok(Json(HealthResponse {
        status: "ok",
        backend: storage.backend_name(),
        registry: registry.kind(),
        version: env!("CARGO_PKG_VERSION"),
    }))
}
