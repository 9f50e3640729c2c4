//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::negotiation::tus_middleware;
use crate::state::AppState;
use axum::Router;
use axum::http::{HeaderName, HeaderValue, header};
use axum::middleware;
use axum::routing::{any, get};
use spool_core::protocol::{
    HEADER_TUS_CHECKSUM_ALGORITHM, HEADER_TUS_EXTENSION, HEADER_TUS_MAX_SIZE,
    HEADER_TUS_RESUMABLE, HEADER_TUS_VERSION, HEADER_UPLOAD_DEFER_LENGTH, HEADER_UPLOAD_EXPIRES,
    HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_METADATA, HEADER_UPLOAD_OFFSET,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let base = normalize_base(&state.config.protocol.base_path);
    let resource = if base == "/" {
        "/{upload_id}".to_string()
    } else {
        format!("{base}/{{upload_id}}")
    };

    let mut tus_routes = Router::new()
        .route(&base, any(handlers::upload_collection))
        .route(&resource, any(handlers::upload_resource));
    if base != "/" {
        // Clients commonly configure the endpoint with a trailing slash
        tus_routes = tus_routes.route(&format!("{base}/"), any(handlers::upload_collection));
    }
    let tus_routes = tus_routes.layer(middleware::from_fn(tus_middleware));

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .merge(tus_routes);

    // When enabled, this endpoint should be network-restricted to the scraper.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    let cors = build_cors(&state.config.server.cors_allowed_origins);

    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Base path with a leading slash and no trailing slash.
fn normalize_base(base: &str) -> String {
    let trimmed = base.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn build_cors(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(exposed_headers());

    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        layer.allow_origin(Any)
    } else {
        let list = origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect::<Vec<_>>();
        layer.allow_origin(AllowOrigin::list(list))
    }
}

fn exposed_headers() -> Vec<HeaderName> {
    let mut headers = vec![header::LOCATION];
    headers.extend(
        [
            HEADER_UPLOAD_OFFSET,
            HEADER_UPLOAD_LENGTH,
            HEADER_UPLOAD_DEFER_LENGTH,
            HEADER_UPLOAD_METADATA,
            HEADER_UPLOAD_EXPIRES,
            HEADER_TUS_RESUMABLE,
            HEADER_TUS_VERSION,
            HEADER_TUS_EXTENSION,
            HEADER_TUS_MAX_SIZE,
            HEADER_TUS_CHECKSUM_ALGORITHM,
        ]
        .into_iter()
        .map(HeaderName::from_static),
    );
    headers
}
