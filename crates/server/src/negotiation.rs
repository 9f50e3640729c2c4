//! Protocol negotiation middleware for the tus routes.

use crate::error::ApiError;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use spool_core::TUS_VERSION;
use spool_core::protocol::{HEADER_METHOD_OVERRIDE, HEADER_TUS_RESUMABLE};

/// Applies `X-HTTP-Method-Override`, requires `Tus-Resumable: 1.0.0` and
/// stamps `Tus-Resumable` on every response.
///
/// `OPTIONS` and the plain `GET` download are exempt from the version check.
pub async fn tus_middleware(mut req: Request, next: Next) -> Response {
    if let Some(method) = override_method(req.headers()) {
        tracing::debug!(from = %req.method(), to = %method, "Applying method override");
        *req.method_mut() = method;
    }

    let exempt = matches!(*req.method(), Method::OPTIONS | Method::GET);
    let mut response = if exempt || version_accepted(req.headers()) {
        next.run(req).await
    } else {
        let sent = req
            .headers()
            .get(HEADER_TUS_RESUMABLE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("<none>");
        ApiError::PreconditionFailed(sent.to_string()).into_response()
    };

    response
        .headers_mut()
        .insert(HEADER_TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    response
}

fn override_method(headers: &HeaderMap) -> Option<Method> {
    let value = headers.get(HEADER_METHOD_OVERRIDE)?.to_str().ok()?.trim();
    if value.is_empty() {
        return None;
    }
    Method::from_bytes(value.to_ascii_uppercase().as_bytes()).ok()
}

fn version_accepted(headers: &HeaderMap) -> bool {
    headers
        .get(HEADER_TUS_RESUMABLE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == TUS_VERSION)
}
