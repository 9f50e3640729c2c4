//! API error types.

use crate::engine::EngineError;
use axum::Json;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use spool_core::TUS_VERSION;
use spool_core::protocol::HEADER_TUS_VERSION;

/// Non-standard status used by the checksum extension.
const CHECKSUM_MISMATCH: u16 = 460;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("unsupported protocol version: {0}")]
    PreconditionFailed(String),

    #[error("request body too large: {0}")]
    PayloadTooLarge(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{0}")]
    Core(#[from] spool_core::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::MethodNotAllowed(_) => "method_not_allowed",
            Self::PreconditionFailed(_) => "unsupported_version",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::Engine(e) => e.code(),
            Self::Core(spool_core::Error::InvalidUploadId(_)) => "not_found",
            Self::Core(spool_core::Error::ChecksumMismatch { .. }) => "checksum_mismatch",
            Self::Core(spool_core::Error::UnsupportedChecksum(_)) => "unsupported_capability",
            Self::Core(_) => "bad_request",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Engine(e) => match e {
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::DuplicateId(_) => StatusCode::CONFLICT,
                EngineError::OffsetConflict { .. } => StatusCode::CONFLICT,
                EngineError::LengthTooSmall { .. } => StatusCode::BAD_REQUEST,
                EngineError::LengthExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
                EngineError::InvalidState(_) => StatusCode::BAD_REQUEST,
                EngineError::UnsupportedCapability(_) => StatusCode::BAD_REQUEST,
                EngineError::ChecksumMismatch(_) => checksum_mismatch_status(),
                EngineError::ContentTypeInvalid(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
                EngineError::Expired(_) => StatusCode::GONE,
                EngineError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::OffsetRegression { .. } | EngineError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::Core(e) => match e {
                spool_core::Error::InvalidUploadId(_) => StatusCode::NOT_FOUND,
                spool_core::Error::ChecksumMismatch { .. } => checksum_mismatch_status(),
                _ => StatusCode::BAD_REQUEST,
            },
        }
    }
}

fn checksum_mismatch_status() -> StatusCode {
    StatusCode::from_u16(CHECKSUM_MISMATCH).unwrap_or(StatusCode::BAD_REQUEST)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "Request rejected");
        }
        crate::metrics::record_upload_error(self.code());

        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        if matches!(self, Self::PreconditionFailed(_)) {
            response
                .headers_mut()
                .insert(HEADER_TUS_VERSION, HeaderValue::from_static(TUS_VERSION));
        }
        response
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
