//! tus 1.0.0 resource handlers.

use crate::engine::{AppendRequest, CreateRequest, is_offset_octet_stream};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use spool_core::protocol::{
    HEADER_TUS_CHECKSUM_ALGORITHM, HEADER_TUS_EXTENSION, HEADER_TUS_MAX_SIZE, HEADER_TUS_VERSION,
    HEADER_UPLOAD_CHECKSUM, HEADER_UPLOAD_DEFER_LENGTH, HEADER_UPLOAD_EXPIRES,
    HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_METADATA, HEADER_UPLOAD_OFFSET,
};
use spool_core::{ChunkChecksum, Extension, TUS_VERSION, UploadId, UploadMetadata, UploadRecord};
use time::UtcOffset;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

/// RFC 7231 IMF-fixdate.
const HTTP_DATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Any method on the upload collection.
pub async fn upload_collection(
    State(state): State<AppState>,
    request: Request,
) -> ApiResult<Response> {
    match request.method().clone() {
        Method::OPTIONS => Ok(options_response(&state)),
        Method::POST => create_upload(&state, request).await,
        other => Err(ApiError::MethodNotAllowed(other.to_string())),
    }
}

/// Any method on a single upload.
pub async fn upload_resource(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    request: Request,
) -> ApiResult<Response> {
    if request.method() == Method::OPTIONS {
        return Ok(options_response(&state));
    }
    let id = UploadId::parse(&upload_id)?;

    match request.method().clone() {
        Method::HEAD => head_upload(&state, &id).await,
        Method::PATCH => patch_upload(&state, &id, request).await,
        Method::DELETE => delete_upload(&state, &id).await,
        Method::GET => download_upload(&state, &id).await,
        other => Err(ApiError::MethodNotAllowed(other.to_string())),
    }
}

/// OPTIONS - advertise protocol version and extensions.
fn options_response(state: &AppState) -> Response {
    let capabilities = state.engine.capabilities();
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();

    headers.insert(HEADER_TUS_VERSION, HeaderValue::from_static(TUS_VERSION));
    insert_text(
        headers,
        HeaderName::from_static(HEADER_TUS_EXTENSION),
        &capabilities.extension_header(),
    );
    if let Some(max_size) = capabilities.max_size() {
        headers.insert(HEADER_TUS_MAX_SIZE, HeaderValue::from(max_size));
    }
    if let Some(algorithms) = capabilities.checksum_header() {
        insert_text(
            headers,
            HeaderName::from_static(HEADER_TUS_CHECKSUM_ALGORITHM),
            &algorithms,
        );
    }
    response
}

/// POST - create an upload, optionally with its first chunk.
async fn create_upload(state: &AppState, request: Request) -> ApiResult<Response> {
    let (parts, body) = request.into_parts();
    let headers = &parts.headers;

    let declared = parse_number(headers, HEADER_UPLOAD_LENGTH)?;
    let deferred = match header_str(headers, HEADER_UPLOAD_DEFER_LENGTH)? {
        None => false,
        Some("1") => true,
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "Upload-Defer-Length must be 1, got {other}"
            )));
        }
    };

    let mut requested = vec![Extension::Creation];
    let length = match (declared, deferred) {
        (Some(length), false) => Some(length),
        (None, true) => {
            requested.push(Extension::CreationDeferLength);
            None
        }
        (Some(_), true) => {
            return Err(ApiError::BadRequest(
                "Upload-Length and Upload-Defer-Length are mutually exclusive".to_string(),
            ));
        }
        (None, false) => {
            return Err(ApiError::BadRequest(
                "Upload-Length or Upload-Defer-Length is required".to_string(),
            ));
        }
    };

    let metadata = match header_str(headers, HEADER_UPLOAD_METADATA)? {
        Some(value) => UploadMetadata::parse(value)?,
        None => UploadMetadata::new(),
    };

    let content_type = header_str(headers, header::CONTENT_TYPE.as_str())?;
    let with_upload = content_type.is_some_and(is_offset_octet_stream);
    let (data, checksum) = if with_upload {
        requested.push(Extension::CreationWithUpload);
        let checksum = parse_checksum(headers)?;
        (read_body(state, headers, body).await?, checksum)
    } else {
        (Bytes::new(), None)
    };

    let mut record = state
        .engine
        .handle_create(CreateRequest {
            length,
            metadata,
            requested,
        })
        .await?;

    if !data.is_empty() {
        record = state
            .engine
            .handle_append(
                &record.id,
                AppendRequest {
                    offset: 0,
                    content_type: content_type.map(str::to_string),
                    checksum,
                    length: None,
                    data,
                },
            )
            .await?;
    }

    let location = upload_location(state, headers, &record.id);
    let mut response = StatusCode::CREATED.into_response();
    let response_headers = response.headers_mut();
    insert_text(response_headers, header::LOCATION, &location);
    if with_upload {
        response_headers.insert(HEADER_UPLOAD_OFFSET, HeaderValue::from(record.offset));
    }
    insert_expires(response_headers, &record);
    Ok(response)
}

/// HEAD - report the current offset.
async fn head_upload(state: &AppState, id: &UploadId) -> ApiResult<Response> {
    let record = state.engine.handle_head(id).await?;

    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(HEADER_UPLOAD_OFFSET, HeaderValue::from(record.offset));
    match record.length {
        Some(length) => {
            headers.insert(HEADER_UPLOAD_LENGTH, HeaderValue::from(length));
        }
        None => {
            headers.insert(HEADER_UPLOAD_DEFER_LENGTH, HeaderValue::from_static("1"));
        }
    }
    if !record.metadata.is_empty() {
        insert_text(
            headers,
            HeaderName::from_static(HEADER_UPLOAD_METADATA),
            &record.metadata.to_header(),
        );
    }
    insert_expires(headers, &record);
    Ok(response)
}

/// PATCH - append a chunk.
async fn patch_upload(state: &AppState, id: &UploadId, request: Request) -> ApiResult<Response> {
    let (parts, body) = request.into_parts();
    let headers = &parts.headers;

    let offset = parse_number(headers, HEADER_UPLOAD_OFFSET)?
        .ok_or_else(|| ApiError::BadRequest("Upload-Offset is required".to_string()))?;
    let length = parse_number(headers, HEADER_UPLOAD_LENGTH)?;
    let content_type = header_str(headers, header::CONTENT_TYPE.as_str())?.map(str::to_string);
    let checksum = parse_checksum(headers)?;
    let data = read_body(state, headers, body).await?;

    let record = state
        .engine
        .handle_append(
            id,
            AppendRequest {
                offset,
                content_type,
                checksum,
                length,
                data,
            },
        )
        .await?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(HEADER_UPLOAD_OFFSET, HeaderValue::from(record.offset));
    insert_expires(headers, &record);
    Ok(response)
}

/// DELETE - terminate an upload.
async fn delete_upload(state: &AppState, id: &UploadId) -> ApiResult<Response> {
    if !state.engine.capabilities().supports(Extension::Termination) {
        return Err(ApiError::MethodNotAllowed(
            "termination is disabled".to_string(),
        ));
    }
    state.engine.handle_delete(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// GET - stream a completed upload.
async fn download_upload(state: &AppState, id: &UploadId) -> ApiResult<Response> {
    let (record, stream) = state.engine.handle_read(id).await?;

    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(record.offset));

    let content_type = record
        .metadata
        .get("filetype")
        .and_then(|value| HeaderValue::from_str(value).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);

    let disposition = match record.metadata.get("filename") {
        Some(name) => format!("attachment; filename=\"{}\"", sanitize_filename(name)),
        None => "attachment".to_string(),
    };
    insert_text(headers, header::CONTENT_DISPOSITION, &disposition);
    Ok(response)
}

/// Read a chunk body, enforcing the configured chunk limit.
async fn read_body(state: &AppState, headers: &HeaderMap, body: Body) -> ApiResult<Bytes> {
    let limit = state.config.protocol.max_chunk_size;
    if let Some(declared) = parse_number(headers, header::CONTENT_LENGTH.as_str())?
        && declared > limit
    {
        return Err(ApiError::PayloadTooLarge(format!(
            "chunk of {declared} bytes exceeds the limit of {limit}"
        )));
    }

    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    axum::body::to_bytes(body, limit).await.map_err(|e| {
        let message = e.to_string();
        if message.contains("length limit") {
            ApiError::PayloadTooLarge(message)
        } else {
            ApiError::BadRequest(format!("failed to read request body: {message}"))
        }
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> ApiResult<Option<&'a str>> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map(str::trim)
                .map_err(|_| ApiError::BadRequest(format!("invalid {name} header")))
        })
        .transpose()
}

/// Parse a header holding a non-negative decimal integer.
fn parse_number(headers: &HeaderMap, name: &str) -> ApiResult<Option<u64>> {
    header_str(headers, name)?
        .map(|value| {
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ApiError::BadRequest(format!(
                    "{name} must be a non-negative integer"
                )));
            }
            value
                .parse::<u64>()
                .map_err(|_| ApiError::BadRequest(format!("{name} is out of range")))
        })
        .transpose()
}

fn parse_checksum(headers: &HeaderMap) -> ApiResult<Option<ChunkChecksum>> {
    Ok(header_str(headers, HEADER_UPLOAD_CHECKSUM)?
        .map(ChunkChecksum::parse)
        .transpose()?)
}

fn insert_text(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::warn!(header = %name, "Dropping header with invalid value"),
    }
}

/// Add `Upload-Expires` while an upload can still expire.
fn insert_expires(headers: &mut HeaderMap, record: &UploadRecord) {
    if record.is_complete() {
        return;
    }
    if let Some(expires_at) = record.expires_at
        && let Ok(value) = expires_at.to_offset(UtcOffset::UTC).format(HTTP_DATE)
    {
        insert_text(headers, HeaderName::from_static(HEADER_UPLOAD_EXPIRES), &value);
    }
}

/// URL of an upload resource as seen by the client.
fn upload_location(state: &AppState, headers: &HeaderMap, id: &UploadId) -> String {
    let base = state.config.protocol.base_path.trim_end_matches('/');
    let path = format!("{base}/{id}");

    if let Some(public) = &state.config.protocol.public_base_url {
        return format!("{}{path}", public.trim_end_matches('/'));
    }
    match headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
        Some(host) => {
            let scheme = headers
                .get("x-forwarded-proto")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("http");
            format!("{scheme}://{host}{path}")
        }
        None => path,
    }
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect()
}
