use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::common::errors::{ApiError, CoreError};
use crate::common::types::MediaId;
use crate::http::AppState;

fn error_response(err: &CoreError, path: &str) -> Response {
    let body = ApiError::from_core(err, path);
    let status = StatusCode::from_u16(body.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}

/// Parses a single-range `Range: bytes=start-end` header into an exclusive
/// `[start, end)` pair clamped to `total_size`. Multi-range requests are not
/// supported; the whole header is ignored and treated as a full-body request.
fn parse_range(header_value: &str, total_size: u64) -> Option<(u64, u64)> {
    let spec = header_value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_str, end_str) = spec.split_once('-')?;

    if start_str.is_empty() {
        let suffix_len: u64 = end_str.parse().ok()?;
        let start = total_size.saturating_sub(suffix_len);
        return Some((start, total_size));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        total_size
    } else {
        let last: u64 = end_str.parse().ok()?;
        (last + 1).min(total_size)
    };
    if start >= total_size || start >= end {
        return None;
    }
    Some((start, end))
}

/// `GET /media/{id}` — streams `[start, end)` of the media, honoring a
/// single-range `Range` header (spec §6.3).
pub async fn stream_media(
    Path(id): Path<i64>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let media_id = MediaId(id);
    let path = format!("/media/{id}");

    // Persistent: successive Range requests for the same media id (typical
    // of a player seeking through one file) reuse the registered reader and
    // its warmed-up session lease instead of leasing fresh sessions each time.
    let reader = match state.registry.get_or_create(media_id, true).await {
        Ok(Some(reader)) => reader,
        Ok(None) => return error_response(&CoreError::NotFound, &path),
        Err(e) => {
            return error_response(&CoreError::BackendUnavailable(crate::backend::BackendError::Fatal(e.to_string())), &path);
        }
    };

    let total_size = reader.total_size;
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range(v, total_size));

    let (start, end, partial) = match range {
        Some((s, e)) => (s, e, true),
        None => (0, total_size, false),
    };

    let (tx, rx) = mpsc::unbounded_channel::<Result<axum::body::Bytes, std::io::Error>>();
    let cancel = CancellationToken::new();

    tokio::spawn({
        let reader = reader.clone();
        let cancel = cancel.clone();
        async move {
            let result = reader
                .read_range(start, end, &cancel, |chunk| {
                    let _ = tx.send(Ok(chunk));
                })
                .await;
            if let Err(e) = result {
                tracing::warn!(media_id = %media_id, error = %e, "stream ended with error");
            }
        }
    });

    let body = Body::from_stream(UnboundedReceiverStream::new(rx));

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, (end - start).to_string());

    if partial {
        builder = builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end - 1, total_size));
    } else {
        builder = builder.status(StatusCode::OK);
    }

    builder.body(body).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to build streaming response");
        (StatusCode::INTERNAL_SERVER_ERROR, "failed to build response").into_response()
    })
}

/// `POST /media/{id}/release` — forces the registry to drop a persistent
/// reader ahead of its normal sweep TTL (spec §4.5).
pub async fn release_media(Path(id): Path<i64>, State(state): State<Arc<AppState>>) -> StatusCode {
    state.registry.release(MediaId(id));
    StatusCode::NO_CONTENT
}

/// `GET /status` — pool occupancy and per-account backoff state (spec §6.4).
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<crate::pool::PoolStatus> {
    Json(state.pool.status())
}
