//! Point ingestion over HTTP

use std::io::Read;

use axum::{Json, body::Bytes, extract::State, http::HeaderMap, http::header::CONTENT_ENCODING};
use flate2::read::GzDecoder;
use tracing::{debug, trace};

use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
    types::DataResponse,
};
use crate::point::parse_json_batch;

/// POST /api/transfer/push
///
/// Body is a JSON array of points, optionally gzip encoded. `data` is `"ok"`
/// when every point was accepted, otherwise the rejection summary.
pub async fn push(State(state): State<ApiState>, headers: HeaderMap, body: Bytes) -> ApiResult<Json<DataResponse<String>>> {
    let body = decode_body(&headers, body, state.max_body_bytes)?;
    let points = parse_json_batch(&body)?;
    trace!("received {} points over http", points.len());

    let summary = state.ingestor.push_results(points)?;
    if summary.invalid == 0 {
        return Ok(Json(DataResponse::new("ok".to_string())));
    }

    debug!("http push: {} of {} invalid", summary.invalid, summary.total_received);
    Ok(Json(DataResponse::new(summary.message)))
}

/// Undo `Content-Encoding: gzip`, enforcing `limit` on the decoded size
pub fn decode_body(headers: &HeaderMap, body: Bytes, limit: usize) -> ApiResult<Bytes> {
    let gzip = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"));

    if !gzip {
        if body.len() > limit {
            return Err(ApiError::PayloadTooLarge(limit));
        }
        return Ok(body);
    }

    let mut decoded = Vec::new();
    GzDecoder::new(body.as_ref())
        .take(limit as u64 + 1)
        .read_to_end(&mut decoded)
        .map_err(|e| ApiError::InvalidRequest(format!("invalid gzip body: {e}")))?;

    if decoded.len() > limit {
        return Err(ApiError::PayloadTooLarge(limit));
    }
    Ok(Bytes::from(decoded))
}
