//! Liveness endpoint

use axum::Json;

use crate::api::types::DataResponse;

/// GET /api/transfer/ping
pub async fn ping() -> Json<DataResponse<&'static str>> {
    Json(DataResponse::new("pong"))
}
