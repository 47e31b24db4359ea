//! Series queries over HTTP

use axum::{Json, body::Bytes, extract::State};

use crate::api::{error::ApiResult, state::ApiState, types::DataResponse};
use crate::rpc::{QueryRequest, QueryResponse};

/// POST /api/transfer/data
///
/// Body is a JSON array of query requests.
pub async fn query(State(state): State<ApiState>, body: Bytes) -> ApiResult<Json<DataResponse<Vec<QueryResponse>>>> {
    let requests: Vec<QueryRequest> = serde_json::from_slice(&body)?;
    let results = state.query.query(requests).await?;
    Ok(Json(DataResponse::new(results)))
}
