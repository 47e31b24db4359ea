//! Process statistics endpoint

use axum::{Json, extract::State};
use chrono::Utc;

use crate::api::{
    error::ApiResult,
    state::ApiState,
    types::{DataResponse, QueueStats, StatsResponse},
};

/// GET /api/transfer/stats
///
/// Returns every counter plus the current depth of the destination queues
pub async fn get_stats(State(state): State<ApiState>) -> ApiResult<Json<DataResponse<StatsResponse>>> {
    let now = Utc::now();
    let dispatcher = state.ingestor.dispatcher();

    Ok(Json(DataResponse::new(StatsResponse {
        timestamp: now.to_rfc3339(),
        uptime_secs: (now - state.started_at).num_seconds(),
        accepting: dispatcher.is_accepting(),
        counters: state.stats.snapshot(),
        storage_queues: QueueStats {
            destinations: dispatcher.storage().keys().len(),
            pending: dispatcher.storage().total_len(),
        },
        judge_queues: QueueStats {
            destinations: dispatcher.judges().keys().len(),
            pending: dispatcher.judges().total_len(),
        },
    })))
}
