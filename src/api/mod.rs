//! HTTP ingestion edge
//!
//! ## Endpoints
//!
//! - `POST /api/transfer/push` - JSON array of points, optional gzip
//! - `POST /api/transfer/data` - series queries against the storage ring
//! - `GET /api/transfer/ping` - liveness
//! - `GET /api/transfer/stats` - counters and queue depths
//!
//! Every handler answers `{"data": ...}` on success and `{"error": msg}` on
//! failure.

pub mod error;
pub mod routes;
pub mod state;
pub mod types;

pub use error::{ApiError, ApiResult};
pub use state::ApiState;
pub use types::{DataResponse, QueueStats, StatsResponse};

use std::net::SocketAddr;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::shutdown::ShutdownSignal;

/// All routes with their shared state
pub fn router(state: ApiState) -> Router {
    // compressed bodies are bounded again after decoding
    let body_limit = DefaultBodyLimit::max(state.max_body_bytes);

    Router::new()
        .route("/api/transfer/push", post(routes::push::push))
        .route("/api/transfer/data", post(routes::query::query))
        .route("/api/transfer/ping", get(routes::health::ping))
        .route("/api/transfer/stats", get(routes::stats::get_stats))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(body_limit))
}

/// Serve the API on an already bound listener until shutdown
///
/// Returns the listener's local address and the server task.
pub fn spawn_api_server(
    listener: TcpListener,
    state: ApiState,
    mut shutdown: ShutdownSignal,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let addr = listener.local_addr()?;
    let app = router(state);

    info!("HTTP server listening on {addr}");

    let handle = tokio::spawn(async move {
        let graceful = async move { shutdown.recv().await };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(graceful).await {
            error!("HTTP server error: {e}");
        }
        info!("HTTP server stopped");
    });

    Ok((addr, handle))
}
