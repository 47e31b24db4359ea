//! API shared state

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::ingest::Ingestor;
use crate::query::QueryService;
use crate::stats::Stats;

/// Shared state passed to all API handlers
#[derive(Clone)]
pub struct ApiState {
    /// Validation and fan-out of pushed points
    pub ingestor: Arc<Ingestor>,

    /// Read path to the storage ring
    pub query: Arc<QueryService>,

    pub stats: Stats,

    /// Largest accepted body after gzip decoding
    pub max_body_bytes: usize,

    pub started_at: DateTime<Utc>,
}

impl ApiState {
    pub fn new(ingestor: Arc<Ingestor>, query: Arc<QueryService>, stats: Stats, max_body_bytes: usize) -> Self {
        Self {
            ingestor,
            query,
            stats,
            max_body_bytes,
            started_at: Utc::now(),
        }
    }
}
