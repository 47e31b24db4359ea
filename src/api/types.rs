//! HTTP response bodies

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Success envelope; failures render `{"error": msg}` through `ApiError`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataResponse<T> {
    pub data: T,
}

impl<T> DataResponse<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

/// Items waiting in the destination queues of one kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub destinations: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsResponse {
    /// RFC 3339
    pub timestamp: String,
    pub uptime_secs: i64,
    pub accepting: bool,
    pub counters: BTreeMap<String, u64>,
    pub storage_queues: QueueStats,
    pub judge_queues: QueueStats,
}
