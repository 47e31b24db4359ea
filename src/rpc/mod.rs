//! Framed binary RPC
//!
//! Every frame is a 4-byte big-endian length followed by a `bincode` encoding
//! of [`Request`] or [`Response`]. The request variant names the method. A
//! connection carries a single in-flight call at a time.
//!
//! ```text
//! client                                  server
//!   | -- [len][Request::Push(points)] -->   |
//!   | <-- [len][Response::Push(summary)] -- |
//! ```

pub mod codec;
pub mod pool;
pub mod server;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::point::{RawPoint, SharedPoint};

pub use codec::{RpcConn, decode, encode};
pub use pool::{ConnPool, PoolConfig, PoolRegistry, PoolStats};

/// Point as forwarded to a judge for a specific rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeItem {
    pub rule_id: u64,
    pub point: SharedPoint,
}

/// Point forwarded to an aggregation detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggrPacket {
    pub rule_id: u64,
    /// Tag keys the aggregation groups by
    pub group_by: Vec<String>,
    /// Values of `group_by` taken from the point, in the same order
    pub group_values: Vec<String>,
    pub step: u32,
    /// Seconds a late sample is still accepted into its window
    pub lateness: u32,
    pub point: SharedPoint,
}

/// Query against a storage instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub start: i64,
    pub end: i64,
    pub consolidation: String,
    pub endpoint: String,
    /// `metric` or `metric/k=v,k=v`
    pub counter: String,
    pub step: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeValue {
    pub timestamp: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub start: i64,
    pub end: i64,
    pub endpoint: String,
    pub counter: String,
    pub step: u32,
    pub values: Vec<TimeValue>,
}

/// Summary returned for every push call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub total_received: u32,
    pub invalid: u32,
    pub latency_ms: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Raw points from agents, validated by the receiver
    Push(Vec<RawPoint>),
    /// Already validated points forwarded to a storage instance
    Store(Vec<SharedPoint>),
    Query(Vec<QueryRequest>),
    Judge(Vec<JudgeItem>),
    Aggregate(Vec<AggrPacket>),
    Ping,
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Push(_) => "Push",
            Request::Store(_) => "Store",
            Request::Query(_) => "Query",
            Request::Judge(_) => "Judge",
            Request::Aggregate(_) => "Aggregate",
            Request::Ping => "Ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Push(PushResponse),
    Query(Vec<QueryResponse>),
    /// Number of items the peer accepted
    Ack(u32),
    Pong,
    /// Protocol-level failure (undecodable request, unsupported method)
    Error(String),
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("no connection to {0} available before the deadline")]
    PoolExhausted(String),
    #[error("call to {0} timed out")]
    CallTimeout(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
    #[error("pool for {0} is closed")]
    PoolClosed(String),
}
