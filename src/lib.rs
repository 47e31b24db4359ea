//! Metric ingestion fabric
//!
//! Accepts points over RPC, HTTP and statsd-style UDP, validates them, shards
//! each one onto storage instances with a consistent hash ring, and fans it
//! out to alert judges and aggregation detectors through bounded
//! per-destination queues.

pub mod actors;
pub mod adapters;
pub mod api;
pub mod app;
pub mod bus;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod ingest;
pub mod point;
pub mod query;
pub mod queue;
pub mod ring;
pub mod routing;
pub mod rpc;
pub mod service;
pub mod shutdown;
pub mod stats;
pub mod statsd;
pub mod util;
