//! Integration tests for a running transfer instance

#[path = "integration/helpers.rs"]
mod helpers;

#[path = "integration/ingest_pipeline.rs"]
mod ingest_pipeline;

#[path = "integration/http_push.rs"]
mod http_push;

#[path = "integration/aggregator.rs"]
mod aggregator;

#[path = "integration/ring_failover.rs"]
mod ring_failover;

#[path = "integration/adapters.rs"]
mod adapters;

#[path = "integration/discovery.rs"]
mod discovery;
