//! Push endpoints for every kind of downstream
//!
//! All adapters satisfy [`PushEndpoint`]: push one batch, succeed or fail
//! within a bounded time. The sender owns retries; adapters never retry on
//! their own.
//!
//! | `type`     | Adapter              | Transport                         |
//! |------------|----------------------|-----------------------------------|
//! | `rpc`      | [`RpcEndpoint`]      | framed bincode over the pool      |
//! | `opentsdb` | [`OpenTsdbEndpoint`] | `put` lines over TCP              |
//! | `influxdb` | [`InfluxDbEndpoint`] | line protocol over HTTP           |
//! | `m3db`     | [`M3DbEndpoint`]     | JSON write API over HTTP          |
//! | `kafka`    | `KafkaEndpoint`      | JSON records (feature `kafka`)    |

mod influxdb;
#[cfg(feature = "kafka")]
mod kafka;
mod m3db;
mod opentsdb;
mod rpc;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::point::SharedPoint;
use crate::rpc::RpcError;

pub use influxdb::{InfluxDbConfig, InfluxDbEndpoint};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaConfig, KafkaEndpoint, KafkaProducer, LogDeliveryContext};
pub use m3db::{M3DbConfig, M3DbEndpoint};
pub use opentsdb::{OpenTsdbConfig, OpenTsdbEndpoint};
pub use rpc::{RpcEndpoint, RpcItem};

/// Downstream contract shared by every adapter
#[async_trait]
pub trait PushEndpoint<T: Send + Sync = SharedPoint>: Send + Sync {
    fn name(&self) -> &str;

    async fn push(&self, batch: &[T]) -> Result<(), PushError>;
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("kafka error: {0}")]
    Kafka(String),
}

/// One entry of `storage.backends`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Storage instances from cluster membership, sharded by the storage ring
    Rpc,
    Opentsdb(OpenTsdbConfig),
    Influxdb(InfluxDbConfig),
    M3db(M3DbConfig),
    #[cfg(feature = "kafka")]
    Kafka(KafkaConfig),
}

impl BackendConfig {
    /// Queue key of a single-destination backend, `None` for the ring
    pub fn destination_key(&self) -> Option<String> {
        match self {
            BackendConfig::Rpc => None,
            BackendConfig::Opentsdb(c) => Some(format!("opentsdb:{}", c.name)),
            BackendConfig::Influxdb(c) => Some(format!("influxdb:{}", c.name)),
            BackendConfig::M3db(c) => Some(format!("m3db:{}", c.name)),
            #[cfg(feature = "kafka")]
            BackendConfig::Kafka(c) => Some(format!("kafka:{}", c.name)),
        }
    }

    /// Build the endpoint for a single-destination backend
    pub fn build(&self) -> anyhow::Result<Option<Arc<dyn PushEndpoint>>> {
        let endpoint: Arc<dyn PushEndpoint> = match self {
            BackendConfig::Rpc => return Ok(None),
            BackendConfig::Opentsdb(c) => Arc::new(OpenTsdbEndpoint::new(c.clone())),
            BackendConfig::Influxdb(c) => Arc::new(InfluxDbEndpoint::new(c.clone())?),
            BackendConfig::M3db(c) => Arc::new(M3DbEndpoint::new(c.clone())?),
            #[cfg(feature = "kafka")]
            BackendConfig::Kafka(c) => Arc::new(KafkaEndpoint::new(c.clone())?),
        };
        Ok(Some(endpoint))
    }
}

pub(crate) fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_backend_selection_by_type() {
        let backends: Vec<BackendConfig> = serde_json::from_str(
            r#"[
                {"type": "rpc"},
                {"type": "opentsdb", "name": "tsdb", "addr": "127.0.0.1:4242"},
                {"type": "influxdb", "name": "influx", "url": "http://127.0.0.1:8086", "database": "n9e"},
                {"type": "m3db", "name": "m3", "url": "http://127.0.0.1:7201", "timeout": "2s"}
            ]"#,
        )
        .unwrap();

        assert_matches!(backends[0], BackendConfig::Rpc);
        assert_eq!(backends[0].destination_key(), None);
        assert_eq!(backends[1].destination_key().as_deref(), Some("opentsdb:tsdb"));
        assert_matches!(&backends[3], BackendConfig::M3db(c) if c.timeout == Duration::from_secs(2));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = serde_json::from_str::<BackendConfig>(r#"{"type": "graphite"}"#);
        assert!(result.is_err());
    }
}
