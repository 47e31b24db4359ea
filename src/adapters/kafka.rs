use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::ClientContext;
use rdkafka::producer::{BaseRecord, DeliveryResult, ProducerContext, ThreadedProducer};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::{PushEndpoint, PushError, default_timeout};
use crate::point::{Point, SharedPoint};

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub name: String,
    pub brokers: String,
    pub topic: String,
    /// Extra librdkafka properties
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl KafkaConfig {
    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &self.brokers);
        client_config.set("message.timeout.ms", self.timeout.as_millis().to_string());
        for (name, value) in &self.params {
            client_config.set(name, value);
        }
        client_config
    }
}

/// Producer context that logs asynchronous delivery failures
#[derive(Debug)]
pub struct LogDeliveryContext;

impl ClientContext for LogDeliveryContext {}

impl ProducerContext for LogDeliveryContext {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult, _delivery_opaque: Self::DeliveryOpaque) {
        if let Err((e, _message)) = result {
            error!("failed to produce message to kafka (delivery callback): {e}");
        }
    }
}

pub type KafkaProducer = ThreadedProducer<LogDeliveryContext>;

/// JSON document written per point
#[derive(Debug, Serialize)]
struct KafkaPoint<'a> {
    endpoint: &'a str,
    metric: &'a str,
    tags: &'a BTreeMap<String, String>,
    value: f64,
    timestamp: i64,
    step: u32,
}

/// One JSON record per point, keyed by identity
pub struct KafkaEndpoint {
    config: KafkaConfig,
    producer: KafkaProducer,
}

impl KafkaEndpoint {
    pub fn new(config: KafkaConfig) -> anyhow::Result<Self> {
        let producer = config.client_config().create_with_context(LogDeliveryContext)?;
        Ok(Self { config, producer })
    }

    fn send(&self, point: &Point) -> Result<(), PushError> {
        let identity = point.identity.key();
        let payload = serde_json::to_vec(&KafkaPoint {
            endpoint: &identity,
            metric: &point.metric,
            tags: &point.tags,
            value: point.value,
            timestamp: point.timestamp,
            step: point.step,
        })
        .map_err(|e| PushError::Kafka(e.to_string()))?;

        let record = BaseRecord::to(&self.config.topic)
            .key(identity.as_bytes())
            .payload(&payload);
        self.producer
            .send(record)
            .map_err(|(e, _record)| PushError::Kafka(e.to_string()))
    }
}

#[async_trait]
impl PushEndpoint for KafkaEndpoint {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn push(&self, batch: &[SharedPoint]) -> Result<(), PushError> {
        // enqueueing is local; delivery failures surface in the context callback
        for point in batch {
            self.send(point)?;
        }
        Ok(())
    }
}
