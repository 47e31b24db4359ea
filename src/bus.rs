//! Aggregation bus: where packets for aggregation rules go
//!
//! Publishing is synchronous and never waits on the network. Each bus owns
//! its own buffering: detector queues, the Kafka producer's local queue, or
//! an in-process channel.

use std::fmt::Debug;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::cluster::MembershipCache;
use crate::queue::QueueRegistry;
use crate::rpc::AggrPacket;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no aggregation detector for rule {0}")]
    NoDetector(u64),
    #[error("aggregation buffer full")]
    Full,
    #[error("aggregation bus closed")]
    Closed,
    #[error("aggregation packet encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("kafka error: {0}")]
    Kafka(String),
}

pub trait AggregationBus: Send + Sync {
    fn publish(&self, packet: AggrPacket) -> Result<(), BusError>;
}

/// Routes each rule to one detector of the local region over the
/// aggregation ring, through a per-detector queue
pub struct DetectorBus {
    membership: Arc<MembershipCache>,
    queues: Arc<QueueRegistry<AggrPacket>>,
}

impl DetectorBus {
    pub fn new(membership: Arc<MembershipCache>, queues: Arc<QueueRegistry<AggrPacket>>) -> Self {
        Self { membership, queues }
    }

    pub fn queues(&self) -> &Arc<QueueRegistry<AggrPacket>> {
        &self.queues
    }
}

impl AggregationBus for DetectorBus {
    fn publish(&self, packet: AggrPacket) -> Result<(), BusError> {
        let rule_id = packet.rule_id;
        let view = self.membership.aggregation().ok_or(BusError::NoDetector(rule_id))?;
        let addr = view
            .addresses_for_str(&rule_id.to_string())
            .first()
            .ok_or(BusError::NoDetector(rule_id))?;

        if self.queues.push(addr, packet) {
            Ok(())
        } else {
            Err(BusError::Full)
        }
    }
}

/// In-process bus backed by a bounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelBus {
    tx: mpsc::Sender<AggrPacket>,
}

impl ChannelBus {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AggrPacket>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl AggregationBus for ChannelBus {
    fn publish(&self, packet: AggrPacket) -> Result<(), BusError> {
        self.tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BusError::Full,
            mpsc::error::TrySendError::Closed(_) => BusError::Closed,
        })
    }
}

#[cfg(feature = "kafka")]
pub use kafka::KafkaBus;

#[cfg(feature = "kafka")]
mod kafka {
    use rdkafka::producer::BaseRecord;

    use super::{AggregationBus, BusError};
    use crate::adapters::{KafkaConfig, KafkaProducer, LogDeliveryContext};
    use crate::rpc::AggrPacket;

    /// Packets as JSON records keyed by rule id, so one rule stays on one
    /// partition
    pub struct KafkaBus {
        topic: String,
        producer: KafkaProducer,
    }

    impl KafkaBus {
        pub fn new(config: &KafkaConfig) -> anyhow::Result<Self> {
            let producer = config.client_config().create_with_context(LogDeliveryContext)?;
            Ok(Self {
                topic: config.topic.clone(),
                producer,
            })
        }
    }

    impl AggregationBus for KafkaBus {
        fn publish(&self, packet: AggrPacket) -> Result<(), BusError> {
            let key = packet.rule_id.to_string();
            let payload = serde_json::to_vec(&packet)?;
            let record = BaseRecord::to(&self.topic).key(key.as_bytes()).payload(&payload);
            self.producer.send(record).map_err(|(e, _record)| BusError::Kafka(e.to_string()))
        }
    }
}
