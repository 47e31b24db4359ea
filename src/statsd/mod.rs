//! Statsd-style pre-aggregation
//!
//! Clients send three-line packets (`value`, `[namespace/]metric`,
//! `[tags|]aggregator`). Packets are folded into per-series accumulators for
//! a ten second window; on each roll the window is frozen and its points are
//! handed to the dispatcher like any pushed point.

mod accumulator;
mod aggregator;
mod digest;
mod parse;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownSignal;

pub use accumulator::{Accumulator, Emitted, Histogram, RpcStats, is_error_code};
pub use aggregator::{ROLL_SECS, RolledState, StatsdAggregator, window_start};
pub use digest::TDigest;
pub use parse::{AggrSpec, HistogramStat, Packet, Sample, StatsdParseError, TRACE_ID_TAG};

/// Largest datagram accepted on the UDP listener
const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatsdConfig {
    /// UDP listen address; the aggregator is off when unset
    pub listen: Option<String>,
    /// Endpoint for packets that carry no namespace; defaults to the hostname
    pub endpoint: Option<String>,
}

/// Receive datagrams into `aggregator` until shutdown
pub async fn serve_udp(socket: UdpSocket, aggregator: Arc<StatsdAggregator>, mut shutdown: ShutdownSignal) {
    if let Ok(addr) = socket.local_addr() {
        info!("statsd listener on udp://{addr}");
    }

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            r = socket.recv_from(&mut buf) => r,
            _ = shutdown.recv() => break,
        };

        match received {
            Ok((len, peer)) => {
                let text = String::from_utf8_lossy(&buf[..len]);
                let rejected = aggregator.collect_datagram(&text);
                if rejected > 0 {
                    debug!("{rejected} bad statsd packets from {peer}");
                }
            }
            Err(e) => warn!("statsd receive failed: {e}"),
        }
    }
    debug!("statsd listener stopped");
}
