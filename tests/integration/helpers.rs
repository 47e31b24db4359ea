//! Helper functions for integration tests

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metric_transfer::clock::{Clock, system_now_ms};
use metric_transfer::cluster::{Instance, Role};
use metric_transfer::config::{Config, ListenConfig};
use metric_transfer::point::SharedPoint;
use metric_transfer::rpc::server::{RequestHandler, serve};
use metric_transfer::rpc::{AggrPacket, JudgeItem, Request, Response};
use metric_transfer::shutdown::Shutdown;
use parking_lot::Mutex;
use tokio::net::TcpListener;

/// RPC peer that acknowledges and records everything it is sent
#[derive(Default)]
pub struct RecordingPeer {
    pub stored: Mutex<Vec<SharedPoint>>,
    pub judged: Mutex<Vec<JudgeItem>>,
    pub aggregated: Mutex<Vec<AggrPacket>>,
}

impl RecordingPeer {
    pub fn stored_len(&self) -> usize {
        self.stored.lock().len()
    }

    pub fn stored_canonicals(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stored.lock().iter().map(|p| p.canonical()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl RequestHandler for RecordingPeer {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Store(points) => {
                let n = points.len() as u32;
                self.stored.lock().extend(points);
                Response::Ack(n)
            }
            Request::Judge(items) => {
                let n = items.len() as u32;
                self.judged.lock().extend(items);
                Response::Ack(n)
            }
            Request::Aggregate(packets) => {
                let n = packets.len() as u32;
                self.aggregated.lock().extend(packets);
                Response::Ack(n)
            }
            Request::Ping => Response::Pong,
            other => Response::Error(format!("unexpected {}", other.method())),
        }
    }
}

/// A recording peer listening on an ephemeral port
pub struct Peer {
    pub addr: String,
    pub recorder: Arc<RecordingPeer>,
    _shutdown: Shutdown,
}

pub async fn spawn_peer() -> Peer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let recorder = Arc::new(RecordingPeer::default());
    let shutdown = Shutdown::new();
    tokio::spawn(serve(listener, recorder.clone(), shutdown.subscribe()));
    Peer {
        addr,
        recorder,
        _shutdown: shutdown,
    }
}

pub fn instance(node: &str, addr: &str) -> Instance {
    Instance {
        node: node.to_string(),
        addr: addr.to_string(),
        heartbeat_ts: 0,
        region: None,
    }
}

pub fn now_secs() -> i64 {
    system_now_ms() / 1000
}

pub fn test_clock() -> Clock {
    Clock::manual(now_secs())
}

/// Config listening on ephemeral local ports with fast senders
pub fn test_config(members: HashMap<Role, Vec<Instance>>) -> Config {
    let mut config = Config {
        listen: ListenConfig {
            rpc: Some("127.0.0.1:0".to_string()),
            http: Some("127.0.0.1:0".to_string()),
        },
        ..Config::default()
    };
    config.discovery.members = members;
    config.sender.idle_interval = Duration::from_millis(10);
    config.shutdown_drain_deadline = Duration::from_secs(5);
    config
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Like [`wait_until`] for async checks
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
