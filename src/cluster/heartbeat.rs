use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::discovery::Envelope;
use crate::actors::scheduler::PeriodicTask;
use crate::clock::Clock;

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(3)
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: default_heartbeat_interval(),
            timeout: default_heartbeat_timeout(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    hostname: &'a str,
    offset_ms: i64,
    extend_info: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct HeartbeatReply {
    #[serde(default)]
    now_ms: Option<i64>,
}

/// Announces this instance to the control plane
///
/// `offset_ms` is the control plane's clock minus ours, estimated at the
/// midpoint of the previous round trip.
pub struct Heartbeat {
    addrs: Vec<String>,
    client: reqwest::Client,
    hostname: String,
    extend_info: String,
    clock: Clock,
    offset_ms: AtomicI64,
}

impl Heartbeat {
    pub fn new(addrs: Vec<String>, hostname: String, extend_info: String, clock: Clock, config: &HeartbeatConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            addrs,
            client,
            hostname,
            extend_info,
            clock,
            offset_ms: AtomicI64::new(0),
        })
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Send one heartbeat; the first address that accepts it wins
    pub async fn beat(&self) -> anyhow::Result<()> {
        let mut last_err = anyhow::anyhow!("no discovery address configured");
        for addr in &self.addrs {
            match self.beat_to(addr).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("heartbeat to {addr} failed: {e:#}");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn beat_to(&self, addr: &str) -> anyhow::Result<()> {
        let url = format!("{}/v1/n9e/heartbeat", addr.trim_end_matches('/'));
        let body = HeartbeatRequest {
            hostname: &self.hostname,
            offset_ms: self.offset_ms(),
            extend_info: &self.extend_info,
        };

        let sent_at = self.clock.now_ms();
        let response = self.client.post(&url).json(&body).send().await?;
        let received_at = self.clock.now_ms();

        if !response.status().is_success() {
            anyhow::bail!("heartbeat answered {}", response.status());
        }

        let envelope: Envelope<HeartbeatReply> = response.json().await?;
        if !envelope.err.is_empty() {
            anyhow::bail!("heartbeat rejected: {}", envelope.err);
        }

        if let Some(remote_now) = envelope.dat.and_then(|d| d.now_ms) {
            let midpoint = sent_at + (received_at - sent_at) / 2;
            let offset = remote_now.saturating_sub(midpoint);
            self.offset_ms.store(offset, Ordering::Relaxed);
            trace!("clock offset to control plane: {offset}ms");
        }
        Ok(())
    }
}

pub struct HeartbeatTask(pub std::sync::Arc<Heartbeat>);

#[async_trait]
impl PeriodicTask for HeartbeatTask {
    async fn tick(&mut self) -> anyhow::Result<()> {
        self.0.beat().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_offset_from_reply_is_sent_next_time() {
        let server = MockServer::start().await;
        let clock = Clock::manual(1_000);

        Mock::given(method("POST"))
            .and(path("/v1/n9e/heartbeat"))
            .and(body_partial_json(json!({"hostname": "transfer-01", "offset_ms": 0})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"dat": {"now_ms": 1_000_250}, "err": ""})))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/v1/n9e/heartbeat"))
            .and(body_partial_json(json!({"offset_ms": 250})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"dat": null, "err": ""})))
            .expect(1)
            .mount(&server)
            .await;

        let heartbeat = Heartbeat::new(
            vec![server.uri()],
            "transfer-01".to_string(),
            r#"{"rpc":"0.0.0.0:8004"}"#.to_string(),
            clock,
            &HeartbeatConfig::default(),
        )
        .unwrap();

        heartbeat.beat().await.unwrap();
        assert_eq!(heartbeat.offset_ms(), 250);
        heartbeat.beat().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_envelope_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"dat": null, "err": "unknown host"})))
            .mount(&server)
            .await;

        let heartbeat = Heartbeat::new(
            vec![server.uri()],
            "h".to_string(),
            String::new(),
            Clock::manual(0),
            &HeartbeatConfig::default(),
        )
        .unwrap();
        assert!(heartbeat.beat().await.is_err());
    }
}
