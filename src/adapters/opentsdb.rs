use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout_at};
use tracing::debug;

use super::{PushEndpoint, PushError, default_timeout};
use crate::point::{Point, SharedPoint};

/// Staging buffer size; a full buffer is written out before appending more
pub const STAGING_CAPACITY: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct OpenTsdbConfig {
    pub name: String,
    /// `host:port` of the telnet-style listener
    pub addr: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// OpenTSDB `put` lines over one long-lived TCP connection
pub struct OpenTsdbEndpoint {
    config: OpenTsdbConfig,
    conn: Mutex<Option<TcpStream>>,
}

impl OpenTsdbEndpoint {
    pub fn new(config: OpenTsdbConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    async fn write_batch(&self, batch: &[SharedPoint]) -> Result<(), PushError> {
        let deadline = Instant::now() + self.config.timeout;
        let elapsed = |_| PushError::Timeout(self.config.timeout);

        let mut guard = timeout_at(deadline, self.conn.lock()).await.map_err(elapsed)?;
        if guard.is_none() {
            debug!("connecting to opentsdb at {}", self.config.addr);
            let stream = timeout_at(deadline, TcpStream::connect(&self.config.addr))
                .await
                .map_err(elapsed)??;
            *guard = Some(stream);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(PushError::Rejected("opentsdb connection unavailable".to_string()));
        };

        match timeout_at(deadline, write_lines(stream, batch)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                // the stream may hold a partial line
                *guard = None;
                Err(e.into())
            }
            Err(_) => {
                *guard = None;
                Err(PushError::Timeout(self.config.timeout))
            }
        }
    }
}

async fn write_lines(stream: &mut TcpStream, batch: &[SharedPoint]) -> std::io::Result<()> {
    let mut staging = Vec::with_capacity(STAGING_CAPACITY.min(batch.len() * 128));
    for point in batch {
        let before = staging.len();
        write_put_line(&mut staging, point);
        if staging.len() >= STAGING_CAPACITY && before > 0 {
            // flush everything up to the line that overflowed
            let tail = staging.split_off(before);
            stream.write_all(&staging).await?;
            staging = tail;
        }
    }
    if !staging.is_empty() {
        stream.write_all(&staging).await?;
    }
    stream.flush().await
}

#[async_trait]
impl PushEndpoint for OpenTsdbEndpoint {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn push(&self, batch: &[SharedPoint]) -> Result<(), PushError> {
        self.write_batch(batch).await
    }
}

/// `put <metric> <ts> <value> endpoint=<identity> k=v ...`
pub fn write_put_line(buf: &mut Vec<u8>, point: &Point) {
    let _ = write!(
        buf,
        "put {} {} {} endpoint={}",
        sanitize(&point.metric),
        point.timestamp,
        point.value,
        sanitize(&point.identity.key())
    );
    for (key, value) in &point.tags {
        if key == "endpoint" {
            continue;
        }
        let _ = write!(buf, " {}={}", sanitize(key), sanitize(value));
    }
    buf.push(b'\n');
}

/// Whitespace separates fields in the text protocol
fn sanitize(s: &str) -> String {
    s.chars().map(|c| if c.is_whitespace() { '_' } else { c }).collect()
}
