use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{PushEndpoint, PushError, default_timeout};
use crate::point::{Point, SharedPoint};

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxDbConfig {
    pub name: String,
    /// Base URL, e.g. `http://127.0.0.1:8086`
    pub url: String,
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// InfluxDB 1.x `/write` endpoint, second precision
pub struct InfluxDbEndpoint {
    config: InfluxDbConfig,
    client: reqwest::Client,
    write_url: String,
}

impl InfluxDbEndpoint {
    pub fn new(config: InfluxDbConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        let write_url = format!("{}/write", config.url.trim_end_matches('/'));
        Ok(Self {
            config,
            client,
            write_url,
        })
    }
}

#[async_trait]
impl PushEndpoint for InfluxDbEndpoint {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn push(&self, batch: &[SharedPoint]) -> Result<(), PushError> {
        let mut body = String::with_capacity(batch.len() * 96);
        for point in batch {
            write_line(&mut body, point);
        }

        let mut request = self
            .client
            .post(&self.write_url)
            .query(&[("db", self.config.database.as_str()), ("precision", "s")])
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// `measurement,endpoint=..,k=v value=<v> <ts>`
pub fn write_line(buf: &mut String, point: &Point) {
    buf.push_str(&escape_measurement(&point.metric));
    let _ = write!(buf, ",endpoint={}", escape_tag(&point.identity.key()));
    for (key, value) in &point.tags {
        if key == "endpoint" || value.is_empty() {
            continue;
        }
        let _ = write!(buf, ",{}={}", escape_tag(key), escape_tag(value));
    }
    let _ = writeln!(buf, " value={} {}", point.value, point.timestamp);
}

fn escape_measurement(s: &str) -> String {
    escape(s, &[',', ' '])
}

fn escape_tag(s: &str) -> String {
    escape(s, &[',', '=', ' '])
}

fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
