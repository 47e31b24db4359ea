use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{PushEndpoint, PushError, default_timeout};
use crate::point::{Point, SharedPoint};

#[derive(Debug, Clone, Deserialize)]
pub struct M3DbConfig {
    pub name: String,
    /// Coordinator base URL, e.g. `http://127.0.0.1:7201`
    pub url: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Body of one `json/write` call
#[derive(Debug, Serialize, PartialEq)]
pub struct M3Write<'a> {
    pub tags: BTreeMap<&'a str, String>,
    /// Unix seconds, as a string
    pub timestamp: String,
    pub value: f64,
}

impl<'a> M3Write<'a> {
    pub fn from_point(point: &'a Point) -> Self {
        let mut tags: BTreeMap<&str, String> = point
            .tags
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        tags.insert("__name__", point.metric.replace('.', "_"));
        tags.insert("endpoint", point.identity.key().into_owned());

        Self {
            tags,
            timestamp: point.timestamp.to_string(),
            value: point.value,
        }
    }
}

/// M3 coordinator JSON write API, one request per point
pub struct M3DbEndpoint {
    config: M3DbConfig,
    client: reqwest::Client,
    write_url: String,
}

impl M3DbEndpoint {
    pub fn new(config: M3DbConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        let write_url = format!("{}/api/v1/json/write", config.url.trim_end_matches('/'));
        Ok(Self {
            config,
            client,
            write_url,
        })
    }
}

#[async_trait]
impl PushEndpoint for M3DbEndpoint {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn push(&self, batch: &[SharedPoint]) -> Result<(), PushError> {
        for point in batch {
            let response = self
                .client
                .post(&self.write_url)
                .json(&M3Write::from_point(point))
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(PushError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_one_request_per_point() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/json/write"))
            .and(body_json(json!({
                "tags": {"__name__": "cpu_idle", "endpoint": "h1", "core": "0"},
                "timestamp": "100",
                "value": 99.0
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let endpoint = M3DbEndpoint::new(M3DbConfig {
            name: "m3".to_string(),
            url: format!("{}/", server.uri()),
            timeout: Duration::from_secs(1),
        })
        .unwrap();

        let point = Arc::new(Point::new("h1", "cpu.idle", 99.0, 100).with_tag("core", "0"));
        endpoint.push(&[point.clone(), point]).await.unwrap();
    }

    #[tokio::test]
    async fn test_first_failure_aborts_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = M3DbEndpoint::new(M3DbConfig {
            name: "m3".to_string(),
            url: server.uri(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();

        let point = Arc::new(Point::new("h1", "m", 1.0, 1));
        assert!(endpoint.push(&[point.clone(), point]).await.is_err());
    }
}
