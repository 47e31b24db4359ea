use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::Rule;
use crate::cluster::Envelope;

/// What the control plane publishes for routing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Known identities, expanded against glob filters
    #[serde(default)]
    pub endpoints: Vec<String>,
}

#[derive(Debug, Error)]
pub enum RuleSourceError {
    #[error("no rule source address configured")]
    NoAddress,
    #[error("rule request to {addr} failed: {source}")]
    Request {
        addr: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("rule source at {addr} answered {status}")]
    Status { addr: String, status: u16 },
    #[error("rule source at {addr} reported: {message}")]
    Remote { addr: String, message: String },
}

#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn fetch(&self) -> Result<RuleSet, RuleSourceError>;
}

/// `GET {addr}/v1/n9e/rules`, addresses tried in order
pub struct HttpRuleSource {
    addrs: Vec<String>,
    client: reqwest::Client,
}

impl HttpRuleSource {
    pub fn new(addrs: Vec<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { addrs, client })
    }

    async fn fetch_from(&self, addr: &str) -> Result<RuleSet, RuleSourceError> {
        let url = format!("{}/v1/n9e/rules", addr.trim_end_matches('/'));
        let request_err = |source| RuleSourceError::Request {
            addr: addr.to_string(),
            source,
        };

        let response = self.client.get(&url).send().await.map_err(request_err)?;
        if !response.status().is_success() {
            return Err(RuleSourceError::Status {
                addr: addr.to_string(),
                status: response.status().as_u16(),
            });
        }

        let envelope: Envelope<RuleSet> = response.json().await.map_err(request_err)?;
        if !envelope.err.is_empty() {
            return Err(RuleSourceError::Remote {
                addr: addr.to_string(),
                message: envelope.err,
            });
        }
        Ok(envelope.dat.unwrap_or_default())
    }
}

#[async_trait]
impl RuleSource for HttpRuleSource {
    async fn fetch(&self) -> Result<RuleSet, RuleSourceError> {
        let mut last_err = RuleSourceError::NoAddress;
        for addr in &self.addrs {
            match self.fetch_from(addr).await {
                Ok(set) => return Ok(set),
                Err(e) => {
                    debug!("rule fetch via {addr} failed: {e}");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

/// Rules from configuration, replaceable on reload
#[derive(Debug, Default)]
pub struct StaticRuleSource {
    set: RwLock<RuleSet>,
}

impl StaticRuleSource {
    pub fn new(set: RuleSet) -> Self {
        Self { set: RwLock::new(set) }
    }

    pub fn replace(&self, set: RuleSet) {
        *self.set.write() = set;
    }
}

#[async_trait]
impl RuleSource for StaticRuleSource {
    async fn fetch(&self) -> Result<RuleSet, RuleSourceError> {
        Ok(self.set.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_http_rule_source() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/n9e/rules"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "dat": {
                    "rules": [{"id": 1, "filters": [{"endpoint": "h*", "metric": "net.in"}]}],
                    "endpoints": ["h1", "h2"]
                },
                "err": ""
            })))
            .mount(&server)
            .await;

        let source = HttpRuleSource::new(vec![server.uri()], Duration::from_secs(1)).unwrap();
        let set = source.fetch().await.unwrap();

        assert_eq!(set.rules.len(), 1);
        assert_eq!(set.rules[0].id, 1);
        assert_eq!(set.endpoints, vec!["h1".to_string(), "h2".to_string()]);
    }

    #[tokio::test]
    async fn test_unreachable_source_fails() {
        let source = HttpRuleSource::new(vec!["http://127.0.0.1:1".to_string()], Duration::from_millis(200)).unwrap();
        assert!(source.fetch().await.is_err());
    }
}
