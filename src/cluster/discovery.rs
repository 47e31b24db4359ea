use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, trace};

use super::{Instance, Role};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no discovery address configured")]
    NoAddress,
    #[error("discovery request to {addr} failed: {source}")]
    Request {
        addr: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("discovery at {addr} answered {status}")]
    Status { addr: String, status: u16 },
    #[error("discovery at {addr} reported: {message}")]
    Remote { addr: String, message: String },
}

/// Source of live instances per role
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn instances(&self, role: Role) -> Result<Vec<Instance>, DiscoveryError>;
}

/// `{"dat": ..., "err": ""}` envelope used by the control plane
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    pub dat: Option<T>,
    #[serde(default)]
    pub err: String,
}

/// Control-plane discovery over HTTP
///
/// Addresses are tried in order; the first usable answer wins.
pub struct HttpDiscovery {
    addrs: Vec<String>,
    client: reqwest::Client,
}

impl HttpDiscovery {
    pub fn new(addrs: Vec<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { addrs, client })
    }

    async fn fetch(&self, addr: &str, role: Role) -> Result<Vec<Instance>, DiscoveryError> {
        let url = format!("{}/v1/n9e/instances", addr.trim_end_matches('/'));
        trace!("fetching {role} instances from {url}");

        let response = self
            .client
            .get(&url)
            .query(&[("role", role.as_str())])
            .send()
            .await
            .map_err(|source| DiscoveryError::Request {
                addr: addr.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Status {
                addr: addr.to_string(),
                status: response.status().as_u16(),
            });
        }

        let envelope: Envelope<Vec<Instance>> = response.json().await.map_err(|source| DiscoveryError::Request {
            addr: addr.to_string(),
            source,
        })?;

        if !envelope.err.is_empty() {
            return Err(DiscoveryError::Remote {
                addr: addr.to_string(),
                message: envelope.err,
            });
        }

        Ok(envelope.dat.unwrap_or_default())
    }
}

#[async_trait]
impl Discovery for HttpDiscovery {
    async fn instances(&self, role: Role) -> Result<Vec<Instance>, DiscoveryError> {
        let mut last_err = DiscoveryError::NoAddress;
        for addr in &self.addrs {
            match self.fetch(addr, role).await {
                Ok(instances) => return Ok(instances),
                Err(e) => {
                    debug!("discovery via {addr} failed: {e}");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

/// Fixed membership from configuration
///
/// Static instances carry no heartbeat; they are stamped with the current
/// time on every read so they never age out.
pub struct StaticDiscovery {
    members: RwLock<HashMap<Role, Vec<Instance>>>,
    clock: crate::clock::Clock,
}

impl StaticDiscovery {
    pub fn new(members: HashMap<Role, Vec<Instance>>, clock: crate::clock::Clock) -> Self {
        Self {
            members: RwLock::new(members),
            clock,
        }
    }

    /// Replace the member list (config reload)
    pub fn replace(&self, members: HashMap<Role, Vec<Instance>>) {
        *self.members.write() = members;
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn instances(&self, role: Role) -> Result<Vec<Instance>, DiscoveryError> {
        let now = self.clock.now();
        Ok(self
            .members
            .read()
            .get(&role)
            .map(|list| {
                list.iter()
                    .cloned()
                    .map(|mut i| {
                        i.heartbeat_ts = now;
                        i
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
