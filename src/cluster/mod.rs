//! Cluster membership
//!
//! Live instances are pulled per role from a [`Discovery`] implementation and
//! turned into immutable [`ClusterView`]s: a hash ring over logical nodes plus
//! the physical addresses backing each node.
//!
//! ```text
//! discovery ──► [Instance] ──alive?──► node → [addr] ──► HashRing ──► ArcSwap<ClusterView>
//! ```

mod discovery;
mod heartbeat;
mod membership;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ring::HashRing;

pub(crate) use discovery::Envelope;
pub use discovery::{Discovery, DiscoveryError, HttpDiscovery, StaticDiscovery};
pub use heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatTask};
pub use membership::{DepartureHook, MembershipCache, MembershipConfig, MembershipTask, RefreshOutcome};

/// Region used when an instance does not report one
pub const DEFAULT_REGION: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Storage,
    Judge,
    Aggregation,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Storage, Role::Judge, Role::Aggregation];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Storage => "storage",
            Role::Judge => "judge",
            Role::Aggregation => "aggregation",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One live process as reported by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Logical node; several instances may back one node for replication
    pub node: String,
    /// `host:port` of the RPC listener
    pub addr: String,
    /// Unix seconds of the last heartbeat
    #[serde(rename = "ts", alias = "heartbeat_ts", default)]
    pub heartbeat_ts: i64,
    #[serde(default)]
    pub region: Option<String>,
}

impl Instance {
    pub fn region(&self) -> &str {
        self.region.as_deref().filter(|r| !r.is_empty()).unwrap_or(DEFAULT_REGION)
    }
}

/// Immutable routing view of one role (or one region of a role)
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    ring: HashRing,
    /// node → physical addresses, sorted
    addrs: BTreeMap<String, Vec<String>>,
}

impl ClusterView {
    pub fn new(addrs: BTreeMap<String, Vec<String>>, replicas: usize) -> Self {
        let ring = HashRing::new(addrs.keys().cloned(), replicas);
        Self { ring, addrs }
    }

    /// Group instances by node into a view
    pub fn from_instances<'a>(instances: impl IntoIterator<Item = &'a Instance>, replicas: usize) -> Self {
        Self::new(group_by_node(instances), replicas)
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    pub fn addrs(&self) -> &BTreeMap<String, Vec<String>> {
        &self.addrs
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Physical addresses of the node owning `key`
    pub fn addresses_for(&self, key: u64) -> &[String] {
        self.ring
            .node_for(key)
            .and_then(|node| self.addrs.get(node))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn addresses_for_str(&self, key: &str) -> &[String] {
        self.ring
            .node_for_str(key)
            .and_then(|node| self.addrs.get(node))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn all_addresses(&self) -> impl Iterator<Item = &String> {
        self.addrs.values().flatten()
    }

    /// True if a rebuild from `addrs` with `replicas` would change nothing
    pub fn matches(&self, addrs: &BTreeMap<String, Vec<String>>, replicas: usize) -> bool {
        let nodes: BTreeSet<String> = addrs.keys().cloned().collect();
        self.ring.same_shape(&nodes, replicas) && &self.addrs == addrs
    }
}

pub fn group_by_node<'a>(instances: impl IntoIterator<Item = &'a Instance>) -> BTreeMap<String, Vec<String>> {
    let mut addrs: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for instance in instances {
        addrs.entry(instance.node.clone()).or_default().push(instance.addr.clone());
    }
    for list in addrs.values_mut() {
        list.sort();
        list.dedup();
    }
    addrs
}
