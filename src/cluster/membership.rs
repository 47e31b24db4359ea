use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use arc_swap::{ArcSwap, Guard};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::{ClusterView, DEFAULT_REGION, Discovery, DiscoveryError, Instance, Role, group_by_node};
use crate::actors::scheduler::PeriodicTask;
use crate::clock::Clock;
use crate::ring::DEFAULT_REPLICAS;
use crate::rpc::PoolRegistry;
use crate::stats::{self, Counter, Stats};

#[derive(Debug, Clone, Deserialize)]
pub struct MembershipConfig {
    #[serde(default = "default_discovery_interval", with = "humantime_serde")]
    pub discovery_interval: Duration,
    #[serde(default = "default_liveness_window", with = "humantime_serde")]
    pub liveness_window: Duration,
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    /// Region whose aggregation detectors this instance feeds
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_discovery_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_liveness_window() -> Duration {
    Duration::from_secs(30)
}

fn default_replicas() -> usize {
    DEFAULT_REPLICAS
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            discovery_interval: default_discovery_interval(),
            liveness_window: default_liveness_window(),
            replicas: default_replicas(),
            region: default_region(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Unchanged,
    Rebuilt,
    /// Nothing alive was reported; the previous view stays in place
    KeptPrevious,
}

/// Called after a rebuild with every address still alive in some role
pub type DepartureHook = Arc<dyn Fn(&HashSet<String>) + Send + Sync>;

/// Current views of every role, rebuilt from discovery
pub struct MembershipCache {
    discovery: Arc<dyn Discovery>,
    storage: ArcSwap<ClusterView>,
    judge: ArcSwap<ClusterView>,
    /// region → view
    aggregation: ArcSwap<BTreeMap<String, Arc<ClusterView>>>,
    replicas: AtomicUsize,
    liveness_window: Duration,
    region: String,
    clock: Clock,
    pools: PoolRegistry,
    departure_hooks: Mutex<Vec<DepartureHook>>,
    discovery_err: Counter,
    discovery_empty: Counter,
}

impl MembershipCache {
    pub fn new(discovery: Arc<dyn Discovery>, config: &MembershipConfig, clock: Clock, pools: PoolRegistry, stats: &Stats) -> Self {
        Self {
            discovery,
            storage: ArcSwap::from_pointee(ClusterView::default()),
            judge: ArcSwap::from_pointee(ClusterView::default()),
            aggregation: ArcSwap::from_pointee(BTreeMap::new()),
            replicas: AtomicUsize::new(config.replicas),
            liveness_window: config.liveness_window,
            region: config.region.clone(),
            clock,
            pools,
            departure_hooks: Mutex::new(Vec::new()),
            discovery_err: stats.counter(stats::DISCOVERY_ERR),
            discovery_empty: stats.counter(stats::DISCOVERY_EMPTY),
        }
    }

    pub fn storage(&self) -> Guard<Arc<ClusterView>> {
        self.storage.load()
    }

    pub fn judge(&self) -> Guard<Arc<ClusterView>> {
        self.judge.load()
    }

    /// Aggregation detectors of the local region
    pub fn aggregation(&self) -> Option<Arc<ClusterView>> {
        self.aggregation.load().get(&self.region).cloned()
    }

    pub fn aggregation_region(&self, region: &str) -> Option<Arc<ClusterView>> {
        self.aggregation.load().get(region).cloned()
    }

    pub fn replicas(&self) -> usize {
        self.replicas.load(Ordering::Relaxed)
    }

    /// Run `hook` after every rebuild, before departed pools are closed
    pub fn on_departure(&self, hook: DepartureHook) {
        self.departure_hooks.lock().push(hook);
    }

    /// Takes effect at the next refresh
    pub fn set_replicas(&self, replicas: usize) {
        self.replicas.store(replicas, Ordering::Relaxed);
    }

    /// Refresh every role; returns the first discovery error, if any
    ///
    /// Roles are independent: a failure for one never blocks the others.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<bool, DiscoveryError> {
        let mut rebuilt = false;
        let mut first_err = None;

        for role in Role::ALL {
            match self.refresh_role(role).await {
                Ok(outcome) => rebuilt |= outcome == RefreshOutcome::Rebuilt,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        if rebuilt {
            self.retire_departed();
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(rebuilt),
        }
    }

    pub async fn refresh_role(&self, role: Role) -> Result<RefreshOutcome, DiscoveryError> {
        let instances = match self.discovery.instances(role).await {
            Ok(instances) => instances,
            Err(e) => {
                self.discovery_err.incr();
                warn!("discovery of {role} failed, keeping previous view: {e}");
                return Err(e);
            }
        };

        let now = self.clock.now();
        let window = self.liveness_window.as_secs() as i64;
        let alive: Vec<&Instance> = instances.iter().filter(|i| now.saturating_sub(i.heartbeat_ts) <= window).collect();

        if alive.is_empty() {
            self.discovery_empty.incr();
            debug!("no live {role} instances, keeping previous view");
            return Ok(RefreshOutcome::KeptPrevious);
        }

        let replicas = self.replicas();
        let outcome = match role {
            Role::Storage => self.rebuild(&self.storage, role, &alive, replicas),
            Role::Judge => self.rebuild(&self.judge, role, &alive, replicas),
            Role::Aggregation => self.rebuild_regions(&alive, replicas),
        };
        Ok(outcome)
    }

    fn rebuild(&self, slot: &ArcSwap<ClusterView>, role: Role, alive: &[&Instance], replicas: usize) -> RefreshOutcome {
        let addrs = group_by_node(alive.iter().copied());
        if slot.load().matches(&addrs, replicas) {
            return RefreshOutcome::Unchanged;
        }

        info!("{role} membership changed: {:?}", addrs.keys().collect::<Vec<_>>());
        slot.store(Arc::new(ClusterView::new(addrs, replicas)));
        RefreshOutcome::Rebuilt
    }

    fn rebuild_regions(&self, alive: &[&Instance], replicas: usize) -> RefreshOutcome {
        let mut by_region: BTreeMap<String, Vec<&Instance>> = BTreeMap::new();
        for instance in alive {
            by_region.entry(instance.region().to_string()).or_default().push(*instance);
        }

        let current = self.aggregation.load();
        let mut changed = by_region.len() != current.len();
        let mut next = BTreeMap::new();

        for (region, instances) in by_region {
            let addrs = group_by_node(instances.iter().copied());
            match current.get(&region) {
                Some(view) if view.matches(&addrs, replicas) => {
                    next.insert(region, view.clone());
                }
                _ => {
                    info!("aggregation membership in {region} changed: {:?}", addrs.keys().collect::<Vec<_>>());
                    changed = true;
                    next.insert(region, Arc::new(ClusterView::new(addrs, replicas)));
                }
            }
        }

        if !changed {
            return RefreshOutcome::Unchanged;
        }
        self.aggregation.store(Arc::new(next));
        RefreshOutcome::Rebuilt
    }

    /// Addresses present in at least one role
    pub fn live_addresses(&self) -> HashSet<String> {
        let mut live: HashSet<String> = HashSet::new();
        live.extend(self.storage.load().all_addresses().cloned());
        live.extend(self.judge.load().all_addresses().cloned());
        for view in self.aggregation.load().values() {
            live.extend(view.all_addresses().cloned());
        }
        live
    }

    /// Stop everything bound to addresses that left every role
    ///
    /// Hooks go first so senders of departed destinations stop before their
    /// pools close.
    fn retire_departed(&self) {
        let live = self.live_addresses();
        let hooks: Vec<DepartureHook> = self.departure_hooks.lock().clone();
        for hook in hooks {
            hook(&live);
        }
        self.pools.retain(&live);
    }
}

/// Periodic driver for [`MembershipCache::refresh`]
pub struct MembershipTask(pub Arc<MembershipCache>);

#[async_trait]
impl PeriodicTask for MembershipTask {
    async fn tick(&mut self) -> anyhow::Result<()> {
        self.0.refresh().await?;
        Ok(())
    }
}
