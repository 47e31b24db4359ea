use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::{IdentityTracker, RoutingSnapshot, RoutingTable, RuleSource, RuleSourceError};
use crate::actors::scheduler::PeriodicTask;
use crate::clock::Clock;
use crate::stats::{self, Counter, Stats};

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_refresh", with = "humantime_serde")]
    pub refresh: Duration,
    /// How long an observed identity stays in the glob inventory
    #[serde(default = "default_identity_ttl", with = "humantime_serde")]
    pub identity_ttl: Duration,
    /// Rule source addresses; empty means rules come from the config file
    #[serde(default)]
    pub addrs: Vec<String>,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_refresh() -> Duration {
    Duration::from_secs(8)
}

fn default_identity_ttl() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_timeout() -> Duration {
    Duration::from_secs(3)
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            refresh: default_refresh(),
            identity_ttl: default_identity_ttl(),
            addrs: Vec::new(),
            timeout: default_timeout(),
        }
    }
}

/// Pulls rules and rebuilds the routing table
pub struct RoutingCache {
    source: Arc<dyn RuleSource>,
    table: Arc<RoutingTable>,
    tracker: Arc<IdentityTracker>,
    identity_ttl: i64,
    clock: Clock,
    refresh_err: Counter,
    empty_guard: Counter,
}

impl RoutingCache {
    pub fn new(
        source: Arc<dyn RuleSource>,
        table: Arc<RoutingTable>,
        tracker: Arc<IdentityTracker>,
        config: &RoutingConfig,
        clock: Clock,
        stats: &Stats,
    ) -> Self {
        Self {
            source,
            table,
            tracker,
            identity_ttl: config.identity_ttl.as_secs() as i64,
            clock,
            refresh_err: stats.counter(stats::ROUTING_REFRESH_ERR),
            empty_guard: stats.counter(stats::ROUTING_EMPTY_GUARD),
        }
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    /// Rebuild and publish; `Ok(false)` when the empty guard kept the old
    /// snapshot
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<bool, RuleSourceError> {
        let set = match self.source.fetch().await {
            Ok(set) => set,
            Err(e) => {
                self.refresh_err.incr();
                warn!("rule fetch failed, keeping previous routing: {e}");
                return Err(e);
            }
        };

        let now = self.clock.now();
        let expired = self.tracker.expire(now, self.identity_ttl);
        if expired > 0 {
            debug!("forgot {expired} idle identities");
        }

        if set.rules.is_empty() && !self.table.load().is_empty() {
            self.empty_guard.incr();
            warn!("rule source returned no rules, keeping previous routing");
            return Ok(false);
        }

        let mut inventory: BTreeSet<String> = set.endpoints.into_iter().collect();
        inventory.extend(self.tracker.inventory(now, self.identity_ttl));

        let snapshot = RoutingSnapshot::build(set.rules, &inventory);
        let (rules, keys) = (snapshot.rule_count(), snapshot.key_count());
        let previous = self.table.load().rule_count();
        self.table.install(snapshot);

        if rules != previous {
            info!("routing rebuilt: {rules} rules over {keys} series keys");
        } else {
            debug!("routing rebuilt: {rules} rules over {keys} series keys");
        }
        Ok(true)
    }
}

pub struct RoutingTask(pub Arc<RoutingCache>);

#[async_trait]
impl PeriodicTask for RoutingTask {
    async fn tick(&mut self) -> anyhow::Result<()> {
        self.0.refresh().await?;
        Ok(())
    }
}
