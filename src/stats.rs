//! Counter registry with periodic self-reporting
//!
//! Counters are sharded by name inside a [`DashMap`]. Hot paths resolve a
//! [`Counter`] handle once and then increment it without touching the map.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::actors::scheduler::PeriodicTask;
use crate::clock::Clock;
use crate::dispatch::Dispatcher;
use crate::point::Point;

pub const POINTS_IN: &str = "points.in";
pub const POINTS_IN_ERR: &str = "points.in.err";
pub const POINTS_OUT: &str = "points.out";
pub const POINTS_OUT_ERR: &str = "points.out.err";
pub const STORAGE_QUEUE_DROP: &str = "storage.queue.drop";
pub const JUDGE_QUEUE_DROP: &str = "judge.queue.drop";
pub const AGGR_QUEUE_DROP: &str = "aggr.queue.drop";
pub const AGGR_BUS_ERR: &str = "aggr.bus.err";
pub const PANIC_TOTAL: &str = "panic.total";
pub const DISCOVERY_ERR: &str = "discovery.err";
pub const DISCOVERY_EMPTY: &str = "discovery.empty";
pub const ROUTING_REFRESH_ERR: &str = "routing.refresh.err";
pub const ROUTING_EMPTY_GUARD: &str = "routing.empty_guard";
pub const CONFIG_RELOAD_ERR: &str = "config.reload.err";
pub const POOL_FETCH: &str = "pool.fetch";
pub const POOL_RELEASE: &str = "pool.release";
pub const POOL_FORCE_CLOSE: &str = "pool.force_close";
pub const STATSD_PACKETS: &str = "statsd.packets";
pub const STATSD_ERR: &str = "statsd.err";
pub const STATSD_SCAN: &str = "statsd.scan";

/// A single named monotonic counter
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    #[inline]
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Process-wide counter registry
///
/// Cloning is cheap; every clone refers to the same registry.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    counters: Arc<DashMap<String, Counter>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve (or create) the counter registered under `name`
    pub fn counter(&self, name: &str) -> Counter {
        if let Some(counter) = self.counters.get(name) {
            return counter.clone();
        }
        self.counters.entry(name.to_string()).or_default().clone()
    }

    pub fn incr(&self, name: &str) {
        self.counter(name).incr();
    }

    pub fn add(&self, name: &str, n: u64) {
        self.counter(name).add(n);
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.get(name).map(|c| c.get()).unwrap_or(0)
    }

    /// Ordered copy of every counter value
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().get()))
            .collect()
    }
}

/// Where self-reported deltas are fed back as points
struct SelfSink {
    dispatcher: Arc<Dispatcher>,
    endpoint: String,
    step: u32,
    clock: Clock,
}

/// Computes per-interval deltas for the periodic self-report
pub struct StatsReporter {
    stats: Stats,
    last: BTreeMap<String, u64>,
    sink: Option<SelfSink>,
}

impl StatsReporter {
    pub fn new(stats: Stats) -> Self {
        Self {
            stats,
            last: BTreeMap::new(),
            sink: None,
        }
    }

    /// Also dispatch every delta as `transfer.<counter>` under `endpoint`
    pub fn with_sink(mut self, dispatcher: Arc<Dispatcher>, endpoint: String, step: u32, clock: Clock) -> Self {
        self.sink = Some(SelfSink {
            dispatcher,
            endpoint,
            step,
            clock,
        });
        self
    }

    /// Log and return the non-zero deltas since the previous call
    pub fn report(&mut self) -> BTreeMap<String, u64> {
        let current = self.stats.snapshot();
        let deltas: BTreeMap<String, u64> = current
            .iter()
            .filter_map(|(name, value)| {
                let prev = self.last.get(name).copied().unwrap_or(0);
                let delta = value.saturating_sub(prev);
                (delta > 0).then(|| (name.clone(), delta))
            })
            .collect();

        if !deltas.is_empty() {
            let line = deltas
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(" ");
            info!("stats: {line}");
        }

        self.last = current;
        deltas
    }
}

#[async_trait]
impl PeriodicTask for StatsReporter {
    async fn tick(&mut self) -> anyhow::Result<()> {
        let deltas = self.report();
        let Some(sink) = &self.sink else {
            return Ok(());
        };

        let now = sink.clock.now();
        let points = deltas.into_iter().map(|(name, delta)| {
            Point::new(sink.endpoint.as_str(), format!("transfer.{name}"), delta as f64, now).with_step(sink.step)
        });
        if let Err(e) = sink.dispatcher.dispatch_all(points) {
            debug!("self-report not dispatched: {e}");
        }
        Ok(())
    }
}
