//! Per-point fan-out
//!
//! ```text
//!                 ┌─► storage ring ─► node ─► every address ─► storage queues
//! point ──────────┼─► named backends (opentsdb, influxdb, ...) ─► their queues
//!                 └─► routing lookup ─► predicate ─┬─► alert rule ─► judge queue
//!                                                  └─► aggregation rule ─► bus
//! ```
//!
//! Storage and rule fan-out are independent: neither one's failure stops
//! the other. Enqueueing never blocks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, trace};

use crate::bus::AggregationBus;
use crate::clock::Clock;
use crate::cluster::MembershipCache;
use crate::point::{Point, SharedPoint};
use crate::queue::QueueRegistry;
use crate::routing::{IdentityTracker, Rule, RuleKind, RoutingTable};
use crate::rpc::{AggrPacket, JudgeItem};
use crate::stats::{self, Counter, Stats};

/// Where storage copies of a point go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageRoute {
    /// Every address of the storage node owning the fingerprint
    Ring,
    /// A configured single-destination backend, by queue key
    Endpoint(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("transfer is shutting down")]
    ShuttingDown,
}

/// Where one point went
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fanout {
    pub storage: usize,
    pub judge: usize,
    pub aggregation: usize,
}

pub struct Dispatcher {
    accepting: AtomicBool,
    routes: Vec<StorageRoute>,
    membership: Arc<MembershipCache>,
    routing: Arc<RoutingTable>,
    tracker: Arc<IdentityTracker>,
    storage: Arc<QueueRegistry<SharedPoint>>,
    judges: Arc<QueueRegistry<JudgeItem>>,
    bus: Option<Arc<dyn AggregationBus>>,
    clock: Clock,
    points_in: Counter,
    bus_err: Counter,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        routes: Vec<StorageRoute>,
        membership: Arc<MembershipCache>,
        routing: Arc<RoutingTable>,
        tracker: Arc<IdentityTracker>,
        storage: Arc<QueueRegistry<SharedPoint>>,
        judges: Arc<QueueRegistry<JudgeItem>>,
        bus: Option<Arc<dyn AggregationBus>>,
        clock: Clock,
        stats: &Stats,
    ) -> Self {
        Self {
            accepting: AtomicBool::new(true),
            routes,
            membership,
            routing,
            tracker,
            storage,
            judges,
            bus,
            clock,
            points_in: stats.counter(stats::POINTS_IN),
            bus_err: stats.counter(stats::AGGR_BUS_ERR),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub fn storage(&self) -> &Arc<QueueRegistry<SharedPoint>> {
        &self.storage
    }

    pub fn judges(&self) -> &Arc<QueueRegistry<JudgeItem>> {
        &self.judges
    }

    pub fn dispatch(&self, point: Point) -> Result<Fanout, DispatchError> {
        if !self.is_accepting() {
            return Err(DispatchError::ShuttingDown);
        }
        self.points_in.incr();
        self.tracker.observe(&point.identity.key(), self.clock.now());

        let point = Arc::new(point);
        let mut fanout = Fanout {
            storage: self.to_storage(&point),
            ..Fanout::default()
        };

        let snapshot = self.routing.load();
        for rule in snapshot.matching(&point) {
            match &rule.kind {
                RuleKind::Alert => fanout.judge += self.to_judge(&rule, &point),
                RuleKind::Aggregation { .. } => fanout.aggregation += self.to_bus(&rule, &point),
            }
        }

        trace!("dispatched {}: {fanout:?}", point.canonical());
        Ok(fanout)
    }

    /// Dispatch every point; stops at the first refusal
    pub fn dispatch_all(&self, points: impl IntoIterator<Item = Point>) -> Result<usize, DispatchError> {
        let mut count = 0;
        for point in points {
            self.dispatch(point)?;
            count += 1;
        }
        Ok(count)
    }

    fn to_storage(&self, point: &SharedPoint) -> usize {
        let mut enqueued = 0;
        for route in &self.routes {
            match route {
                StorageRoute::Ring => {
                    let view = self.membership.storage();
                    let addrs = view.addresses_for(point.fingerprint().ring_key());
                    if addrs.is_empty() {
                        debug!("no storage node for {}", point.canonical());
                    }
                    for addr in addrs {
                        self.storage.push(addr, point.clone());
                        enqueued += 1;
                    }
                }
                StorageRoute::Endpoint(key) => match self.storage.get(key) {
                    Some(dest) => {
                        dest.queue().push(point.clone());
                        enqueued += 1;
                    }
                    None => debug!("storage backend {key} is not registered"),
                },
            }
        }
        enqueued
    }

    fn to_judge(&self, rule: &Rule, point: &SharedPoint) -> usize {
        let view = self.membership.judge();
        let Some(addr) = view.addresses_for_str(&rule.id.to_string()).first() else {
            debug!("no judge for rule {}", rule.id);
            return 0;
        };

        self.judges.push(
            addr,
            JudgeItem {
                rule_id: rule.id,
                point: point.clone(),
            },
        );
        1
    }

    fn to_bus(&self, rule: &Rule, point: &SharedPoint) -> usize {
        let (Some(bus), RuleKind::Aggregation { group_by, step, lateness }) = (&self.bus, &rule.kind) else {
            return 0;
        };

        let packet = AggrPacket {
            rule_id: rule.id,
            group_by: group_by.clone(),
            group_values: group_by
                .iter()
                .map(|key| point.tags.get(key).cloned().unwrap_or_default())
                .collect(),
            step: *step,
            lateness: *lateness,
            point: point.clone(),
        };

        match bus.publish(packet) {
            Ok(()) => 1,
            Err(e) => {
                self.bus_err.incr();
                debug!("aggregation packet for rule {} not published: {e}", rule.id);
                0
            }
        }
    }
}
