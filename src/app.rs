//! Process wiring
//!
//! [`App::start`] builds every component from a [`Config`], binds the
//! listeners and spawns the periodic tasks. [`App::reload`] republishes the
//! reloadable sections; [`App::shutdown`] stops intake and drains the queues.
//!
//! ```text
//!  rpc ─┐                                   ┌─► storage queues ─► senders
//!  http ┼─► Ingestor ─► Dispatcher ─────────┼─► judge queues   ─► senders
//! statsd┘   (validate)  (ring, routing)     └─► aggregation bus
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::actors::scheduler::{PeriodicTask, Schedule, Scheduler, TaskHandle};
use crate::actors::supervisor::supervise;
use crate::adapters::{PushEndpoint, RpcEndpoint};
use crate::api::{self, ApiState};
use crate::bus::{AggregationBus, DetectorBus};
use crate::clock::Clock;
use crate::cluster::{Discovery, Heartbeat, HeartbeatTask, HttpDiscovery, MembershipCache, MembershipTask, StaticDiscovery};
use crate::config::{BusConfig, Config};
use crate::dispatch::{Dispatcher, StorageRoute};
use crate::ingest::Ingestor;
use crate::point::{SharedPoint, Validator};
use crate::query::QueryService;
use crate::queue::{EndpointFactory, QueueRegistry};
use crate::routing::{HttpRuleSource, IdentityTracker, RoutingCache, RoutingTable, RoutingTask, RuleSource, StaticRuleSource};
use crate::rpc::{AggrPacket, JudgeItem, PoolRegistry, server};
use crate::service::TransferService;
use crate::shutdown::{self, Shutdown};
use crate::stats::{self, Stats, StatsReporter};
use crate::statsd::{self, StatsdAggregator};
use crate::util;

/// Period of the idle destination sweep
const GC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to bind {what} listener on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

/// Removes destinations nothing has touched for `ttl`
struct QueueGcTask {
    storage: Arc<QueueRegistry<SharedPoint>>,
    judges: Arc<QueueRegistry<JudgeItem>>,
    detectors: Option<Arc<QueueRegistry<AggrPacket>>>,
    pools: PoolRegistry,
    ttl: Duration,
}

#[async_trait]
impl PeriodicTask for QueueGcTask {
    async fn tick(&mut self) -> anyhow::Result<()> {
        let mut removed = self.storage.gc(self.ttl);
        removed.extend(self.judges.gc(self.ttl));
        if let Some(detectors) = &self.detectors {
            removed.extend(detectors.gc(self.ttl));
        }
        for addr in removed {
            self.pools.remove(&addr);
        }
        Ok(())
    }
}

/// A running transfer instance
pub struct App {
    /// Stops senders and periodic tasks
    shutdown: Shutdown,
    /// Stops listeners and the statsd roller
    intake: Shutdown,
    stats: Stats,
    clock: Clock,
    drain_deadline: Duration,
    dispatcher: Arc<Dispatcher>,
    ingestor: Arc<Ingestor>,
    membership: Arc<MembershipCache>,
    detectors: Option<Arc<QueueRegistry<AggrPacket>>>,
    statsd: Option<Arc<StatsdAggregator>>,
    static_discovery: Option<Arc<StaticDiscovery>>,
    static_rules: Option<Arc<StaticRuleSource>>,
    membership_task: TaskHandle,
    routing_task: TaskHandle,
    rpc_addr: Option<SocketAddr>,
    http_addr: Option<SocketAddr>,
    statsd_addr: Option<SocketAddr>,
    /// Everything that feeds the dispatcher
    listeners: Vec<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    clock_task: Option<JoinHandle<()>>,
}

impl App {
    /// Start with a ticking clock and a fresh stats sink
    pub async fn start(config: Config) -> Result<Self, AppError> {
        let (clock, clock_task) = Clock::start();
        let mut app = Self::start_with(config, clock, Stats::new()).await?;
        app.clock_task = Some(clock_task);
        Ok(app)
    }

    #[instrument(skip_all)]
    pub async fn start_with(config: Config, clock: Clock, stats: Stats) -> Result<Self, AppError> {
        let shutdown = Shutdown::new();
        let intake = Shutdown::new();
        let scheduler = Scheduler::new(shutdown.subscribe(), stats.clone());
        let pools = PoolRegistry::new(config.pool.clone(), stats.clone());
        let mut tasks = Vec::new();

        // membership
        let (discovery, static_discovery): (Arc<dyn Discovery>, _) = if config.discovery.addrs.is_empty() {
            let discovery = Arc::new(StaticDiscovery::new(config.discovery.members.clone(), clock.clone()));
            (discovery.clone() as Arc<dyn Discovery>, Some(discovery))
        } else {
            let discovery = HttpDiscovery::new(config.discovery.addrs.clone(), config.discovery.timeout)?;
            (Arc::new(discovery) as Arc<dyn Discovery>, None)
        };
        let membership = Arc::new(MembershipCache::new(
            discovery,
            &config.membership,
            clock.clone(),
            pools.clone(),
            &stats,
        ));
        if let Err(e) = membership.refresh().await {
            warn!("initial membership refresh failed: {e}");
        }

        // routing
        let (source, static_rules): (Arc<dyn RuleSource>, _) = if config.routing.addrs.is_empty() {
            let source = Arc::new(StaticRuleSource::new(config.rules.clone()));
            (source.clone() as Arc<dyn RuleSource>, Some(source))
        } else {
            let source = HttpRuleSource::new(config.routing.addrs.clone(), config.routing.timeout)?;
            (Arc::new(source) as Arc<dyn RuleSource>, None)
        };
        let table = Arc::new(RoutingTable::new());
        let tracker = Arc::new(IdentityTracker::new());
        let routing = Arc::new(RoutingCache::new(
            source,
            table.clone(),
            tracker.clone(),
            &config.routing,
            clock.clone(),
            &stats,
        ));
        if let Err(e) = routing.refresh().await {
            warn!("initial routing refresh failed: {e}");
        }

        // queues
        let storage = Arc::new(QueueRegistry::new(
            "storage",
            stats::STORAGE_QUEUE_DROP,
            rpc_factory::<SharedPoint>(&pools),
            config.queue,
            config.sender,
            stats.clone(),
            clock.clone(),
            shutdown.subscribe(),
        ));
        let judges = Arc::new(QueueRegistry::new(
            "judge",
            stats::JUDGE_QUEUE_DROP,
            rpc_factory::<JudgeItem>(&pools),
            config.queue,
            config.sender,
            stats.clone(),
            clock.clone(),
            shutdown.subscribe(),
        ));

        let mut routes = Vec::new();
        for backend in &config.storage.backends {
            match (backend.destination_key(), backend.build()?) {
                (Some(key), Some(endpoint)) => {
                    storage.register(&key, endpoint);
                    info!("storage backend {key} registered");
                    routes.push(StorageRoute::Endpoint(key));
                }
                _ => routes.push(StorageRoute::Ring),
            }
        }

        let mut detectors = None;
        let bus: Option<Arc<dyn AggregationBus>> = match &config.aggregation.bus {
            BusConfig::None => None,
            BusConfig::Detector => {
                let queues = Arc::new(QueueRegistry::new(
                    "aggregation",
                    stats::AGGR_QUEUE_DROP,
                    rpc_factory::<AggrPacket>(&pools),
                    config.queue,
                    config.sender,
                    stats.clone(),
                    clock.clone(),
                    shutdown.subscribe(),
                ));
                detectors = Some(queues.clone());
                Some(Arc::new(DetectorBus::new(membership.clone(), queues)))
            }
            #[cfg(feature = "kafka")]
            BusConfig::Kafka(kafka) => Some(Arc::new(crate::bus::KafkaBus::new(kafka)?)),
        };

        {
            let (storage, judges, detectors) = (storage.clone(), judges.clone(), detectors.clone());
            membership.on_departure(Arc::new(move |live: &HashSet<String>| {
                storage.retain(live);
                judges.retain(live);
                if let Some(detectors) = &detectors {
                    detectors.retain(live);
                }
            }));
        }

        let dispatcher = Arc::new(Dispatcher::new(
            routes,
            membership.clone(),
            table,
            tracker,
            storage.clone(),
            judges.clone(),
            bus,
            clock.clone(),
            &stats,
        ));
        let validator = Validator::new(config.ingest.validator(), clock.clone());
        let ingestor = Arc::new(Ingestor::new(validator, dispatcher.clone(), &stats));
        let query = Arc::new(QueryService::new(membership.clone(), pools.clone()));

        // listeners
        let mut listeners = Vec::new();

        let mut rpc_addr = None;
        if let Some(addr) = &config.listen.rpc {
            let listener = bind_tcp("rpc", addr).await?;
            rpc_addr = listener.local_addr().ok();
            let handler = Arc::new(TransferService::new(ingestor.clone(), query.clone()));
            info!("rpc listening on {addr}");
            listeners.push(tokio::spawn(server::serve(listener, handler, intake.subscribe())));
        }

        let mut http_addr = None;
        if let Some(addr) = &config.listen.http {
            let listener = bind_tcp("http", addr).await?;
            let state = ApiState::new(ingestor.clone(), query.clone(), stats.clone(), config.ingest.max_body_bytes);
            let (bound, handle) = api::spawn_api_server(listener, state, intake.subscribe())?;
            http_addr = Some(bound);
            listeners.push(handle);
        }

        let mut statsd_addr = None;
        let mut aggregator = None;
        if let Some(addr) = &config.statsd.listen {
            let socket = UdpSocket::bind(addr).await.map_err(|source| AppError::Bind {
                what: "statsd",
                addr: addr.clone(),
                source,
            })?;
            statsd_addr = socket.local_addr().ok();

            let statsd_aggregator = Arc::new(StatsdAggregator::new(clock.clone(), &stats));
            listeners.push(tokio::spawn(statsd::serve_udp(
                socket,
                statsd_aggregator.clone(),
                intake.subscribe(),
            )));

            let endpoint = config.statsd.endpoint.clone().unwrap_or_else(util::get_hostname);
            let (roller, dispatcher, signal) = (statsd_aggregator.clone(), dispatcher.clone(), intake.subscribe());
            listeners.push(tokio::spawn(supervise("statsd-roll".to_string(), stats.clone(), move || {
                roller.clone().run(dispatcher.clone(), endpoint.clone(), signal.clone())
            })));
            aggregator = Some(statsd_aggregator);
        }

        // periodic tasks
        let (membership_task, join) = scheduler.spawn(
            "membership",
            Schedule::every(config.membership.discovery_interval).with_jitter(0.1),
            MembershipTask(membership.clone()),
        );
        tasks.push(join);

        let (routing_task, join) = scheduler.spawn(
            "routing",
            Schedule::every(config.routing.refresh).with_jitter(0.1),
            RoutingTask(routing),
        );
        tasks.push(join);

        if !config.discovery.addrs.is_empty() {
            let extend_info = serde_json::json!({
                "rpc": rpc_addr.map(|a| a.to_string()),
                "http": http_addr.map(|a| a.to_string()),
            })
            .to_string();
            let heartbeat = Heartbeat::new(
                config.discovery.addrs.clone(),
                util::get_hostname(),
                extend_info,
                clock.clone(),
                &config.heartbeat,
            )?;
            let (_, join) = scheduler.spawn(
                "heartbeat",
                Schedule::every(config.heartbeat.interval),
                HeartbeatTask(Arc::new(heartbeat)),
            );
            tasks.push(join);
        }

        let gc = QueueGcTask {
            storage,
            judges,
            detectors: detectors.clone(),
            pools,
            ttl: config.queue_gc_ttl,
        };
        let (_, join) = scheduler.spawn("queue-gc", Schedule::every(GC_INTERVAL), gc);
        tasks.push(join);

        let mut reporter = StatsReporter::new(stats.clone());
        if config.stats.push_self {
            let step = config.stats.interval.as_secs().max(1) as u32;
            reporter = reporter.with_sink(dispatcher.clone(), util::get_hostname(), step, clock.clone());
        }
        let (_, join) = scheduler.spawn("stats", Schedule::every(config.stats.interval), reporter);
        tasks.push(join);

        info!("transfer started");
        Ok(Self {
            shutdown,
            intake,
            stats,
            clock,
            drain_deadline: config.shutdown_drain_deadline,
            dispatcher,
            ingestor,
            membership,
            detectors,
            statsd: aggregator,
            static_discovery,
            static_rules,
            membership_task,
            routing_task,
            rpc_addr,
            http_addr,
            statsd_addr,
            listeners,
            tasks,
            clock_task: None,
        })
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn membership(&self) -> &Arc<MembershipCache> {
        &self.membership
    }

    pub fn statsd(&self) -> Option<&Arc<StatsdAggregator>> {
        self.statsd.as_ref()
    }

    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.rpc_addr
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn statsd_addr(&self) -> Option<SocketAddr> {
        self.statsd_addr
    }

    /// Apply the reloadable sections of `config`
    ///
    /// Static members and static rules only take effect when the running
    /// instance was started without a control plane for them.
    pub async fn reload(&self, config: &Config) -> anyhow::Result<()> {
        self.membership.set_replicas(config.membership.replicas);

        if let Some(discovery) = &self.static_discovery {
            let members: HashMap<_, _> = config.discovery.members.clone();
            discovery.replace(members);
        }
        self.membership_task.run_now().await?;

        if let Some(rules) = &self.static_rules {
            rules.replace(config.rules.clone());
            self.routing_task.run_now().await?;
        }

        info!("configuration reloaded");
        Ok(())
    }

    /// Stop intake, drain the queues and stop every task
    ///
    /// Returns `false` when the drain deadline passed before the queues
    /// emptied.
    #[instrument(skip_all)]
    pub async fn shutdown(self) -> bool {
        info!("shutting down, draining for at most {:?}", self.drain_deadline);
        let started = Instant::now();

        // the final statsd roll reaches the queues before the senders drain
        self.intake.trigger();
        let mut drained = shutdown::drain(self.listeners, self.drain_deadline).await;
        self.dispatcher.stop_accepting();
        self.shutdown.trigger();

        drained &= self.dispatcher.storage().drain(remaining(started, self.drain_deadline)).await;
        drained &= self.dispatcher.judges().drain(remaining(started, self.drain_deadline)).await;
        if let Some(detectors) = &self.detectors {
            drained &= detectors.drain(remaining(started, self.drain_deadline)).await;
        }
        drained &= shutdown::drain(self.tasks, remaining(started, self.drain_deadline)).await;

        if let Some(clock_task) = self.clock_task {
            clock_task.abort();
        }

        if drained {
            info!("shutdown complete in {:?}", started.elapsed());
        } else {
            warn!("shutdown deadline exceeded after {:?}", started.elapsed());
        }
        drained
    }
}

fn remaining(started: Instant, deadline: Duration) -> Duration {
    deadline.saturating_sub(started.elapsed())
}

async fn bind_tcp(what: &'static str, addr: &str) -> Result<TcpListener, AppError> {
    debug!("binding {what} listener on {addr}");
    TcpListener::bind(addr).await.map_err(|source| AppError::Bind {
        what,
        addr: addr.to_string(),
        source,
    })
}

/// Endpoint factory for destinations discovered through membership
fn rpc_factory<T>(pools: &PoolRegistry) -> EndpointFactory<T>
where
    T: crate::adapters::RpcItem + std::fmt::Debug,
{
    let pools = pools.clone();
    Arc::new(move |addr: &str| Arc::new(RpcEndpoint::new(addr, pools.clone())) as Arc<dyn PushEndpoint<T>>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenConfig;
    use crate::point::RawPoint;

    fn local_config() -> Config {
        Config {
            listen: ListenConfig {
                rpc: Some("127.0.0.1:0".to_string()),
                http: Some("127.0.0.1:0".to_string()),
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_start_and_shutdown_without_cluster() {
        let app = App::start_with(local_config(), Clock::manual(1_700_000_000), Stats::new())
            .await
            .unwrap();
        assert!(app.rpc_addr().is_some());
        assert!(app.http_addr().is_some());

        let summary = app
            .ingestor()
            .push(vec![RawPoint::new("host-a", "cpu.idle", 12.0, 1_700_000_000)])
            .unwrap();
        assert_eq!(summary.invalid, 0);
        assert_eq!(app.stats().get(stats::POINTS_IN), 1);

        assert!(app.shutdown().await);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = local_config();
        config.listen.rpc = Some(taken.local_addr().unwrap().to_string());

        let result = App::start_with(config, Clock::manual(1_700_000_000), Stats::new()).await;
        assert!(matches!(result, Err(AppError::Bind { what: "rpc", .. })));
    }
}
