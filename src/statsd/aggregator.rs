use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, trace};

use super::accumulator::Accumulator;
use super::parse::{AggrSpec, Packet, Sample, StatsdParseError};
use crate::clock::{Clock, system_now_ms};
use crate::dispatch::Dispatcher;
use crate::point::{Point, join_tags};
use crate::shutdown::ShutdownSignal;
use crate::stats::{self, Counter, Stats};

/// Roll period in seconds, aligned to wall clock
pub const ROLL_SECS: i64 = 10;

/// Wait between swapping out the live state and reading it
const GRACE: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AggrKey {
    namespace: String,
    metric: String,
    tags: String,
    aggr: String,
}

#[derive(Debug, Clone)]
struct Entry {
    namespace: String,
    metric: String,
    tags: BTreeMap<String, String>,
    spec: AggrSpec,
    acc: Accumulator,
}

#[derive(Debug)]
struct LiveState {
    window: i64,
    entries: DashMap<AggrKey, Mutex<Entry>>,
}

impl LiveState {
    fn new(window: i64) -> Self {
        Self {
            window,
            entries: DashMap::new(),
        }
    }
}

/// Start of the roll window containing `ts`
pub fn window_start(ts: i64) -> i64 {
    ts - ts.rem_euclid(ROLL_SECS)
}

/// A window's accumulators after the roll, ready to emit
#[derive(Debug, Clone)]
pub struct RolledState {
    window: i64,
    entries: Vec<Entry>,
}

impl RolledState {
    pub fn window(&self) -> i64 {
        self.window
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Points for every accumulator, stamped with the window start
    ///
    /// The namespace becomes the point's endpoint; packets without one are
    /// attributed to `default_endpoint`.
    pub fn emit(&self, default_endpoint: &str) -> Vec<Point> {
        let mut points = Vec::new();
        for entry in &self.entries {
            let endpoint = if entry.namespace.is_empty() {
                default_endpoint
            } else {
                &entry.namespace
            };
            for emitted in entry.acc.emit(&entry.spec) {
                let mut point = Point::new(endpoint, format!("{}{}", entry.metric, emitted.suffix), emitted.value, self.window)
                    .with_step(ROLL_SECS as u32);
                point.tags = entry.tags.clone();
                if let Some((key, value)) = emitted.tag {
                    point.tags.insert(key.to_string(), value);
                }
                points.push(point);
            }
        }
        points
    }
}

/// In-process pre-aggregation of statsd-style packets
pub struct StatsdAggregator {
    live: RwLock<Arc<LiveState>>,
    clock: Clock,
    packets: Counter,
    errors: Counter,
    scans: Counter,
}

impl StatsdAggregator {
    pub fn new(clock: Clock, stats: &Stats) -> Self {
        let window = window_start(clock.now());
        Self {
            live: RwLock::new(Arc::new(LiveState::new(window))),
            clock,
            packets: stats.counter(stats::STATSD_PACKETS),
            errors: stats.counter(stats::STATSD_ERR),
            scans: stats.counter(stats::STATSD_SCAN),
        }
    }

    /// Parse and collect one three-line packet
    pub fn collect_packet(&self, text: &str) -> Result<(), StatsdParseError> {
        match Packet::parse(text) {
            Ok(packet) => {
                self.collect(packet);
                Ok(())
            }
            Err(e) => {
                self.errors.incr();
                Err(e)
            }
        }
    }

    /// Collect every packet of a datagram; returns how many were rejected
    pub fn collect_datagram(&self, text: &str) -> usize {
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut rejected = 0;
        for chunk in lines.chunks(3) {
            let result = match chunk {
                [value, metric, tags] => Packet::from_lines(value, metric, tags),
                _ => Err(StatsdParseError::MissingLine("aggregator")),
            };
            match result {
                Ok(packet) => self.collect(packet),
                Err(e) => {
                    self.errors.incr();
                    rejected += 1;
                    trace!("rejected statsd packet: {e}");
                }
            }
        }
        rejected
    }

    pub fn collect(&self, packet: Packet) {
        self.packets.incr();

        let (metric, spec, sample) = if packet.is_scan() {
            self.scans.incr();
            (format!("{}.scan", packet.metric), AggrSpec::Counter, Sample::Value(1.0))
        } else {
            (packet.metric, packet.aggr, packet.sample)
        };

        let key = AggrKey {
            namespace: packet.namespace.clone(),
            metric: metric.clone(),
            tags: join_tags(&packet.tags),
            aggr: spec.to_string(),
        };

        // the read lock is held only to clone the Arc
        let state = self.live.read().clone();
        let slot = state.entries.entry(key).or_insert_with(|| {
            Mutex::new(Entry {
                namespace: packet.namespace,
                metric,
                tags: packet.tags,
                acc: Accumulator::new(&spec),
                spec,
            })
        });
        slot.lock().acc.add(&sample);
    }

    /// Number of series in the live window
    pub fn live_len(&self) -> usize {
        self.live.read().entries.len()
    }

    /// Roll at the window containing the current clock time
    pub async fn roll(&self) -> RolledState {
        self.roll_at(window_start(self.clock.now())).await
    }

    /// Swap in a fresh state for `window` and freeze the previous one
    #[instrument(skip(self))]
    pub async fn roll_at(&self, window: i64) -> RolledState {
        let old = std::mem::replace(&mut *self.live.write(), Arc::new(LiveState::new(window)));

        // collectors that cloned the old Arc just before the swap finish here
        tokio::time::sleep(GRACE).await;

        let entries: Vec<Entry> = old
            .entries
            .iter()
            .map(|slot| {
                let mut entry = slot.value().lock().clone();
                entry.acc.freeze();
                entry
            })
            .collect();

        debug!("rolled window {} with {} series", old.window, entries.len());
        RolledState {
            window: old.window,
            entries,
        }
    }

    /// Roll on every wall-clock boundary and dispatch the emitted points
    ///
    /// On shutdown the current window is rolled one last time.
    pub async fn run(self: Arc<Self>, dispatcher: Arc<Dispatcher>, endpoint: String, mut shutdown: ShutdownSignal) {
        info!("statsd aggregator rolling every {ROLL_SECS}s");
        loop {
            let now_ms = system_now_ms();
            let next = window_start(now_ms.div_euclid(1000)) + ROLL_SECS;
            let wait = Duration::from_millis((next * 1000 - now_ms).max(0) as u64);

            let last = tokio::select! {
                _ = tokio::time::sleep(wait) => false,
                _ = shutdown.recv() => true,
            };

            let rolled = self.roll_at(next).await;
            let points = rolled.emit(&endpoint);
            if !points.is_empty() {
                trace!("emitting {} aggregated points for window {}", points.len(), rolled.window());
            }
            for point in points {
                if dispatcher.dispatch(point).is_err() {
                    debug!("dispatcher closed, dropping the rest of window {}", rolled.window());
                    break;
                }
            }

            if last {
                break;
            }
        }
    }
}
