use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::sender::{self, SenderConfig, WarnLimiter};
use super::{BoundedQueue, QueueConfig};
use crate::actors::supervisor::supervise;
use crate::adapters::PushEndpoint;
use crate::clock::Clock;
use crate::shutdown::{self, ShutdownSignal};
use crate::stats::{Counter, Stats};

/// Builds the endpoint for a destination created on first use
pub type EndpointFactory<T> = Arc<dyn Fn(&str) -> Arc<dyn PushEndpoint<T>> + Send + Sync>;

/// One physical destination: a queue, its endpoint and a sender task
pub struct Destination<T: Send + Sync + 'static> {
    key: String,
    queue: BoundedQueue<T>,
    endpoint: Arc<dyn PushEndpoint<T>>,
    limiter: Arc<WarnLimiter>,
    /// Pinned destinations come from configuration and are never collected
    pinned: bool,
    paused: AtomicBool,
    retired: AtomicBool,
}

impl<T: Send + Sync + 'static> Destination<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn queue(&self) -> &BoundedQueue<T> {
        &self.queue
    }

    pub fn endpoint(&self) -> Arc<dyn PushEndpoint<T>> {
        self.endpoint.clone()
    }

    pub fn limiter(&self) -> Arc<WarnLimiter> {
        self.limiter.clone()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Stop popping; items keep accumulating subject to the overflow policy
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Stop the sender and count whatever is still queued as dropped
    pub(crate) fn retire(&self) -> usize {
        self.retired.store(true, Ordering::Release);
        self.queue.discard()
    }
}

/// All destinations of one kind (storage, judge, aggregation detector)
pub struct QueueRegistry<T: Send + Sync + 'static> {
    kind: &'static str,
    destinations: DashMap<String, Arc<Destination<T>>>,
    factory: EndpointFactory<T>,
    queue_config: QueueConfig,
    sender_config: SenderConfig,
    drop_counter: Counter,
    stats: Stats,
    clock: Clock,
    shutdown: ShutdownSignal,
    senders: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> QueueRegistry<T>
where
    T: Debug + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: &'static str,
        drop_counter_name: &str,
        factory: EndpointFactory<T>,
        queue_config: QueueConfig,
        sender_config: SenderConfig,
        stats: Stats,
        clock: Clock,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            kind,
            destinations: DashMap::new(),
            factory,
            queue_config,
            sender_config,
            drop_counter: stats.counter(drop_counter_name),
            stats,
            clock,
            shutdown,
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Destination for `key`, created with the factory endpoint if missing
    pub fn get_or_create(&self, key: &str) -> Arc<Destination<T>> {
        if let Some(dest) = self.destinations.get(key) {
            return dest.clone();
        }

        let mut created = None;
        let dest = self
            .destinations
            .entry(key.to_string())
            .or_insert_with(|| {
                let dest = self.build(key, (self.factory)(key), false);
                created = Some(dest.clone());
                dest
            })
            .clone();

        if let Some(dest) = created {
            self.start_sender(dest);
        }
        dest
    }

    /// Register a configured destination with its own endpoint
    pub fn register(&self, key: &str, endpoint: Arc<dyn PushEndpoint<T>>) -> Arc<Destination<T>> {
        let dest = self.build(key, endpoint, true);
        if let Some(old) = self.destinations.insert(key.to_string(), dest.clone()) {
            let discarded = old.retire();
            if discarded > 0 {
                warn!("replaced {} destination {key} with {discarded} items still queued", self.kind);
            }
        }
        self.start_sender(dest.clone());
        info!("registered {} destination {key}", self.kind);
        dest
    }

    pub fn get(&self, key: &str) -> Option<Arc<Destination<T>>> {
        self.destinations.get(key).map(|d| d.clone())
    }

    /// Enqueue onto `key`, creating the destination if needed
    pub fn push(&self, key: &str, item: T) -> bool {
        self.get_or_create(key).queue().push(item)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.destinations.iter().map(|d| d.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Sum of items waiting across every destination
    pub fn total_len(&self) -> usize {
        self.destinations.iter().map(|d| d.queue().len()).sum()
    }

    /// Remove unpinned destinations idle for longer than `ttl`
    ///
    /// Returns the removed keys so the caller can drop their pools.
    pub fn gc(&self, ttl: Duration) -> Vec<String> {
        let cutoff = self.clock.now() - ttl.as_secs() as i64;
        let mut removed = Vec::new();

        self.destinations.retain(|key, dest| {
            let stale = !dest.pinned && dest.queue().last_activity() < cutoff;
            if stale {
                let discarded = dest.retire();
                if discarded > 0 {
                    warn!("collected {} destination {key} with {discarded} items still queued", self.kind);
                }
                removed.push(key.clone());
            }
            !stale
        });

        if !removed.is_empty() {
            info!("collected {} idle {} destinations: {removed:?}", removed.len(), self.kind);
        }
        removed
    }

    /// Retire unpinned destinations whose key is not in `live`
    pub fn retain(&self, live: &HashSet<String>) -> Vec<String> {
        let mut removed = Vec::new();
        self.destinations.retain(|key, dest| {
            let departed = !dest.pinned && !live.contains(key);
            if departed {
                let discarded = dest.retire();
                debug!("retired departed {} destination {key} ({discarded} queued items dropped)", self.kind);
                removed.push(key.clone());
            }
            !departed
        });

        if !removed.is_empty() {
            info!("retired {} departed {} destinations: {removed:?}", removed.len(), self.kind);
        }
        removed
    }

    /// Wait for every sender to drain; `false` if the deadline passed
    pub async fn drain(&self, deadline: Duration) -> bool {
        let senders = std::mem::take(&mut *self.senders.lock());
        shutdown::drain(senders, deadline).await
    }

    fn build(&self, key: &str, endpoint: Arc<dyn PushEndpoint<T>>, pinned: bool) -> Arc<Destination<T>> {
        Arc::new(Destination {
            key: key.to_string(),
            queue: BoundedQueue::new(self.queue_config, self.drop_counter.clone(), self.clock.clone()),
            endpoint,
            limiter: Arc::new(WarnLimiter::new(Duration::from_secs(10))),
            pinned,
            paused: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        })
    }

    fn start_sender(&self, dest: Arc<Destination<T>>) {
        debug!("starting {} sender for {}", self.kind, dest.key());
        let name = format!("{}:{}", self.kind, dest.key());
        let config = self.sender_config;
        let stats = self.stats.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(supervise(name, self.stats.clone(), move || {
            sender::run(dest.clone(), config, stats.clone(), shutdown.clone())
        }));

        let mut senders = self.senders.lock();
        senders.retain(|h| !h.is_finished());
        senders.push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::PushError;
    use crate::shutdown::Shutdown;
    use crate::stats;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Records every batch; fails the first `failures` calls
    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<u32>>>,
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PushEndpoint<u32> for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn push(&self, batch: &[u32]) -> Result<(), PushError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(PushError::Rejected("not now".to_string()));
            }
            self.batches.lock().push(batch.to_vec());
            Ok(())
        }
    }

    fn registry(recorder: Arc<Recorder>, capacity: usize) -> (QueueRegistry<u32>, Stats, Shutdown, Clock) {
        let stats = Stats::new();
        let shutdown = Shutdown::new();
        let clock = Clock::manual(1_000);
        let factory: EndpointFactory<u32> = Arc::new(move |_| recorder.clone() as Arc<dyn PushEndpoint<u32>>);
        let registry = QueueRegistry::new(
            "test",
            stats::STORAGE_QUEUE_DROP,
            factory,
            QueueConfig {
                capacity,
                ..Default::default()
            },
            SenderConfig {
                batch_size: 2,
                idle_interval: Duration::from_millis(5),
                max_concurrency: 1,
                max_retries: 3,
                backoff: Duration::from_millis(1),
            },
            stats.clone(),
            clock.clone(),
            shutdown.subscribe(),
        );
        (registry, stats, shutdown, clock)
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_items_are_batched_and_counted() {
        let recorder = Arc::new(Recorder::default());
        let (registry, stats, _shutdown, _) = registry(recorder.clone(), 16);

        for i in 0..5 {
            assert!(registry.push("10.0.0.1:9000", i));
        }

        wait_for(|| stats.get(stats::POINTS_OUT) == 5).await;
        let batches = recorder.batches.lock().clone();
        assert!(batches.iter().all(|b| b.len() <= 2));
        assert_eq!(batches.concat(), vec![0, 1, 2, 3, 4]);
        assert_eq!(registry.total_len(), 0);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let recorder = Arc::new(Recorder::default());
        recorder.failures.store(2, Ordering::SeqCst);
        let (registry, stats, _shutdown, _) = registry(recorder.clone(), 16);

        registry.push("a", 1);
        wait_for(|| stats.get(stats::POINTS_OUT) == 1).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.get(stats::POINTS_OUT_ERR), 0);
    }

    #[tokio::test]
    async fn test_final_failure_counts_loss() {
        let recorder = Arc::new(Recorder::default());
        recorder.failures.store(100, Ordering::SeqCst);
        let (registry, stats, _shutdown, _) = registry(recorder.clone(), 16);

        registry.push("a", 1);
        registry.push("a", 2);
        wait_for(|| stats.get(stats::POINTS_OUT_ERR) == 2).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_paused_destination_overflows() {
        let recorder = Arc::new(Recorder::default());
        let (registry, stats, _shutdown, _) = registry(recorder.clone(), 2);

        registry.get_or_create("a").pause();
        for i in 1..=4 {
            registry.push("a", i);
        }

        let dest = registry.get("a").unwrap();
        assert_eq!(dest.queue().len(), 2);
        assert_eq!(dest.queue().dropped(), 2);
        assert_eq!(stats.get(stats::STORAGE_QUEUE_DROP), 2);

        dest.resume();
        wait_for(|| stats.get(stats::POINTS_OUT) == 2).await;
        assert_eq!(recorder.batches.lock().concat(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_gc_removes_idle_unpinned() {
        let recorder = Arc::new(Recorder::default());
        let (registry, _stats, _shutdown, clock) = registry(recorder.clone(), 4);

        registry.get_or_create("judge-1");
        registry.register("influx", recorder.clone());

        clock.advance(3_601);
        let removed = registry.gc(Duration::from_secs(3_600));

        assert_eq!(removed, vec!["judge-1".to_string()]);
        assert_eq!(registry.keys(), vec!["influx".to_string()]);
    }

    #[tokio::test]
    async fn test_retired_destinations_count_queued_items_as_drops() {
        let recorder = Arc::new(Recorder::default());
        let (registry, stats, _shutdown, clock) = registry(recorder.clone(), 8);

        registry.get_or_create("judge-1").pause();
        for i in 0..3 {
            registry.push("judge-1", i);
        }
        clock.advance(3_601);
        assert_eq!(registry.gc(Duration::from_secs(3_600)), vec!["judge-1".to_string()]);
        assert_eq!(stats.get(stats::STORAGE_QUEUE_DROP), 3);

        let first = registry.register("influx", recorder.clone());
        first.pause();
        registry.push("influx", 7);
        registry.push("influx", 8);
        registry.register("influx", recorder.clone());

        assert!(first.is_retired());
        assert_eq!(first.queue().dropped(), 2);
        assert_eq!(stats.get(stats::STORAGE_QUEUE_DROP), 5);
        assert_eq!(stats.get(stats::POINTS_OUT), 0);
    }

    #[tokio::test]
    async fn test_retain_retires_departed_destinations() {
        let recorder = Arc::new(Recorder::default());
        let (registry, stats, _shutdown, _) = registry(recorder.clone(), 8);

        let departed = registry.get_or_create("10.0.0.1:9000");
        departed.pause();
        registry.push("10.0.0.1:9000", 1);
        registry.get_or_create("10.0.0.2:9000");
        registry.register("influx", recorder.clone());

        let live: HashSet<String> = ["10.0.0.2:9000".to_string()].into_iter().collect();
        assert_eq!(registry.retain(&live), vec!["10.0.0.1:9000".to_string()]);

        assert!(departed.is_retired());
        assert_eq!(registry.keys(), vec!["10.0.0.2:9000".to_string(), "influx".to_string()]);
        assert_eq!(stats.get(stats::STORAGE_QUEUE_DROP), 1);
    }

    #[tokio::test]
    async fn test_drain_after_shutdown() {
        let recorder = Arc::new(Recorder::default());
        let (registry, stats, shutdown, _) = registry(recorder.clone(), 16);

        for i in 0..6 {
            registry.push("a", i);
        }
        shutdown.trigger();

        assert!(registry.drain(Duration::from_secs(2)).await);
        assert_eq!(stats.get(stats::POINTS_OUT), 6);
    }
}
