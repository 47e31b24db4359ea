use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

use super::Destination;
use crate::actors::supervisor::guard;
use crate::adapters::PushEndpoint;
use crate::shutdown::ShutdownSignal;
use crate::stats::{self, Counter, Stats};

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SenderConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_idle_interval", with = "humantime_serde")]
    pub idle_interval: Duration,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub backoff: Duration,
}

fn default_batch_size() -> usize {
    200
}

fn default_idle_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_max_concurrency() -> usize {
    10
}

fn default_max_retries() -> usize {
    3
}

fn default_backoff() -> Duration {
    Duration::from_millis(10)
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            idle_interval: default_idle_interval(),
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            backoff: default_backoff(),
        }
    }
}

/// Lets one warning through per period
#[derive(Debug)]
pub struct WarnLimiter {
    period: Duration,
    last: Mutex<Option<Instant>>,
}

impl WarnLimiter {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last: Mutex::new(None),
        }
    }

    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        match *last {
            Some(at) if now.duration_since(at) < self.period => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

struct BatchContext<T: Send + Sync + 'static> {
    endpoint: Arc<dyn PushEndpoint<T>>,
    config: SenderConfig,
    out: Counter,
    out_err: Counter,
    limiter: Arc<WarnLimiter>,
    shutdown: ShutdownSignal,
    name: String,
}

/// Sender loop for one destination
///
/// Exits when the destination is retired, or once shutdown has begun and the
/// queue is empty. Waits for its in-flight batches before returning.
pub(crate) async fn run<T>(dest: Arc<Destination<T>>, config: SenderConfig, stats: Stats, mut shutdown: ShutdownSignal)
where
    T: Debug + Send + Sync + 'static,
{
    let max_concurrency = config.max_concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(max_concurrency));
    let ctx = Arc::new(BatchContext {
        endpoint: dest.endpoint(),
        config,
        out: stats.counter(stats::POINTS_OUT),
        out_err: stats.counter(stats::POINTS_OUT_ERR),
        limiter: dest.limiter(),
        shutdown: shutdown.clone(),
        name: dest.key().to_string(),
    });

    debug!("sender for {} started", dest.key());

    loop {
        if dest.is_retired() {
            dest.queue().discard();
            break;
        }

        let draining = shutdown.is_triggered();
        if draining && dest.queue().is_empty() {
            break;
        }

        let batch = if dest.is_paused() && !draining {
            Vec::new()
        } else {
            dest.queue().pop_batch(config.batch_size.max(1))
        };

        if batch.is_empty() {
            if draining {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(config.idle_interval) => {}
                _ = shutdown.recv() => {}
            }
            continue;
        }

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };

        let ctx = ctx.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            let name = format!("sender:{}", ctx.name);
            guard(&name, &stats, send_batch(&ctx, batch)).await;
            drop(permit);
        });
    }

    let _ = semaphore.acquire_many(max_concurrency as u32).await;
    debug!("sender for {} stopped", dest.key());
}

async fn send_batch<T>(ctx: &BatchContext<T>, batch: Vec<T>)
where
    T: Debug + Send + Sync + 'static,
{
    let attempts = ctx.config.max_retries.max(1);
    let mut last_err = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            if ctx.shutdown.is_triggered() {
                break;
            }
            tokio::time::sleep(ctx.config.backoff).await;
        }

        match ctx.endpoint.push(&batch).await {
            Ok(()) => {
                trace!("pushed {} items to {}", batch.len(), ctx.name);
                ctx.out.add(batch.len() as u64);
                return;
            }
            Err(e) => {
                trace!("attempt {} to {} failed: {e}", attempt + 1, ctx.name);
                last_err = Some(e);
            }
        }
    }

    ctx.out_err.add(batch.len() as u64);
    if ctx.limiter.allow() {
        let reason = last_err.map(|e| e.to_string()).unwrap_or_else(|| "shutting down".to_string());
        warn!(
            "dropping {} items for {}: {reason}; first item: {:?}",
            batch.len(),
            ctx.name,
            batch.first()
        );
    }
}
