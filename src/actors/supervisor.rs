//! Panic barrier for workers
//!
//! Nothing on the hot path is supposed to panic. If it does anyway, the
//! barrier logs the payload together with a backtrace, bumps `panic.total`
//! and restarts the worker instead of taking the process down.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error};

use crate::stats::{self, Stats};

/// Delay before a panicked worker is started again
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Run `fut` once; a panic is logged, counted and turned into `None`
pub async fn guard<F, T>(name: &str, stats: &Stats, fut: F) -> Option<T>
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => Some(value),
        Err(payload) => {
            report(name, stats, payload.as_ref());
            None
        }
    }
}

/// Keep a worker alive: restart it after [`RESTART_DELAY`] whenever it panics
///
/// Returns once the worker finishes normally.
pub async fn supervise<F, Fut>(name: String, stats: Stats, mut factory: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        if guard(&name, &stats, factory()).await.is_some() {
            debug!("worker {name} finished");
            return;
        }
        tokio::time::sleep(RESTART_DELAY).await;
        debug!("restarting worker {name}");
    }
}

fn report(name: &str, stats: &Stats, payload: &(dyn Any + Send)) {
    stats.incr(stats::PANIC_TOTAL);
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    let backtrace = Backtrace::force_capture();
    error!("worker {name} panicked: {message}\n{backtrace}");
}
