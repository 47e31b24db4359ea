//! Coarse wall clock readable without a syscall
//!
//! A background task stores the current unix time (milliseconds) into a shared
//! atomic every 100 ms. Hot paths read it with a single acquire load.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tracing::trace;

/// Refresh period of the background ticker
const TICK: Duration = Duration::from_millis(100);

/// Shared coarse clock
#[derive(Debug, Clone)]
pub struct Clock {
    now_ms: Arc<AtomicI64>,
}

impl Clock {
    /// Create a clock and spawn its ticker task
    pub fn start() -> (Self, JoinHandle<()>) {
        let clock = Self {
            now_ms: Arc::new(AtomicI64::new(system_now_ms())),
        };

        let now_ms = clock.now_ms.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                now_ms.store(system_now_ms(), Ordering::Release);
            }
        });

        trace!("clock ticker started");
        (clock, handle)
    }

    /// Clock that only moves when told to (tests, replay)
    pub fn manual(now_secs: i64) -> Self {
        Self {
            now_ms: Arc::new(AtomicI64::new(now_secs * 1000)),
        }
    }

    /// Current unix time in seconds
    #[inline]
    pub fn now(&self) -> i64 {
        self.now_ms.load(Ordering::Acquire).div_euclid(1000)
    }

    /// Current unix time in milliseconds
    #[inline]
    pub fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::Acquire)
    }

    pub fn set(&self, now_secs: i64) {
        self.now_ms.store(now_secs * 1000, Ordering::Release);
    }

    pub fn advance(&self, secs: i64) {
        self.now_ms.fetch_add(secs * 1000, Ordering::AcqRel);
    }
}

/// Wall clock straight from the OS
pub fn system_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
