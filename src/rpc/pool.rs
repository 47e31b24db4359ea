//! Per-destination connection pool
//!
//! ## Connection lifecycle
//!
//! ```text
//! dial ─► InUse ─► release (healthy, idle < max_idle) ─► Idle ─► fetch ─► InUse
//!           │
//!           └────► force_close / unhealthy / idle full ─► Closed
//! ```
//!
//! `max_conns` is a hard cap enforced by a semaphore: a lease holds one permit
//! for as long as the connection is in use. Dials that fail are never pooled.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

use super::{Request, Response, RpcConn, RpcError};
use crate::stats::{self, Counter, Stats};

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub call_timeout: Duration,
}

fn default_max_conns() -> usize {
    32
}

fn default_max_idle() -> usize {
    32
}

fn default_connect_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(3)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conns: default_max_conns(),
            max_idle: default_max_idle(),
            connect_timeout: default_connect_timeout(),
            call_timeout: default_call_timeout(),
        }
    }
}

/// Point-in-time copy of a pool's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub fetch: u64,
    pub release: u64,
    pub force_close: u64,
}

/// A connection checked out of the pool together with its capacity permit
pub struct Lease {
    conn: RpcConn,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn conn(&mut self) -> &mut RpcConn {
        &mut self.conn
    }
}

pub struct ConnPool {
    addr: String,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<RpcConn>>,
    live: AtomicUsize,
    fetches: AtomicU64,
    releases: AtomicU64,
    force_closes: AtomicU64,
    closed: AtomicBool,
    global_fetch: Counter,
    global_release: Counter,
    global_force_close: Counter,
}

impl ConnPool {
    pub fn new(addr: impl Into<String>, config: PoolConfig, stats: &Stats) -> Self {
        let addr = addr.into();
        debug!("creating connection pool for {addr} (max_conns {})", config.max_conns);
        Self {
            permits: Arc::new(Semaphore::new(config.max_conns.max(1))),
            idle: Mutex::new(Vec::with_capacity(config.max_idle)),
            addr,
            config,
            live: AtomicUsize::new(0),
            fetches: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            force_closes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            global_fetch: stats.counter(stats::POOL_FETCH),
            global_release: stats.counter(stats::POOL_RELEASE),
            global_force_close: stats.counter(stats::POOL_FORCE_CLOSE),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out a connection, dialing if no idle one is available
    ///
    /// Waits for capacity at most `call_timeout`.
    pub async fn fetch(&self) -> Result<Lease, RpcError> {
        self.fetch_until(Instant::now() + self.config.call_timeout).await
    }

    async fn fetch_until(&self, deadline: Instant) -> Result<Lease, RpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::PoolClosed(self.addr.clone()));
        }

        let permit = timeout_at(deadline, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| RpcError::PoolExhausted(self.addr.clone()))?
            .map_err(|_| RpcError::PoolClosed(self.addr.clone()))?;

        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.global_fetch.incr();

        let idle = self.idle.lock().pop();
        if let Some(conn) = idle {
            trace!("reusing idle connection to {}", self.addr);
            return Ok(Lease {
                conn,
                _permit: permit,
            });
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let conn = RpcConn::connect(&self.addr, self.config.connect_timeout.min(remaining)).await?;
        self.live.fetch_add(1, Ordering::AcqRel);
        trace!("dialed new connection to {}", self.addr);

        Ok(Lease {
            conn,
            _permit: permit,
        })
    }

    /// Return a connection; unhealthy ones and overflow beyond `max_idle` are closed
    pub fn release(&self, lease: Lease) {
        if !lease.conn.is_healthy() || self.closed.load(Ordering::Acquire) {
            self.force_close(lease);
            return;
        }

        self.releases.fetch_add(1, Ordering::Relaxed);
        self.global_release.incr();

        let Lease { conn, _permit } = lease;
        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle {
            idle.push(conn);
        } else {
            drop(idle);
            drop(conn);
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Discard a connection that may be in an unknown state
    pub fn force_close(&self, lease: Lease) {
        drop(lease);
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.force_closes.fetch_add(1, Ordering::Relaxed);
        self.global_force_close.incr();
    }

    /// One request/response exchange bounded by `call_timeout`
    ///
    /// Waiting for capacity, dialing and the exchange share one deadline. On
    /// timeout the connection is force-closed; the peer may still be writing,
    /// which is harmless because the socket is dropped.
    pub async fn call(&self, request: &Request) -> Result<Response, RpcError> {
        let deadline = Instant::now() + self.config.call_timeout;
        let mut lease = self.fetch_until(deadline).await?;

        match timeout_at(deadline, lease.conn.call(request)).await {
            Ok(Ok(Response::Error(msg))) => {
                self.release(lease);
                Err(RpcError::Remote(msg))
            }
            Ok(Ok(response)) => {
                self.release(lease);
                Ok(response)
            }
            Ok(Err(e)) => {
                self.force_close(lease);
                Err(e)
            }
            Err(_) => {
                self.force_close(lease);
                Err(RpcError::CallTimeout(self.addr.clone()))
            }
        }
    }

    /// Refuse new fetches and drop idle connections
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
        let drained: Vec<RpcConn> = std::mem::take(&mut *self.idle.lock());
        self.live.fetch_sub(drained.len(), Ordering::AcqRel);
        debug!("closed pool for {} ({} idle dropped)", self.addr, drained.len());
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live: self.live.load(Ordering::Acquire),
            idle: self.idle.lock().len(),
            fetch: self.fetches.load(Ordering::Relaxed),
            release: self.releases.load(Ordering::Relaxed),
            force_close: self.force_closes.load(Ordering::Relaxed),
        }
    }
}

/// One pool per destination address
#[derive(Clone)]
pub struct PoolRegistry {
    pools: Arc<DashMap<String, Arc<ConnPool>>>,
    config: PoolConfig,
    stats: Stats,
}

impl PoolRegistry {
    pub fn new(config: PoolConfig, stats: Stats) -> Self {
        Self {
            pools: Arc::new(DashMap::new()),
            config,
            stats,
        }
    }

    pub fn get(&self, addr: &str) -> Arc<ConnPool> {
        if let Some(pool) = self.pools.get(addr) {
            return pool.clone();
        }
        self.pools
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(ConnPool::new(addr, self.config.clone(), &self.stats)))
            .clone()
    }

    pub async fn call(&self, addr: &str, request: &Request) -> Result<Response, RpcError> {
        self.get(addr).call(request).await
    }

    /// Close and forget every pool whose address is not in `keep`
    pub fn retain(&self, keep: &HashSet<String>) {
        self.pools.retain(|addr, pool| {
            let alive = keep.contains(addr);
            if !alive {
                pool.close();
            }
            alive
        });
    }

    pub fn remove(&self, addr: &str) {
        if let Some((_, pool)) = self.pools.remove(addr) {
            pool.close();
        }
    }

    pub fn addresses(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    pub fn stats_for(&self, addr: &str) -> Option<PoolStats> {
        self.pools.get(addr).map(|p| p.stats())
    }
}
