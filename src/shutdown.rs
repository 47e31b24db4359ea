//! Process-wide shutdown broadcast
//!
//! One [`Shutdown`] owns a `watch` channel; every long-lived loop holds a
//! [`ShutdownSignal`] and selects on [`ShutdownSignal::recv`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!("shutdown requested");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested or the owner is gone
    pub async fn recv(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

/// Wait for `tasks` to finish; `false` if the deadline passed first
pub async fn drain(tasks: Vec<JoinHandle<()>>, deadline: Duration) -> bool {
    let pending = tasks.len();
    match tokio::time::timeout(deadline, join_all(tasks)).await {
        Ok(_) => true,
        Err(_) => {
            warn!("{pending} tasks still running after the {deadline:?} drain deadline");
            false
        }
    }
}
