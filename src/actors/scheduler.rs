//! PeriodicTaskActor - runs one named job on a jittered interval
//!
//! Ring rebuilds, routing refreshes, heartbeats, queue GC and the stats
//! report are all periodic tasks spawned through [`Scheduler`].
//!
//! ## Message Flow
//!
//! ```text
//! sleep(interval + jitter) → tick() → sleep ...
//!     ↑
//!     └─── Commands (RunNow, UpdateInterval, Shutdown) / shutdown signal
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::messages::TaskCommand;
use super::supervisor::guard;
use crate::shutdown::ShutdownSignal;
use crate::stats::Stats;

/// One iteration of a periodic job
#[async_trait]
pub trait PeriodicTask: Send + 'static {
    async fn tick(&mut self) -> Result<()>;
}

/// Timing of a periodic task
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub interval: Duration,
    /// Upper bound of the random extra delay, as a fraction of `interval`
    pub jitter: f64,
}

impl Schedule {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    fn next_delay(&self) -> Duration {
        if self.jitter <= 0.0 {
            return self.interval;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter);
        self.interval + self.interval.mul_f64(extra)
    }
}

struct PeriodicTaskActor<T> {
    name: String,
    task: T,
    schedule: Schedule,
    command_rx: mpsc::Receiver<TaskCommand>,
    shutdown: ShutdownSignal,
    stats: Stats,
}

impl<T: PeriodicTask> PeriodicTaskActor<T> {
    #[instrument(skip(self), fields(task = %self.name))]
    async fn run(mut self) {
        debug!("starting periodic task");

        loop {
            let delay = self.schedule.next_delay();

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.run_once().await {
                        warn!("periodic task failed: {e:#}");
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        TaskCommand::RunNow { respond_to } => {
                            let result = self.run_once().await;
                            let _ = respond_to.send(result);
                        }

                        TaskCommand::UpdateInterval { interval } => {
                            debug!("updating interval to {interval:?}");
                            self.schedule.interval = interval;
                        }

                        TaskCommand::Shutdown => break,
                    }
                }

                _ = self.shutdown.recv() => break,

                else => break,
            }
        }

        debug!("periodic task stopped");
    }

    async fn run_once(&mut self) -> Result<()> {
        match guard(&self.name, &self.stats, self.task.tick()).await {
            Some(result) => result,
            None => anyhow::bail!("task {} panicked", self.name),
        }
    }
}

/// Handle for controlling a periodic task
#[derive(Clone)]
pub struct TaskHandle {
    sender: mpsc::Sender<TaskCommand>,
    name: String,
}

impl TaskHandle {
    /// Run one iteration immediately and wait for its result
    pub async fn run_now(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(TaskCommand::RunNow { respond_to: tx })
            .await
            .context("failed to send RunNow command")?;

        rx.await.context("failed to receive response")?
    }

    pub async fn update_interval(&self, interval: Duration) -> Result<()> {
        self.sender
            .send(TaskCommand::UpdateInterval { interval })
            .await
            .context("failed to send UpdateInterval command")?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(TaskCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Spawns periodic tasks that share a shutdown signal and stats sink
#[derive(Clone)]
pub struct Scheduler {
    shutdown: ShutdownSignal,
    stats: Stats,
}

impl Scheduler {
    pub fn new(shutdown: ShutdownSignal, stats: Stats) -> Self {
        Self { shutdown, stats }
    }

    pub fn spawn<T: PeriodicTask>(&self, name: &str, schedule: Schedule, task: T) -> (TaskHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);

        let actor = PeriodicTaskActor {
            name: name.to_string(),
            task,
            schedule,
            command_rx: cmd_rx,
            shutdown: self.shutdown.clone(),
            stats: self.stats.clone(),
        };

        let join = tokio::spawn(actor.run());

        (
            TaskHandle {
                sender: cmd_tx,
                name: name.to_string(),
            },
            join,
        )
    }
}
