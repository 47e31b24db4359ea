//! Message types for task control
//!
//! Every periodic task owns an mpsc command channel; request/response
//! commands carry a oneshot sender for the reply.

use std::time::Duration;

use tokio::sync::oneshot;

/// Commands accepted by a periodic task actor
#[derive(Debug)]
pub enum TaskCommand {
    /// Run one iteration now, bypassing the timer
    ///
    /// Used for deterministic injection under test and for SIGHUP-driven
    /// refreshes.
    RunNow {
        respond_to: oneshot::Sender<anyhow::Result<()>>,
    },

    /// Change the period; takes effect from the next sleep
    UpdateInterval { interval: Duration },

    /// Finish the current iteration and exit
    Shutdown,
}
