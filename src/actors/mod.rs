//! Long-lived tasks and their supervision
//!
//! ## Task Types
//!
//! - **PeriodicTaskActor** ([`scheduler`]): membership refresh, routing
//!   refresh, heartbeat, queue GC and the stats report, each on its own
//!   jittered interval
//! - **Senders** (`queue`): one per destination, restarted by
//!   [`supervisor::supervise`] if they panic
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: each periodic task has an mpsc command channel
//! 2. **Request/Response**: `RunNow` replies over a oneshot channel
//! 3. **Shutdown**: every task selects on a shared `watch` signal

pub mod messages;
pub mod scheduler;
pub mod supervisor;
