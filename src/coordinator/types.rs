//! Engine state and health types.
//!
//! # State Transitions
//!
//! ```text
//!            start()                 shutdown()
//! Created ───────────→ Running ───────────────→ ShuttingDown ──→ Stopped
//!    │                                                              ↑
//!    └──────────────────────── shutdown() ──────────────────────────┘
//! ```
//!
//! - **Created**: after `ReplicationEngine::open()`. The queue is loaded but
//!   no worker runs; listeners may already enqueue.
//! - **Running**: the worker drains the queue (unless the queue is paused).
//! - **ShuttingDown**: the queue is stopped and its snapshot written; waiting
//!   for the worker to finish its current apply.
//! - **Stopped**: terminal. A new engine must be opened to continue.

use crate::queue::QueueState;

/// State of the replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Opened, worker not started.
    Created,

    /// Worker spawned.
    Running,

    /// Stop requested, worker draining its in-flight apply.
    ShuttingDown,

    /// Shut down. Pending operations are in the snapshot.
    Stopped,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Created => "Created",
            EngineState::Running => "Running",
            EngineState::ShuttingDown => "ShuttingDown",
            EngineState::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the engine for monitoring.
///
/// Collected from in-process state only; no slave store I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    pub queue_state: QueueState,
    /// Shorthand for `queue_state == Paused`.
    pub paused: bool,
    /// Operations waiting to be applied.
    pub queue_depth: usize,
    /// Rollback position, if marked.
    pub mark: Option<usize>,
    pub applied: u64,
    pub dropped: u64,
    pub retried: u64,
    /// Running with an active (not paused) queue.
    pub healthy: bool,
}
