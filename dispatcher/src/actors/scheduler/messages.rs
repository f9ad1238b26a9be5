//! SchedulerActor message types.

use ractor::RpcReplyPort;
use serde::Serialize;
use shared_types::{RateLimits, ServerRateHint};
use tokio::sync::oneshot;

/// Verdict delivered to a queued task's waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Canceled,
}

#[derive(Debug)]
pub enum SchedulerMsg {
    /// Append a task to the FIFO queue.
    Enqueue {
        task_id: u64,
        admit: oneshot::Sender<Admission>,
    },
    /// Remove a task only if it is still queued.
    Withdraw {
        task_id: u64,
        reply: RpcReplyPort<bool>,
    },
    /// Task settled or its waiter went away.
    Release { task_id: u64 },
    /// Periodic token refill.
    Tick,
    UpdateLimits { limits: RateLimits },
    ApplyServerHint { hint: ServerRateHint },
    CancelAll { reply: RpcReplyPort<usize> },
    GetSnapshot { reply: RpcReplyPort<SchedulerSnapshot> },
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub running: usize,
    pub queued: usize,
    pub tokens: f64,
    pub capacity: f64,
    pub max_concurrency: usize,
    pub max_per_minute: u32,
    pub cooling_down: bool,
    pub admitted_total: u64,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("task canceled")]
    Canceled,

    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
}
