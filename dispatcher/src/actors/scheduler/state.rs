//! SchedulerActor state types.

use std::collections::{HashSet, VecDeque};

use shared_types::{RateLimits, ServerRateHint};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

use super::messages::{Admission, SchedulerSnapshot};

/// Fractional token bucket refilled continuously at `max_per_minute / 60s`.
#[derive(Debug, Clone)]
pub struct TokenBucketState {
    pub capacity: f64,
    pub tokens: f64,
    pub last_refill: Instant,
    pub cooldown_until: Option<Instant>,
}

impl TokenBucketState {
    /// One second's worth of requests, never less than a single token.
    pub fn capacity_for(max_per_minute: u32) -> f64 {
        (f64::from(max_per_minute) / 60.0).max(1.0)
    }

    pub fn full(max_per_minute: u32, now: Instant) -> Self {
        let capacity = Self::capacity_for(max_per_minute);
        Self {
            capacity,
            tokens: capacity,
            last_refill: now,
            cooldown_until: None,
        }
    }

    pub fn refill(&mut self, max_per_minute: u32, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_secs_f64() * 1_000.0;
        let per_ms = f64::from(max_per_minute) / 60_000.0;
        self.tokens = (self.tokens + per_ms * elapsed_ms).min(self.capacity);
        self.last_refill = now;
    }

    /// Shrinks or grows capacity; tokens are only ever lowered here.
    pub fn resize(&mut self, max_per_minute: u32) {
        self.capacity = Self::capacity_for(max_per_minute);
        self.tokens = self.tokens.min(self.capacity);
    }

    pub fn try_take(&mut self) -> bool {
        if self.tokens < 1.0 {
            return false;
        }
        self.tokens = (self.tokens - 1.0).max(0.0);
        true
    }

    pub fn refund(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }

    /// Cooldowns only move forward.
    pub fn extend_cooldown(&mut self, until: Instant) {
        self.cooldown_until = Some(match self.cooldown_until {
            Some(existing) => existing.max(until),
            None => until,
        });
    }

    pub fn is_cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

pub(crate) struct QueuedTask {
    pub task_id: u64,
    pub admit: oneshot::Sender<Admission>,
}

pub struct SchedulerState {
    pub limits: RateLimits,
    pub dynamic_limits: bool,
    pub bucket: TokenBucketState,
    pub(crate) queue: VecDeque<QueuedTask>,
    pub running: HashSet<u64>,
    pub admitted_total: u64,
    pub tick_task: Option<tokio::task::JoinHandle<()>>,
}

impl SchedulerState {
    pub fn new(limits: RateLimits, dynamic_limits: bool, now: Instant) -> Self {
        let limits = limits.normalized();
        Self {
            limits,
            dynamic_limits,
            bucket: TokenBucketState::full(limits.max_per_minute, now),
            queue: VecDeque::new(),
            running: HashSet::new(),
            admitted_total: 0,
            tick_task: None,
        }
    }

    pub fn enqueue(&mut self, task_id: u64, admit: oneshot::Sender<Admission>) {
        self.queue.push_back(QueuedTask { task_id, admit });
    }

    fn can_start(&self, now: Instant) -> bool {
        self.running.len() < self.limits.max_concurrency
            && !self.bucket.is_cooling_down(now)
            && self.bucket.tokens >= 1.0
            && !self.queue.is_empty()
    }

    /// Pops the FIFO front while capacity, cooldown and tokens allow it.
    pub fn admit_ready(&mut self, now: Instant) -> usize {
        let mut admitted = 0;
        while self.can_start(now) {
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            if !self.bucket.try_take() {
                self.queue.push_front(task);
                break;
            }
            if task.admit.send(Admission::Granted).is_ok() {
                self.running.insert(task.task_id);
                self.admitted_total += 1;
                admitted += 1;
            } else {
                // Waiter dropped before admission; the token was never spent.
                self.bucket.refund();
            }
        }
        admitted
    }

    /// Removes a still-queued task. Returns false once it has left the queue.
    pub fn withdraw(&mut self, task_id: u64) -> bool {
        let Some(index) = self.queue.iter().position(|t| t.task_id == task_id) else {
            return false;
        };
        if let Some(task) = self.queue.remove(index) {
            let _ = task.admit.send(Admission::Canceled);
        }
        true
    }

    /// Frees whatever the task holds: its queue entry or its running slot.
    pub fn release(&mut self, task_id: u64) -> bool {
        self.withdraw(task_id) || self.running.remove(&task_id)
    }

    pub fn update_limits(&mut self, limits: RateLimits) {
        self.limits = limits.normalized();
        self.bucket.resize(self.limits.max_per_minute);
    }

    /// Returns true when the hint changed the per-minute cap.
    pub fn apply_hint(&mut self, hint: ServerRateHint, now: Instant) -> bool {
        let hint = hint.clamped();
        if let Some(retry_after_ms) = hint.retry_after_ms {
            self.bucket
                .extend_cooldown(now + Duration::from_millis(retry_after_ms));
        }

        match hint.limit_per_minute_hint {
            Some(per_minute)
                if self.dynamic_limits
                    && per_minute > 0
                    && per_minute != self.limits.max_per_minute =>
            {
                self.update_limits(RateLimits::new(self.limits.max_concurrency, per_minute));
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&mut self) -> usize {
        let rejected = self.queue.len();
        for task in self.queue.drain(..) {
            let _ = task.admit.send(Admission::Canceled);
        }
        rejected
    }

    pub fn snapshot(&self, now: Instant) -> SchedulerSnapshot {
        SchedulerSnapshot {
            running: self.running.len(),
            queued: self.queue.len(),
            tokens: self.bucket.tokens,
            capacity: self.bucket.capacity,
            max_concurrency: self.limits.max_concurrency,
            max_per_minute: self.limits.max_per_minute,
            cooling_down: self.bucket.is_cooling_down(now),
            admitted_total: self.admitted_total,
        }
    }
}
