//! SchedulerActor - admission control for outbound generation requests.
//!
//! A task is admitted only while all of these hold:
//! - fewer than `max_concurrency` tasks are running
//! - no server-imposed cooldown is active
//! - the token bucket holds at least one token
//!
//! The bucket refills continuously on a fixed tick. Admission is re-run after
//! every message, so refills, settles, limit updates and hints all unblock the
//! queue. The actor never runs task bodies itself: it hands a permit to the
//! waiting [`Scheduler::schedule`] future, which runs the action and releases
//! its slot on drop.

mod messages;
mod state;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use shared_types::{RateLimits, ServerRateHint};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use messages::{Admission, SchedulerError, SchedulerMsg, SchedulerSnapshot};
pub use state::{SchedulerState, TokenBucketState};

use crate::provider::RateHintSink;

pub const DEFAULT_REFILL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
pub struct SchedulerActor;

#[derive(Debug, Clone)]
pub struct SchedulerArguments {
    pub limits: RateLimits,
    /// Follow `limit_per_minute_hint`s reported by the server.
    pub dynamic_limits: bool,
    pub refill_interval: Duration,
}

impl Default for SchedulerArguments {
    fn default() -> Self {
        Self {
            limits: RateLimits::default(),
            dynamic_limits: true,
            refill_interval: DEFAULT_REFILL_INTERVAL,
        }
    }
}

#[async_trait]
impl Actor for SchedulerActor {
    type Msg = SchedulerMsg;
    type State = SchedulerState;
    type Arguments = SchedulerArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let interval = args.refill_interval.max(Duration::from_millis(10));
        let tick_ref = myself.clone();
        let tick_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if tick_ref.cast(SchedulerMsg::Tick).is_err() {
                    break;
                }
            }
        });

        let mut state = SchedulerState::new(args.limits, args.dynamic_limits, Instant::now());
        state.tick_task = Some(tick_task);

        tracing::info!(
            actor_id = %myself.get_id(),
            max_concurrency = state.limits.max_concurrency,
            max_per_minute = state.limits.max_per_minute,
            refill_interval_ms = interval.as_millis() as u64,
            "SchedulerActor starting"
        );
        Ok(state)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let now = Instant::now();
        match message {
            SchedulerMsg::Enqueue { task_id, admit } => {
                state.enqueue(task_id, admit);
                tracing::debug!(task_id, queued = state.queue.len(), "Task queued");
            }
            SchedulerMsg::Withdraw { task_id, reply } => {
                let withdrawn = state.withdraw(task_id);
                if withdrawn {
                    tracing::debug!(task_id, "Queued task canceled");
                }
                let _ = reply.send(withdrawn);
            }
            SchedulerMsg::Release { task_id } => {
                if state.release(task_id) {
                    tracing::debug!(task_id, running = state.running.len(), "Task released");
                }
            }
            SchedulerMsg::Tick => {
                state.bucket.refill(state.limits.max_per_minute, now);
            }
            SchedulerMsg::UpdateLimits { limits } => {
                state.update_limits(limits);
                tracing::info!(
                    max_concurrency = state.limits.max_concurrency,
                    max_per_minute = state.limits.max_per_minute,
                    "Scheduler limits updated"
                );
            }
            SchedulerMsg::ApplyServerHint { hint } => {
                let limits_changed = state.apply_hint(hint, now);
                if let Some(retry_after_ms) = hint.retry_after_ms {
                    tracing::warn!(retry_after_ms, "Server requested cooldown");
                }
                if limits_changed {
                    tracing::info!(
                        max_per_minute = state.limits.max_per_minute,
                        "Adopted server rate limit hint"
                    );
                }
            }
            SchedulerMsg::CancelAll { reply } => {
                let rejected = state.cancel_all();
                if rejected > 0 {
                    tracing::info!(rejected, "Canceled queued tasks");
                }
                let _ = reply.send(rejected);
            }
            SchedulerMsg::GetSnapshot { reply } => {
                let _ = reply.send(state.snapshot(now));
            }
        }

        let admitted = state.admit_ready(now);
        if admitted > 0 {
            tracing::debug!(
                admitted,
                running = state.running.len(),
                queued = state.queue.len(),
                tokens = state.bucket.tokens,
                "Admitted tasks"
            );
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(tick_task) = state.tick_task.take() {
            tick_task.abort();
        }
        let rejected = state.cancel_all();
        tracing::info!(actor_id = %myself.get_id(), rejected, "SchedulerActor stopped");
        Ok(())
    }
}

/// Handle to a running [`SchedulerActor`].
pub struct Scheduler {
    actor: ActorRef<SchedulerMsg>,
    join: Mutex<Option<JoinHandle<()>>>,
    next_task_id: AtomicU64,
}

struct ReleaseGuard {
    actor: ActorRef<SchedulerMsg>,
    task_id: u64,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let _ = self.actor.cast(SchedulerMsg::Release {
            task_id: self.task_id,
        });
    }
}

impl Scheduler {
    pub async fn spawn(args: SchedulerArguments) -> Result<Self, SchedulerError> {
        let (actor, join) = Actor::spawn(None, SchedulerActor, args)
            .await
            .map_err(|e| SchedulerError::Unavailable(e.to_string()))?;
        Ok(Self {
            actor,
            join: Mutex::new(Some(join)),
            next_task_id: AtomicU64::new(0),
        })
    }

    /// Queues `action` and resolves with its output once it has run.
    ///
    /// The task is enqueued when this is called, not when the returned future
    /// is first polled. A `cancel` that fires while the task is queued rejects
    /// it with [`SchedulerError::Canceled`]; once running, the action is
    /// expected to watch the token itself.
    pub fn schedule<T, F, Fut>(
        &self,
        action: F,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<T, SchedulerError>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1;
        let actor = self.actor.clone();
        let (admit_tx, mut admit_rx) = oneshot::channel();

        // The guard lives in the returned future from the start, so a future
        // dropped before its first poll still frees its queue entry or slot.
        let enqueued = if cancel.is_cancelled() {
            Err(SchedulerError::Canceled)
        } else {
            actor
                .cast(SchedulerMsg::Enqueue {
                    task_id,
                    admit: admit_tx,
                })
                .map(|()| ReleaseGuard {
                    actor: actor.clone(),
                    task_id,
                })
                .map_err(|e| SchedulerError::Unavailable(e.to_string()))
        };

        async move {
            let _release = enqueued?;

            let early = tokio::select! {
                biased;
                admission = &mut admit_rx => Some(admission),
                _ = cancel.cancelled() => None,
            };
            let admission = match early {
                Some(admission) => admission,
                None => {
                    let withdrawn =
                        ractor::call!(actor, |reply| SchedulerMsg::Withdraw { task_id, reply })
                            .unwrap_or(true);
                    if withdrawn {
                        return Err(SchedulerError::Canceled);
                    }
                    admit_rx.await
                }
            };

            match admission {
                Ok(Admission::Granted) if !cancel.is_cancelled() => Ok(action().await),
                _ => Err(SchedulerError::Canceled),
            }
        }
    }

    /// Rejects every queued task. Running tasks are left alone.
    pub async fn cancel_all(&self) -> Result<usize, SchedulerError> {
        ractor::call!(self.actor, |reply| SchedulerMsg::CancelAll { reply })
            .map_err(|e| SchedulerError::Unavailable(e.to_string()))
    }

    pub fn update_limits(&self, limits: RateLimits) {
        if let Err(e) = self.actor.cast(SchedulerMsg::UpdateLimits { limits }) {
            tracing::warn!(error = %e, "Failed to update scheduler limits");
        }
    }

    pub fn apply_server_hint(&self, hint: ServerRateHint) {
        if hint.is_empty() {
            return;
        }
        if let Err(e) = self.actor.cast(SchedulerMsg::ApplyServerHint { hint }) {
            tracing::warn!(error = %e, "Failed to apply server rate hint");
        }
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot, SchedulerError> {
        ractor::call!(self.actor, |reply| SchedulerMsg::GetSnapshot { reply })
            .map_err(|e| SchedulerError::Unavailable(e.to_string()))
    }

    /// Stops the refill tick and rejects queued work. Idempotent.
    pub async fn dispose(&self) {
        let Some(join) = self.join.lock().await.take() else {
            return;
        };
        match self.cancel_all().await {
            Ok(rejected) => tracing::debug!(rejected, "Scheduler disposing"),
            Err(e) => tracing::warn!(error = %e, "Scheduler already unavailable"),
        }
        self.actor.stop(Some("disposed".to_string()));
        let _ = join.await;
    }
}

impl RateHintSink for Scheduler {
    fn on_rate_hint(&self, hint: ServerRateHint) {
        self.apply_server_hint(hint);
    }
}
