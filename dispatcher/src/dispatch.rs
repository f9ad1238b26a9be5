//! Dispatcher - fans selections out to the provider through the scheduler and
//! streams each result into the document at the selection's anchor.

use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use shared_types::{InsertionMode, TextRange};
use tokio_util::sync::CancellationToken;

use crate::actors::document::{AnchorError, AnchorRegistry, AnchorSession, SessionOptions};
use crate::actors::scheduler::{Scheduler, SchedulerError};
use crate::config::DispatcherConfig;
use crate::document::TextDocument;
use crate::provider::{DeltaSink, GenerateError, GenerateRequest, ProviderClient, RateHintSink};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error(transparent)]
    Anchor(#[from] AnchorError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

#[derive(Debug)]
pub enum SelectionOutcome {
    /// Output was written; `chars` counts generated text, separators excluded.
    Completed { chars: usize },
    /// Nothing usable came back; the selection was put back as it was.
    Empty,
    /// The selection was restored and the error surfaced.
    Failed(DispatchError),
    /// Stopped by a cancel; any partial output stays in the document.
    Canceled,
}

impl SelectionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SelectionOutcome::Completed { .. })
    }
}

pub struct Dispatcher {
    scheduler: Arc<Scheduler>,
    client: Arc<ProviderClient>,
    registry: Arc<AnchorRegistry>,
    session_template: SessionOptions,
    cancel: Mutex<CancellationToken>,
}

impl Dispatcher {
    pub async fn new(config: &DispatcherConfig) -> Result<Self, DispatchError> {
        let scheduler = Arc::new(Scheduler::spawn(config.scheduler_args()).await?);
        let hint_sink: Arc<dyn RateHintSink> = scheduler.clone();
        let client = ProviderClient::new(config.provider_config(), config.credential())?
            .with_hint_sink(hint_sink);

        tracing::info!(
            base_url = %config.base_url,
            request_path = %config.request_path,
            max_concurrency = config.max_concurrency,
            max_per_minute = config.max_per_minute,
            stream = config.stream,
            "Dispatcher ready"
        );
        Ok(Self::from_parts(
            scheduler,
            client,
            AnchorRegistry::new(),
            config.session_options(TextRange::default()),
        ))
    }

    /// Assembles a dispatcher from existing pieces. The client should already
    /// report rate hints to `scheduler` if adaptation is wanted.
    pub fn from_parts(
        scheduler: Arc<Scheduler>,
        client: ProviderClient,
        registry: Arc<AnchorRegistry>,
        session_template: SessionOptions,
    ) -> Self {
        Self {
            scheduler,
            client: Arc::new(client),
            registry,
            session_template,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn registry(&self) -> &Arc<AnchorRegistry> {
        &self.registry
    }

    fn root_token(&self) -> CancellationToken {
        match self.cancel.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Generates for every selection and returns outcomes in selection order.
    ///
    /// All sessions are registered before the first task is scheduled, so
    /// sibling ordering is based on the untouched document.
    pub async fn run(
        &self,
        document: Arc<dyn TextDocument>,
        selections: &[TextRange],
    ) -> Vec<SelectionOutcome> {
        let root = self.root_token();
        let mode = self.session_template.mode;

        let mut opened = Vec::with_capacity(selections.len());
        for range in selections {
            let options = SessionOptions {
                range: *range,
                ..self.session_template.clone()
            };
            let session = self
                .registry
                .open_session(Arc::clone(&document), options)
                .await
                .map(Arc::new);
            opened.push(session);
        }

        let tasks: Vec<_> = opened
            .into_iter()
            .enumerate()
            .map(|(index, opened)| {
                let task_cancel = root.child_token();
                let scheduled = opened.map(|session| {
                    let client = Arc::clone(&self.client);
                    let action_session = Arc::clone(&session);
                    let action_cancel = task_cancel.clone();
                    let pending = self.scheduler.schedule(
                        move || run_selection(client, action_session, action_cancel, mode),
                        task_cancel,
                    );
                    (session, pending)
                });

                async move {
                    let (session, pending) = match scheduled {
                        Ok(scheduled) => scheduled,
                        Err(e) => {
                            tracing::warn!(index, error = %e, "Failed to open anchor session");
                            return SelectionOutcome::Failed(e.into());
                        }
                    };
                    let outcome = match pending.await {
                        Ok(outcome) => outcome,
                        Err(SchedulerError::Canceled) => SelectionOutcome::Canceled,
                        Err(e) => SelectionOutcome::Failed(e.into()),
                    };
                    session.dispose().await;
                    log_outcome(index, &outcome);
                    outcome
                }
            })
            .collect();

        join_all(tasks).await
    }

    /// Cancels everything in flight or queued. Later runs start fresh.
    pub async fn cancel(&self) {
        let previous = match self.cancel.lock() {
            Ok(mut token) => std::mem::take(&mut *token),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        previous.cancel();
        match self.scheduler.cancel_all().await {
            Ok(rejected) => tracing::info!(rejected, "Dispatcher canceled"),
            Err(e) => tracing::warn!(error = %e, "Scheduler unavailable during cancel"),
        }
    }

    pub async fn shutdown(&self) {
        self.cancel().await;
        self.scheduler.dispose().await;
    }
}

fn log_outcome(index: usize, outcome: &SelectionOutcome) {
    match outcome {
        SelectionOutcome::Completed { chars } => {
            tracing::info!(index, chars, "Selection completed");
        }
        SelectionOutcome::Empty => {
            tracing::info!(index, "Provider returned no usable text; selection left unchanged");
        }
        SelectionOutcome::Failed(e) => {
            let rate_limited = matches!(e, DispatchError::Generate(g) if g.is_rate_limited());
            tracing::warn!(index, rate_limited, error = %e, "Selection failed");
        }
        SelectionOutcome::Canceled => {
            tracing::debug!(index, "Selection canceled");
        }
    }
}

async fn run_selection(
    client: Arc<ProviderClient>,
    session: Arc<AnchorSession>,
    cancel: CancellationToken,
    mode: InsertionMode,
) -> SelectionOutcome {
    let original = match session.original_text().await {
        Ok(text) => text,
        Err(e) => return SelectionOutcome::Failed(e.into()),
    };
    if original.trim().is_empty() {
        return SelectionOutcome::Empty;
    }
    if let Err(e) = session.start().await {
        return SelectionOutcome::Failed(e.into());
    }

    let request = GenerateRequest {
        prompt: original.clone(),
        cancel,
    };
    let sink: &dyn DeltaSink = session.as_ref();
    let result = client.generate(request, Some(sink)).await;

    match result {
        Ok(generation) if generation.text.trim().is_empty() => {
            restore(&session, mode, &original).await;
            SelectionOutcome::Empty
        }
        Ok(generation) => {
            if let Err(e) = session.finish().await {
                tracing::warn!(error = %e, "Failed to finish anchor session");
            }
            SelectionOutcome::Completed {
                chars: generation.text.chars().count(),
            }
        }
        Err(GenerateError::Canceled) => SelectionOutcome::Canceled,
        Err(e) => {
            restore(&session, mode, &original).await;
            SelectionOutcome::Failed(e.into())
        }
    }
}

/// Puts the selection back: the original text in replace mode, nothing in
/// append mode (the original was never removed).
async fn restore(session: &AnchorSession, mode: InsertionMode, original: &str) {
    let text = match mode {
        InsertionMode::Replace => original,
        InsertionMode::Append => "",
    };
    if let Err(e) = session.restore_original(text).await {
        tracing::warn!(
            session_id = session.session_id(),
            error = %e,
            "Failed to restore original text"
        );
    }
}
