//! Handle for one streaming insertion into a shared document.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ractor::ActorRef;

use super::messages::{AnchorError, DocumentMsg};
use super::registry::AnchorRegistry;
use super::state::SessionSnapshot;
use crate::provider::DeltaSink;

/// Writes one task's output at an anchor that follows sibling edits.
///
/// Every call is queued on the document's actor, so `start`, `append_delta`
/// and `finish` land in call order. Once disposed, all calls are no-ops.
pub struct AnchorSession {
    session_id: u64,
    document_id: String,
    actor: ActorRef<DocumentMsg>,
    registry: Arc<AnchorRegistry>,
    disposed: AtomicBool,
}

fn unavailable(e: impl std::fmt::Display) -> AnchorError {
    AnchorError::Unavailable(e.to_string())
}

impl AnchorSession {
    pub(crate) fn new(
        session_id: u64,
        document_id: String,
        actor: ActorRef<DocumentMsg>,
        registry: Arc<AnchorRegistry>,
    ) -> Self {
        Self {
            session_id,
            document_id,
            actor,
            registry,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Clears the original range in replace mode and writes the pre-separator.
    pub async fn start(&self) -> Result<(), AnchorError> {
        if self.is_disposed() {
            return Ok(());
        }
        let session_id = self.session_id;
        ractor::call!(self.actor, |reply| DocumentMsg::Start { session_id, reply })
            .map_err(unavailable)?
    }

    pub async fn append_delta(&self, text: &str) -> Result<(), AnchorError> {
        if self.is_disposed() || text.is_empty() {
            return Ok(());
        }
        let session_id = self.session_id;
        let text = text.to_string();
        ractor::call!(self.actor, |reply| DocumentMsg::AppendDelta {
            session_id,
            text,
            reply
        })
        .map_err(unavailable)?
    }

    /// Writes the post-separator if anything was inserted.
    pub async fn finish(&self) -> Result<(), AnchorError> {
        if self.is_disposed() {
            return Ok(());
        }
        let session_id = self.session_id;
        ractor::call!(self.actor, |reply| DocumentMsg::Finish { session_id, reply })
            .map_err(unavailable)?
    }

    /// Drops everything this session wrote and re-inserts `original_text`.
    pub async fn restore_original(&self, original_text: &str) -> Result<(), AnchorError> {
        if self.is_disposed() {
            return Ok(());
        }
        let session_id = self.session_id;
        let original_text = original_text.to_string();
        ractor::call!(self.actor, |reply| DocumentMsg::RestoreOriginal {
            session_id,
            original_text,
            reply
        })
        .map_err(unavailable)?
    }

    /// Current text of the (re-based) original range.
    pub async fn original_text(&self) -> Result<String, AnchorError> {
        let session_id = self.session_id;
        ractor::call!(self.actor, |reply| DocumentMsg::ReadOriginal {
            session_id,
            reply
        })
        .map_err(unavailable)?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, AnchorError> {
        let session_id = self.session_id;
        ractor::call!(self.actor, |reply| DocumentMsg::GetSnapshot {
            session_id,
            reply
        })
        .map_err(unavailable)?
    }

    /// Deregisters the session. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry
            .release(&self.document_id, self.session_id)
            .await;
    }
}

#[async_trait]
impl DeltaSink for AnchorSession {
    async fn on_delta(&self, delta: &str) {
        if let Err(e) = self.append_delta(delta).await {
            tracing::warn!(
                document_id = %self.document_id,
                session_id = self.session_id,
                error = %e,
                "Dropped streamed delta"
            );
        }
    }
}
