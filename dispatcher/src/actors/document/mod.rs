//! DocumentActor - single mutation authority for one shared document.
//!
//! One actor per document. Every session writing into the document sends its
//! edits here, so edits are applied one at a time in arrival order. After each
//! edit the anchors of all sessions ordered after the writer are re-based, so
//! each session keeps writing directly after its own text.
//!
//! A failed start/append/finish edit is logged and dropped; the session's
//! anchor stays where it was and the queue keeps moving.

mod messages;
mod registry;
mod session;
mod state;

use std::sync::Arc;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use shared_types::{InsertionMode, TextRange};

pub use messages::{AnchorError, DocumentMsg};
pub use registry::AnchorRegistry;
pub use session::AnchorSession;
pub use state::{DocumentState, Edit, SessionOptions, SessionSnapshot, SessionState};

use crate::document::{end_of_insert, TextDocument};

#[derive(Debug, Default)]
pub struct DocumentActor;

pub struct DocumentArguments {
    pub document: Arc<dyn TextDocument>,
}

#[async_trait]
impl Actor for DocumentActor {
    type Msg = DocumentMsg;
    type State = DocumentState;
    type Arguments = DocumentArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!(
            actor_id = %myself.get_id(),
            document_id = %args.document.id(),
            "DocumentActor starting"
        );
        Ok(DocumentState::new(args.document))
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DocumentMsg::Register { options, reply } => {
                let session_id = state.register(options);
                tracing::debug!(
                    document_id = %state.document.id(),
                    session_id,
                    live = state.sessions.len(),
                    "Anchor session registered"
                );
                let _ = reply.send(session_id);
            }
            DocumentMsg::Start { session_id, reply } => {
                let _ = reply.send(Self::handle_start(state, session_id).await);
            }
            DocumentMsg::AppendDelta {
                session_id,
                text,
                reply,
            } => {
                let result = if state.sessions.contains_key(&session_id) {
                    Self::insert_at_anchor(state, session_id, &text).await;
                    Ok(())
                } else {
                    Err(AnchorError::SessionNotFound(session_id))
                };
                let _ = reply.send(result);
            }
            DocumentMsg::Finish { session_id, reply } => {
                let _ = reply.send(Self::handle_finish(state, session_id).await);
            }
            DocumentMsg::RestoreOriginal {
                session_id,
                original_text,
                reply,
            } => {
                let result = Self::handle_restore(state, session_id, &original_text).await;
                if let Err(e) = &result {
                    tracing::warn!(
                        document_id = %state.document.id(),
                        session_id,
                        error = %e,
                        "Failed to restore original text"
                    );
                }
                let _ = reply.send(result);
            }
            DocumentMsg::ReadOriginal { session_id, reply } => {
                let result = match state.sessions.get(&session_id) {
                    Some(session) => state
                        .document
                        .read_range(session.original_range)
                        .await
                        .map_err(AnchorError::from),
                    None => Err(AnchorError::SessionNotFound(session_id)),
                };
                let _ = reply.send(result);
            }
            DocumentMsg::GetSnapshot { session_id, reply } => {
                let result = state
                    .sessions
                    .get(&session_id)
                    .map(SessionState::snapshot)
                    .ok_or(AnchorError::SessionNotFound(session_id));
                let _ = reply.send(result);
            }
            DocumentMsg::Dispose { session_id, reply } => {
                if state.sessions.remove(&session_id).is_some() {
                    tracing::debug!(
                        document_id = %state.document.id(),
                        session_id,
                        live = state.sessions.len(),
                        "Anchor session disposed"
                    );
                }
                let _ = reply.send(state.sessions.len());
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::debug!(
            actor_id = %myself.get_id(),
            document_id = %state.document.id(),
            edits_applied = state.edits_applied,
            "DocumentActor stopped"
        );
        Ok(())
    }
}

impl DocumentActor {
    async fn handle_start(state: &mut DocumentState, session_id: u64) -> Result<(), AnchorError> {
        let session = state
            .sessions
            .get_mut(&session_id)
            .ok_or(AnchorError::SessionNotFound(session_id))?;
        if session.started {
            return Ok(());
        }
        session.started = true;
        let mode = session.mode;
        let range = session.original_range;
        let pre_separator = session.pre_separator.clone();

        if mode == InsertionMode::Replace && !range.is_empty() {
            match state.document.delete(range).await {
                Ok(()) => {
                    if let Some(session) = state.sessions.get_mut(&session_id) {
                        session.anchor = range.start;
                        session.initial_anchor = range.start;
                        session.original_range = TextRange::empty(range.start);
                    }
                    let shifted = state.rebase_after(session_id, &Edit::Delete { range });
                    tracing::debug!(
                        document_id = %state.document.id(),
                        session_id,
                        lines_removed = range.line_span(),
                        shifted,
                        "Deleted original range"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        document_id = %state.document.id(),
                        session_id,
                        range = %range,
                        error = %e,
                        "Failed to delete original range"
                    );
                }
            }
        }

        if let Some(separator) = pre_separator {
            Self::insert_at_anchor(state, session_id, &separator).await;
        }
        Ok(())
    }

    async fn handle_finish(state: &mut DocumentState, session_id: u64) -> Result<(), AnchorError> {
        let session = state
            .sessions
            .get_mut(&session_id)
            .ok_or(AnchorError::SessionNotFound(session_id))?;
        if session.finished {
            return Ok(());
        }
        session.finished = true;
        let post_separator = session
            .post_separator
            .clone()
            .filter(|_| session.has_content);

        if let Some(separator) = post_separator {
            Self::insert_at_anchor(state, session_id, &separator).await;
        }
        Ok(())
    }

    /// Removes everything the session wrote and puts `original_text` back at
    /// its initial anchor. Unlike streaming edits, failures propagate.
    async fn handle_restore(
        state: &mut DocumentState,
        session_id: u64,
        original_text: &str,
    ) -> Result<(), AnchorError> {
        let session = state
            .sessions
            .get(&session_id)
            .ok_or(AnchorError::SessionNotFound(session_id))?;
        let initial = session.initial_anchor;
        let written = TextRange::new(initial, session.anchor);

        if !written.is_empty() {
            state.document.delete(written).await?;
            state.rebase_after(session_id, &Edit::Delete { range: written });
        }

        let mut end = initial;
        if !original_text.is_empty() {
            state.document.insert(initial, original_text).await?;
            end = end_of_insert(initial, original_text);
            state.rebase_after(session_id, &Edit::Insert { at: initial, end });
        }

        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.anchor = end;
            session.inserted_chars = 0;
            session.has_content = false;
            if !original_text.is_empty() {
                session.original_range = TextRange::new(initial, end);
            }
        }
        tracing::debug!(
            document_id = %state.document.id(),
            session_id,
            removed = %written,
            restored_chars = original_text.chars().count(),
            "Restored original text"
        );
        Ok(())
    }

    /// Inserts `text` at the session's anchor and re-bases later siblings.
    async fn insert_at_anchor(state: &mut DocumentState, session_id: u64, text: &str) {
        if text.is_empty() {
            return;
        }
        let Some(at) = state.sessions.get(&session_id).map(|s| s.anchor) else {
            return;
        };

        if let Err(e) = state.document.insert(at, text).await {
            tracing::warn!(
                document_id = %state.document.id(),
                session_id,
                at = %at,
                error = %e,
                "Failed to insert text at anchor"
            );
            return;
        }

        let end = end_of_insert(at, text);
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.anchor = end;
            session.inserted_chars += text.chars().count();
            session.has_content = true;
        }
        let shifted = state.rebase_after(session_id, &Edit::Insert { at, end });
        if end.line > at.line {
            tracing::trace!(
                session_id,
                lines_added = end.line - at.line,
                shifted,
                "Re-based sibling anchors"
            );
        }
    }
}
