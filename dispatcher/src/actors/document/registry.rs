//! Registry of live document actors, keyed by document id.
//!
//! The first session opened on a document spawns its actor; disposing the last
//! session stops it. All bookkeeping happens under one lock so a session can
//! never register on an actor that is being torn down.

use std::collections::HashMap;
use std::sync::Arc;

use ractor::{Actor, ActorRef};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::messages::{AnchorError, DocumentMsg};
use super::session::AnchorSession;
use super::state::SessionOptions;
use super::{DocumentActor, DocumentArguments};
use crate::document::TextDocument;

struct DocumentEntry {
    actor: ActorRef<DocumentMsg>,
    join: JoinHandle<()>,
}

#[derive(Default)]
pub struct AnchorRegistry {
    documents: Mutex<HashMap<String, DocumentEntry>>,
}

impl AnchorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a new session on `document`.
    pub async fn open_session(
        self: &Arc<Self>,
        document: Arc<dyn TextDocument>,
        options: SessionOptions,
    ) -> Result<AnchorSession, AnchorError> {
        let document_id = document.id().to_string();
        let mut documents = self.documents.lock().await;

        let existing = documents.get(&document_id).map(|entry| entry.actor.clone());
        let actor = match existing {
            Some(actor) => actor,
            None => {
                let (actor, join) =
                    Actor::spawn(None, DocumentActor, DocumentArguments { document })
                        .await
                        .map_err(|e| AnchorError::Unavailable(e.to_string()))?;
                tracing::debug!(document_id = %document_id, "Spawned document actor");
                documents.insert(
                    document_id.clone(),
                    DocumentEntry {
                        actor: actor.clone(),
                        join,
                    },
                );
                actor
            }
        };

        let session_id = ractor::call!(actor, |reply| DocumentMsg::Register { options, reply })
            .map_err(|e| AnchorError::Unavailable(e.to_string()))?;

        Ok(AnchorSession::new(
            session_id,
            document_id,
            actor,
            Arc::clone(self),
        ))
    }

    /// Deregisters a session, stopping its document actor if it was the last.
    pub(crate) async fn release(&self, document_id: &str, session_id: u64) {
        let mut documents = self.documents.lock().await;
        let Some(entry) = documents.get(document_id) else {
            return;
        };

        let remaining =
            match ractor::call!(entry.actor, |reply| DocumentMsg::Dispose { session_id, reply }) {
                Ok(remaining) => remaining,
                Err(e) => {
                    tracing::warn!(
                        document_id = %document_id,
                        session_id,
                        error = %e,
                        "Document actor unavailable during dispose"
                    );
                    0
                }
            };

        if remaining == 0 {
            if let Some(entry) = documents.remove(document_id) {
                entry.actor.stop(Some("last session disposed".to_string()));
                let _ = entry.join.await;
                tracing::debug!(document_id = %document_id, "Stopped document actor");
            }
        }
    }

    pub async fn document_count(&self) -> usize {
        self.documents.lock().await.len()
    }

    pub async fn is_tracking(&self, document_id: &str) -> bool {
        self.documents.lock().await.contains_key(document_id)
    }
}
