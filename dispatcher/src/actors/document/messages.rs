//! DocumentActor message types.

use ractor::RpcReplyPort;

use super::state::{SessionOptions, SessionSnapshot};
use crate::document::DocumentError;

#[derive(Debug)]
pub enum DocumentMsg {
    Register {
        options: SessionOptions,
        reply: RpcReplyPort<u64>,
    },
    Start {
        session_id: u64,
        reply: RpcReplyPort<Result<(), AnchorError>>,
    },
    AppendDelta {
        session_id: u64,
        text: String,
        reply: RpcReplyPort<Result<(), AnchorError>>,
    },
    Finish {
        session_id: u64,
        reply: RpcReplyPort<Result<(), AnchorError>>,
    },
    RestoreOriginal {
        session_id: u64,
        original_text: String,
        reply: RpcReplyPort<Result<(), AnchorError>>,
    },
    ReadOriginal {
        session_id: u64,
        reply: RpcReplyPort<Result<String, AnchorError>>,
    },
    GetSnapshot {
        session_id: u64,
        reply: RpcReplyPort<Result<SessionSnapshot, AnchorError>>,
    },
    /// Deregisters a session; replies with the number still live.
    Dispose {
        session_id: u64,
        reply: RpcReplyPort<usize>,
    },
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AnchorError {
    #[error("document edit failed: {0}")]
    Document(#[from] DocumentError),

    #[error("anchor session {0} not found")]
    SessionNotFound(u64),

    #[error("document actor unavailable: {0}")]
    Unavailable(String),
}
