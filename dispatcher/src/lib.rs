//! Dispatcher - rate-limited generation requests streamed into shared documents
//!
//! This crate schedules many generation requests against a rate-limited
//! endpoint and writes each response into a document at the position of the
//! selection that produced it, while other responses are being written into
//! the same document.

pub mod actors;
pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod document;
pub mod provider;

pub use actors::document::{AnchorRegistry, AnchorSession, SessionOptions};
pub use actors::scheduler::{Scheduler, SchedulerArguments, SchedulerError};
pub use config::DispatcherConfig;
pub use dispatch::{DispatchError, Dispatcher, SelectionOutcome};
pub use document::{MemoryDocument, TextDocument};
pub use provider::{GenerateError, ProviderClient, ProviderConfig};
