//! Actor modules
//!
//! - `scheduler`: admission control (concurrency cap, token bucket, server hints)
//! - `document`: per-document serialized edits and anchor sessions

pub mod document;
pub mod scheduler;

pub use document::{AnchorRegistry, AnchorSession, DocumentActor, DocumentMsg};
pub use scheduler::{Scheduler, SchedulerActor, SchedulerMsg};
