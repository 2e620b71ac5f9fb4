//! Adapters between asynchronous event sources and the reactive runtime.
//!
//! The pending-task registry tracks in-flight asynchronous work so callers
//! can ask "is anything still settling?" as a reactive question. This module
//! bridges `futures` streams into that registry.

mod stream;

pub use stream::{pending_until_first, PendingUntilFirst};
