//! Runtime support for reactive primitives.
//!
//! This module provides the infrastructure for dependency tracking, lazy
//! invalidation, effect scheduling and pending-task bookkeeping.

mod context;
mod scheduler;

pub use context::{set_effect_error_handler, untracked, ReactiveRuntime};
pub use scheduler::{
    flush_effects, has_pending_tasks, register_pending_task, unregister_pending_task, FlushError,
    PendingTaskHandle, MAX_FLUSH_PASSES,
};

pub(crate) use context::NodeState;
