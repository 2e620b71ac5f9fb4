//! # Filament
//!
//! A fine-grained signal-based reactivity core for Rust.
//!
//! Filament tracks dependencies automatically and recomputes lazily:
//!
//! ## Signals (Low-level primitives)
//!
//! Fine-grained reactive primitives for building reactive systems:
//! - `Signal<T>` - Reactive values that notify dependents when changed
//! - `Memo<T>` - Computed values that automatically track dependencies
//! - `Effect` - Side effects scheduled to run when dependencies change
//!
//! ## Runtime (Graph, clock and scheduler)
//!
//! The machinery underneath the primitives:
//! - A dependency graph with per-node version numbers and a global clock
//! - Lazy dirty / maybe-dirty revalidation with equality cutoff
//! - An effect queue drained explicitly via `flush_effects`
//! - A pending-task registry for in-flight asynchronous work
//!
//! ## Bridge (Async interop)
//!
//! `pending_until_first` wraps a `futures` stream so the gap between
//! subscribing and the first delivered event counts as a pending task.

pub mod bridge;
pub mod runtime;
pub mod signal;

// Re-export main types for convenience
pub use bridge::{pending_until_first, PendingUntilFirst};
pub use runtime::{
    flush_effects, has_pending_tasks, register_pending_task, set_effect_error_handler,
    unregister_pending_task, untracked, FlushError, PendingTaskHandle,
};
pub use signal::{
    create_effect, create_memo, create_signal, on_cleanup, Effect, Memo, ReadSignal, Signal,
    WriteSignal,
};
