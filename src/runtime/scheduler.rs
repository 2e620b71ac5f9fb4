use std::panic::{catch_unwind, AssertUnwindSafe};

use thiserror::Error;

use super::context::{NodeState, ReactiveRuntime, STABILITY_NODE};

/// Flush passes allowed before the scheduler gives up on a queue that keeps
/// refilling itself. A development-mode safety bound against ping-pong
/// scheduling, not a semantic contract.
pub const MAX_FLUSH_PASSES: usize = 100;

/// Fatal scheduling failure reported by [`flush_effects`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlushError {
    /// Effects kept rescheduling each other; the flush was aborted to avoid
    /// an infinite loop.
    #[error("effect queue did not settle after {passes} flush passes")]
    Unsettled {
        /// Number of queue drains performed before aborting.
        passes: usize,
    },
}

/// Opaque handle for one unit of outstanding asynchronous work.
///
/// Returned by [`register_pending_task`]; pass it back to
/// [`unregister_pending_task`] exactly once when the work completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingTaskHandle(pub(crate) usize);

impl ReactiveRuntime {
    /// Queue an effect for the next flush. Redundant dirties coalesce: an
    /// already-queued effect is left alone. Each queued cycle holds a
    /// pending-task handle so stability observers see the work.
    pub(crate) fn enqueue_effect(&self, id: usize) {
        let transition = {
            let mut ctx = self.context.lock().unwrap();
            let Some(record) = ctx.effects.get_mut(&id) else {
                return;
            };
            if record.destroyed || record.destroy_requested || record.queued {
                return;
            }
            record.queued = true;
            let task = self.next_id();
            record.task = Some(task);
            ctx.pending.insert(id);
            let was_empty = ctx.pending_tasks.is_empty();
            ctx.pending_tasks.insert(task);
            if was_empty {
                ctx.touch_stability();
            }
            was_empty
        };
        if transition {
            self.propagate(STABILITY_NODE);
        }
    }

    /// Drain the pending effect queue until it stays empty.
    ///
    /// Effects run in creation order within a pass. Writes performed by a
    /// running effect fold into the same flush: the queue is drained again
    /// until no effect reschedules, bounded by [`MAX_FLUSH_PASSES`]. The
    /// runtime never calls this on its own; the external synchronization
    /// driver decides when to flush.
    pub fn flush(&self) -> Result<(), FlushError> {
        for _ in 0..MAX_FLUSH_PASSES {
            let batch: Vec<usize> = {
                let mut ctx = self.context.lock().unwrap();
                if ctx.pending.is_empty() {
                    return Ok(());
                }
                std::mem::take(&mut ctx.pending).into_iter().collect()
            };
            for id in batch {
                self.run_effect(id);
            }
        }

        let settled = {
            let ctx = self.context.lock().unwrap();
            ctx.pending.is_empty()
        };
        if settled {
            Ok(())
        } else {
            tracing::error!(
                passes = MAX_FLUSH_PASSES,
                "flush aborted; effects kept rescheduling each other"
            );
            Err(FlushError::Unsettled {
                passes: MAX_FLUSH_PASSES,
            })
        }
    }

    /// One queued -> running -> idle cycle for a single effect.
    ///
    /// `Check` effects revalidate first and skip the run when every source
    /// version still matches its snapshot. A panic in the body is routed to
    /// the error handler and the effect stays idle, ready to retry on the
    /// next dependency change.
    fn run_effect(&self, id: usize) {
        let task = {
            let mut ctx = self.context.lock().unwrap();
            let Some(record) = ctx.effects.get_mut(&id) else {
                return;
            };
            if record.destroyed {
                return;
            }
            record.queued = false;
            record.task.take()
        };

        let state = self.resolve_check(id);
        if state != NodeState::Dirty {
            if let Some(task) = task {
                self.unregister_pending_task(PendingTaskHandle(task));
            }
            return;
        }

        let (body, cleanup) = {
            let mut ctx = self.context.lock().unwrap();
            let Some(record) = ctx.effects.get_mut(&id) else {
                return;
            };
            record.running = true;
            (record.body.clone(), record.cleanup.take())
        };

        if let Some(cleanup) = cleanup {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(cleanup)) {
                self.report_effect_error(payload);
            }
        }

        self.clear_sources(id);
        self.set_node_state(id, NodeState::Clean);

        let result = catch_unwind(AssertUnwindSafe(|| self.with_observer(id, || body())));

        let destroy_requested = {
            let mut ctx = self.context.lock().unwrap();
            match ctx.effects.get_mut(&id) {
                Some(record) => {
                    record.running = false;
                    record.destroy_requested
                }
                None => false,
            }
        };

        if let Err(payload) = result {
            self.report_effect_error(payload);
        }
        if let Some(task) = task {
            self.unregister_pending_task(PendingTaskHandle(task));
        }
        if destroy_requested {
            self.finalize_destroy(id);
        }
    }

    /// Destroy an effect: detach its edges, dequeue it, release its pending
    /// task and run its last cleanup. Idempotent; a destroy requested while
    /// the body is mid-run is deferred to the end of that run.
    pub(crate) fn destroy_effect(&self, id: usize) {
        {
            let mut ctx = self.context.lock().unwrap();
            let Some(record) = ctx.effects.get_mut(&id) else {
                return;
            };
            if record.destroyed {
                return;
            }
            if record.running {
                record.destroy_requested = true;
                return;
            }
        }
        self.finalize_destroy(id);
    }

    fn finalize_destroy(&self, id: usize) {
        let (cleanup, task) = {
            let mut ctx = self.context.lock().unwrap();
            let Some(record) = ctx.effects.get_mut(&id) else {
                return;
            };
            if record.destroyed {
                return;
            }
            record.destroyed = true;
            record.queued = false;
            let cleanup = record.cleanup.take();
            let task = record.task.take();
            ctx.pending.remove(&id);
            ctx.remove_node_locked(id);
            ctx.effects.remove(&id);
            (cleanup, task)
        };
        if let Some(task) = task {
            self.unregister_pending_task(PendingTaskHandle(task));
        }
        if let Some(cleanup) = cleanup {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(cleanup)) {
                self.report_effect_error(payload);
            }
        }
    }

    /// Mark the system "unsettled" until the returned handle is passed back
    /// to [`unregister_pending_task`](Self::unregister_pending_task).
    pub fn register_pending_task(&self) -> PendingTaskHandle {
        let id = self.next_id();
        let transition = {
            let mut ctx = self.context.lock().unwrap();
            let was_empty = ctx.pending_tasks.is_empty();
            ctx.pending_tasks.insert(id);
            if was_empty {
                ctx.touch_stability();
            }
            was_empty
        };
        if transition {
            self.propagate(STABILITY_NODE);
        }
        PendingTaskHandle(id)
    }

    /// Release a pending task. Unregistering the same handle twice is a
    /// usage error: it is logged and the outstanding count is untouched.
    pub fn unregister_pending_task(&self, handle: PendingTaskHandle) {
        let transition = {
            let mut ctx = self.context.lock().unwrap();
            if !ctx.pending_tasks.remove(&handle.0) {
                drop(ctx);
                tracing::error!(handle = handle.0, "pending task unregistered twice");
                return;
            }
            let now_empty = ctx.pending_tasks.is_empty();
            if now_empty {
                ctx.touch_stability();
            }
            now_empty
        };
        if transition {
            self.propagate(STABILITY_NODE);
        }
    }

    /// Whether any asynchronous work is outstanding: queued effects or
    /// externally registered pending tasks. A tracked read, so memos and
    /// effects can depend on stability.
    pub fn has_pending_tasks(&self) -> bool {
        self.track_read(STABILITY_NODE);
        let ctx = self.context.lock().unwrap();
        !ctx.pending_tasks.is_empty()
    }
}

/// Drain the current runtime's effect queue. See
/// [`ReactiveRuntime::flush`].
///
/// # Examples
///
/// ```
/// use filament::{create_effect, create_signal, flush_effects};
/// use filament::runtime::ReactiveRuntime;
/// use std::sync::atomic::{AtomicI32, Ordering};
/// use std::sync::Arc;
///
/// ReactiveRuntime::scope(|| {
///     let (count, set_count) = create_signal(0);
///     let seen = Arc::new(AtomicI32::new(-1));
///     let _effect = create_effect({
///         let seen = Arc::clone(&seen);
///         move || seen.store(count.get(), Ordering::SeqCst)
///     });
///
///     set_count.set(1);
///     set_count.set(2);
///     flush_effects().unwrap();
///     // Two writes between flushes, one run.
///     assert_eq!(seen.load(Ordering::SeqCst), 2);
/// });
/// ```
pub fn flush_effects() -> Result<(), FlushError> {
    ReactiveRuntime::current().flush()
}

/// Register outstanding asynchronous work with the current runtime.
pub fn register_pending_task() -> PendingTaskHandle {
    ReactiveRuntime::current().register_pending_task()
}

/// Release a handle obtained from [`register_pending_task`].
pub fn unregister_pending_task(handle: PendingTaskHandle) {
    ReactiveRuntime::current().unregister_pending_task(handle);
}

/// Whether the current runtime has outstanding work. Tracked read.
pub fn has_pending_tasks() -> bool {
    ReactiveRuntime::current().has_pending_tasks()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_on_empty_queue_is_ok() {
        ReactiveRuntime::scope(|| {
            assert_eq!(flush_effects(), Ok(()));
        });
    }

    #[test]
    fn pending_tasks_round_trip() {
        ReactiveRuntime::scope(|| {
            assert!(!has_pending_tasks());
            let a = register_pending_task();
            let b = register_pending_task();
            assert!(has_pending_tasks());
            unregister_pending_task(a);
            assert!(has_pending_tasks());
            unregister_pending_task(b);
            assert!(!has_pending_tasks());
        });
    }

    #[test]
    fn double_unregister_is_reported_not_fatal() {
        ReactiveRuntime::scope(|| {
            let a = register_pending_task();
            let b = register_pending_task();
            unregister_pending_task(a);
            // Second unregister of the same handle must not disturb b.
            unregister_pending_task(a);
            assert!(has_pending_tasks());
            unregister_pending_task(b);
            assert!(!has_pending_tasks());
        });
    }
}
