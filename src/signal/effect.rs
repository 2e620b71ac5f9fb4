use crate::runtime::ReactiveRuntime;
use std::sync::{Arc, Weak};

/// A side effect scheduled to re-run when its dependencies change.
///
/// Effects are deferred consumers: creating one queues it, and the first run
/// happens at the next [`flush_effects`](crate::flush_effects) call. Each
/// run re-tracks exactly the signals and memos the body reads, so branches
/// not taken stop re-triggering the effect. Redundant writes between two
/// flushes coalesce into a single run.
///
/// Dropping the handle destroys the effect; [`destroy`](Effect::destroy)
/// does so explicitly and is idempotent.
///
/// # Examples
///
/// ```
/// use filament::{create_signal, flush_effects, Effect};
/// use filament::runtime::ReactiveRuntime;
/// use std::sync::atomic::{AtomicI32, Ordering};
/// use std::sync::Arc;
///
/// ReactiveRuntime::scope(|| {
///     let (count, set_count) = create_signal(0);
///     let seen = Arc::new(AtomicI32::new(-1));
///
///     let _effect = Effect::new({
///         let seen = Arc::clone(&seen);
///         move || seen.store(count.get(), Ordering::SeqCst)
///     });
///
///     // Not run yet; effects wait for the flush.
///     assert_eq!(seen.load(Ordering::SeqCst), -1);
///
///     flush_effects().unwrap();
///     assert_eq!(seen.load(Ordering::SeqCst), 0);
///
///     set_count.set(5);
///     flush_effects().unwrap();
///     assert_eq!(seen.load(Ordering::SeqCst), 5);
/// });
/// ```
pub struct Effect {
    id: usize,
    runtime: Weak<ReactiveRuntime>,
}

impl Effect {
    /// Create a new effect and queue it for its first run.
    pub fn new<F>(body: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let runtime = ReactiveRuntime::current();
        let id = runtime.register_effect(Arc::new(body));
        Self {
            id,
            runtime: Arc::downgrade(&runtime),
        }
    }

    /// Destroy the effect: detach it from every dependency, drop any queued
    /// run and run the last registered cleanup.
    ///
    /// Idempotent: destroying an already-destroyed effect is a no-op. If
    /// called while the body is mid-run, destruction happens right after
    /// the run completes and no further queued run executes.
    pub fn destroy(&self) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.destroy_effect(self.id);
        }
    }

    /// The effect's graph node id.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Create a new effect that re-runs when its tracked dependencies change.
///
/// The returned handle owns the effect; keep it alive for as long as the
/// effect should react.
pub fn create_effect<F>(body: F) -> Effect
where
    F: Fn() + Send + Sync + 'static,
{
    Effect::new(body)
}

/// Register a cleanup for the currently running effect.
///
/// The callback runs before the effect's next run, or when the effect is
/// destroyed, whichever comes first. Calling this again within the same run
/// replaces the previous callback. Outside an effect run this logs a
/// warning and drops the callback.
///
/// # Examples
///
/// ```
/// use filament::{create_effect, create_signal, flush_effects, on_cleanup};
/// use filament::runtime::ReactiveRuntime;
///
/// ReactiveRuntime::scope(|| {
///     let (source, _set_source) = create_signal(0);
///     let _effect = create_effect(move || {
///         let value = source.get();
///         on_cleanup(move || {
///             // Undo whatever this run set up for `value`.
///             let _ = value;
///         });
///     });
///     flush_effects().unwrap();
/// });
/// ```
pub fn on_cleanup<F>(cleanup: F)
where
    F: FnOnce() + Send + 'static,
{
    ReactiveRuntime::current().register_cleanup(Box::new(cleanup));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::flush_effects;
    use crate::signal::create_signal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn effect_waits_for_flush() {
        ReactiveRuntime::scope(|| {
            let runs = Arc::new(AtomicUsize::new(0));
            let _effect = create_effect({
                let runs = Arc::clone(&runs);
                move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            });

            assert_eq!(runs.load(Ordering::SeqCst), 0);
            flush_effects().unwrap();
            assert_eq!(runs.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn destroy_is_idempotent() {
        ReactiveRuntime::scope(|| {
            let (count, set_count) = create_signal(0);
            let runs = Arc::new(AtomicUsize::new(0));
            let effect = create_effect({
                let runs = Arc::clone(&runs);
                move || {
                    let _ = count.get();
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            });
            flush_effects().unwrap();
            assert_eq!(runs.load(Ordering::SeqCst), 1);

            effect.destroy();
            effect.destroy();

            set_count.set(1);
            flush_effects().unwrap();
            assert_eq!(runs.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn destroy_while_queued_skips_the_run() {
        ReactiveRuntime::scope(|| {
            let runtime = ReactiveRuntime::current();
            let runs = Arc::new(AtomicUsize::new(0));
            let effect = create_effect({
                let runs = Arc::clone(&runs);
                move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            });

            // Queued but never flushed; destruction drops the queued run
            // and releases its pending task.
            effect.destroy();
            assert!(!runtime.has_pending_tasks());

            flush_effects().unwrap();
            assert_eq!(runs.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn destroy_from_inside_the_body_is_honored_after_the_run() {
        ReactiveRuntime::scope(|| {
            let (count, set_count) = create_signal(0);
            let runs = Arc::new(AtomicUsize::new(0));
            let slot: Arc<std::sync::Mutex<Option<Effect>>> =
                Arc::new(std::sync::Mutex::new(None));

            let effect = create_effect({
                let runs = Arc::clone(&runs);
                let slot = Arc::clone(&slot);
                let count = count.clone();
                move || {
                    let _ = count.get();
                    runs.fetch_add(1, Ordering::SeqCst);
                    if let Some(effect) = slot.lock().unwrap().take() {
                        effect.destroy();
                    }
                }
            });
            *slot.lock().unwrap() = Some(effect);

            flush_effects().unwrap();
            assert_eq!(runs.load(Ordering::SeqCst), 1);

            // Destroyed mid-run; later writes never reach it.
            set_count.set(1);
            flush_effects().unwrap();
            assert_eq!(runs.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn cleanup_runs_before_rerun_and_on_destroy() {
        ReactiveRuntime::scope(|| {
            let (count, set_count) = create_signal(0);
            let cleanups = Arc::new(AtomicUsize::new(0));
            let effect = create_effect({
                let cleanups = Arc::clone(&cleanups);
                move || {
                    let _ = count.get();
                    let cleanups = Arc::clone(&cleanups);
                    on_cleanup(move || {
                        cleanups.fetch_add(1, Ordering::SeqCst);
                    });
                }
            });

            flush_effects().unwrap();
            assert_eq!(cleanups.load(Ordering::SeqCst), 0);

            set_count.set(1);
            flush_effects().unwrap();
            assert_eq!(cleanups.load(Ordering::SeqCst), 1);

            effect.destroy();
            assert_eq!(cleanups.load(Ordering::SeqCst), 2);
        });
    }
}
