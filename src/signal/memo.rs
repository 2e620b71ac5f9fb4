use crate::runtime::{NodeState, ReactiveRuntime};
use std::sync::{Arc, RwLock, Weak};

struct MemoInner<T> {
    compute: Box<dyn Fn() -> T + Send + Sync>,
    cached: RwLock<Option<T>>,
    id: usize,
    runtime: Weak<ReactiveRuntime>,
}

impl<T> Drop for MemoInner<T> {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.remove_node(self.id);
        }
    }
}

/// A memoized computed value that automatically tracks its dependencies.
///
/// Memos are lazy: nothing is computed until the first read, and a read only
/// recomputes when a dependency actually changed. Invalidation is cheap (a
/// write upgrades the memo to dirty or maybe-dirty) and a maybe-dirty memo
/// revalidates by comparing each recorded dependency's version against the
/// snapshot taken at the last read, recursively refreshing stale upstream
/// memos first. A recompute that produces an equal value keeps the old
/// version, so consumers further downstream are not re-run.
///
/// # Examples
///
/// ```
/// use filament::{create_signal, Memo};
///
/// let (count, set_count) = create_signal(5);
/// let doubled = Memo::new({
///     let count = count.clone();
///     move || count.get() * 2
/// });
///
/// assert_eq!(doubled.get(), 10);
/// set_count.set(10);
/// assert_eq!(doubled.get(), 20);
/// ```
pub struct Memo<T> {
    inner: Arc<MemoInner<T>>,
}

impl<T> Clone for Memo<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Memo<T> {
    /// Create a new memo with the given computation function. The memo
    /// starts dirty; the first read computes.
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let runtime = ReactiveRuntime::current();
        let inner = Arc::new_cyclic(|weak: &Weak<MemoInner<T>>| {
            // The arena keeps a type-erased handle to this memo so the
            // runtime can refresh it while revalidating downstream
            // consumers. Weak, so the arena never owns the memo.
            let hook = {
                let weak = weak.clone();
                Arc::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        MemoInner::refresh(&inner);
                    }
                }) as Arc<dyn Fn() + Send + Sync>
            };
            let id = runtime.register_memo(hook);
            MemoInner {
                compute: Box::new(compute),
                cached: RwLock::new(None),
                id,
                runtime: Arc::downgrade(&runtime),
            }
        });
        Self { inner }
    }

    /// Get the current value, revalidating and recomputing if necessary.
    /// Tracked when read inside another memo or an effect.
    pub fn get(&self) -> T {
        MemoInner::refresh(&self.inner);
        if let Some(runtime) = self.inner.runtime.upgrade() {
            runtime.track_read(self.inner.id);
        }
        self.inner.cached.read().unwrap().as_ref().unwrap().clone()
    }

    /// Read the memoized value with a function without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        MemoInner::refresh(&self.inner);
        if let Some(runtime) = self.inner.runtime.upgrade() {
            runtime.track_read(self.inner.id);
        }
        let cached = self.inner.cached.read().unwrap();
        f(cached.as_ref().unwrap())
    }

    /// The memo's graph node id.
    pub fn id(&self) -> usize {
        self.inner.id
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> MemoInner<T> {
    /// Bring the cache up to date: resolve maybe-dirty by pulling sources,
    /// then recompute if dirty. Recompute replaces the source set with
    /// whatever this run reads and bumps the version only when the value
    /// changed.
    fn refresh(inner: &Arc<MemoInner<T>>) {
        let Some(runtime) = inner.runtime.upgrade() else {
            // Runtime is gone; keep reads usable as a plain lazy cell.
            let missing = inner.cached.read().unwrap().is_none();
            if missing {
                let value = (inner.compute)();
                *inner.cached.write().unwrap() = Some(value);
            }
            return;
        };

        let state = runtime.resolve_check(inner.id);
        let missing = inner.cached.read().unwrap().is_none();
        if state != NodeState::Dirty && !missing {
            return;
        }

        runtime.clear_sources(inner.id);
        let value = runtime.with_observer(inner.id, || (inner.compute)());
        let changed = {
            let mut cached = inner.cached.write().unwrap();
            let changed = match cached.as_ref() {
                Some(old) => *old != value,
                None => true,
            };
            if changed {
                *cached = Some(value);
            }
            changed
        };
        if changed {
            runtime.bump_version(inner.id);
        }
        runtime.set_node_state(inner.id, NodeState::Clean);
    }
}

/// Create a new memoized computation.
///
/// # Examples
///
/// ```
/// use filament::{create_memo, create_signal};
///
/// let (count, set_count) = create_signal(5);
/// let doubled = create_memo(move || count.get() * 2);
/// assert_eq!(doubled.get(), 10);
/// set_count.set(7);
/// assert_eq!(doubled.get(), 14);
/// ```
pub fn create_memo<T, F>(compute: F) -> Memo<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: Fn() -> T + Send + Sync + 'static,
{
    Memo::new(compute)
}
