use crate::runtime::ReactiveRuntime;
use std::sync::{Arc, RwLock, Weak};

type Comparator<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

struct SignalInner<T> {
    value: RwLock<T>,
    /// Returns true when two values are equal, i.e. a write can be skipped.
    equals: Comparator<T>,
    id: usize,
    runtime: Weak<ReactiveRuntime>,
}

impl<T> Drop for SignalInner<T> {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.remove_node(self.id);
        }
    }
}

/// A reactive signal: a mutable value cell that invalidates its consumers
/// when written.
///
/// Reads inside a memo or effect register a dependency; writes bump the
/// runtime clock and mark dependents stale. Writing an equal value is a
/// no-op by default (see [`Signal::with_equality`] for custom policies).
///
/// # Examples
///
/// ```
/// use filament::Signal;
///
/// let count = Signal::new(1);
/// assert_eq!(count.get(), 1);
/// count.set(2);
/// assert_eq!(count.get(), 2);
/// ```
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Signal<T> {
    /// Create a new signal with the given initial value. Writes compare via
    /// `PartialEq` and only notify when the value actually changed.
    pub fn new(initial: T) -> Self {
        Self::with_equality(initial, |a, b| a == b)
    }
}

impl<T: Clone + Send + Sync + 'static> Signal<T> {
    /// Create a signal with a custom equality comparator.
    ///
    /// The comparator decides whether a write is a real change; `|_, _|
    /// false` is the always-notify escape hatch.
    ///
    /// # Examples
    ///
    /// ```
    /// use filament::Signal;
    ///
    /// // Notify on every write, even when the value is unchanged.
    /// let ticks = Signal::with_equality(0u64, |_, _| false);
    /// ticks.set(0);
    /// ```
    pub fn with_equality<F>(initial: T, equals: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let runtime = ReactiveRuntime::current();
        let id = runtime.register_signal();

        Self {
            inner: Arc::new(SignalInner {
                value: RwLock::new(initial),
                equals: Arc::new(equals),
                id,
                runtime: Arc::downgrade(&runtime),
            }),
        }
    }

    /// Get the current value of the signal. Tracked when read inside a memo
    /// or effect; a plain read otherwise.
    pub fn get(&self) -> T {
        if let Some(runtime) = self.inner.runtime.upgrade() {
            runtime.track_read(self.inner.id);
        }
        self.inner.value.read().unwrap().clone()
    }

    /// Set a new value. Consumers are invalidated only when the comparator
    /// says the value changed.
    pub fn set(&self, new_value: T) {
        let changed = {
            let mut value = self.inner.value.write().unwrap();
            let changed = !(self.inner.equals)(&*value, &new_value);
            if changed {
                *value = new_value;
            }
            changed
        };
        if changed {
            if let Some(runtime) = self.inner.runtime.upgrade() {
                runtime.notify_changed(self.inner.id);
            }
        }
    }

    /// Update the value in place using a function. Same change detection as
    /// [`set`](Signal::set).
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let changed = {
            let mut value = self.inner.value.write().unwrap();
            let before = value.clone();
            f(&mut *value);
            !(self.inner.equals)(&before, &*value)
        };
        if changed {
            if let Some(runtime) = self.inner.runtime.upgrade() {
                runtime.notify_changed(self.inner.id);
            }
        }
    }

    /// Read the value with a function without cloning. Tracked like
    /// [`get`](Signal::get).
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        if let Some(runtime) = self.inner.runtime.upgrade() {
            runtime.track_read(self.inner.id);
        }
        let value = self.inner.value.read().unwrap();
        f(&*value)
    }

    /// The signal's graph node id.
    pub fn id(&self) -> usize {
        self.inner.id
    }
}

/// The read half of a signal created with [`create_signal`].
pub struct ReadSignal<T> {
    signal: Signal<T>,
}

impl<T> Clone for ReadSignal<T> {
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ReadSignal<T> {
    /// Get the current value. Tracked inside memos and effects.
    pub fn get(&self) -> T {
        self.signal.get()
    }

    /// Read the value with a function without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.signal.with(f)
    }

    /// The signal's graph node id.
    pub fn id(&self) -> usize {
        self.signal.id()
    }
}

/// The write half of a signal created with [`create_signal`].
pub struct WriteSignal<T> {
    signal: Signal<T>,
}

impl<T> Clone for WriteSignal<T> {
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> WriteSignal<T> {
    /// Set a new value, invalidating consumers if it changed.
    pub fn set(&self, new_value: T) {
        self.signal.set(new_value);
    }

    /// Update the value in place using a function.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.signal.update(f);
    }
}

/// Create a signal split into read and write halves.
///
/// # Examples
///
/// ```
/// use filament::create_signal;
///
/// let (count, set_count) = create_signal(0);
/// assert_eq!(count.get(), 0);
/// set_count.set(42);
/// assert_eq!(count.get(), 42);
/// set_count.update(|n| *n += 10);
/// assert_eq!(count.get(), 52);
/// ```
pub fn create_signal<T>(initial: T) -> (ReadSignal<T>, WriteSignal<T>)
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let signal = Signal::new(initial);
    (
        ReadSignal {
            signal: signal.clone(),
        },
        WriteSignal { signal },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_same_value_does_not_bump_clock() {
        ReactiveRuntime::scope(|| {
            let runtime = ReactiveRuntime::current();
            let signal = Signal::new(42);
            signal.set(42);
            assert_eq!(runtime.context.lock().unwrap().clock, 0);
            signal.set(43);
            assert_eq!(runtime.context.lock().unwrap().clock, 1);
        });
    }

    #[test]
    fn always_notify_escape_bumps_on_equal_write() {
        ReactiveRuntime::scope(|| {
            let runtime = ReactiveRuntime::current();
            let signal = Signal::with_equality(7, |_, _| false);
            signal.set(7);
            assert_eq!(runtime.context.lock().unwrap().clock, 1);
        });
    }

    #[test]
    fn dropped_signal_leaves_the_graph() {
        ReactiveRuntime::scope(|| {
            let runtime = ReactiveRuntime::current();
            let id = {
                let signal = Signal::new(1);
                signal.id()
            };
            assert!(!runtime.context.lock().unwrap().nodes.contains_key(&id));
        });
    }
}
