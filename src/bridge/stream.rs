use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use pin_project::{pin_project, pinned_drop};

use crate::runtime::{PendingTaskHandle, ReactiveRuntime};

/// Stream adapter that counts "subscribed, first event not yet delivered"
/// as a pending task.
///
/// Created by [`pending_until_first`]. The task registers at wrap time and
/// releases on the first `Poll::Ready` (an item, an error item, or end of
/// stream) or when the adapter is dropped before anything arrived. Later
/// items do nothing: only the time to first event blocks stability, not the
/// rest of the subscription.
#[pin_project(PinnedDrop)]
pub struct PendingUntilFirst<S> {
    #[pin]
    stream: S,
    pending: Option<(Weak<ReactiveRuntime>, PendingTaskHandle)>,
}

/// Bridge an asynchronous event stream into the pending-task registry.
///
/// Each call gets its own handle, so independent subscriptions to the same
/// underlying source keep independent bookkeeping.
///
/// # Examples
///
/// ```
/// use filament::runtime::{has_pending_tasks, ReactiveRuntime};
/// use filament::pending_until_first;
/// use futures_util::stream;
///
/// ReactiveRuntime::scope(|| {
///     let events = pending_until_first(stream::iter([1, 2, 3]));
///     assert!(has_pending_tasks());
///
///     // Dropping before the first item also settles the task.
///     drop(events);
///     assert!(!has_pending_tasks());
/// });
/// ```
pub fn pending_until_first<S: Stream>(stream: S) -> PendingUntilFirst<S> {
    let runtime = ReactiveRuntime::current();
    let handle = runtime.register_pending_task();
    PendingUntilFirst {
        stream,
        pending: Some((Arc::downgrade(&runtime), handle)),
    }
}

fn settle(pending: &mut Option<(Weak<ReactiveRuntime>, PendingTaskHandle)>) {
    if let Some((runtime, handle)) = pending.take() {
        if let Some(runtime) = runtime.upgrade() {
            runtime.unregister_pending_task(handle);
        }
    }
}

impl<S: Stream> Stream for PendingUntilFirst<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let poll = this.stream.poll_next(cx);
        if poll.is_ready() {
            settle(this.pending);
        }
        poll
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.stream.size_hint()
    }
}

#[pinned_drop]
impl<S> PinnedDrop for PendingUntilFirst<S> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        settle(this.pending);
    }
}
