use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::{IndexMap, IndexSet};

/// Node id of the built-in stability producer backing
/// [`has_pending_tasks`](crate::runtime::has_pending_tasks).
pub(crate) const STABILITY_NODE: usize = 0;

/// What a graph node is. Values live in the handle structs
/// ([`Signal`](crate::Signal), [`Memo`](crate::Memo)); the runtime only
/// keeps ids, flags and edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Signal,
    Memo,
    Effect,
}

/// Tri-state invalidation flag for consumer nodes.
///
/// `Check` means "a transitive dependency changed, staleness unknown until
/// sources are pulled and version-compared". States only upgrade during a
/// propagation pass and reset to `Clean` after a run or a successful
/// revalidation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum NodeState {
    Clean,
    Check,
    Dirty,
}

/// Per-node metadata held by the runtime.
pub(crate) struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) state: NodeState,
    /// Clock value of the last observed change of this node.
    pub(crate) version: u64,
    /// Consumers to invalidate when this node changes. Non-owning: these are
    /// plain ids, lifetime belongs to the handle that allocated the node.
    pub(crate) subscribers: IndexSet<usize>,
    /// Producers read during this consumer's last run, with the producer's
    /// version at read time. Replaced wholesale on every run.
    pub(crate) sources: IndexMap<usize, u64>,
    /// Type-erased revalidation hook for memos; `None` for other kinds.
    pub(crate) refresh: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Node {
    fn new(kind: NodeKind, state: NodeState, version: u64) -> Self {
        Self {
            kind,
            state,
            version,
            subscribers: IndexSet::new(),
            sources: IndexMap::new(),
            refresh: None,
        }
    }
}

/// Scheduling record for one effect.
pub(crate) struct EffectRecord {
    pub(crate) body: Arc<dyn Fn() + Send + Sync>,
    /// Finalizer registered via [`on_cleanup`](crate::on_cleanup) during the
    /// last run; consumed before the next run or at destruction.
    pub(crate) cleanup: Option<Box<dyn FnOnce() + Send>>,
    pub(crate) queued: bool,
    pub(crate) running: bool,
    pub(crate) destroyed: bool,
    /// Destruction requested while the body was mid-run; honored right after
    /// the run completes, before any further queued run.
    pub(crate) destroy_requested: bool,
    /// Pending-task handle covering the current queued cycle.
    pub(crate) task: Option<usize>,
}

pub(crate) type EffectErrorHandler = Arc<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;

/// Reactive context for tracking dependencies and scheduling state.
pub(crate) struct ReactiveContext {
    /// Change counter for this runtime. Monotonic; bumped only on writes
    /// that actually change state.
    pub(crate) clock: u64,
    /// Stack of currently-computing consumers. `None` frames are pushed by
    /// [`untracked`] so reads inside attribute to nobody.
    pub(crate) observer_stack: Vec<Option<usize>>,
    pub(crate) nodes: HashMap<usize, Node>,
    pub(crate) effects: HashMap<usize, EffectRecord>,
    /// Queued effect ids; BTreeSet iteration is id order, which is creation
    /// order.
    pub(crate) pending: BTreeSet<usize>,
    /// Outstanding pending-task handles (effects awaiting flush plus any
    /// externally registered asynchronous work).
    pub(crate) pending_tasks: HashSet<usize>,
    pub(crate) error_handler: Option<EffectErrorHandler>,
}

impl ReactiveContext {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        // The stability producer exists for the whole life of the runtime.
        nodes.insert(
            STABILITY_NODE,
            Node::new(NodeKind::Signal, NodeState::Clean, 0),
        );
        Self {
            clock: 0,
            observer_stack: Vec::new(),
            nodes,
            effects: HashMap::new(),
            pending: BTreeSet::new(),
            pending_tasks: HashSet::new(),
            error_handler: None,
        }
    }

    /// Record a change of the stability producer. Caller propagates after
    /// releasing the lock.
    pub(crate) fn touch_stability(&mut self) {
        self.clock += 1;
        let clock = self.clock;
        if let Some(node) = self.nodes.get_mut(&STABILITY_NODE) {
            node.version = clock;
        }
    }

    /// Drop a node and detach it from both sides of the graph.
    pub(crate) fn remove_node_locked(&mut self, id: usize) {
        if let Some(node) = self.nodes.remove(&id) {
            for subscriber in node.subscribers {
                if let Some(consumer) = self.nodes.get_mut(&subscriber) {
                    consumer.sources.swap_remove(&id);
                }
            }
            for (producer, _) in node.sources {
                if let Some(source) = self.nodes.get_mut(&producer) {
                    source.subscribers.swap_remove(&id);
                }
            }
        }
    }
}

/// Hybrid reactive runtime owning the dependency graph, the global clock and
/// the effect scheduler.
///
/// Supports both a global runtime (default) and scoped runtimes for
/// isolation. Signals, memos and effects allocate their graph node from the
/// runtime that is current at creation time.
///
/// # Examples
///
/// Using the default global runtime:
///
/// ```
/// use filament::Signal;
///
/// let signal = Signal::new(42);
/// assert_eq!(signal.get(), 42);
/// ```
///
/// Using scoped runtimes for isolation:
///
/// ```
/// use filament::runtime::ReactiveRuntime;
/// use filament::Signal;
///
/// ReactiveRuntime::scope(|| {
///     let signal = Signal::new(0);
///     assert_eq!(signal.get(), 0);
/// });
/// // Runtime and all its state is dropped here
/// ```
pub struct ReactiveRuntime {
    next_id: AtomicUsize,
    pub(crate) context: Mutex<ReactiveContext>,
}

// Thread-local stack for scoped runtimes
thread_local! {
    static RUNTIME_STACK: RefCell<Vec<Arc<ReactiveRuntime>>> = const { RefCell::new(Vec::new()) };
}

impl ReactiveRuntime {
    /// Create a new isolated runtime.
    ///
    /// This creates a completely independent reactive runtime with its own
    /// dependency graph, clock and effect queue. Useful for testing or
    /// creating isolated contexts.
    pub fn new() -> Arc<Self> {
        Arc::new(ReactiveRuntime {
            next_id: AtomicUsize::new(STABILITY_NODE + 1),
            context: Mutex::new(ReactiveContext::new()),
        })
    }

    /// Run a function with a fresh isolated runtime.
    ///
    /// The runtime and all its state is automatically cleaned up when the
    /// function returns.
    ///
    /// # Examples
    ///
    /// ```
    /// use filament::runtime::ReactiveRuntime;
    /// use filament::Signal;
    ///
    /// ReactiveRuntime::scope(|| {
    ///     let signal = Signal::new(0);
    ///     assert_eq!(signal.get(), 0);
    /// });
    /// // Runtime and all its state is dropped here
    /// ```
    pub fn scope<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let runtime = Self::new();
        Self::with_runtime(runtime, f)
    }

    /// Get or create the global runtime (fallback).
    ///
    /// This is used as the default runtime when no scoped runtime is active.
    pub fn global() -> Arc<Self> {
        use std::sync::OnceLock;
        static RUNTIME: OnceLock<Arc<ReactiveRuntime>> = OnceLock::new();
        Arc::clone(RUNTIME.get_or_init(Self::new))
    }

    /// Get the current reactive runtime (scoped or global fallback).
    ///
    /// Returns the runtime from the top of the thread-local stack, or the
    /// global runtime if no scoped runtime is active.
    pub fn current() -> Arc<Self> {
        RUNTIME_STACK.with(|stack| stack.borrow().last().cloned().unwrap_or_else(Self::global))
    }

    /// Run a function with a specific runtime as the current context.
    ///
    /// This pushes the runtime onto the thread-local stack for the duration
    /// of the function execution.
    ///
    /// # Examples
    ///
    /// ```
    /// use filament::runtime::ReactiveRuntime;
    /// use filament::Signal;
    ///
    /// let runtime = ReactiveRuntime::new();
    /// ReactiveRuntime::with_runtime(runtime, || {
    ///     let signal = Signal::new(42);
    ///     assert_eq!(signal.get(), 42);
    /// });
    /// ```
    pub fn with_runtime<F, R>(runtime: Arc<Self>, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        RUNTIME_STACK.with(|stack| {
            stack.borrow_mut().push(runtime);
        });

        let result = catch_unwind(AssertUnwindSafe(f));

        RUNTIME_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });

        match result {
            Ok(r) => r,
            Err(e) => resume_unwind(e),
        }
    }

    /// Clear all nodes, effects and scheduling state from this runtime.
    ///
    /// Useful for resetting between tests. The clock, the id counter and the
    /// pending queue are all reset.
    pub fn clear(&self) {
        let mut ctx = self.context.lock().unwrap();
        *ctx = ReactiveContext::new();
        self.next_id.store(STABILITY_NODE + 1, Ordering::SeqCst);
    }

    /// Generate the next unique id for a reactive primitive or task handle.
    pub(crate) fn next_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate a producer node for a signal. Its version starts at the
    /// current clock; the first real write bumps it.
    pub(crate) fn register_signal(&self) -> usize {
        let id = self.next_id();
        let mut ctx = self.context.lock().unwrap();
        let version = ctx.clock;
        ctx.nodes
            .insert(id, Node::new(NodeKind::Signal, NodeState::Clean, version));
        id
    }

    /// Allocate a consumer/producer node for a memo. Memos start `Dirty` so
    /// the first read computes.
    pub(crate) fn register_memo(&self, refresh: Arc<dyn Fn() + Send + Sync>) -> usize {
        let id = self.next_id();
        let mut ctx = self.context.lock().unwrap();
        let version = ctx.clock;
        let mut node = Node::new(NodeKind::Memo, NodeState::Dirty, version);
        node.refresh = Some(refresh);
        ctx.nodes.insert(id, node);
        id
    }

    /// Allocate an effect node and queue it for its first run. Effects never
    /// run at creation; the next flush runs them.
    pub(crate) fn register_effect(&self, body: Arc<dyn Fn() + Send + Sync>) -> usize {
        let id = self.next_id();
        {
            let mut ctx = self.context.lock().unwrap();
            let version = ctx.clock;
            ctx.nodes
                .insert(id, Node::new(NodeKind::Effect, NodeState::Dirty, version));
            ctx.effects.insert(
                id,
                EffectRecord {
                    body,
                    cleanup: None,
                    queued: false,
                    running: false,
                    destroyed: false,
                    destroy_requested: false,
                    task: None,
                },
            );
        }
        self.enqueue_effect(id);
        id
    }

    /// Record a read of `producer` by the innermost active consumer.
    ///
    /// The consumer snapshots the producer's current version; revalidation
    /// later compares snapshots against live versions. Reads outside any
    /// consumer are plain reads and record nothing.
    pub(crate) fn track_read(&self, producer: usize) {
        let mut ctx = self.context.lock().unwrap();
        let observer = match ctx.observer_stack.last() {
            Some(Some(observer)) => *observer,
            _ => return,
        };
        if observer == producer {
            return;
        }
        let version = match ctx.nodes.get(&producer) {
            Some(node) => node.version,
            None => return,
        };
        if let Some(node) = ctx.nodes.get_mut(&producer) {
            node.subscribers.insert(observer);
        }
        if let Some(node) = ctx.nodes.get_mut(&observer) {
            node.sources.insert(producer, version);
        }
    }

    /// Record that `id` changed: bump the clock, stamp the node's version
    /// and invalidate its consumers.
    pub(crate) fn notify_changed(&self, id: usize) {
        {
            let mut ctx = self.context.lock().unwrap();
            if let Some(Some(observer)) = ctx.observer_stack.last() {
                if ctx.nodes.get(observer).map(|n| n.kind) == Some(NodeKind::Memo) {
                    tracing::warn!(
                        node = id,
                        observer,
                        "signal written during memo evaluation; staleness of dependents is undefined"
                    );
                }
            }
            ctx.clock += 1;
            let clock = ctx.clock;
            if let Some(node) = ctx.nodes.get_mut(&id) {
                node.version = clock;
            }
        }
        self.propagate(id);
    }

    /// Bump the clock and restamp `id` without invalidating consumers. Used
    /// by memo recomputes, which happen during the pull phase: consumers are
    /// already marked and compare versions themselves.
    pub(crate) fn bump_version(&self, id: usize) {
        let mut ctx = self.context.lock().unwrap();
        ctx.clock += 1;
        let clock = ctx.clock;
        if let Some(node) = ctx.nodes.get_mut(&id) {
            node.version = clock;
        }
    }

    /// Walk the consumer graph from `origin`, marking direct consumers
    /// `Dirty` and transitive consumers `Check`. Breadth-first with a
    /// visited set, so diamond shapes are marked once and never retraversed.
    /// Effects newly leaving `Clean` are queued.
    pub(crate) fn propagate(&self, origin: usize) {
        let mut to_schedule: Vec<usize> = Vec::new();
        {
            let mut ctx = self.context.lock().unwrap();
            let mut visited: HashSet<usize> = HashSet::new();
            let mut frontier: VecDeque<(usize, bool)> = ctx
                .nodes
                .get(&origin)
                .map(|node| node.subscribers.iter().map(|s| (*s, true)).collect())
                .unwrap_or_default();

            while let Some((id, direct)) = frontier.pop_front() {
                if !visited.insert(id) {
                    continue;
                }
                let Some(node) = ctx.nodes.get_mut(&id) else {
                    continue;
                };
                let target = if direct {
                    NodeState::Dirty
                } else {
                    NodeState::Check
                };
                let was = node.state;
                if target > was {
                    node.state = target;
                }
                // A node that already left Clean had its own consumers
                // marked in an earlier pass; don't walk it again.
                if was == NodeState::Clean {
                    match node.kind {
                        NodeKind::Memo => {
                            for subscriber in node.subscribers.iter() {
                                frontier.push_back((*subscriber, false));
                            }
                        }
                        NodeKind::Effect => to_schedule.push(id),
                        NodeKind::Signal => {}
                    }
                }
            }
        }
        for id in to_schedule {
            self.enqueue_effect(id);
        }
    }

    /// Resolve a consumer's `Check` state by lazily pulling each recorded
    /// source (refreshing stale memos on the way) and comparing versions.
    /// Returns the resulting state: `Dirty` if any source moved, `Clean`
    /// otherwise. `Clean` and `Dirty` inputs pass through unchanged.
    pub(crate) fn resolve_check(&self, id: usize) -> NodeState {
        let (state, sources) = {
            let ctx = self.context.lock().unwrap();
            let Some(node) = ctx.nodes.get(&id) else {
                return NodeState::Clean;
            };
            let sources: Vec<(usize, u64)> = node.sources.iter().map(|(k, v)| (*k, *v)).collect();
            (node.state, sources)
        };
        if state != NodeState::Check {
            return state;
        }

        let mut stale = false;
        for (source, seen) in sources {
            self.ensure_fresh(source);
            let current = {
                let ctx = self.context.lock().unwrap();
                ctx.nodes.get(&source).map(|node| node.version)
            };
            if current != Some(seen) {
                stale = true;
                break;
            }
        }

        let mut ctx = self.context.lock().unwrap();
        let Some(node) = ctx.nodes.get_mut(&id) else {
            return NodeState::Clean;
        };
        if stale {
            node.state = NodeState::Dirty;
        } else if node.state == NodeState::Check {
            node.state = NodeState::Clean;
        }
        node.state
    }

    /// Bring a producer up to date before comparing its version. Only memos
    /// carry a refresh hook; signals are always fresh.
    pub(crate) fn ensure_fresh(&self, id: usize) {
        let hook = {
            let ctx = self.context.lock().unwrap();
            match ctx.nodes.get(&id) {
                Some(node) if node.kind == NodeKind::Memo && node.state != NodeState::Clean => {
                    node.refresh.clone()
                }
                _ => None,
            }
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    #[cfg(test)]
    pub(crate) fn node_state(&self, id: usize) -> NodeState {
        let ctx = self.context.lock().unwrap();
        ctx.nodes
            .get(&id)
            .map(|node| node.state)
            .unwrap_or(NodeState::Clean)
    }

    pub(crate) fn set_node_state(&self, id: usize, state: NodeState) {
        let mut ctx = self.context.lock().unwrap();
        if let Some(node) = ctx.nodes.get_mut(&id) {
            node.state = state;
        }
    }

    /// Drop a consumer's recorded sources, on both sides of the graph. A
    /// fresh run re-records exactly what it reads, so edges from untaken
    /// branches disappear here.
    pub(crate) fn clear_sources(&self, id: usize) {
        let mut ctx = self.context.lock().unwrap();
        let sources = match ctx.nodes.get_mut(&id) {
            Some(node) => std::mem::take(&mut node.sources),
            None => return,
        };
        for (producer, _) in sources {
            if let Some(source) = ctx.nodes.get_mut(&producer) {
                source.subscribers.swap_remove(&id);
            }
        }
    }

    /// Detach and drop a node. Called from signal/memo handle drops.
    pub(crate) fn remove_node(&self, id: usize) {
        let mut ctx = self.context.lock().unwrap();
        ctx.remove_node_locked(id);
    }

    /// Run `f` with `observer` as the active consumer, restoring the
    /// previous frame on every exit path including panics.
    pub(crate) fn with_observer<F, R>(&self, observer: usize, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        {
            let mut ctx = self.context.lock().unwrap();
            ctx.observer_stack.push(Some(observer));
        }

        let result = catch_unwind(AssertUnwindSafe(f));

        {
            let mut ctx = self.context.lock().unwrap();
            ctx.observer_stack.pop();
        }

        match result {
            Ok(r) => r,
            Err(e) => resume_unwind(e),
        }
    }

    /// Run `f` without dependency tracking. Reads inside are plain reads,
    /// even when a consumer is currently executing.
    pub fn untracked<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        {
            let mut ctx = self.context.lock().unwrap();
            ctx.observer_stack.push(None);
        }

        let result = catch_unwind(AssertUnwindSafe(f));

        {
            let mut ctx = self.context.lock().unwrap();
            ctx.observer_stack.pop();
        }

        match result {
            Ok(r) => r,
            Err(e) => resume_unwind(e),
        }
    }

    /// Install the process-wide handler for panics escaping effect bodies
    /// and cleanups. The default handler logs via `tracing::error!`.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        let mut ctx = self.context.lock().unwrap();
        ctx.error_handler = Some(Arc::new(handler));
    }

    /// Route a caught effect panic to the installed handler.
    pub(crate) fn report_effect_error(&self, payload: Box<dyn Any + Send>) {
        let handler = {
            let ctx = self.context.lock().unwrap();
            ctx.error_handler.clone()
        };
        match handler {
            Some(handler) => handler(payload),
            None => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "effect panicked".to_string());
                tracing::error!(error = %message, "effect run failed");
            }
        }
    }

    /// Replace the cleanup callback of the innermost running effect.
    pub(crate) fn register_cleanup(&self, cleanup: Box<dyn FnOnce() + Send>) {
        let mut ctx = self.context.lock().unwrap();
        let observer = match ctx.observer_stack.last() {
            Some(Some(observer)) => *observer,
            _ => {
                drop(ctx);
                tracing::warn!("on_cleanup called outside an effect; callback dropped");
                return;
            }
        };
        match ctx.effects.get_mut(&observer) {
            Some(record) => record.cleanup = Some(cleanup),
            None => {
                drop(ctx);
                tracing::warn!(
                    observer,
                    "on_cleanup called outside an effect; callback dropped"
                );
            }
        }
    }
}

/// Read signals without registering dependencies on the current runtime.
///
/// Inside a memo or effect, reads normally subscribe the consumer to the
/// producer. `untracked` opts out for the duration of `f`.
///
/// # Examples
///
/// ```
/// use filament::{create_signal, untracked};
///
/// let (count, _set_count) = create_signal(1);
/// let value = untracked(|| count.get());
/// assert_eq!(value, 1);
/// ```
pub fn untracked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    ReactiveRuntime::current().untracked(f)
}

/// Install the process-wide effect error handler on the current runtime.
///
/// An effect body that panics is caught, reported here, and the effect
/// returns to idle so future dependency changes can retry it.
pub fn set_effect_error_handler<F>(handler: F)
where
    F: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
{
    ReactiveRuntime::current().set_error_handler(handler);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untracked_restores_observer_frame_on_panic() {
        ReactiveRuntime::scope(|| {
            let runtime = ReactiveRuntime::current();
            let result = catch_unwind(AssertUnwindSafe(|| {
                runtime.untracked(|| panic!("boom"));
            }));
            assert!(result.is_err());
            let ctx = runtime.context.lock().unwrap();
            assert!(ctx.observer_stack.is_empty());
        });
    }

    #[test]
    fn propagation_is_diamond_safe() {
        ReactiveRuntime::scope(|| {
            let runtime = ReactiveRuntime::current();
            // a -> b, a -> c, b -> d, c -> d
            let a = runtime.register_signal();
            let b = runtime.register_memo(Arc::new(|| {}));
            let c = runtime.register_memo(Arc::new(|| {}));
            let d = runtime.register_memo(Arc::new(|| {}));
            {
                let mut ctx = runtime.context.lock().unwrap();
                ctx.nodes.get_mut(&a).unwrap().subscribers.extend([b, c]);
                ctx.nodes.get_mut(&b).unwrap().subscribers.insert(d);
                ctx.nodes.get_mut(&c).unwrap().subscribers.insert(d);
                for id in [b, c, d] {
                    ctx.nodes.get_mut(&id).unwrap().state = NodeState::Clean;
                }
            }

            runtime.notify_changed(a);

            assert_eq!(runtime.node_state(b), NodeState::Dirty);
            assert_eq!(runtime.node_state(c), NodeState::Dirty);
            assert_eq!(runtime.node_state(d), NodeState::Check);
        });
    }

    #[test]
    fn tracked_read_records_version_snapshot() {
        ReactiveRuntime::scope(|| {
            let runtime = ReactiveRuntime::current();
            let producer = runtime.register_signal();
            let consumer = runtime.register_memo(Arc::new(|| {}));

            runtime.notify_changed(producer);
            runtime.with_observer(consumer, || {
                runtime.track_read(producer);
            });

            let ctx = runtime.context.lock().unwrap();
            let node = ctx.nodes.get(&consumer).unwrap();
            assert_eq!(node.sources.get(&producer), Some(&1));
        });
    }
}
