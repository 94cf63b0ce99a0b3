//! Event bus for session lifecycle and upstream events
//!
//! Dispatch is asynchronous through a bounded queue serviced by a fixed set
//! of worker tasks. Producers block when the queue is full - backpressure
//! propagates into the transport event pump and is preferred to event loss.
//!
//! Events are sharded onto workers by `(user, kind)`, and each worker drains
//! its own queue in order, so delivery order is preserved per session and
//! event kind. No cross-session ordering is guaranteed.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::SessionState;

/// Soft per-call deadline before an observer is logged as slow
const SLOW_OBSERVER_WARN: Duration = Duration::from_secs(1);

/// Kinds of event the bus carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Status,
    Qr,
    Error,
    Raw,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Status => "status",
            Self::Qr => "qr",
            Self::Error => "error",
            Self::Raw => "raw",
        };
        f.write_str(s)
    }
}

/// A session lifecycle or upstream event, tagged with its user
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Status { user: String, state: SessionState },
    Qr { user: String, code: String },
    Error { user: String, detail: String },
    Raw { user: String, payload: serde_json::Value },
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Status { .. } => EventKind::Status,
            Self::Qr { .. } => EventKind::Qr,
            Self::Error { .. } => EventKind::Error,
            Self::Raw { .. } => EventKind::Raw,
        }
    }

    pub fn user(&self) -> &str {
        match self {
            Self::Status { user, .. }
            | Self::Qr { user, .. }
            | Self::Error { user, .. }
            | Self::Raw { user, .. } => user,
        }
    }
}

/// Receives dispatched events. Implementations must not block indefinitely;
/// calls past the soft deadline are logged.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

/// Function adapter for [`Observer`]
pub struct FnObserver<F>(pub F);

impl<F> Observer for FnObserver<F>
where
    F: Fn(&SessionEvent) + Send + Sync,
{
    fn on_event(&self, event: &SessionEvent) {
        (self.0)(event)
    }
}

/// Decorator delivering only events of one kind to the inner observer
pub struct ByKind {
    kind: EventKind,
    inner: Arc<dyn Observer>,
}

impl ByKind {
    pub fn new(kind: EventKind, inner: Arc<dyn Observer>) -> Self {
        Self { kind, inner }
    }
}

impl Observer for ByKind {
    fn on_event(&self, event: &SessionEvent) {
        if event.kind() == self.kind {
            self.inner.on_event(event);
        }
    }
}

/// Decorator delivering only one user's events to the inner observer
pub struct ByUser {
    user: String,
    inner: Arc<dyn Observer>,
}

impl ByUser {
    pub fn new(user: &str, inner: Arc<dyn Observer>) -> Self {
        Self {
            user: user.to_string(),
            inner,
        }
    }
}

impl Observer for ByUser {
    fn on_event(&self, event: &SessionEvent) {
        if event.user() == self.user {
            self.inner.on_event(event);
        }
    }
}

type ObserverList = Arc<RwLock<Vec<(usize, Arc<dyn Observer>)>>>;

/// Bounded asynchronous publish/subscribe bus
pub struct EventBus {
    shards: Vec<mpsc::Sender<SessionEvent>>,
    observers: ObserverList,
    next_id: AtomicUsize,
    depth: Arc<AtomicUsize>,
    closed: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EventBus {
    /// Create a bus with `capacity` total queue slots spread over
    /// `workers` dispatch tasks.
    pub fn new(capacity: usize, workers: usize) -> Self {
        let workers = workers.max(1);
        let per_shard = (capacity / workers).max(1);
        let observers: ObserverList = Arc::new(RwLock::new(Vec::new()));
        let depth = Arc::new(AtomicUsize::new(0));

        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let (tx, rx) = mpsc::channel::<SessionEvent>(per_shard);
            shards.push(tx);
            handles.push(tokio::spawn(worker_loop(
                i,
                rx,
                Arc::clone(&observers),
                Arc::clone(&depth),
            )));
        }

        info!(
            "Event bus started with {} workers, {} slots per queue",
            workers, per_shard
        );

        Self {
            shards,
            observers,
            next_id: AtomicUsize::new(1),
            depth,
            closed: AtomicBool::new(false),
            workers: Mutex::new(handles),
        }
    }

    /// Register an observer. Wrap it in [`ByKind`] / [`ByUser`] to filter.
    /// Returns a token for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> usize {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .write()
            .expect("observer lock poisoned")
            .push((id, observer));
        debug!("Registered observer {}", id);
        id
    }

    pub fn unsubscribe(&self, id: usize) {
        self.observers
            .write()
            .expect("observer lock poisoned")
            .retain(|(oid, _)| *oid != id);
        debug!("Unregistered observer {}", id);
    }

    /// Enqueue an event for dispatch, blocking while the target queue is
    /// full. Events published after shutdown are dropped.
    pub async fn publish(&self, event: SessionEvent) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("Event bus closed, dropping {} event", event.kind());
            return;
        }

        let shard = self.shard_for(event.user(), event.kind());
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.shards[shard].send(event).await.is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Events enqueued but not yet dispatched
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Stop accepting events and wait for the queues to drain, up to
    /// `deadline`. Returns whether the drain completed.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        self.closed.store(true, Ordering::SeqCst);
        let start = Instant::now();
        while self.queue_depth() > 0 {
            if start.elapsed() >= deadline {
                warn!(
                    "Event bus drain deadline expired with {} events queued",
                    self.queue_depth()
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    fn shard_for(&self, user: &str, kind: EventKind) -> usize {
        let mut hasher = DefaultHasher::new();
        user.hash(&mut hasher);
        kind.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        for handle in self.workers.lock().expect("worker lock poisoned").drain(..) {
            handle.abort();
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<SessionEvent>,
    observers: ObserverList,
    depth: Arc<AtomicUsize>,
) {
    while let Some(event) = rx.recv().await {
        let snapshot: Vec<Arc<dyn Observer>> = observers
            .read()
            .expect("observer lock poisoned")
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();

        for observer in snapshot {
            let started = Instant::now();
            observer.on_event(&event);
            let elapsed = started.elapsed();
            if elapsed > SLOW_OBSERVER_WARN {
                warn!(
                    "Slow observer on worker {}: {:?} handling {} event for {}",
                    worker_id,
                    elapsed,
                    event.kind(),
                    event.user()
                );
            }
        }

        depth.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("Event bus worker {} stopped", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        seen: StdMutex<Vec<SessionEvent>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: StdMutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<SessionEvent> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Observer for Recorder {
        fn on_event(&self, event: &SessionEvent) {
            self.seen.lock().unwrap().push(event.clone());
        }
    }

    async fn drain(bus: &EventBus) {
        while bus.queue_depth() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // One more tick so the last dispatch finishes its observer calls
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn status(user: &str, state: SessionState) -> SessionEvent {
        SessionEvent::Status {
            user: user.to_string(),
            state,
        }
    }

    #[tokio::test]
    async fn test_dispatch_reaches_observer() {
        let bus = EventBus::new(16, 2);
        let recorder = Recorder::new();
        bus.subscribe(recorder.clone());

        bus.publish(status("alice", SessionState::Connecting)).await;
        drain(&bus).await;

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user(), "alice");
    }

    #[tokio::test]
    async fn test_per_session_kind_order_preserved() {
        let bus = EventBus::new(64, 4);
        let recorder = Recorder::new();
        bus.subscribe(recorder.clone());

        let states = [
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::LoggedIn,
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::Connected,
        ];
        for state in states {
            bus.publish(status("alice", state)).await;
        }
        drain(&bus).await;

        let seen: Vec<SessionState> = recorder
            .events()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Status { state, .. } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(seen, states);
    }

    #[tokio::test]
    async fn test_kind_filter() {
        let bus = EventBus::new(16, 2);
        let recorder = Recorder::new();
        bus.subscribe(Arc::new(ByKind::new(EventKind::Qr, recorder.clone())));

        bus.publish(status("alice", SessionState::Connecting)).await;
        bus.publish(SessionEvent::Qr {
            user: "alice".into(),
            code: "code-1".into(),
        })
        .await;
        drain(&bus).await;

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Qr);
    }

    #[tokio::test]
    async fn test_user_filter_composes_with_kind() {
        let bus = EventBus::new(16, 2);
        let recorder = Recorder::new();
        bus.subscribe(Arc::new(ByUser::new(
            "bob",
            Arc::new(ByKind::new(EventKind::Status, recorder.clone())),
        )));

        bus.publish(status("alice", SessionState::Connected)).await;
        bus.publish(status("bob", SessionState::Connected)).await;
        bus.publish(SessionEvent::Qr {
            user: "bob".into(),
            code: "code-1".into(),
        })
        .await;
        drain(&bus).await;

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user(), "bob");
        assert_eq!(events[0].kind(), EventKind::Status);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new(16, 2);
        let recorder = Recorder::new();
        let id = bus.subscribe(recorder.clone());

        bus.publish(status("alice", SessionState::Connecting)).await;
        drain(&bus).await;
        bus.unsubscribe(id);

        bus.publish(status("alice", SessionState::Connected)).await;
        drain(&bus).await;

        assert_eq!(recorder.events().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let bus = EventBus::new(16, 2);
        let recorder = Recorder::new();
        bus.subscribe(recorder.clone());

        for _ in 0..8 {
            bus.publish(status("alice", SessionState::Connecting)).await;
        }
        assert!(bus.shutdown(Duration::from_secs(2)).await);

        // Publishing after shutdown is a no-op
        bus.publish(status("alice", SessionState::Connected)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(recorder.events().len(), 8);
    }
}
