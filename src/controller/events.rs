/// Lifecycle events and the subscriber registry
///
/// Callbacks run synchronously on the reporting thread, outside the registry
/// lock, so a handler may subscribe, unsubscribe or report another error. A
/// panicking handler is contained and counted. Async observers can `watch()`
/// a broadcast channel carrying the same events.
use super::RollbackResult;
use crate::checkpoint::{CheckpointSummary, RollbackTarget};
use crate::classification::{Classification, FingerprintId};
use crate::recovery::RecoveryOutcome;
use crate::sinks::EmergencySignal;
use crate::taxonomy::{Category, Strategy};
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Event names accepted by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleKind {
    Classified,
    StrategySelected,
    RecoverySuccess,
    RecoveryFailed,
    CheckpointCreated,
    RollbackStarted,
    RollbackComplete,
    Emergency,
}

impl LifecycleKind {
    pub const ALL: [LifecycleKind; 8] = [
        LifecycleKind::Classified,
        LifecycleKind::StrategySelected,
        LifecycleKind::RecoverySuccess,
        LifecycleKind::RecoveryFailed,
        LifecycleKind::CheckpointCreated,
        LifecycleKind::RollbackStarted,
        LifecycleKind::RollbackComplete,
        LifecycleKind::Emergency,
    ];
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleKind::Classified => "CLASSIFIED",
            LifecycleKind::StrategySelected => "STRATEGY_SELECTED",
            LifecycleKind::RecoverySuccess => "RECOVERY_SUCCESS",
            LifecycleKind::RecoveryFailed => "RECOVERY_FAILED",
            LifecycleKind::CheckpointCreated => "CHECKPOINT_CREATED",
            LifecycleKind::RollbackStarted => "ROLLBACK_STARTED",
            LifecycleKind::RollbackComplete => "ROLLBACK_COMPLETE",
            LifecycleKind::Emergency => "EMERGENCY",
        };
        f.write_str(name)
    }
}

/// Something that happened inside the controller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleEvent {
    Classified(Classification),
    StrategySelected {
        fingerprint: FingerprintId,
        category: Category,
        strategy: Strategy,
        short_circuited: bool,
    },
    RecoverySuccess(RecoveryOutcome),
    RecoveryFailed(RecoveryOutcome),
    CheckpointCreated(CheckpointSummary),
    RollbackStarted {
        target: RollbackTarget,
        reason: String,
    },
    RollbackComplete(RollbackResult),
    Emergency(EmergencySignal),
}

impl LifecycleEvent {
    pub fn kind(&self) -> LifecycleKind {
        match self {
            LifecycleEvent::Classified(_) => LifecycleKind::Classified,
            LifecycleEvent::StrategySelected { .. } => LifecycleKind::StrategySelected,
            LifecycleEvent::RecoverySuccess(_) => LifecycleKind::RecoverySuccess,
            LifecycleEvent::RecoveryFailed(_) => LifecycleKind::RecoveryFailed,
            LifecycleEvent::CheckpointCreated(_) => LifecycleKind::CheckpointCreated,
            LifecycleEvent::RollbackStarted { .. } => LifecycleKind::RollbackStarted,
            LifecycleEvent::RollbackComplete(_) => LifecycleKind::RollbackComplete,
            LifecycleEvent::Emergency(_) => LifecycleKind::Emergency,
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    /// `None` receives every kind
    kind: Option<LifecycleKind>,
    handler: Handler,
}

/// Registry of lifecycle subscribers
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<LifecycleEvent>,
    handler_panics: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sender,
            handler_panics: AtomicU64::new(0),
        }
    }

    fn register(&self, kind: Option<LifecycleKind>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription { id, kind, handler });
        id
    }

    /// Call `handler` for every event of `kind`
    pub fn subscribe<F>(&self, kind: LifecycleKind, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Call `handler` for every event
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    /// Returns whether the subscription existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Receive events asynchronously; slow receivers lose the oldest events
    pub fn watch(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn handler_panics(&self) -> u64 {
        self.handler_panics.load(Ordering::Relaxed)
    }

    pub fn emit(&self, event: LifecycleEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind.map_or(true, |k| k == kind))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                self.handler_panics.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event = %kind, "Lifecycle subscriber panicked");
            }
        }

        // No receivers is fine
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn started() -> LifecycleEvent {
        LifecycleEvent::RollbackStarted {
            target: RollbackTarget::Latest,
            reason: "test".to_string(),
        }
    }

    #[test]
    fn test_subscribers_receive_matching_kinds_only() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        bus.subscribe(LifecycleKind::RollbackStarted, move |e| sink.lock().unwrap().push(e.kind()));
        let sink = Arc::clone(&seen);
        bus.subscribe(LifecycleKind::Emergency, move |e| sink.lock().unwrap().push(e.kind()));

        bus.emit(started());
        assert_eq!(*seen.lock().unwrap(), vec![LifecycleKind::RollbackStarted]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let id = bus.subscribe_all(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(started());
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(started());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let bus = EventBus::default();
        let reached = Arc::new(AtomicU64::new(0));
        bus.subscribe_all(|_| panic!("subscriber bug"));
        let r = Arc::clone(&reached);
        bus.subscribe_all(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(started());
        assert_eq!(bus.handler_panics(), 1);
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_unsubscribe_itself() {
        let bus = Arc::new(EventBus::default());
        let slot = Arc::new(Mutex::new(None::<SubscriptionId>));

        let (b, s) = (Arc::clone(&bus), Arc::clone(&slot));
        let id = bus.subscribe_all(move |_| {
            if let Some(id) = s.lock().unwrap().take() {
                b.unsubscribe(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        bus.emit(started());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.watch();
        bus.emit(started());
        assert_eq!(rx.recv().await.unwrap().kind(), LifecycleKind::RollbackStarted);
    }
}
