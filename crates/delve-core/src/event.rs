use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{Event, EventKind};

/// Handle returned by a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    /// `None` subscribes to every event kind.
    kind: Option<EventKind>,
    listener: Listener,
}

/// Per-run publish/subscribe channel.
///
/// `emit` is synchronous: every listener has seen the event before `emit`
/// returns, so consumers observe the exact order in which the engine
/// produced events. Nothing is buffered or replayed once the channel is
/// closed.
pub struct EventChannel {
    subs: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl EventChannel {
    pub fn new() -> Self {
        Self {
            subs: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribe to one event kind.
    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe(Some(kind), Arc::new(listener))
    }

    /// Subscribe to every event kind.
    pub fn on_all(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> SubscriptionId {
        self.subscribe(None, Arc::new(listener))
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Forward every event into an unbounded receiver.
    ///
    /// The receiver ends once the subscription is removed or the channel
    /// is closed and dropped.
    pub fn stream(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.on_all(move |event| {
            // Receiver gone means the consumer hung up; nothing to do.
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Emit an event to all matching listeners, in subscription order.
    pub fn emit(
        &self,
        kind: EventKind,
        node_id: Option<&str>,
        payload: serde_json::Value,
    ) -> Option<Event> {
        if self.closed.load(Ordering::Acquire) {
            debug!(kind = %kind, "Event emitted on closed channel, dropped");
            return None;
        }

        let event = Event {
            kind,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            node_id: node_id.map(str::to_string),
            payload,
            timestamp: Utc::now(),
        };

        // Snapshot listeners so a listener may unsubscribe without deadlocking.
        let listeners: Vec<Listener> = {
            let subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
            subs.iter()
                .filter(|s| s.kind.map_or(true, |k| k == kind))
                .map(|s| s.listener.clone())
                .collect()
        };

        for listener in listeners {
            listener(&event);
        }
        Some(event)
    }

    /// Release every listener and refuse further events.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.subs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn listener_count(&self) -> usize {
        self.subs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn subscribe(&self, kind: Option<EventKind>, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscription { id, kind, listener });
        id
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}
