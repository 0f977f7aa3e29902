#![forbid(unsafe_code)]

//! In-memory trace of captured calls with live subscriptions.
//!
//! The log grows until [`TraceBus::clear`] is called; nothing bounds it.

use std::sync::{Arc, Weak};

use ormscope_domain::{CallId, CapturedCall};
use parking_lot::Mutex;

pub trait TraceSink: Send + Sync {
    fn append(&self, call: CapturedCall);
}

/// Receives each call as it is appended.
///
/// Listeners run synchronously on the thread that issued the call, while the
/// issuing runtime instance is still locked. A listener may read or subscribe
/// to the bus, but must not run statements, queries or configuration changes
/// against the same playground: that would wait on the held instance lock
/// forever. Hand such work to another thread instead.
pub trait TraceListener: Send + Sync {
    fn on_call(&self, call: &CapturedCall);
}

impl<F> TraceListener for F
where
    F: Fn(&CapturedCall) + Send + Sync,
{
    fn on_call(&self, call: &CapturedCall) {
        self(call);
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SubscriptionId(u64);

struct ListenerEntry {
    id: SubscriptionId,
    listener: Weak<dyn TraceListener>,
}

#[derive(Default)]
pub struct TraceBus {
    events: Mutex<Vec<CapturedCall>>,
    listeners: Mutex<Vec<ListenerEntry>>,
    next_subscription: Mutex<u64>,
}

impl std::fmt::Debug for TraceBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceBus")
            .field("events", &self.events.lock().len())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl TraceBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every captured call, in insertion order.
    #[must_use]
    pub fn list(&self) -> Vec<CapturedCall> {
        self.events.lock().clone()
    }

    /// Calls whose id is at least `first`, in insertion order.
    #[must_use]
    pub fn since(&self, first: CallId) -> Vec<CapturedCall> {
        self.events
            .lock()
            .iter()
            .filter(|call| call.id >= first)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Drop every stored call. Listeners are not told about the drop.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Register a listener. The bus only keeps a weak reference, so the
    /// listener stops receiving calls once the caller drops its `Arc`.
    pub fn subscribe(&self, listener: &Arc<dyn TraceListener>) -> SubscriptionId {
        let id = {
            let mut next = self.next_subscription.lock();
            *next += 1;
            SubscriptionId(*next)
        };
        self.listeners.lock().push(ListenerEntry {
            id,
            listener: Arc::downgrade(listener),
        });
        id
    }

    /// Returns `false` when the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|entry| entry.listener.strong_count() > 0)
            .count()
    }

    fn live_listeners(&self) -> Vec<Arc<dyn TraceListener>> {
        let mut listeners = self.listeners.lock();
        listeners.retain(|entry| entry.listener.strong_count() > 0);
        listeners
            .iter()
            .filter_map(|entry| entry.listener.upgrade())
            .collect()
    }
}

impl TraceSink for TraceBus {
    fn append(&self, call: CapturedCall) {
        self.events.lock().push(call.clone());
        // Notify over a snapshot; listeners may subscribe or unsubscribe
        // from inside the callback.
        for listener in self.live_listeners() {
            listener.on_call(&call);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use ormscope_domain::{now_utc, CallId, CapturedCall, InstanceId, StatementKind};
    use parking_lot::Mutex;

    use super::{SubscriptionId, TraceBus, TraceListener, TraceSink};

    fn fixture_call(id: u64) -> CapturedCall {
        CapturedCall {
            id: CallId(id),
            instance_id: InstanceId::new(),
            statement: format!("SELECT {id}"),
            parameters: vec![serde_json::json!(id)],
            many: false,
            execution_time_micros: 3,
            kind: StatementKind::Dml,
            source_line: None,
            source_context: None,
            tag: None,
            succeeded: true,
            error: None,
            timestamp: now_utc(),
        }
    }

    #[test]
    fn list_preserves_insertion_order() {
        let bus = TraceBus::new();
        bus.append(fixture_call(2));
        bus.append(fixture_call(1));
        bus.append(fixture_call(3));
        let ids: Vec<u64> = bus.list().iter().map(|call| call.id.0).collect();
        assert_eq!(ids, vec![2, 1, 3]);
        assert_eq!(bus.since(CallId(3)).len(), 1);
    }

    #[test]
    fn listeners_are_notified_before_append_returns() {
        let bus = TraceBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Arc<dyn TraceListener> =
            Arc::new(move |call: &CapturedCall| sink.lock().push(call.id.0));
        bus.subscribe(&listener);

        bus.append(fixture_call(7));
        assert_eq!(*seen.lock(), vec![7]);
    }

    #[test]
    fn clear_empties_the_log_and_late_subscribers_see_nothing_old() {
        let bus = TraceBus::new();
        bus.append(fixture_call(1));
        bus.clear();
        assert!(bus.list().is_empty());

        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let listener: Arc<dyn TraceListener> = Arc::new(move |_: &CapturedCall| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.subscribe(&listener);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        bus.append(fixture_call(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_unsubscribe_itself_during_notification() {
        let bus = Arc::new(TraceBus::new());
        let own_id: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let bus_ref = Arc::clone(&bus);
        let id_ref = Arc::clone(&own_id);
        let calls_ref = Arc::clone(&calls);
        let listener: Arc<dyn TraceListener> = Arc::new(move |_: &CapturedCall| {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *id_ref.lock() {
                bus_ref.unsubscribe(id);
            }
        });
        let id = bus.subscribe(&listener);
        *own_id.lock() = Some(id);

        bus.append(fixture_call(1));
        bus.append(fixture_call(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.len(), 2);
        assert!(!bus.unsubscribe(id));
    }

    #[test]
    fn dropped_listeners_stop_receiving_calls() {
        let bus = TraceBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let listener: Arc<dyn TraceListener> = Arc::new(move |_: &CapturedCall| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.subscribe(&listener);
        assert_eq!(bus.subscriber_count(), 1);

        drop(listener);
        bus.append(fixture_call(1));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
