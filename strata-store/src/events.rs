//! # Event Dispatcher
//!
//! Per-operation change events. Every facade operation acquires an
//! [`EventSink`] before touching the map, records ordered events inside
//! the remap, and releases the sink exactly once: `release` publishes the
//! whole batch, `release_after_failure` discards it. A logical mutation
//! therefore publishes its event group exactly once on success and never
//! on failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use strata_common::StoreError;

/// A single change observed by one store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent<K, V> {
    Created { key: K, value: V },
    Updated { key: K, old: V, new: V },
    Removed { key: K, old: V },
    Expired { key: K, old: V },
    Evicted { key: K, old: V },
}

impl<K, V> StoreEvent<K, V> {
    /// Key the event is about.
    pub fn key(&self) -> &K {
        match self {
            StoreEvent::Created { key, .. }
            | StoreEvent::Updated { key, .. }
            | StoreEvent::Removed { key, .. }
            | StoreEvent::Expired { key, .. }
            | StoreEvent::Evicted { key, .. } => key,
        }
    }
}

/// Ordered event buffer scoped to a single store operation.
#[derive(Debug)]
pub struct EventSink<K, V> {
    events: Vec<StoreEvent<K, V>>,
}

impl<K, V> EventSink<K, V> {
    pub fn new() -> Self {
        EventSink { events: Vec::new() }
    }

    pub(crate) fn record(&mut self, event: StoreEvent<K, V>) {
        self.events.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[StoreEvent<K, V>] {
        &self.events
    }

    pub fn into_events(self) -> Vec<StoreEvent<K, V>> {
        self.events
    }
}

impl<K, V> Default for EventSink<K, V> {
    fn default() -> Self {
        EventSink::new()
    }
}

/// Sink lifecycle contract consumed by the store.
pub trait StoreEventDispatcher<K, V>: Send + Sync {
    /// New empty sink for one operation.
    fn event_sink(&self) -> EventSink<K, V>;

    /// Publishes the sink's events, preserving their order.
    fn release(&self, sink: EventSink<K, V>);

    /// Discards the sink after a failed operation; nothing is published.
    fn release_after_failure(&self, sink: EventSink<K, V>, error: &StoreError);
}

/// Dispatcher that drops every event; the default wiring.
#[derive(Debug, Default)]
pub struct NoopDispatcher;

impl<K, V> StoreEventDispatcher<K, V> for NoopDispatcher {
    fn event_sink(&self) -> EventSink<K, V> {
        EventSink::new()
    }

    fn release(&self, _sink: EventSink<K, V>) {}

    fn release_after_failure(&self, _sink: EventSink<K, V>, _error: &StoreError) {}
}

/// Observer of published events.
pub trait StoreEventListener<K, V>: Send + Sync {
    fn on_event(&self, event: &StoreEvent<K, V>);
}

/// How released sinks reach the listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiringMode {
    /// Deliver inline on the releasing thread.
    Sync,
    /// Deliver on a background worker, batches kept in release order.
    Async,
}

/// Dispatcher fanning batches out to registered listeners.
///
/// In [`FiringMode::Async`] a worker thread drains a channel of batches;
/// `shutdown` (or drop) closes the channel and joins the worker, so every
/// released batch is delivered before the dispatcher goes away.
pub struct ListenerDispatcher<K, V> {
    listeners: Arc<Vec<Box<dyn StoreEventListener<K, V>>>>,
    tx: Mutex<Option<mpsc::Sender<Vec<StoreEvent<K, V>>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl<K, V> ListenerDispatcher<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    pub fn new(listeners: Vec<Box<dyn StoreEventListener<K, V>>>, mode: FiringMode) -> Self {
        let listeners = Arc::new(listeners);
        let (tx, worker) = match mode {
            FiringMode::Sync => (None, None),
            FiringMode::Async => {
                let (tx, rx) = mpsc::channel::<Vec<StoreEvent<K, V>>>();
                let sinks = Arc::clone(&listeners);
                let join = std::thread::spawn(move || {
                    while let Ok(batch) = rx.recv() {
                        for event in &batch {
                            for listener in sinks.iter() {
                                listener.on_event(event);
                            }
                        }
                    }
                });
                (Some(tx), Some(join))
            }
        };

        ListenerDispatcher {
            listeners,
            tx: Mutex::new(tx),
            worker: Mutex::new(worker),
            stopped: AtomicBool::new(false),
        }
    }

    /// Closes the channel and waits for the worker to drain.
    ///
    /// Use this in tests or shutdown hooks to avoid leaking the thread.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tx.lock().take();
        if let Some(join) = self.worker.lock().take() {
            let _ = join.join();
        }
    }
}

impl<K, V> Drop for ListenerDispatcher<K, V> {
    fn drop(&mut self) {
        self.tx.get_mut().take();
        if let Some(join) = self.worker.get_mut().take() {
            let _ = join.join();
        }
    }
}

impl<K, V> StoreEventDispatcher<K, V> for ListenerDispatcher<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn event_sink(&self) -> EventSink<K, V> {
        EventSink::new()
    }

    fn release(&self, sink: EventSink<K, V>) {
        if sink.is_empty() {
            return;
        }
        let tx = self.tx.lock();
        match &*tx {
            Some(sender) => {
                let _ = sender.send(sink.into_events());
            }
            None => {
                for event in sink.events() {
                    for listener in self.listeners.iter() {
                        listener.on_event(event);
                    }
                }
            }
        }
    }

    fn release_after_failure(&self, sink: EventSink<K, V>, error: &StoreError) {
        tracing::debug!(
            dropped = sink.events().len(),
            %error,
            "discarding events after failed operation"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recording(Arc<Mutex<Vec<StoreEvent<String, String>>>>);

    impl StoreEventListener<String, String> for Recording {
        fn on_event(&self, event: &StoreEvent<String, String>) {
            self.0.lock().push(event.clone());
        }
    }

    fn event(n: u32) -> StoreEvent<String, String> {
        StoreEvent::Created {
            key: format!("k{n}"),
            value: format!("v{n}"),
        }
    }

    fn listeners(
        seen: &Arc<Mutex<Vec<StoreEvent<String, String>>>>,
    ) -> Vec<Box<dyn StoreEventListener<String, String>>> {
        vec![Box::new(Recording(Arc::clone(seen)))]
    }

    #[test]
    fn sync_release_preserves_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = ListenerDispatcher::new(listeners(&seen), FiringMode::Sync);

        let mut sink = dispatcher.event_sink();
        sink.record(event(1));
        sink.record(event(2));
        dispatcher.release(sink);

        let got = seen.lock();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].key(), "k1");
        assert_eq!(got[1].key(), "k2");
    }

    #[test]
    fn failure_release_publishes_nothing() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = ListenerDispatcher::new(listeners(&seen), FiringMode::Sync);

        let mut sink = dispatcher.event_sink();
        sink.record(event(1));
        dispatcher.release_after_failure(sink, &StoreError::access("boom"));

        assert!(seen.lock().is_empty());
    }

    #[test]
    fn async_delivers_before_shutdown_returns() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = ListenerDispatcher::new(listeners(&seen), FiringMode::Async);

        for n in 0..4 {
            let mut sink = dispatcher.event_sink();
            sink.record(event(n));
            dispatcher.release(sink);
        }
        dispatcher.shutdown();

        let got = seen.lock();
        assert_eq!(got.len(), 4);
        assert_eq!(got[3].key(), "k3");
    }
}
