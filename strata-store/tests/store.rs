//! Authoritative-tier behavior: expiry, conditional operations, the
//! oversize protocol, and event publication.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use strata_store::{
    ConditionalOutcome, EventSink, ExpiryDuration, ExpiryPolicy, FnVeto, JsonCodec,
    ManualTimeSource, OffHeapStore, PutOutcome, RemoveOutcome, StoreError, StoreEvent,
    StoreEventDispatcher, TimeSource, TimeToLive,
};

type Store = OffHeapStore<String, String>;
type Event = StoreEvent<String, String>;

/// Dispatcher that records released batches and counts failure releases.
#[derive(Default)]
struct RecordingDispatcher {
    released: Mutex<Vec<Vec<Event>>>,
    failures: AtomicU64,
}

impl RecordingDispatcher {
    fn events(&self) -> Vec<Event> {
        self.released.lock().iter().flatten().cloned().collect()
    }

    fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }
}

impl StoreEventDispatcher<String, String> for RecordingDispatcher {
    fn event_sink(&self) -> EventSink<String, String> {
        EventSink::new()
    }

    fn release(&self, sink: EventSink<String, String>) {
        if !sink.is_empty() {
            self.released.lock().push(sink.into_events());
        }
    }

    fn release_after_failure(&self, _sink: EventSink<String, String>, _error: &StoreError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

fn fixture(
    expiry: impl ExpiryPolicy<String, String> + 'static,
) -> (Store, Arc<ManualTimeSource>, Arc<RecordingDispatcher>) {
    let clock = Arc::new(ManualTimeSource::new(0));
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let store = OffHeapStore::builder(JsonCodec)
        .segments(4)
        .capacity_bytes(1 << 20)
        .page_size(1 << 16)
        .time_source(Arc::clone(&clock) as Arc<dyn TimeSource>)
        .dispatcher(Arc::clone(&dispatcher) as Arc<dyn StoreEventDispatcher<String, String>>)
        .expiry(expiry)
        .build()
        .expect("valid config");
    (store, clock, dispatcher)
}

fn expired_events(dispatcher: &RecordingDispatcher) -> Vec<Event> {
    dispatcher
        .events()
        .into_iter()
        .filter(|e| matches!(e, StoreEvent::Expired { .. }))
        .collect()
}

#[test]
fn put_then_expiry_sweep() {
    let (store, clock, dispatcher) = fixture(TimeToLive(Duration::from_millis(1000)));

    assert_eq!(
        store.put("a".into(), "1".into()).unwrap(),
        PutOutcome::Put
    );

    clock.set(500);
    assert_eq!(store.get(&"a".to_string()).unwrap(), Some("1".to_string()));

    clock.set(2000);
    assert_eq!(store.get(&"a".to_string()).unwrap(), None);
    assert_eq!(
        expired_events(&dispatcher),
        vec![StoreEvent::Expired {
            key: "a".into(),
            old: "1".into(),
        }]
    );

    let snapshot = store.stats_snapshot();
    assert_eq!(snapshot.operations.expirations, 1);
    assert_eq!(snapshot.operations.get_hit, 1);
    assert_eq!(snapshot.operations.get_miss, 1);
    assert_eq!(snapshot.long_size, 0);
}

#[test]
fn conditional_replace_miss_then_hit() {
    let (store, _clock, dispatcher) = fixture(TimeToLive(Duration::from_secs(60)));
    let key = "k".to_string();

    store.put(key.clone(), "v1".into()).unwrap();

    let miss = store
        .conditional_replace(&key, &"wrong".to_string(), "v2".into())
        .unwrap();
    assert_eq!(miss, ConditionalOutcome::MissPresent);
    assert_eq!(store.get(&key).unwrap(), Some("v1".to_string()));

    let hit = store
        .conditional_replace(&key, &"v1".to_string(), "v2".into())
        .unwrap();
    assert_eq!(hit, ConditionalOutcome::Hit);
    assert_eq!(store.get(&key).unwrap(), Some("v2".to_string()));

    let updates: Vec<Event> = dispatcher
        .events()
        .into_iter()
        .filter(|e| matches!(e, StoreEvent::Updated { .. }))
        .collect();
    assert_eq!(
        updates,
        vec![StoreEvent::Updated {
            key: key.clone(),
            old: "v1".into(),
            new: "v2".into(),
        }]
    );

    assert_eq!(
        store
            .conditional_replace(&"absent".to_string(), &"x".to_string(), "y".into())
            .unwrap(),
        ConditionalOutcome::MissAbsent
    );
}

#[test]
fn conditional_remove_outcomes() {
    let (store, _clock, _dispatcher) = fixture(TimeToLive(Duration::from_secs(60)));
    let key = "k".to_string();
    store.put(key.clone(), "v".into()).unwrap();

    assert_eq!(
        store
            .conditional_remove(&key, &"other".to_string())
            .unwrap(),
        ConditionalOutcome::MissPresent
    );
    assert_eq!(
        store.conditional_remove(&key, &"v".to_string()).unwrap(),
        ConditionalOutcome::Hit
    );
    assert_eq!(
        store.conditional_remove(&key, &"v".to_string()).unwrap(),
        ConditionalOutcome::MissAbsent
    );
}

#[test]
fn put_if_absent_returns_existing() {
    let (store, _clock, _dispatcher) = fixture(TimeToLive(Duration::from_secs(60)));
    let key = "k".to_string();

    assert_eq!(store.put_if_absent(key.clone(), "v1".into()).unwrap(), None);
    assert_eq!(
        store.put_if_absent(key.clone(), "v2".into()).unwrap(),
        Some("v1".to_string())
    );
    assert_eq!(store.get(&key).unwrap(), Some("v1".to_string()));
}

#[test]
fn remove_reports_miss_then_removed() {
    let (store, _clock, dispatcher) = fixture(TimeToLive(Duration::from_secs(60)));
    let key = "k".to_string();

    assert_eq!(store.remove(&key).unwrap(), RemoveOutcome::Miss);
    store.put(key.clone(), "v".into()).unwrap();
    assert_eq!(store.remove(&key).unwrap(), RemoveOutcome::Removed);
    assert!(dispatcher
        .events()
        .iter()
        .any(|e| matches!(e, StoreEvent::Removed { .. })));
}

#[test]
fn compute_creates_updates_and_removes() {
    let (store, _clock, dispatcher) = fixture(TimeToLive(Duration::from_secs(60)));
    let key = "k".to_string();

    let created = store
        .compute(key.clone(), |_, current| {
            assert!(current.is_none());
            Some("v1".to_string())
        }, || true)
        .unwrap();
    assert_eq!(created, Some("v1".to_string()));

    let updated = store
        .compute(key.clone(), |_, current| {
            assert_eq!(current, Some(&"v1".to_string()));
            Some("v2".to_string())
        }, || true)
        .unwrap();
    assert_eq!(updated, Some("v2".to_string()));

    let removed = store.compute(key.clone(), |_, _| None, || true).unwrap();
    assert_eq!(removed, None);
    assert_eq!(store.get(&key).unwrap(), None);

    let kinds: Vec<&'static str> = dispatcher
        .events()
        .iter()
        .map(|e| match e {
            StoreEvent::Created { .. } => "created",
            StoreEvent::Updated { .. } => "updated",
            StoreEvent::Removed { .. } => "removed",
            StoreEvent::Expired { .. } => "expired",
            StoreEvent::Evicted { .. } => "evicted",
        })
        .collect();
    assert_eq!(kinds, vec!["created", "updated", "removed"]);
}

#[test]
fn compute_equal_value_keeps_mapping() {
    let (store, _clock, dispatcher) = fixture(TimeToLive(Duration::from_secs(60)));
    let key = "k".to_string();
    store.put(key.clone(), "v".into()).unwrap();

    let kept = store
        .compute(key.clone(), |_, _| Some("v".to_string()), || false)
        .unwrap();
    assert_eq!(kept, Some("v".to_string()));

    // No update event: the equal value was not rewritten.
    assert!(!dispatcher
        .events()
        .iter()
        .any(|e| matches!(e, StoreEvent::Updated { .. })));
}

#[test]
fn compute_if_absent_runs_once_for_missing_keys() {
    let (store, _clock, _dispatcher) = fixture(TimeToLive(Duration::from_secs(60)));
    let key = "k".to_string();

    let computed = store
        .compute_if_absent(key.clone(), |_| Some("fresh".to_string()))
        .unwrap();
    assert_eq!(computed, Some("fresh".to_string()));

    let existing = store
        .compute_if_absent(key.clone(), |_| {
            panic!("mapping function must not run for a live entry")
        })
        .unwrap();
    assert_eq!(existing, Some("fresh".to_string()));
}

/// Access expiry of zero: every read observes an absent entry and only
/// the first one emits the expired event.
struct ExpireOnAccess;

impl ExpiryPolicy<String, String> for ExpireOnAccess {
    fn for_creation(&self, _: &String, _: &String) -> anyhow::Result<ExpiryDuration> {
        Ok(ExpiryDuration::Forever)
    }

    fn for_access(&self, _: &String) -> anyhow::Result<Option<ExpiryDuration>> {
        Ok(Some(ExpiryDuration::ZERO))
    }

    fn for_update(
        &self,
        _: &String,
        _: Option<&String>,
        _: &String,
    ) -> anyhow::Result<Option<ExpiryDuration>> {
        Ok(None)
    }
}

#[test]
fn access_zero_is_idempotent() {
    let (store, _clock, dispatcher) = fixture(ExpireOnAccess);
    let key = "k".to_string();
    store.put(key.clone(), "v".into()).unwrap();

    assert_eq!(store.get(&key).unwrap(), None);
    assert_eq!(store.get(&key).unwrap(), None);
    assert_eq!(store.get(&key).unwrap(), None);

    assert_eq!(expired_events(&dispatcher).len(), 1);
    assert_eq!(store.stats_snapshot().operations.expirations, 1);
}

/// Expiry collaborator that always fails; the store must degrade to
/// immediate expiry instead of surfacing the failure.
struct BrokenExpiry;

impl ExpiryPolicy<String, String> for BrokenExpiry {
    fn for_creation(&self, _: &String, _: &String) -> anyhow::Result<ExpiryDuration> {
        Ok(ExpiryDuration::Forever)
    }

    fn for_access(&self, _: &String) -> anyhow::Result<Option<ExpiryDuration>> {
        anyhow::bail!("expiry backend unavailable")
    }

    fn for_update(
        &self,
        _: &String,
        _: Option<&String>,
        _: &String,
    ) -> anyhow::Result<Option<ExpiryDuration>> {
        Ok(None)
    }
}

#[test]
fn broken_expiry_policy_expires_instead_of_failing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();
    let (store, _clock, dispatcher) = fixture(BrokenExpiry);
    let key = "k".to_string();
    store.put(key.clone(), "v".into()).unwrap();

    assert_eq!(store.get(&key).unwrap(), None, "treated as just-expired");
    assert_eq!(expired_events(&dispatcher).len(), 1);
    assert_eq!(dispatcher.failure_count(), 0);
}

fn tiny_store(
    valve_target: Arc<OnceLock<Arc<Store>>>,
    with_valve: bool,
    dispatcher: Arc<dyn StoreEventDispatcher<String, String>>,
) -> Arc<Store> {
    let mut builder = OffHeapStore::builder(JsonCodec)
        .segments(1)
        .capacity_bytes(256)
        .page_size(256)
        .dispatcher(dispatcher)
        .expiry(TimeToLive(Duration::from_secs(60)));
    if with_valve {
        // The valve stands in for "drain the write-behind queue": it
        // releases the resident entry so the retried allocation fits.
        builder = builder.emergency_valve(move || {
            if let Some(store) = valve_target.get() {
                let _ = store.invalidate(&"a".to_string());
            }
        });
    }
    let store = Arc::new(builder.build().expect("valid config"));
    store
}

#[test]
fn oversize_with_valve_recovers() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let target = Arc::new(OnceLock::new());
    let store = tiny_store(
        Arc::clone(&target),
        true,
        Arc::clone(&dispatcher) as Arc<dyn StoreEventDispatcher<String, String>>,
    );
    target.set(Arc::clone(&store)).ok().expect("set once");

    store.put("a".into(), "#".repeat(100)).unwrap();
    // Pin "a" so the shrink pass cannot touch it; only the valve (which
    // invalidates "a", pinned or not) can clear the way for "b".
    store.get_and_fault(&"a".to_string()).unwrap();
    store.put("b".into(), "#".repeat(120)).unwrap();

    assert_eq!(store.get(&"b".to_string()).unwrap(), Some("#".repeat(120)));
    assert_eq!(store.get(&"a".to_string()).unwrap(), None);
    assert_eq!(dispatcher.failure_count(), 0);

    let creations = dispatcher
        .events()
        .into_iter()
        .filter(|e| matches!(e, StoreEvent::Created { key, .. } if key == "b"))
        .count();
    assert_eq!(creations, 1);
}

#[test]
fn oversize_without_valve_fails_and_publishes_nothing() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let target = Arc::new(OnceLock::new());
    let store = tiny_store(
        target,
        false,
        Arc::clone(&dispatcher) as Arc<dyn StoreEventDispatcher<String, String>>,
    );

    store.put("a".into(), "#".repeat(100)).unwrap();
    store.get_and_fault(&"a".to_string()).unwrap();
    let before = dispatcher.events().len();

    let err = store.put("b".into(), "#".repeat(120)).unwrap_err();
    assert!(matches!(err, StoreError::StoreAccess(ref m) if m.contains("too large")));
    assert_eq!(dispatcher.failure_count(), 1);
    assert_eq!(
        dispatcher.events().len(),
        before,
        "failed operation published nothing"
    );
    assert_eq!(store.get(&"a".to_string()).unwrap(), Some("#".repeat(100)));
}

#[test]
fn vetoed_entries_survive_pressure_but_stay_removable() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let store: Store = OffHeapStore::builder(JsonCodec)
        .segments(1)
        .capacity_bytes(512)
        .page_size(512)
        .dispatcher(Arc::clone(&dispatcher) as Arc<dyn StoreEventDispatcher<String, String>>)
        .eviction_veto(FnVeto(|key: &String, _: &String| key == "keep"))
        .expiry(TimeToLive(Duration::from_secs(60)))
        .build()
        .unwrap();

    store.put("keep".into(), "#".repeat(120)).unwrap();
    store.put("drop".into(), "#".repeat(120)).unwrap();

    // Needs more space than remains: pressure evicts "drop" (the veto
    // protects "keep") during the terminal walk's shrink attempts.
    store.put("big".into(), "#".repeat(200)).unwrap();

    assert_eq!(
        store.get(&"keep".to_string()).unwrap(),
        Some("#".repeat(120)),
        "vetoed entry never chosen by eviction"
    );
    assert_eq!(store.get(&"drop".to_string()).unwrap(), None);

    // Explicit removal still applies to vetoed entries.
    assert_eq!(
        store.remove(&"keep".to_string()).unwrap(),
        RemoveOutcome::Removed
    );
}

#[test]
fn concurrent_compute_serializes_on_the_segment_lock() {
    let (store, _clock, dispatcher) = fixture(TimeToLive(Duration::from_secs(60)));
    let store = Arc::new(store);
    let key = "k".to_string();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let store = Arc::clone(&store);
        let key = key.clone();
        handles.push(std::thread::spawn(move || {
            store
                .compute(
                    key,
                    |_, current| {
                        let mut next = current.cloned().unwrap_or_default();
                        next.push('x');
                        Some(next)
                    },
                    || true,
                )
                .unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.get(&key).unwrap(), Some("xx".to_string()));

    let events = dispatcher.events();
    let created = events
        .iter()
        .filter(|e| matches!(e, StoreEvent::Created { .. }))
        .count();
    let updated = events
        .iter()
        .filter(|e| matches!(e, StoreEvent::Updated { .. }))
        .count();
    assert_eq!((created, updated), (1, 1));
}

#[test]
fn iterator_yields_live_entries() {
    let (store, clock, _dispatcher) = fixture(TimeToLive(Duration::from_millis(100)));
    store.put("a".into(), "1".into()).unwrap();
    store.put("b".into(), "2".into()).unwrap();

    let mut entries: Vec<(String, String)> = store.iter().map(|e| e.unwrap()).collect();
    entries.sort();
    assert_eq!(
        entries,
        vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]
    );

    clock.set(500);
    assert_eq!(store.iter().count(), 0, "expired entries are not yielded");
}

#[test]
fn bulk_compute_applies_per_key() {
    let (store, _clock, _dispatcher) = fixture(TimeToLive(Duration::from_secs(60)));
    store.put("a".into(), "1".into()).unwrap();

    let results = store
        .bulk_compute(vec!["a".into(), "b".into()], |_, current| {
            Some(match current {
                Some(v) => format!("{v}!"),
                None => "new".to_string(),
            })
        })
        .unwrap();
    assert_eq!(
        results,
        vec![
            ("a".to_string(), Some("1!".to_string())),
            ("b".to_string(), Some("new".to_string())),
        ]
    );

    let absent_only = store
        .bulk_compute_if_absent(vec!["a".into(), "c".into()], |_| Some("filled".to_string()))
        .unwrap();
    assert_eq!(
        absent_only,
        vec![
            ("a".to_string(), Some("1!".to_string())),
            ("c".to_string(), Some("filled".to_string())),
        ]
    );
}

#[test]
fn clear_empties_the_store_without_events() {
    let (store, _clock, dispatcher) = fixture(TimeToLive(Duration::from_secs(60)));
    store.put("a".into(), "1".into()).unwrap();
    store.put("b".into(), "2".into()).unwrap();
    let before = dispatcher.events().len();

    store.clear();
    assert!(store.is_empty());
    assert_eq!(store.stats_snapshot().occupied_memory, 0);
    assert_eq!(dispatcher.events().len(), before);
}

#[test]
fn builder_rejects_bad_configuration() {
    let zero_capacity: Result<Store, _> = OffHeapStore::builder(JsonCodec)
        .capacity_bytes(0)
        .build();
    assert!(matches!(
        zero_capacity,
        Err(StoreError::InvalidArgument(_))
    ));

    let odd_page: Result<Store, _> = OffHeapStore::builder(JsonCodec).page_size(1000).build();
    assert!(matches!(odd_page, Err(StoreError::InvalidArgument(_))));

    let no_segments: Result<Store, _> = OffHeapStore::builder(JsonCodec).segments(0).build();
    assert!(matches!(no_segments, Err(StoreError::InvalidArgument(_))));
}

#[test]
fn stats_track_memory_and_outcomes() {
    let (store, _clock, _dispatcher) = fixture(TimeToLive(Duration::from_secs(60)));
    store.put("a".into(), "1".into()).unwrap();
    store.put("a".into(), "2".into()).unwrap();
    store.get(&"a".to_string()).unwrap();
    store.get(&"missing".to_string()).unwrap();

    let snapshot = store.stats_snapshot();
    assert_eq!(snapshot.operations.put_put, 1);
    assert_eq!(snapshot.operations.put_replaced, 1);
    assert_eq!(snapshot.operations.get_hit, 1);
    assert_eq!(snapshot.operations.get_miss, 1);
    assert_eq!(snapshot.long_size, 1);
    assert_eq!(snapshot.used_slot_count, 1);
    assert!(snapshot.allocated_memory > 0);
    assert!(snapshot.occupied_memory > 0);
    assert!(snapshot.data_occupied_memory < snapshot.occupied_memory);
    assert!(snapshot.table_capacity >= 4 * 8);
}
