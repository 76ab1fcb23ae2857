//! # Tier Facade
//!
//! `OffHeapStore` is the public face of the off-heap tier. It plays two
//! roles at once: the authoritative tier (source of truth with the full
//! get/put/compute surface) and the lower caching tier (invalidation
//! target of an upper tier, cooperating through the fault/flush
//! protocol).
//!
//! Every operation follows the same discipline: acquire an event sink,
//! read the clock *inside* the remap closure, resolve expiry before the
//! operation's own semantics, and release the sink exactly once on the
//! way out. Collaborator policies that fail are logged and degraded to
//! their documented defaults so they can never wedge the map.

use std::cell::Cell;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;

use strata_common::{
    EvictionVeto, ExpiryDuration, ExpiryPolicy, NoExpiry, NoVeto, StoreError, StoreResult,
    SystemTimeSource, TimeSource, ValueCodec,
};

use crate::arena::PageArena;
use crate::events::{EventSink, NoopDispatcher, StoreEvent, StoreEventDispatcher};
use crate::holder::{HolderMeta, ValueHolder, META_BYTES};
use crate::map::{SegmentedMap, Valve};
use crate::segment::{EvictionHooks, RemapOutcome, Resolve, SegmentError};
use crate::stats::{
    ConditionalOutcome, FlushOutcome, PutOutcome, RemoveOutcome, StatsSnapshot, StoreStats,
};

const DEFAULT_SEGMENT_COUNT: usize = 16;
const DEFAULT_CAPACITY_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_PAGE_SIZE: u32 = 1024 * 1024;
const DEFAULT_TABLE_CAPACITY: usize = 64;

/// Upper-tier callback fired when the lower tier drops or hands off a
/// mapping the upper tier may be caching.
pub trait InvalidationListener<K>: Send + Sync {
    fn on_invalidation(&self, key: &K, holder: Option<&ValueHolder>);
}

/// Default listener: ignores everything.
#[derive(Debug, Default)]
pub struct NoopInvalidation;

impl<K> InvalidationListener<K> for NoopInvalidation {
    fn on_invalidation(&self, _key: &K, _holder: Option<&ValueHolder>) {}
}

/// Configures and builds an [`OffHeapStore`].
pub struct StoreBuilder<K, V> {
    segment_count: usize,
    capacity_bytes: u64,
    page_size: u32,
    initial_table_capacity: usize,
    codec: Box<dyn ValueCodec<V>>,
    expiry: Box<dyn ExpiryPolicy<K, V>>,
    veto: Box<dyn EvictionVeto<K, V>>,
    time: Arc<dyn TimeSource>,
    dispatcher: Arc<dyn StoreEventDispatcher<K, V>>,
    valve: Option<Box<Valve>>,
}

impl<K, V> StoreBuilder<K, V> {
    pub fn new(codec: impl ValueCodec<V> + 'static) -> Self {
        StoreBuilder {
            segment_count: DEFAULT_SEGMENT_COUNT,
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            page_size: DEFAULT_PAGE_SIZE,
            initial_table_capacity: DEFAULT_TABLE_CAPACITY,
            codec: Box::new(codec),
            expiry: Box::new(NoExpiry),
            veto: Box::new(NoVeto),
            time: Arc::new(SystemTimeSource::new()),
            dispatcher: Arc::new(NoopDispatcher),
            valve: None,
        }
    }

    /// Number of segments; normalized to a power of two.
    pub fn segments(mut self, count: usize) -> Self {
        self.segment_count = count;
        self
    }

    /// Arena byte budget.
    pub fn capacity_bytes(mut self, bytes: u64) -> Self {
        self.capacity_bytes = bytes;
        self
    }

    /// Arena page size; must be a power of two no larger than the
    /// capacity. Also the largest storable entry.
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Initial slots per segment table.
    pub fn initial_table_capacity(mut self, slots: usize) -> Self {
        self.initial_table_capacity = slots;
        self
    }

    pub fn expiry(mut self, policy: impl ExpiryPolicy<K, V> + 'static) -> Self {
        self.expiry = Box::new(policy);
        self
    }

    pub fn eviction_veto(mut self, veto: impl EvictionVeto<K, V> + 'static) -> Self {
        self.veto = Box::new(veto);
        self
    }

    pub fn time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn StoreEventDispatcher<K, V>>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Last-resort closure pulled once per operation when the arena
    /// cannot allocate; typically drains a write-behind queue.
    pub fn emergency_valve(mut self, valve: impl Fn() + Send + Sync + 'static) -> Self {
        self.valve = Some(Box::new(valve));
        self
    }

    pub fn build(self) -> StoreResult<OffHeapStore<K, V>>
    where
        K: Eq + Hash + Clone,
    {
        if self.segment_count == 0 {
            return Err(StoreError::InvalidArgument("segment count must be non-zero"));
        }
        if self.capacity_bytes == 0 {
            return Err(StoreError::InvalidArgument("capacity must be non-zero"));
        }
        if !self.page_size.is_power_of_two() {
            return Err(StoreError::InvalidArgument("page size must be a power of two"));
        }
        if self.page_size as u64 > self.capacity_bytes {
            return Err(StoreError::InvalidArgument("page size exceeds capacity"));
        }

        Ok(OffHeapStore {
            map: SegmentedMap::new(self.segment_count, self.initial_table_capacity),
            arena: PageArena::new(self.page_size, self.capacity_bytes),
            codec: self.codec,
            expiry: self.expiry,
            veto: self.veto,
            time: self.time,
            dispatcher: self.dispatcher,
            invalidation: RwLock::new(Arc::new(NoopInvalidation)),
            valve: self.valve,
            stats: StoreStats::default(),
        })
    }
}

/// The off-heap authoritative tier.
pub struct OffHeapStore<K, V> {
    map: SegmentedMap<K>,
    arena: PageArena,
    codec: Box<dyn ValueCodec<V>>,
    expiry: Box<dyn ExpiryPolicy<K, V>>,
    veto: Box<dyn EvictionVeto<K, V>>,
    time: Arc<dyn TimeSource>,
    dispatcher: Arc<dyn StoreEventDispatcher<K, V>>,
    invalidation: RwLock<Arc<dyn InvalidationListener<K>>>,
    valve: Option<Box<Valve>>,
    stats: StoreStats,
}

impl<K, V> OffHeapStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn builder(codec: impl ValueCodec<V> + 'static) -> StoreBuilder<K, V> {
        StoreBuilder::new(codec)
    }

    /// Replaces the upper tier's invalidation listener.
    pub fn set_invalidation_listener(&self, listener: Arc<dyn InvalidationListener<K>>) {
        *self.invalidation.write() = listener;
    }

    // -- authoritative tier --------------------------------------------

    /// Point lookup with the access-touch policy applied.
    pub fn get(&self, key: &K) -> StoreResult<Option<V>> {
        let hash = self.map.hash_of(key);
        let mut sink = self.dispatcher.event_sink();
        let mut found: Option<V> = None;
        let mut expired = 0u64;

        let remap = self
            .map
            .segment_for(hash)
            .compute_if_present(&self.arena, key, hash, |view| {
                let view = match view {
                    Some(view) => view,
                    None => return Ok(Resolve::Keep),
                };
                let now = self.time.now_ms();
                let old = self.decode(view.payload)?;
                if view.meta.is_expired(now) || !self.touch_on_access(key, view.meta, now) {
                    sink.record(StoreEvent::Expired {
                        key: key.clone(),
                        old,
                    });
                    expired += 1;
                    return Ok(Resolve::Remove);
                }
                found = Some(old);
                Ok(Resolve::Keep)
            });
        let result = self.run_remap(&mut sink, remap).map(|_| ());
        self.finish(sink, result)?;

        StoreStats::add(&self.stats.expirations, expired);
        StoreStats::bump(match found {
            Some(_) => &self.stats.get_hit,
            None => &self.stats.get_miss,
        });
        Ok(found)
    }

    /// Presence check; does not touch access metadata.
    pub fn contains_key(&self, key: &K) -> StoreResult<bool> {
        let hash = self.map.hash_of(key);
        let mut sink = self.dispatcher.event_sink();
        let mut present = false;
        let mut expired = 0u64;

        let remap = self
            .map
            .segment_for(hash)
            .compute_if_present(&self.arena, key, hash, |view| {
                let view = match view {
                    Some(view) => view,
                    None => return Ok(Resolve::Keep),
                };
                let now = self.time.now_ms();
                if view.meta.is_expired(now) {
                    let old = self.decode(view.payload)?;
                    sink.record(StoreEvent::Expired {
                        key: key.clone(),
                        old,
                    });
                    expired += 1;
                    return Ok(Resolve::Remove);
                }
                present = true;
                Ok(Resolve::Keep)
            });
        let result = self.run_remap(&mut sink, remap).map(|_| ());
        self.finish(sink, result)?;

        StoreStats::add(&self.stats.expirations, expired);
        Ok(present)
    }

    /// Unconditional write.
    pub fn put(&self, key: K, value: V) -> StoreResult<PutOutcome> {
        let payload = self.encode(&value)?;
        let hash = self.map.hash_of(&key);
        let mut sink = self.dispatcher.event_sink();
        let mut outcome = PutOutcome::Noop;
        let mut expired = 0u64;

        let remap = self
            .map
            .segment_for(hash)
            .compute(&self.arena, &key, hash, false, |view| {
                let now = self.time.now_ms();
                let view = match view {
                    Some(view) => view,
                    None => {
                        let duration = self.creation_duration(&key, &value);
                        if duration.is_zero() {
                            return Ok(Resolve::Keep);
                        }
                        sink.record(StoreEvent::Created {
                            key: key.clone(),
                            value: value.clone(),
                        });
                        outcome = PutOutcome::Put;
                        return Ok(Resolve::Install {
                            payload: payload.clone(),
                            meta: HolderMeta::create(now, duration),
                            preserve_id: false,
                        });
                    }
                };

                let old = self.decode(view.payload)?;
                if view.meta.is_expired(now) {
                    sink.record(StoreEvent::Expired {
                        key: key.clone(),
                        old,
                    });
                    expired += 1;
                    let duration = self.creation_duration(&key, &value);
                    if duration.is_zero() {
                        return Ok(Resolve::Remove);
                    }
                    sink.record(StoreEvent::Created {
                        key: key.clone(),
                        value: value.clone(),
                    });
                    outcome = PutOutcome::Put;
                    return Ok(Resolve::Install {
                        payload: payload.clone(),
                        meta: HolderMeta::create(now, duration),
                        preserve_id: false,
                    });
                }

                match self.update_duration(&key, Some(&old), &value) {
                    Some(duration) if duration.is_zero() => {
                        sink.record(StoreEvent::Expired {
                            key: key.clone(),
                            old,
                        });
                        expired += 1;
                        outcome = PutOutcome::Put;
                        Ok(Resolve::Remove)
                    }
                    duration => {
                        let meta = self.update_meta(now, view.meta, duration);
                        sink.record(StoreEvent::Updated {
                            key: key.clone(),
                            old,
                            new: value.clone(),
                        });
                        outcome = PutOutcome::Replaced;
                        Ok(Resolve::Install {
                            payload: payload.clone(),
                            meta,
                            preserve_id: false,
                        })
                    }
                }
            });
        let result = self.run_remap(&mut sink, remap).map(|_| ());
        self.finish(sink, result)?;

        StoreStats::add(&self.stats.expirations, expired);
        StoreStats::bump(match outcome {
            PutOutcome::Put => &self.stats.put_put,
            PutOutcome::Replaced => &self.stats.put_replaced,
            PutOutcome::Noop => &self.stats.put_noop,
        });
        Ok(outcome)
    }

    /// Writes only when no live mapping exists; returns the existing
    /// value otherwise.
    pub fn put_if_absent(&self, key: K, value: V) -> StoreResult<Option<V>> {
        let payload = self.encode(&value)?;
        let hash = self.map.hash_of(&key);
        let mut sink = self.dispatcher.event_sink();
        let mut existing: Option<V> = None;
        let mut installed = false;
        let mut expired = 0u64;

        let remap = self
            .map
            .segment_for(hash)
            .compute(&self.arena, &key, hash, false, |view| {
                let now = self.time.now_ms();
                let was_present = view.is_some();
                if let Some(view) = view {
                    let old = self.decode(view.payload)?;
                    if !view.meta.is_expired(now) && self.touch_on_access(&key, view.meta, now) {
                        existing = Some(old);
                        return Ok(Resolve::Keep);
                    }
                    sink.record(StoreEvent::Expired {
                        key: key.clone(),
                        old,
                    });
                    expired += 1;
                }

                let duration = self.creation_duration(&key, &value);
                if duration.is_zero() {
                    return Ok(if was_present {
                        Resolve::Remove
                    } else {
                        Resolve::Keep
                    });
                }
                sink.record(StoreEvent::Created {
                    key: key.clone(),
                    value: value.clone(),
                });
                installed = true;
                Ok(Resolve::Install {
                    payload: payload.clone(),
                    meta: HolderMeta::create(now, duration),
                    preserve_id: false,
                })
            });
        let result = self.run_remap(&mut sink, remap).map(|_| ());
        self.finish(sink, result)?;

        StoreStats::add(&self.stats.expirations, expired);
        if existing.is_some() {
            StoreStats::bump(&self.stats.put_if_absent_hit);
        } else if installed {
            StoreStats::bump(&self.stats.put_if_absent_put);
        }
        Ok(existing)
    }

    /// Unconditional removal.
    pub fn remove(&self, key: &K) -> StoreResult<RemoveOutcome> {
        let hash = self.map.hash_of(key);
        let mut sink = self.dispatcher.event_sink();
        let mut outcome = RemoveOutcome::Miss;
        let mut expired = 0u64;

        let remap = self
            .map
            .segment_for(hash)
            .compute_if_present(&self.arena, key, hash, |view| {
                let view = match view {
                    Some(view) => view,
                    None => return Ok(Resolve::Keep),
                };
                let now = self.time.now_ms();
                let old = self.decode(view.payload)?;
                if view.meta.is_expired(now) {
                    sink.record(StoreEvent::Expired {
                        key: key.clone(),
                        old,
                    });
                    expired += 1;
                } else {
                    sink.record(StoreEvent::Removed {
                        key: key.clone(),
                        old,
                    });
                    outcome = RemoveOutcome::Removed;
                }
                Ok(Resolve::Remove)
            });
        let result = self.run_remap(&mut sink, remap).map(|_| ());
        self.finish(sink, result)?;

        StoreStats::add(&self.stats.expirations, expired);
        StoreStats::bump(match outcome {
            RemoveOutcome::Removed => &self.stats.remove_removed,
            RemoveOutcome::Miss => &self.stats.remove_miss,
        });
        Ok(outcome)
    }

    /// Removes only when the stored value equals `expected`.
    pub fn conditional_remove(&self, key: &K, expected: &V) -> StoreResult<ConditionalOutcome>
    where
        V: PartialEq,
    {
        let hash = self.map.hash_of(key);
        let mut sink = self.dispatcher.event_sink();
        let mut outcome = ConditionalOutcome::MissAbsent;
        let mut expired = 0u64;

        let remap = self
            .map
            .segment_for(hash)
            .compute_if_present(&self.arena, key, hash, |view| {
                let view = match view {
                    Some(view) => view,
                    None => return Ok(Resolve::Keep),
                };
                let now = self.time.now_ms();
                let old = self.decode(view.payload)?;
                if view.meta.is_expired(now) {
                    sink.record(StoreEvent::Expired {
                        key: key.clone(),
                        old,
                    });
                    expired += 1;
                    return Ok(Resolve::Remove);
                }
                if old == *expected {
                    sink.record(StoreEvent::Removed {
                        key: key.clone(),
                        old,
                    });
                    outcome = ConditionalOutcome::Hit;
                    return Ok(Resolve::Remove);
                }
                outcome = ConditionalOutcome::MissPresent;
                if !self.touch_on_access(key, view.meta, now) {
                    sink.record(StoreEvent::Expired {
                        key: key.clone(),
                        old,
                    });
                    expired += 1;
                    return Ok(Resolve::Remove);
                }
                Ok(Resolve::Keep)
            });
        let result = self.run_remap(&mut sink, remap).map(|_| ());
        self.finish(sink, result)?;

        StoreStats::add(&self.stats.expirations, expired);
        StoreStats::bump(match outcome {
            ConditionalOutcome::Hit => &self.stats.conditional_remove_hit,
            ConditionalOutcome::MissPresent => &self.stats.conditional_remove_miss_present,
            ConditionalOutcome::MissAbsent => &self.stats.conditional_remove_miss_absent,
        });
        Ok(outcome)
    }

    /// Replaces an existing live mapping; returns the prior value.
    pub fn replace(&self, key: &K, value: V) -> StoreResult<Option<V>> {
        let payload = self.encode(&value)?;
        let hash = self.map.hash_of(key);
        let mut sink = self.dispatcher.event_sink();
        let mut previous: Option<V> = None;
        let mut expired = 0u64;

        let remap = self
            .map
            .segment_for(hash)
            .compute_if_present(&self.arena, key, hash, |view| {
                let view = match view {
                    Some(view) => view,
                    None => return Ok(Resolve::Keep),
                };
                let now = self.time.now_ms();
                let old = self.decode(view.payload)?;
                if view.meta.is_expired(now) {
                    sink.record(StoreEvent::Expired {
                        key: key.clone(),
                        old,
                    });
                    expired += 1;
                    return Ok(Resolve::Remove);
                }

                match self.update_duration(key, Some(&old), &value) {
                    Some(duration) if duration.is_zero() => {
                        sink.record(StoreEvent::Expired {
                            key: key.clone(),
                            old: old.clone(),
                        });
                        expired += 1;
                        previous = Some(old);
                        Ok(Resolve::Remove)
                    }
                    duration => {
                        let meta = self.update_meta(now, view.meta, duration);
                        sink.record(StoreEvent::Updated {
                            key: key.clone(),
                            old: old.clone(),
                            new: value.clone(),
                        });
                        previous = Some(old);
                        Ok(Resolve::Install {
                            payload: payload.clone(),
                            meta,
                            preserve_id: false,
                        })
                    }
                }
            });
        let result = self.run_remap(&mut sink, remap).map(|_| ());
        self.finish(sink, result)?;

        StoreStats::add(&self.stats.expirations, expired);
        StoreStats::bump(match previous {
            Some(_) => &self.stats.replace_replaced,
            None => &self.stats.replace_miss,
        });
        Ok(previous)
    }

    /// Replaces only when the stored value equals `expected`.
    pub fn conditional_replace(
        &self,
        key: &K,
        expected: &V,
        value: V,
    ) -> StoreResult<ConditionalOutcome>
    where
        V: PartialEq,
    {
        let payload = self.encode(&value)?;
        let hash = self.map.hash_of(key);
        let mut sink = self.dispatcher.event_sink();
        let mut outcome = ConditionalOutcome::MissAbsent;
        let mut expired = 0u64;

        let remap = self
            .map
            .segment_for(hash)
            .compute_if_present(&self.arena, key, hash, |view| {
                let view = match view {
                    Some(view) => view,
                    None => return Ok(Resolve::Keep),
                };
                let now = self.time.now_ms();
                let old = self.decode(view.payload)?;
                if view.meta.is_expired(now) {
                    sink.record(StoreEvent::Expired {
                        key: key.clone(),
                        old,
                    });
                    expired += 1;
                    return Ok(Resolve::Remove);
                }

                if old != *expected {
                    outcome = ConditionalOutcome::MissPresent;
                    if !self.touch_on_access(key, view.meta, now) {
                        sink.record(StoreEvent::Expired {
                            key: key.clone(),
                            old,
                        });
                        expired += 1;
                        return Ok(Resolve::Remove);
                    }
                    return Ok(Resolve::Keep);
                }

                outcome = ConditionalOutcome::Hit;
                match self.update_duration(key, Some(&old), &value) {
                    Some(duration) if duration.is_zero() => {
                        sink.record(StoreEvent::Expired {
                            key: key.clone(),
                            old,
                        });
                        expired += 1;
                        Ok(Resolve::Remove)
                    }
                    duration => {
                        let meta = self.update_meta(now, view.meta, duration);
                        sink.record(StoreEvent::Updated {
                            key: key.clone(),
                            old,
                            new: value.clone(),
                        });
                        Ok(Resolve::Install {
                            payload: payload.clone(),
                            meta,
                            preserve_id: false,
                        })
                    }
                }
            });
        let result = self.run_remap(&mut sink, remap).map(|_| ());
        self.finish(sink, result)?;

        StoreStats::add(&self.stats.expirations, expired);
        StoreStats::bump(match outcome {
            ConditionalOutcome::Hit => &self.stats.conditional_replace_hit,
            ConditionalOutcome::MissPresent => &self.stats.conditional_replace_miss_present,
            ConditionalOutcome::MissAbsent => &self.stats.conditional_replace_miss_absent,
        });
        Ok(outcome)
    }

    /// Full remap: `remap` sees the current value (absent and expired
    /// read as `None`) and returns the next one. `remap` runs at most
    /// once, even when the arena forces an allocation retry.
    ///
    /// `replace_equal` is consulted when the closure returns a value
    /// equal to the stored one; returning false keeps the existing
    /// mapping (with an access touch) instead of rewriting it.
    pub fn compute<F, E>(&self, key: K, remap: F, replace_equal: E) -> StoreResult<Option<V>>
    where
        F: FnOnce(&K, Option<&V>) -> Option<V>,
        E: FnOnce() -> bool,
        V: PartialEq,
    {
        let hash = self.map.hash_of(&key);
        let mut sink = self.dispatcher.event_sink();
        let mut resulting: Option<V> = None;
        let mut expired = 0u64;
        enum Count {
            Put,
            Removed,
            Noop,
        }
        let mut count = Count::Noop;

        let seg_result =
            self.map
                .segment_for(hash)
                .compute(&self.arena, &key, hash, false, |view| {
                    let now = self.time.now_ms();

                    // Resolve expiry first so the closure sees the key the
                    // way its semantics demand: live value or nothing.
                    let (live, was_present, meta_ref) = match view {
                        Some(view) => {
                            let old = self.decode(view.payload)?;
                            if view.meta.is_expired(now) {
                                sink.record(StoreEvent::Expired {
                                    key: key.clone(),
                                    old,
                                });
                                expired += 1;
                                (None, true, Some(view.meta))
                            } else {
                                (Some(old), true, Some(view.meta))
                            }
                        }
                        None => (None, false, None),
                    };

                    let next = remap(&key, live.as_ref());
                    match (live, next) {
                        (None, None) => Ok(if was_present {
                            Resolve::Remove
                        } else {
                            Resolve::Keep
                        }),
                        (None, Some(new)) => {
                            let duration = self.creation_duration(&key, &new);
                            if duration.is_zero() {
                                return Ok(if was_present {
                                    Resolve::Remove
                                } else {
                                    Resolve::Keep
                                });
                            }
                            let payload = self.encode(&new)?;
                            sink.record(StoreEvent::Created {
                                key: key.clone(),
                                value: new.clone(),
                            });
                            resulting = Some(new);
                            count = Count::Put;
                            Ok(Resolve::Install {
                                payload,
                                meta: HolderMeta::create(now, duration),
                                preserve_id: false,
                            })
                        }
                        (Some(old), None) => {
                            sink.record(StoreEvent::Removed {
                                key: key.clone(),
                                old,
                            });
                            count = Count::Removed;
                            Ok(Resolve::Remove)
                        }
                        (Some(old), Some(new)) => {
                            let meta_ref = meta_ref.expect("live value implies metadata");
                            if new == old && !replace_equal() {
                                if !self.touch_on_access(&key, meta_ref, now) {
                                    sink.record(StoreEvent::Expired {
                                        key: key.clone(),
                                        old,
                                    });
                                    expired += 1;
                                    return Ok(Resolve::Remove);
                                }
                                resulting = Some(old);
                                return Ok(Resolve::Keep);
                            }
                            match self.update_duration(&key, Some(&old), &new) {
                                Some(duration) if duration.is_zero() => {
                                    sink.record(StoreEvent::Expired {
                                        key: key.clone(),
                                        old,
                                    });
                                    expired += 1;
                                    count = Count::Removed;
                                    Ok(Resolve::Remove)
                                }
                                duration => {
                                    let payload = self.encode(&new)?;
                                    let meta = self.update_meta(now, meta_ref, duration);
                                    sink.record(StoreEvent::Updated {
                                        key: key.clone(),
                                        old,
                                        new: new.clone(),
                                    });
                                    resulting = Some(new);
                                    count = Count::Put;
                                    Ok(Resolve::Install {
                                        payload,
                                        meta,
                                        preserve_id: false,
                                    })
                                }
                            }
                        }
                    }
                });
        let result = self.run_remap(&mut sink, seg_result).map(|_| ());
        self.finish(sink, result)?;

        StoreStats::add(&self.stats.expirations, expired);
        StoreStats::bump(match count {
            Count::Put => &self.stats.compute_put,
            Count::Removed => &self.stats.compute_removed,
            Count::Noop => &self.stats.compute_noop,
        });
        Ok(resulting)
    }

    /// Runs `f` only when no live mapping exists; otherwise returns the
    /// existing value after an access touch.
    pub fn compute_if_absent<F>(&self, key: K, f: F) -> StoreResult<Option<V>>
    where
        F: FnOnce(&K) -> Option<V>,
    {
        let hash = self.map.hash_of(&key);
        let mut sink = self.dispatcher.event_sink();
        let mut resulting: Option<V> = None;
        let mut hit = false;
        let mut installed = false;
        let mut expired = 0u64;

        let seg_result =
            self.map
                .segment_for(hash)
                .compute(&self.arena, &key, hash, false, |view| {
                    let now = self.time.now_ms();
                    let was_present = view.is_some();
                    if let Some(view) = view {
                        let old = self.decode(view.payload)?;
                        if !view.meta.is_expired(now) && self.touch_on_access(&key, view.meta, now)
                        {
                            resulting = Some(old);
                            hit = true;
                            return Ok(Resolve::Keep);
                        }
                        sink.record(StoreEvent::Expired {
                            key: key.clone(),
                            old,
                        });
                        expired += 1;
                    }

                    match f(&key) {
                        None => Ok(if was_present {
                            Resolve::Remove
                        } else {
                            Resolve::Keep
                        }),
                        Some(new) => {
                            let duration = self.creation_duration(&key, &new);
                            if duration.is_zero() {
                                return Ok(if was_present {
                                    Resolve::Remove
                                } else {
                                    Resolve::Keep
                                });
                            }
                            let payload = self.encode(&new)?;
                            sink.record(StoreEvent::Created {
                                key: key.clone(),
                                value: new.clone(),
                            });
                            resulting = Some(new);
                            installed = true;
                            Ok(Resolve::Install {
                                payload,
                                meta: HolderMeta::create(now, duration),
                                preserve_id: false,
                            })
                        }
                    }
                });
        let result = self.run_remap(&mut sink, seg_result).map(|_| ());
        self.finish(sink, result)?;

        StoreStats::add(&self.stats.expirations, expired);
        if hit {
            StoreStats::bump(&self.stats.compute_if_absent_hit);
        } else if installed {
            StoreStats::bump(&self.stats.compute_if_absent_put);
        } else {
            StoreStats::bump(&self.stats.compute_if_absent_noop);
        }
        Ok(resulting)
    }

    /// Applies `remap` to every key in order, equal values replaced.
    pub fn bulk_compute<F>(&self, keys: Vec<K>, mut remap: F) -> StoreResult<Vec<(K, Option<V>)>>
    where
        F: FnMut(&K, Option<&V>) -> Option<V>,
        V: PartialEq,
    {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let value = self.compute(key.clone(), |k, current| remap(k, current), || true)?;
            out.push((key, value));
        }
        Ok(out)
    }

    /// Applies `f` to every absent key in order.
    pub fn bulk_compute_if_absent<F>(
        &self,
        keys: Vec<K>,
        mut f: F,
    ) -> StoreResult<Vec<(K, Option<V>)>>
    where
        F: FnMut(&K) -> Option<V>,
    {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let value = self.compute_if_absent(key.clone(), |k| f(k))?;
            out.push((key, value));
        }
        Ok(out)
    }

    /// Drops every mapping. No per-entry events are emitted.
    pub fn clear(&self) {
        self.map.clear(&self.arena);
    }

    /// Weakly consistent iteration: one segment is snapshotted at a
    /// time, so every entry resident for the whole iteration is yielded
    /// and concurrent inserts may or may not be.
    pub fn iter(&self) -> StoreIter<'_, K, V> {
        StoreIter {
            store: self,
            segment: 0,
            buffer: VecDeque::new(),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> u64 {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- faulting protocol ---------------------------------------------

    /// Pins a live mapping and returns a detached copy for the upper
    /// tier. The resident mapping stays authoritative.
    pub fn get_and_fault(&self, key: &K) -> StoreResult<Option<ValueHolder>> {
        let hash = self.map.hash_of(key);
        let mut sink = self.dispatcher.event_sink();
        let mut faulted: Option<ValueHolder> = None;
        let mut expired = 0u64;

        let remap =
            self.map
                .segment_for(hash)
                .compute_if_present_and_pin(&self.arena, key, hash, |view| {
                    let view = match view {
                        Some(view) => view,
                        None => return Ok(Resolve::Keep),
                    };
                    let now = self.time.now_ms();
                    if view.meta.is_expired(now) {
                        let old = self.decode(view.payload)?;
                        sink.record(StoreEvent::Expired {
                            key: key.clone(),
                            old,
                        });
                        expired += 1;
                        return Ok(Resolve::Remove);
                    }
                    faulted = Some(ValueHolder::new(*view.meta, view.payload.clone()));
                    Ok(Resolve::Keep)
                });
        let result = self.run_remap(&mut sink, remap).map(|_| ());
        self.finish(sink, result)?;

        StoreStats::add(&self.stats.expirations, expired);
        StoreStats::bump(match faulted {
            Some(_) => &self.stats.get_and_fault_hit,
            None => &self.stats.get_and_fault_miss,
        });
        Ok(faulted)
    }

    /// Like [`OffHeapStore::compute_if_absent`] but the surviving
    /// mapping is pinned and returned detached, leaving
    /// deserialization to the upper tier's first access.
    pub fn compute_if_absent_and_fault<F>(&self, key: K, f: F) -> StoreResult<Option<ValueHolder>>
    where
        F: FnOnce(&K) -> Option<V>,
    {
        let hash = self.map.hash_of(&key);
        let mut sink = self.dispatcher.event_sink();
        let mut kept: Option<ValueHolder> = None;
        let mut installed_payload: Option<Bytes> = None;
        let mut expired = 0u64;

        let seg_result =
            self.map
                .segment_for(hash)
                .compute_and_pin(&self.arena, &key, hash, |view| {
                    let now = self.time.now_ms();
                    let was_present = view.is_some();
                    if let Some(view) = &view {
                        if !view.meta.is_expired(now) {
                            kept = Some(ValueHolder::new(*view.meta, view.payload.clone()));
                            return Ok(Resolve::Keep);
                        }
                        let old = self.decode(view.payload)?;
                        sink.record(StoreEvent::Expired {
                            key: key.clone(),
                            old,
                        });
                        expired += 1;
                    }

                    match f(&key) {
                        None => Ok(if was_present {
                            Resolve::Remove
                        } else {
                            Resolve::Keep
                        }),
                        Some(new) => {
                            let duration = self.creation_duration(&key, &new);
                            if duration.is_zero() {
                                return Ok(if was_present {
                                    Resolve::Remove
                                } else {
                                    Resolve::Keep
                                });
                            }
                            let payload = self.encode(&new)?;
                            sink.record(StoreEvent::Created {
                                key: key.clone(),
                                value: new,
                            });
                            installed_payload = Some(payload.clone());
                            Ok(Resolve::Install {
                                payload,
                                meta: HolderMeta::create(now, duration),
                                preserve_id: false,
                            })
                        }
                    }
                });
        let outcome = self.run_remap(&mut sink, seg_result);
        let outcome = match outcome {
            Ok(outcome) => {
                self.finish(sink, Ok(()))?;
                outcome
            }
            Err(err) => {
                return self.finish(sink, Err(err));
            }
        };

        StoreStats::add(&self.stats.expirations, expired);
        StoreStats::bump(&self.stats.compute_if_absent_and_fault);
        match outcome {
            RemapOutcome::Installed { meta, .. } => {
                let payload = installed_payload.expect("install recorded its payload");
                Ok(Some(ValueHolder::new(meta, payload)))
            }
            _ => Ok(kept),
        }
    }

    /// Pushes upper-tier metadata back onto the resident mapping.
    ///
    /// Applies only when the slot is pinned and the resident id matches
    /// the holder the upper tier faulted; the slot is unpinned on
    /// success. An expired upstairs holder expires the resident mapping.
    pub fn flush(&self, key: &K, upstairs: &ValueHolder) -> StoreResult<FlushOutcome> {
        let hash = self.map.hash_of(key);
        let mut sink = self.dispatcher.event_sink();
        let matched = Cell::new(false);
        let mut expired = 0u64;

        let remap = self.map.segment_for(hash).compute_if_pinned(
            &self.arena,
            key,
            hash,
            |view| {
                let view = match view {
                    Some(view) => view,
                    None => return Ok(Resolve::Keep),
                };
                if view.meta.id != upstairs.id() {
                    return Ok(Resolve::Keep);
                }
                matched.set(true);
                let now = self.time.now_ms();
                if upstairs.is_expired(now) {
                    let old = self.decode(view.payload)?;
                    sink.record(StoreEvent::Expired {
                        key: key.clone(),
                        old,
                    });
                    expired += 1;
                    return Ok(Resolve::Remove);
                }
                view.meta.update_metadata(upstairs.meta());
                Ok(Resolve::Keep)
            },
            |_meta| matched.get(),
        );
        let outcome = match self.run_remap(&mut sink, remap) {
            Ok(outcome) => {
                self.finish(sink, Ok(()))?;
                outcome
            }
            Err(err) => return self.finish(sink, Err(err)),
        };

        StoreStats::add(&self.stats.expirations, expired);
        let flush_outcome = match outcome {
            RemapOutcome::Removed { .. } => FlushOutcome::Hit,
            RemapOutcome::Kept { .. } if matched.get() => FlushOutcome::Hit,
            _ => FlushOutcome::Miss,
        };
        StoreStats::bump(match flush_outcome {
            FlushOutcome::Hit => &self.stats.flush_hit,
            FlushOutcome::Miss => &self.stats.flush_miss,
        });
        Ok(flush_outcome)
    }

    // -- lower caching tier --------------------------------------------

    /// Drops the mapping (pinned or not) and notifies the invalidation
    /// listener with the prior holder. Tier-internal: no `removed`
    /// event is emitted.
    pub fn invalidate(&self, key: &K) -> StoreResult<()> {
        self.invalidate_inner(key, || {})
    }

    /// [`OffHeapStore::invalidate`] plus a closure run atomically inside
    /// the same segment-locked remap, mapping present or not.
    pub fn invalidate_with<F>(&self, key: &K, then: F) -> StoreResult<()>
    where
        F: FnOnce(),
    {
        self.invalidate_inner(key, then)
    }

    fn invalidate_inner<F>(&self, key: &K, then: F) -> StoreResult<()>
    where
        F: FnOnce(),
    {
        let hash = self.map.hash_of(key);
        let mut sink = self.dispatcher.event_sink();

        let remap = self
            .map
            .segment_for(hash)
            .compute(&self.arena, key, hash, false, |view| {
                let resolve = match view {
                    Some(view) => {
                        let holder = ValueHolder::new(*view.meta, view.payload.clone());
                        self.invalidation.read().on_invalidation(key, Some(&holder));
                        Resolve::Remove
                    }
                    None => Resolve::Keep,
                };
                then();
                Ok(resolve)
            });
        let result = self.run_remap(&mut sink, remap).map(|_| ());
        self.finish(sink, result)?;

        StoreStats::bump(&self.stats.invalidations);
        Ok(())
    }

    /// Removes the mapping and returns it when still live; the
    /// invalidation listener observes the removal either way.
    pub fn get_and_remove(&self, key: &K) -> StoreResult<Option<ValueHolder>> {
        let hash = self.map.hash_of(key);
        let mut sink = self.dispatcher.event_sink();
        let mut taken: Option<ValueHolder> = None;

        let remap = self
            .map
            .segment_for(hash)
            .compute_if_present(&self.arena, key, hash, |view| {
                let view = match view {
                    Some(view) => view,
                    None => return Ok(Resolve::Keep),
                };
                let now = self.time.now_ms();
                let holder = ValueHolder::new(*view.meta, view.payload.clone());
                self.invalidation.read().on_invalidation(key, Some(&holder));
                if !holder.is_expired(now) {
                    taken = Some(holder);
                }
                Ok(Resolve::Remove)
            });
        let result = self.run_remap(&mut sink, remap).map(|_| ());
        self.finish(sink, result)?;

        StoreStats::bump(&self.stats.get_and_removes);
        Ok(taken)
    }

    /// Transfers a mapping from another tier into an empty slot,
    /// preserving id, timestamps, hit count, and binary form.
    ///
    /// Fails with `PreconditionViolated` when a mapping is present. An
    /// expired source mapping is reported to the invalidation listener
    /// and nothing is installed.
    pub fn install_mapping<F>(&self, key: K, source: F) -> StoreResult<Option<ValueHolder>>
    where
        F: FnOnce(&K) -> Option<ValueHolder>,
    {
        let hash = self.map.hash_of(&key);
        let mut sink = self.dispatcher.event_sink();
        let mut transferred: Option<Bytes> = None;

        let seg_result =
            self.map
                .segment_for(hash)
                .compute(&self.arena, &key, hash, false, |view| {
                    if view.is_some() {
                        return Err(StoreError::PreconditionViolated(
                            "install_mapping requires an empty slot",
                        ));
                    }
                    match source(&key) {
                        None => Ok(Resolve::Keep),
                        Some(holder) => {
                            let now = self.time.now_ms();
                            if holder.is_expired(now) {
                                self.invalidation
                                    .read()
                                    .on_invalidation(&key, Some(&holder));
                                return Ok(Resolve::Keep);
                            }
                            let payload = holder.binary().clone();
                            transferred = Some(payload.clone());
                            Ok(Resolve::Install {
                                payload,
                                meta: *holder.meta(),
                                preserve_id: true,
                            })
                        }
                    }
                });
        let outcome = match self.run_remap(&mut sink, seg_result) {
            Ok(outcome) => {
                self.finish(sink, Ok(()))?;
                outcome
            }
            Err(err) => return self.finish(sink, Err(err)),
        };

        StoreStats::bump(&self.stats.install_mappings);
        match outcome {
            RemapOutcome::Installed { meta, .. } => {
                let payload = transferred.expect("install recorded its payload");
                Ok(Some(ValueHolder::new(meta, payload)))
            }
            _ => Ok(None),
        }
    }

    // -- maintenance ---------------------------------------------------

    /// Removes expired entries across all segments.
    ///
    /// This is an O(n) scan intended for a periodic background sweep;
    /// one `expired` event is emitted per removed entry.
    pub fn purge_expired(&self) -> usize {
        let mut sink = self.dispatcher.event_sink();
        let mut removed = 0usize;

        for i in 0..self.map.segment_count() {
            let now = self.time.now_ms();
            for (key, _meta, payload) in self.map.segment(i).purge_expired(&self.arena, now) {
                removed += 1;
                match self.codec.decode(&payload) {
                    Ok(old) => sink.record(StoreEvent::Expired { key, old }),
                    Err(err) => {
                        tracing::warn!(error = %err, "codec failed for expired entry; event dropped")
                    }
                }
            }
        }

        StoreStats::add(&self.stats.expirations, removed as u64);
        self.dispatcher.release(sink);
        removed
    }

    /// Point-in-time statistics.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let occupied = self.arena.occupied_memory();
        let long_size = self.map.len();
        let vital = self.map.vital_memory();
        let vital_entries = self.map.vital_entries();
        let data_occupied = occupied.saturating_sub(META_BYTES as u64 * long_size);

        StatsSnapshot {
            allocated_memory: self.arena.allocated_memory(),
            occupied_memory: occupied,
            data_allocated_memory: data_occupied,
            data_occupied_memory: data_occupied,
            data_size: long_size,
            data_vital_memory: vital.saturating_sub(META_BYTES as u64 * vital_entries),
            long_size,
            vital_memory: vital,
            removed_slot_count: self.map.removed_slot_count(),
            reprobe_length: self.map.reprobe_length(),
            used_slot_count: long_size,
            table_capacity: self.map.table_capacity(),
            operations: self.stats.operations(),
        }
    }

    // -- internals -----------------------------------------------------

    fn encode(&self, value: &V) -> StoreResult<Bytes> {
        self.codec.encode(value).map_err(StoreError::access)
    }

    fn decode(&self, payload: &[u8]) -> StoreResult<V> {
        self.codec.decode(payload).map_err(StoreError::access)
    }

    /// Creation lifetime, with a failing policy degraded to "expire
    /// now" (which suppresses the install).
    fn creation_duration(&self, key: &K, value: &V) -> ExpiryDuration {
        match self.expiry.for_creation(key, value) {
            Ok(duration) => duration,
            Err(err) => {
                tracing::warn!(error = %err, "expiry policy failed on creation; suppressing install");
                ExpiryDuration::ZERO
            }
        }
    }

    /// Access lifetime; a failing policy expires the entry.
    fn access_duration(&self, key: &K) -> Option<ExpiryDuration> {
        match self.expiry.for_access(key) {
            Ok(duration) => duration,
            Err(err) => {
                tracing::warn!(error = %err, "expiry policy failed on access; expiring entry");
                Some(ExpiryDuration::ZERO)
            }
        }
    }

    /// Update lifetime; a failing policy expires the entry.
    fn update_duration(&self, key: &K, old: Option<&V>, new: &V) -> Option<ExpiryDuration> {
        match self.expiry.for_update(key, old, new) {
            Ok(duration) => duration,
            Err(err) => {
                tracing::warn!(error = %err, "expiry policy failed on update; expiring entry");
                Some(ExpiryDuration::ZERO)
            }
        }
    }

    /// Access-touch policy for a live entry a read just observed.
    /// Returns false when the policy demands immediate expiry.
    fn touch_on_access(&self, key: &K, meta: &mut HolderMeta, now: u64) -> bool {
        match self.access_duration(key) {
            Some(duration) if duration.is_zero() => false,
            Some(duration) => {
                meta.accessed(now, duration);
                meta.hit_count += 1;
                true
            }
            None => {
                meta.last_access_time_ms = now;
                meta.hit_count += 1;
                true
            }
        }
    }

    /// Metadata for an updated mapping: fresh creation window at `now`,
    /// expiration from the policy or carried over when it abstains.
    fn update_meta(
        &self,
        now: u64,
        prev: &HolderMeta,
        duration: Option<ExpiryDuration>,
    ) -> HolderMeta {
        match duration {
            Some(duration) => HolderMeta::create(now, duration),
            None => {
                let mut meta = HolderMeta::create(now, ExpiryDuration::Forever);
                meta.expiration_time_ms = prev.expiration_time_ms;
                meta
            }
        }
    }

    /// Routes a segment result through the oversize protocol when the
    /// arena rejected the install.
    fn run_remap(
        &self,
        sink: &mut EventSink<K, V>,
        result: Result<RemapOutcome, SegmentError<K>>,
    ) -> StoreResult<RemapOutcome> {
        match result {
            Ok(outcome) => Ok(outcome),
            Err(SegmentError::Store(err)) => Err(err),
            Err(SegmentError::Oversize(pending)) => {
                let mut hooks = PressureHooks { store: self, sink };
                self.map.install_with_pressure(
                    &self.arena,
                    *pending,
                    &mut hooks,
                    self.valve.as_deref(),
                )
            }
        }
    }

    /// Releases the sink exactly once, success or failure path.
    fn finish<R>(&self, sink: EventSink<K, V>, result: StoreResult<R>) -> StoreResult<R> {
        match result {
            Ok(value) => {
                self.dispatcher.release(sink);
                Ok(value)
            }
            Err(err) => {
                self.dispatcher.release_after_failure(sink, &err);
                Err(err)
            }
        }
    }
}

impl<K, V> OffHeapStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Starts a background thread that periodically removes expired
    /// entries. The returned handle must be stopped to join the thread.
    pub fn start_expiry_sweeper(self: Arc<Self>, interval: Duration) -> SweeperHandle {
        let interval = if interval.is_zero() {
            Duration::from_millis(1)
        } else {
            interval
        };

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let store = self;

        let join = std::thread::spawn(move || {
            while !stop_thread.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                store.purge_expired();
            }
        });

        SweeperHandle {
            stop,
            join: Some(join),
        }
    }
}

/// Handle for the background expiry sweeper.
pub struct SweeperHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Signals shutdown and waits for the sweeper thread to finish.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Weakly consistent store iterator; see [`OffHeapStore::iter`].
pub struct StoreIter<'a, K, V> {
    store: &'a OffHeapStore<K, V>,
    segment: usize,
    buffer: VecDeque<(K, Bytes)>,
}

impl<K, V> Iterator for StoreIter<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    type Item = StoreResult<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((key, payload)) = self.buffer.pop_front() {
                return Some(self.store.decode(&payload).map(|value| (key, value)));
            }
            if self.segment >= self.store.map.segment_count() {
                return None;
            }
            let now = self.store.time.now_ms();
            self.buffer = self
                .store
                .map
                .segment(self.segment)
                .snapshot_entries(&self.store.arena, now)
                .into_iter()
                .collect();
            self.segment += 1;
        }
    }
}

/// Eviction callbacks for one operation: veto consultation plus the
/// evicted-event / invalidation / counter triple.
struct PressureHooks<'a, K, V> {
    store: &'a OffHeapStore<K, V>,
    sink: &'a mut EventSink<K, V>,
}

impl<K, V> EvictionHooks<K> for PressureHooks<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn may_evict(&mut self, key: &K, _meta: &HolderMeta, payload: &[u8]) -> bool {
        let value = match self.store.codec.decode(payload) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "codec failed during eviction scan; treating entry as evictable");
                return true;
            }
        };
        match self.store.veto.vetoes(key, &value) {
            Ok(vetoed) => !vetoed,
            Err(err) => {
                tracing::warn!(error = %err, "eviction veto failed; treating entry as not vetoed");
                true
            }
        }
    }

    fn evicted(&mut self, key: K, meta: HolderMeta, payload: Bytes) {
        StoreStats::bump(&self.store.stats.evictions);
        let holder = ValueHolder::new(meta, payload.clone());
        self.store
            .invalidation
            .read()
            .on_invalidation(&key, Some(&holder));
        match self.store.codec.decode(&payload) {
            Ok(old) => self.sink.record(StoreEvent::Evicted { key, old }),
            Err(err) => {
                tracing::warn!(error = %err, "codec failed for evicted entry; event dropped")
            }
        }
    }
}
