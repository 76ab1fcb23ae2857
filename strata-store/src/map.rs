//! # Segmented Map
//!
//! Fan-out over N power-of-two segments by key hash, counter
//! aggregation, and the cross-segment remediation that runs when the
//! arena rejects an install: shrink other segments, pull the emergency
//! valve once, then walk every segment read-and-setting the veto bit
//! until either space appears or the walk proves nothing can yield.

use std::hash::{BuildHasher, Hash};

use ahash::RandomState;
use strata_common::{StoreError, StoreResult};

use crate::arena::PageArena;
use crate::segment::{EvictionHooks, PendingInstall, RemapOutcome, Segment, VetoWalk};

/// Emergency valve pulled when the arena cannot allocate; typically
/// drains a write-behind queue. Invoked at most once per operation.
pub(crate) type Valve = dyn Fn() + Send + Sync;

pub(crate) struct SegmentedMap<K> {
    segments: Box<[Segment<K>]>,
    hash_state: RandomState,
    mask: u64,
}

impl<K: Eq + Hash + Clone> SegmentedMap<K> {
    pub(crate) fn new(segment_count: usize, initial_table_capacity: usize) -> Self {
        let count = segment_count.max(1).next_power_of_two();
        let segments = (0..count)
            .map(|_| Segment::new(initial_table_capacity))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        SegmentedMap {
            segments,
            hash_state: RandomState::new(),
            mask: (count - 1) as u64,
        }
    }

    #[inline]
    pub(crate) fn hash_of(&self, key: &K) -> u64 {
        self.hash_state.hash_one(key)
    }

    #[inline]
    pub(crate) fn segment_for(&self, hash: u64) -> &Segment<K> {
        &self.segments[(hash & self.mask) as usize]
    }

    #[inline]
    pub(crate) fn segment_count(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    pub(crate) fn segment(&self, idx: usize) -> &Segment<K> {
        &self.segments[idx]
    }

    /// Frees space held by entries *not* carrying `hash` by evicting
    /// one entry somewhere in the map. Other segments are tried first,
    /// the home segment last (minus the requesting mapping itself).
    /// Returns whether bytes were freed. Each segment's lock is taken
    /// alone, never two at once.
    pub(crate) fn shrink_others(
        &self,
        arena: &PageArena,
        hash: u64,
        hooks: &mut dyn EvictionHooks<K>,
    ) -> bool {
        let home = (hash & self.mask) as usize;
        for offset in 1..=self.segments.len() {
            let idx = (home + offset) & self.mask as usize;
            if self.segments[idx].try_evict_one(arena, Some(hash), hooks) {
                return true;
            }
        }
        false
    }

    /// Runs the prepared install through the oversize protocol until it
    /// lands or remediation is exhausted.
    ///
    /// Progress is monotone: every retry has either freed arena space or
    /// flipped previously-unvetoed slots, so the loop is bounded by the
    /// total entry count plus one valve invocation.
    pub(crate) fn install_with_pressure(
        &self,
        arena: &PageArena,
        mut pending: PendingInstall<K>,
        hooks: &mut dyn EvictionHooks<K>,
        valve: Option<&Valve>,
    ) -> StoreResult<RemapOutcome> {
        let mut valve_pulled = false;
        loop {
            pending = match self.segment_for(pending.hash).install_prepared(arena, pending) {
                Ok(outcome) => return Ok(outcome),
                Err(pending) => *pending,
            };

            if self.shrink_others(arena, pending.hash, hooks) {
                continue;
            }
            if let Some(valve) = valve {
                if !valve_pulled {
                    valve_pulled = true;
                    valve();
                    continue;
                }
            }
            match self.veto_walk_all() {
                VetoWalk::Flipped(n) if n > 0 => continue,
                _ => return Err(StoreError::StoreAccess("element too large".into())),
            }
        }
    }

    /// Read-and-sets the veto bit across every segment.
    ///
    /// Stops as soon as one segment reports a prior veto: the walk has
    /// looped once through and nothing new can be flagged.
    fn veto_walk_all(&self) -> VetoWalk {
        let mut flipped = 0;
        for segment in self.segments.iter() {
            match segment.veto_walk() {
                VetoWalk::Flipped(n) => flipped += n,
                VetoWalk::SawPriorVetoed => return VetoWalk::SawPriorVetoed,
            }
        }
        VetoWalk::Flipped(flipped)
    }

    pub(crate) fn clear(&self, arena: &PageArena) {
        for segment in self.segments.iter() {
            segment.clear(arena);
        }
    }

    // -- aggregated counters -------------------------------------------

    pub(crate) fn len(&self) -> u64 {
        self.segments.iter().map(|s| s.used_slot_count()).sum()
    }

    pub(crate) fn removed_slot_count(&self) -> u64 {
        self.segments.iter().map(|s| s.removed_slot_count()).sum()
    }

    pub(crate) fn reprobe_length(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.reprobe_length())
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn table_capacity(&self) -> u64 {
        self.segments.iter().map(|s| s.table_capacity()).sum()
    }

    pub(crate) fn vital_memory(&self) -> u64 {
        self.segments.iter().map(|s| s.vital_memory()).sum()
    }

    pub(crate) fn vital_entries(&self) -> u64 {
        self.segments.iter().map(|s| s.vital_entries()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::holder::HolderMeta;
    use crate::segment::Resolve;
    use bytes::Bytes;
    use strata_common::ExpiryDuration;

    struct AllowAll {
        evicted: Vec<u32>,
    }

    impl EvictionHooks<u32> for AllowAll {
        fn may_evict(&mut self, _key: &u32, _meta: &HolderMeta, _payload: &[u8]) -> bool {
            true
        }
        fn evicted(&mut self, key: u32, _meta: HolderMeta, _payload: Bytes) {
            self.evicted.push(key);
        }
    }

    struct RefuseAll;

    impl EvictionHooks<u32> for RefuseAll {
        fn may_evict(&mut self, _key: &u32, _meta: &HolderMeta, _payload: &[u8]) -> bool {
            false
        }
        fn evicted(&mut self, _key: u32, _meta: HolderMeta, _payload: Bytes) {
            unreachable!("nothing may be evicted");
        }
    }

    fn put(map: &SegmentedMap<u32>, arena: &PageArena, key: u32, payload: &[u8]) {
        let hash = map.hash_of(&key);
        map.segment_for(hash)
            .compute(arena, &key, hash, false, |_| {
                Ok(Resolve::Install {
                    payload: Bytes::copy_from_slice(payload),
                    meta: HolderMeta::create(0, ExpiryDuration::Forever),
                    preserve_id: false,
                })
            })
            .map_err(|_| "oversize")
            .unwrap();
    }

    #[test]
    fn routes_to_one_segment_per_key() {
        let map: SegmentedMap<u32> = SegmentedMap::new(4, 8);
        let arena = PageArena::new(4096, 1 << 20);
        for key in 0..64 {
            put(&map, &arena, key, b"v");
        }
        assert_eq!(map.len(), 64);
        let per_segment: u64 = (0..map.segment_count())
            .map(|i| map.segment(i).used_slot_count())
            .sum();
        assert_eq!(per_segment, 64);
    }

    #[test]
    fn segment_count_is_normalized_to_power_of_two() {
        let map: SegmentedMap<u32> = SegmentedMap::new(3, 8);
        assert_eq!(map.segment_count(), 4);
        let map: SegmentedMap<u32> = SegmentedMap::new(0, 8);
        assert_eq!(map.segment_count(), 1);
    }

    #[test]
    fn shrink_never_evicts_the_requesting_hash() {
        let map: SegmentedMap<u32> = SegmentedMap::new(1, 8);
        let arena = PageArena::new(4096, 1 << 20);
        put(&map, &arena, 1, b"va");
        put(&map, &arena, 2, b"vb");

        let mut hooks = AllowAll {
            evicted: Vec::new(),
        };
        assert!(map.shrink_others(&arena, map.hash_of(&1), &mut hooks));
        assert_eq!(hooks.evicted, vec![2], "the requesting mapping survives");

        // Only the requesting hash remains; nothing more can shrink.
        assert!(!map.shrink_others(&arena, map.hash_of(&1), &mut hooks));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn pressure_loop_terminates_with_store_access() {
        // Arena too small for the install, nothing evictable anywhere.
        let map: SegmentedMap<u32> = SegmentedMap::new(1, 8);
        let arena = PageArena::new(64, 64);

        let pending = PendingInstall {
            key: 1,
            hash: map.hash_of(&1),
            payload: Bytes::from(vec![0u8; 60]),
            meta: HolderMeta::create(0, ExpiryDuration::Forever),
            pin: false,
            preserve_id: false,
        };
        let mut hooks = AllowAll {
            evicted: Vec::new(),
        };
        let err = map
            .install_with_pressure(&arena, pending, &mut hooks, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::StoreAccess(ref m) if m.contains("too large")));
    }

    #[test]
    fn valve_is_pulled_once_and_retried() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let map: SegmentedMap<u32> = SegmentedMap::new(1, 8);
        // One page only: the resident block starves the next allocation.
        let arena = PageArena::new(128, 128);
        put(&map, &arena, 9, b"############");

        let pulls = Arc::new(AtomicUsize::new(0));
        let pulls_in_valve = Arc::clone(&pulls);
        // The valve cannot free arena space here; it only counts pulls.
        let valve = move || {
            pulls_in_valve.fetch_add(1, Ordering::SeqCst);
        };

        let pending = PendingInstall {
            key: 1,
            hash: map.hash_of(&1),
            payload: Bytes::from(vec![0u8; 80]),
            meta: HolderMeta::create(0, ExpiryDuration::Forever),
            pin: false,
            preserve_id: false,
        };
        // The hooks refuse the resident entry, so the shrink pass vetoes
        // it, the valve fires once, and the walk then proves nothing can
        // yield.
        let err = map
            .install_with_pressure(&arena, pending, &mut RefuseAll, Some(&valve as &Valve))
            .unwrap_err();
        assert!(matches!(err, StoreError::StoreAccess(_)));
        assert_eq!(pulls.load(Ordering::SeqCst), 1);
    }
}
