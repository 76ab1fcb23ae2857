//! # Segment
//!
//! One lock's worth of the store: an open-addressed hash table whose
//! slots point at arena blocks. Every operation, point reads included,
//! runs under the segment's exclusive lock so a remap closure observes
//! and replaces the current mapping atomically.
//!
//! ## Design Principles
//!
//! 1. **Tombstone Probing**: Linear probing with `Removed` markers keeps
//!    deletes O(1); rehashes purge tombstones when occupancy passes 3/4.
//! 2. **At-Most-Once Closures**: A remap closure runs exactly once. When
//!    the arena cannot take the install, the already-computed result is
//!    carried out as a [`PendingInstall`] and only the *allocation* is
//!    retried by the oversize protocol.
//! 3. **Arena-Backed Metadata**: The block header is the persisted form
//!    of the holder metadata; `Keep` resolutions write mutated metadata
//!    back before the lock is released.
//! 4. **Atomic Stat Mirrors**: Slot counters are republished to relaxed
//!    atomics before each unlock so aggregation never takes the lock.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use strata_common::StoreError;

use crate::arena::{BlockHandle, OversizeMapping, PageArena};
use crate::holder::{HolderMeta, META_BYTES};

/// Slot is held by an upper tier; the eviction scan must skip it.
pub(crate) const PINNED: u8 = 0b0000_0001;

/// The eviction policy refused this slot; the scan skips it too.
pub(crate) const VETOED: u8 = 0b0000_0010;

/// One occupied slot.
struct Slot<K> {
    hash: u64,
    key: K,
    block: BlockHandle,
    flags: u8,
}

enum Bucket<K> {
    Empty,
    Removed,
    Present(Slot<K>),
}

struct SegmentInner<K> {
    table: Vec<Bucket<K>>,
    used: usize,
    removed: usize,
    /// Longest probe distance since the last rehash.
    reprobe: usize,
    /// Eviction scan cursor.
    clock: usize,
    /// Block bytes held by pinned or vetoed slots.
    vital_bytes: u64,
    vital_count: u64,
}

/// View of the current mapping handed to a remap closure.
///
/// Metadata mutations made through `meta` are written back to the arena
/// block when the closure resolves to [`Resolve::Keep`].
pub(crate) struct EntryView<'a> {
    pub meta: &'a mut HolderMeta,
    pub payload: &'a Bytes,
    pub flags: u8,
}

/// Next state chosen by a remap closure.
pub(crate) enum Resolve {
    /// Keep the mapping; metadata mutations are persisted.
    Keep,
    /// Drop the mapping and free its block.
    Remove,
    /// Write a new mapping. `meta.id` is reassigned by the segment
    /// unless `preserve_id` is set (mapping transfer between tiers).
    Install {
        payload: Bytes,
        meta: HolderMeta,
        preserve_id: bool,
    },
}

/// Post-state of a remap.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RemapOutcome {
    /// No mapping before or after.
    Noop,
    /// Mapping kept, metadata possibly rewritten.
    Kept { meta: HolderMeta },
    /// Mapping removed.
    Removed { meta: HolderMeta },
    /// Mapping created or replaced.
    Installed { meta: HolderMeta, replaced: bool },
}

/// An install the arena rejected, carried across the oversize protocol
/// so the user closure is never re-run.
pub(crate) struct PendingInstall<K> {
    pub key: K,
    pub hash: u64,
    pub payload: Bytes,
    pub meta: HolderMeta,
    pub pin: bool,
    pub preserve_id: bool,
}

pub(crate) enum SegmentError<K> {
    /// The arena could not take the install; remediation may retry it.
    Oversize(Box<PendingInstall<K>>),
    /// The remap closure failed; nothing was applied.
    Store(StoreError),
}

/// Callbacks driving a capacity eviction.
pub(crate) trait EvictionHooks<K> {
    /// Decides whether the entry may be evicted. Runs under the segment
    /// lock; a refusal marks the slot `VETOED`.
    fn may_evict(&mut self, key: &K, meta: &HolderMeta, payload: &[u8]) -> bool;

    /// Observes a completed eviction. Runs after the lock is released.
    fn evicted(&mut self, key: K, meta: HolderMeta, payload: Bytes);
}

/// Outcome of a full-segment veto walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VetoWalk {
    /// Number of previously-unvetoed slots flipped to `VETOED`.
    Flipped(usize),
    /// A slot was already `VETOED`: the walk has looped once through.
    SawPriorVetoed,
}

#[derive(Clone, Copy)]
struct Mode {
    require_present: bool,
    require_pinned: bool,
    pin_installed: bool,
    pin_kept: bool,
}

enum Find {
    Found {
        idx: usize,
    },
    Absent {
        insert_at: usize,
        reused_tombstone: bool,
        dist: usize,
    },
}

fn find<K: Eq>(table: &[Bucket<K>], hash: u64, key: &K) -> Find {
    let mask = table.len() - 1;
    let mut idx = (hash as usize) & mask;
    let mut first_removed: Option<usize> = None;

    for dist in 0..table.len() {
        match &table[idx] {
            Bucket::Empty => {
                return Find::Absent {
                    insert_at: first_removed.unwrap_or(idx),
                    reused_tombstone: first_removed.is_some(),
                    dist,
                };
            }
            Bucket::Removed => {
                if first_removed.is_none() {
                    first_removed = Some(idx);
                }
            }
            Bucket::Present(slot) => {
                if slot.hash == hash && slot.key == *key {
                    return Find::Found { idx };
                }
            }
        }
        idx = (idx + 1) & mask;
    }

    // The growth threshold keeps at least a quarter of the table empty
    // or tombstoned, so a full wrap can only land on a tombstone.
    Find::Absent {
        insert_at: first_removed.expect("table never fully occupied"),
        reused_tombstone: true,
        dist: table.len(),
    }
}

/// Concurrent open-addressed table over the arena; one per hash stripe.
pub(crate) struct Segment<K> {
    inner: Mutex<SegmentInner<K>>,
    /// Issues strictly increasing holder ids for this segment.
    next_id: AtomicU64,
    // Lock-free stat mirrors, refreshed before each unlock.
    used_slots: AtomicU64,
    removed_slots: AtomicU64,
    reprobe_len: AtomicU64,
    table_slots: AtomicU64,
    vital_memory: AtomicU64,
    vital_entries: AtomicU64,
}

impl<K: Eq + Clone> Segment<K> {
    pub(crate) fn new(initial_capacity: usize) -> Self {
        let capacity = initial_capacity.max(8).next_power_of_two();
        let table = (0..capacity).map(|_| Bucket::Empty).collect();
        Segment {
            inner: Mutex::new(SegmentInner {
                table,
                used: 0,
                removed: 0,
                reprobe: 0,
                clock: 0,
                vital_bytes: 0,
                vital_count: 0,
            }),
            next_id: AtomicU64::new(0),
            used_slots: AtomicU64::new(0),
            removed_slots: AtomicU64::new(0),
            reprobe_len: AtomicU64::new(0),
            table_slots: AtomicU64::new(capacity as u64),
            vital_memory: AtomicU64::new(0),
            vital_entries: AtomicU64::new(0),
        }
    }

    /// Atomic remap: observe the current mapping, resolve the next one.
    pub(crate) fn compute<F>(
        &self,
        arena: &PageArena,
        key: &K,
        hash: u64,
        pin_on_install: bool,
        f: F,
    ) -> Result<RemapOutcome, SegmentError<K>>
    where
        F: FnOnce(Option<EntryView<'_>>) -> Result<Resolve, StoreError>,
    {
        self.remap(
            arena,
            key,
            hash,
            Mode {
                require_present: false,
                require_pinned: false,
                pin_installed: pin_on_install,
                pin_kept: false,
            },
            f,
            |_| false,
        )
    }

    /// Remap that pins whatever mapping remains, kept or installed.
    pub(crate) fn compute_and_pin<F>(
        &self,
        arena: &PageArena,
        key: &K,
        hash: u64,
        f: F,
    ) -> Result<RemapOutcome, SegmentError<K>>
    where
        F: FnOnce(Option<EntryView<'_>>) -> Result<Resolve, StoreError>,
    {
        self.remap(
            arena,
            key,
            hash,
            Mode {
                require_present: false,
                require_pinned: false,
                pin_installed: true,
                pin_kept: true,
            },
            f,
            |_| false,
        )
    }

    /// Remap that only runs the closure against an existing mapping.
    pub(crate) fn compute_if_present<F>(
        &self,
        arena: &PageArena,
        key: &K,
        hash: u64,
        f: F,
    ) -> Result<RemapOutcome, SegmentError<K>>
    where
        F: FnOnce(Option<EntryView<'_>>) -> Result<Resolve, StoreError>,
    {
        self.remap(
            arena,
            key,
            hash,
            Mode {
                require_present: true,
                require_pinned: false,
                pin_installed: false,
                pin_kept: false,
            },
            f,
            |_| false,
        )
    }

    /// Like [`Segment::compute_if_present`], pinning a surviving mapping.
    pub(crate) fn compute_if_present_and_pin<F>(
        &self,
        arena: &PageArena,
        key: &K,
        hash: u64,
        f: F,
    ) -> Result<RemapOutcome, SegmentError<K>>
    where
        F: FnOnce(Option<EntryView<'_>>) -> Result<Resolve, StoreError>,
    {
        self.remap(
            arena,
            key,
            hash,
            Mode {
                require_present: true,
                require_pinned: false,
                pin_installed: true,
                pin_kept: true,
            },
            f,
            |_| false,
        )
    }

    /// Remap restricted to pinned slots; `unpin_if` inspects the final
    /// metadata of a kept mapping and decides whether to unpin it.
    pub(crate) fn compute_if_pinned<F, U>(
        &self,
        arena: &PageArena,
        key: &K,
        hash: u64,
        f: F,
        unpin_if: U,
    ) -> Result<RemapOutcome, SegmentError<K>>
    where
        F: FnOnce(Option<EntryView<'_>>) -> Result<Resolve, StoreError>,
        U: FnOnce(&HolderMeta) -> bool,
    {
        self.remap(
            arena,
            key,
            hash,
            Mode {
                require_present: true,
                require_pinned: true,
                pin_installed: false,
                pin_kept: false,
            },
            f,
            unpin_if,
        )
    }

    fn remap<F, U>(
        &self,
        arena: &PageArena,
        key: &K,
        hash: u64,
        mode: Mode,
        f: F,
        unpin_if: U,
    ) -> Result<RemapOutcome, SegmentError<K>>
    where
        F: FnOnce(Option<EntryView<'_>>) -> Result<Resolve, StoreError>,
        U: FnOnce(&HolderMeta) -> bool,
    {
        let mut inner = self.inner.lock();
        match find(&inner.table, hash, key) {
            Find::Found { idx } => {
                let (block, flags) = match &inner.table[idx] {
                    Bucket::Present(slot) => (slot.block, slot.flags),
                    _ => unreachable!("find returned an occupied slot"),
                };
                if mode.require_pinned && flags & PINNED == 0 {
                    self.publish(&inner);
                    return Ok(RemapOutcome::Noop);
                }

                let (mut meta, payload) = arena.read(block, |b| {
                    (
                        HolderMeta::from_bytes(&b[..META_BYTES]),
                        Bytes::copy_from_slice(&b[META_BYTES..]),
                    )
                });
                let resolve = f(Some(EntryView {
                    meta: &mut meta,
                    payload: &payload,
                    flags,
                }))
                .map_err(SegmentError::Store)?;

                match resolve {
                    Resolve::Keep => {
                        arena.write(block, |b| {
                            b[..META_BYTES].copy_from_slice(&meta.to_bytes())
                        });
                        let mut final_flags = flags;
                        if mode.pin_kept {
                            final_flags |= PINNED;
                        }
                        if final_flags & PINNED != 0 && unpin_if(&meta) {
                            final_flags &= !PINNED;
                        }
                        if final_flags != flags {
                            self.set_flags(&mut inner, idx, final_flags);
                        }
                        self.publish(&inner);
                        Ok(RemapOutcome::Kept { meta })
                    }
                    Resolve::Remove => {
                        self.remove_at(&mut inner, arena, idx);
                        self.publish(&inner);
                        Ok(RemapOutcome::Removed { meta })
                    }
                    Resolve::Install {
                        payload: new_payload,
                        meta: new_meta,
                        preserve_id,
                    } => {
                        match self.replace_block(
                            &mut inner,
                            arena,
                            idx,
                            &new_payload,
                            new_meta,
                            preserve_id,
                            mode.pin_installed,
                        ) {
                            Ok(meta) => {
                                self.publish(&inner);
                                Ok(RemapOutcome::Installed {
                                    meta,
                                    replaced: true,
                                })
                            }
                            Err(OversizeMapping) => {
                                let key = match &inner.table[idx] {
                                    Bucket::Present(slot) => slot.key.clone(),
                                    _ => unreachable!("slot untouched on failed allocation"),
                                };
                                self.publish(&inner);
                                Err(SegmentError::Oversize(Box::new(PendingInstall {
                                    key,
                                    hash,
                                    payload: new_payload,
                                    meta: new_meta,
                                    pin: mode.pin_installed,
                                    preserve_id,
                                })))
                            }
                        }
                    }
                }
            }
            Find::Absent { .. } => {
                if mode.require_present {
                    self.publish(&inner);
                    return Ok(RemapOutcome::Noop);
                }
                let resolve = f(None).map_err(SegmentError::Store)?;
                match resolve {
                    Resolve::Keep | Resolve::Remove => {
                        self.publish(&inner);
                        Ok(RemapOutcome::Noop)
                    }
                    Resolve::Install {
                        payload,
                        meta,
                        preserve_id,
                    } => {
                        match self.insert_block(
                            &mut inner,
                            arena,
                            key.clone(),
                            hash,
                            &payload,
                            meta,
                            preserve_id,
                            mode.pin_installed,
                        ) {
                            Ok(meta) => {
                                self.publish(&inner);
                                Ok(RemapOutcome::Installed {
                                    meta,
                                    replaced: false,
                                })
                            }
                            Err((key, OversizeMapping)) => {
                                self.publish(&inner);
                                Err(SegmentError::Oversize(Box::new(PendingInstall {
                                    key,
                                    hash,
                                    payload,
                                    meta,
                                    pin: mode.pin_installed,
                                    preserve_id,
                                })))
                            }
                        }
                    }
                }
            }
        }
    }

    /// Re-attempts an install the arena previously rejected.
    ///
    /// The remap closure already ran; this only reinstates its result,
    /// replacing whatever the slot holds by now.
    pub(crate) fn install_prepared(
        &self,
        arena: &PageArena,
        pending: PendingInstall<K>,
    ) -> Result<RemapOutcome, Box<PendingInstall<K>>> {
        let PendingInstall {
            key,
            hash,
            payload,
            meta,
            pin,
            preserve_id,
        } = pending;

        let mut inner = self.inner.lock();
        let result = match find(&inner.table, hash, &key) {
            Find::Found { idx } => self
                .replace_block(&mut inner, arena, idx, &payload, meta, preserve_id, pin)
                .map(|meta| RemapOutcome::Installed {
                    meta,
                    replaced: true,
                })
                .map_err(|OversizeMapping| key.clone()),
            Find::Absent { .. } => self
                .insert_block(
                    &mut inner,
                    arena,
                    key.clone(),
                    hash,
                    &payload,
                    meta,
                    preserve_id,
                    pin,
                )
                .map(|meta| RemapOutcome::Installed {
                    meta,
                    replaced: false,
                })
                .map_err(|(key, OversizeMapping)| key),
        };
        self.publish(&inner);

        result.map_err(|key| {
            Box::new(PendingInstall {
                key,
                hash,
                payload,
                meta,
                pin,
                preserve_id,
            })
        })
    }

    /// Evicts the first unpinned, unvetoed entry the hooks allow,
    /// skipping slots carrying `exclude_hash` (the mapping the caller is
    /// trying to install can never make room for itself).
    ///
    /// Scans from a wrapping cursor so pressure spreads over the table.
    /// Refused entries are marked `VETOED` and skipped on later scans.
    pub(crate) fn try_evict_one(
        &self,
        arena: &PageArena,
        exclude_hash: Option<u64>,
        hooks: &mut dyn EvictionHooks<K>,
    ) -> bool {
        let victim = {
            let mut inner = self.inner.lock();
            let cap = inner.table.len();
            let start = inner.clock;
            let mut victim = None;

            for step in 0..cap {
                let idx = (start + step) & (cap - 1);
                let block = match &inner.table[idx] {
                    Bucket::Present(slot)
                        if slot.flags & (PINNED | VETOED) == 0
                            && exclude_hash != Some(slot.hash) =>
                    {
                        slot.block
                    }
                    _ => continue,
                };
                let (meta, payload) = arena.read(block, |b| {
                    (
                        HolderMeta::from_bytes(&b[..META_BYTES]),
                        Bytes::copy_from_slice(&b[META_BYTES..]),
                    )
                });

                let allowed = {
                    let slot = match &inner.table[idx] {
                        Bucket::Present(slot) => slot,
                        _ => unreachable!("slot pinned under the lock"),
                    };
                    hooks.may_evict(&slot.key, &meta, &payload)
                };

                if allowed {
                    let slot = self.remove_at(&mut inner, arena, idx);
                    inner.clock = (idx + 1) & (cap - 1);
                    victim = Some((slot, meta, payload));
                    break;
                }

                let newly_flagged = {
                    let slot = match &mut inner.table[idx] {
                        Bucket::Present(slot) => slot,
                        _ => unreachable!("slot pinned under the lock"),
                    };
                    let was_clean = slot.flags == 0;
                    slot.flags |= VETOED;
                    was_clean
                };
                if newly_flagged {
                    inner.vital_bytes += block.len() as u64;
                    inner.vital_count += 1;
                }
            }
            self.publish(&inner);
            victim
        };

        match victim {
            Some((key, meta, payload)) => {
                hooks.evicted(key, meta, payload);
                true
            }
            None => false,
        }
    }

    /// Read-and-sets `VETOED` on every occupied slot.
    ///
    /// Stops at the first slot whose prior value was already vetoed,
    /// which means a previous walk covered this segment and nothing new
    /// can be flagged.
    pub(crate) fn veto_walk(&self) -> VetoWalk {
        let mut inner = self.inner.lock();
        let mut flipped = 0;

        for idx in 0..inner.table.len() {
            let flip = match &mut inner.table[idx] {
                Bucket::Present(slot) => {
                    if slot.flags & VETOED != 0 {
                        None
                    } else {
                        let was_clean = slot.flags == 0;
                        slot.flags |= VETOED;
                        Some((slot.block.len() as u64, was_clean))
                    }
                }
                _ => continue,
            };
            match flip {
                None => {
                    self.publish(&inner);
                    return VetoWalk::SawPriorVetoed;
                }
                Some((len, was_clean)) => {
                    if was_clean {
                        inner.vital_bytes += len;
                        inner.vital_count += 1;
                    }
                    flipped += 1;
                }
            }
        }
        self.publish(&inner);
        VetoWalk::Flipped(flipped)
    }

    /// Removes every expired entry, returning them for event emission.
    pub(crate) fn purge_expired(
        &self,
        arena: &PageArena,
        now: u64,
    ) -> Vec<(K, HolderMeta, Bytes)> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();

        for idx in 0..inner.table.len() {
            let expired = match &inner.table[idx] {
                Bucket::Present(slot) => {
                    let meta =
                        arena.read(slot.block, |b| HolderMeta::from_bytes(&b[..META_BYTES]));
                    meta.is_expired(now).then_some((meta, slot.block))
                }
                _ => None,
            };
            if let Some((meta, block)) = expired {
                let payload =
                    arena.read(block, |b| Bytes::copy_from_slice(&b[META_BYTES..]));
                let key = self.remove_at(&mut inner, arena, idx);
                out.push((key, meta, payload));
            }
        }
        self.publish(&inner);
        out
    }

    /// Frees every block and resets the table to empty.
    pub(crate) fn clear(&self, arena: &PageArena) {
        let mut inner = self.inner.lock();
        for idx in 0..inner.table.len() {
            let old = std::mem::replace(&mut inner.table[idx], Bucket::Empty);
            if let Bucket::Present(slot) = old {
                arena.free(slot.block);
            }
        }
        inner.used = 0;
        inner.removed = 0;
        inner.reprobe = 0;
        inner.clock = 0;
        inner.vital_bytes = 0;
        inner.vital_count = 0;
        self.publish(&inner);
    }

    /// Copies out every live entry; expired entries are skipped but left
    /// in place for the next remap or sweep to collect.
    pub(crate) fn snapshot_entries(&self, arena: &PageArena, now: u64) -> Vec<(K, Bytes)> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.used);
        for bucket in &inner.table {
            if let Bucket::Present(slot) = bucket {
                let (meta, payload) = arena.read(slot.block, |b| {
                    (
                        HolderMeta::from_bytes(&b[..META_BYTES]),
                        Bytes::copy_from_slice(&b[META_BYTES..]),
                    )
                });
                if !meta.is_expired(now) {
                    out.push((slot.key.clone(), payload));
                }
            }
        }
        out
    }

    // -- stat mirrors --------------------------------------------------

    #[inline]
    pub(crate) fn used_slot_count(&self) -> u64 {
        self.used_slots.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn removed_slot_count(&self) -> u64 {
        self.removed_slots.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn reprobe_length(&self) -> u64 {
        self.reprobe_len.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn table_capacity(&self) -> u64 {
        self.table_slots.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn vital_memory(&self) -> u64 {
        self.vital_memory.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn vital_entries(&self) -> u64 {
        self.vital_entries.load(Ordering::Relaxed)
    }

    // -- internals -----------------------------------------------------

    fn assign_id(&self, meta: &mut HolderMeta, preserve_id: bool) {
        if preserve_id {
            self.next_id.fetch_max(meta.id, Ordering::Relaxed);
        } else {
            meta.id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        }
    }

    /// Tombstones `idx`, frees its block, and returns the key.
    fn remove_at(&self, inner: &mut SegmentInner<K>, arena: &PageArena, idx: usize) -> K {
        let old = std::mem::replace(&mut inner.table[idx], Bucket::Removed);
        let slot = match old {
            Bucket::Present(slot) => slot,
            _ => unreachable!("remove_at targets occupied slots"),
        };
        arena.free(slot.block);
        inner.used -= 1;
        inner.removed += 1;
        if slot.flags != 0 {
            inner.vital_bytes -= slot.block.len() as u64;
            inner.vital_count -= 1;
        }
        slot.key
    }

    fn set_flags(&self, inner: &mut SegmentInner<K>, idx: usize, flags: u8) {
        let (old_flags, len) = {
            let slot = match &mut inner.table[idx] {
                Bucket::Present(slot) => slot,
                _ => unreachable!("flag updates target occupied slots"),
            };
            let old = slot.flags;
            slot.flags = flags;
            (old, slot.block.len() as u64)
        };
        if old_flags == 0 && flags != 0 {
            inner.vital_bytes += len;
            inner.vital_count += 1;
        } else if old_flags != 0 && flags == 0 {
            inner.vital_bytes -= len;
            inner.vital_count -= 1;
        }
    }

    /// Swaps a new block into an occupied slot. The old block is freed
    /// only after the allocation succeeds, so a rejected install leaves
    /// the mapping untouched.
    #[allow(clippy::too_many_arguments)]
    fn replace_block(
        &self,
        inner: &mut SegmentInner<K>,
        arena: &PageArena,
        idx: usize,
        payload: &Bytes,
        mut meta: HolderMeta,
        preserve_id: bool,
        pin: bool,
    ) -> Result<HolderMeta, OversizeMapping> {
        let total = META_BYTES + payload.len();
        if total > u32::MAX as usize {
            return Err(OversizeMapping);
        }
        let new_block = arena.allocate(total as u32)?;
        self.assign_id(&mut meta, preserve_id);
        arena.write(new_block, |b| {
            b[..META_BYTES].copy_from_slice(&meta.to_bytes());
            b[META_BYTES..].copy_from_slice(payload);
        });

        let (old_block, old_flags, new_flags) = {
            let slot = match &mut inner.table[idx] {
                Bucket::Present(slot) => slot,
                _ => unreachable!("replace targets occupied slots"),
            };
            let old_block = slot.block;
            let old_flags = slot.flags;
            slot.block = new_block;
            if pin {
                slot.flags |= PINNED;
            }
            (old_block, old_flags, slot.flags)
        };
        arena.free(old_block);

        if old_flags != 0 {
            inner.vital_bytes -= old_block.len() as u64;
            inner.vital_count -= 1;
        }
        if new_flags != 0 {
            inner.vital_bytes += new_block.len() as u64;
            inner.vital_count += 1;
        }
        Ok(meta)
    }

    /// Installs into an absent slot, growing the table first if needed.
    #[allow(clippy::too_many_arguments)]
    fn insert_block(
        &self,
        inner: &mut SegmentInner<K>,
        arena: &PageArena,
        key: K,
        hash: u64,
        payload: &Bytes,
        mut meta: HolderMeta,
        preserve_id: bool,
        pin: bool,
    ) -> Result<HolderMeta, (K, OversizeMapping)> {
        let total = META_BYTES + payload.len();
        if total > u32::MAX as usize {
            return Err((key, OversizeMapping));
        }
        let block = match arena.allocate(total as u32) {
            Ok(block) => block,
            Err(err) => return Err((key, err)),
        };
        self.assign_id(&mut meta, preserve_id);
        arena.write(block, |b| {
            b[..META_BYTES].copy_from_slice(&meta.to_bytes());
            b[META_BYTES..].copy_from_slice(payload);
        });

        Self::ensure_capacity(inner);
        let (insert_at, reused) = match find(&inner.table, hash, &key) {
            Find::Absent {
                insert_at,
                reused_tombstone,
                dist,
            } => {
                inner.reprobe = inner.reprobe.max(dist);
                (insert_at, reused_tombstone)
            }
            Find::Found { .. } => unreachable!("caller verified absence"),
        };

        let flags = if pin { PINNED } else { 0 };
        inner.table[insert_at] = Bucket::Present(Slot {
            hash,
            key,
            block,
            flags,
        });
        inner.used += 1;
        if reused {
            inner.removed -= 1;
        }
        if flags != 0 {
            inner.vital_bytes += block.len() as u64;
            inner.vital_count += 1;
        }
        Ok(meta)
    }

    /// Grows (or rehashes in place to purge tombstones) past 3/4 load.
    fn ensure_capacity(inner: &mut SegmentInner<K>) {
        let cap = inner.table.len();
        if (inner.used + inner.removed + 1) * 4 <= cap * 3 {
            return;
        }
        let new_cap = if (inner.used + 1) * 2 > cap {
            cap * 2
        } else {
            cap
        };

        let old = std::mem::replace(
            &mut inner.table,
            (0..new_cap).map(|_| Bucket::Empty).collect(),
        );
        inner.removed = 0;
        inner.reprobe = 0;
        let mask = new_cap - 1;
        for bucket in old {
            if let Bucket::Present(slot) = bucket {
                let mut idx = (slot.hash as usize) & mask;
                let mut dist = 0;
                while !matches!(inner.table[idx], Bucket::Empty) {
                    idx = (idx + 1) & mask;
                    dist += 1;
                }
                inner.reprobe = inner.reprobe.max(dist);
                inner.table[idx] = Bucket::Present(slot);
            }
        }
    }

    fn publish(&self, inner: &SegmentInner<K>) {
        self.used_slots.store(inner.used as u64, Ordering::Relaxed);
        self.removed_slots
            .store(inner.removed as u64, Ordering::Relaxed);
        self.reprobe_len
            .store(inner.reprobe as u64, Ordering::Relaxed);
        self.table_slots
            .store(inner.table.len() as u64, Ordering::Relaxed);
        self.vital_memory
            .store(inner.vital_bytes, Ordering::Relaxed);
        self.vital_entries
            .store(inner.vital_count, Ordering::Relaxed);
    }
}
