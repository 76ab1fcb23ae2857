//! # Value Holder
//!
//! Lifecycle metadata for a stored value and its detached snapshot form.
//! The authoritative copy of the metadata lives in the first
//! [`META_BYTES`] of the entry's arena block; segments materialize a
//! [`HolderMeta`] from that header under the segment lock, mutate it, and
//! write it back. A [`ValueHolder`] pairs the metadata with a copy of the
//! binary payload for handoff across the tier boundary.
//!
//! ## Header Layout
//!
//! ```text
//! Block header (40 bytes, little-endian u64 fields):
//! +-------+------------+-------------+------------+---------+
//! | id:8B | created:8B | accessed:8B | expires:8B | hits:8B |
//! +-------+------------+-------------+------------+---------+
//! ```

use bytes::Bytes;
use strata_common::{ExpiryDuration, StoreError, StoreResult, ValueCodec};

/// Sentinel expiration meaning "never expire".
pub const NO_EXPIRE: u64 = u64::MAX;

/// Size of the metadata header at the front of every arena block.
pub(crate) const META_BYTES: usize = 40;

/// Lifecycle metadata of one stored entry.
///
/// All mutators are intended to run while the owning segment is
/// write-locked; the segment persists changes back into the arena block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HolderMeta {
    /// Monotonically increasing identifier, unique within the segment.
    pub id: u64,
    /// Absolute creation time in milliseconds.
    pub creation_time_ms: u64,
    /// Absolute last-access time in milliseconds.
    pub last_access_time_ms: u64,
    /// Absolute expiration time; [`NO_EXPIRE`] means never.
    pub expiration_time_ms: u64,
    /// Number of successful reads that observed this entry.
    pub hit_count: u64,
}

impl HolderMeta {
    /// Fresh metadata for a mapping created at `now` with the given
    /// lifetime. The id is assigned by the segment at install time.
    pub(crate) fn create(now: u64, duration: ExpiryDuration) -> Self {
        HolderMeta {
            id: 0,
            creation_time_ms: now,
            last_access_time_ms: now,
            expiration_time_ms: expiry_at(now, duration),
            hit_count: 0,
        }
    }

    /// Returns true once `now` has reached the expiration time.
    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration_time_ms != NO_EXPIRE && now >= self.expiration_time_ms
    }

    /// Records an access at `now` and reschedules expiration.
    ///
    /// Returns false when `duration` is zero: the entry is to be treated
    /// as just-expired and the caller must remove it.
    pub fn accessed(&mut self, now: u64, duration: ExpiryDuration) -> bool {
        self.last_access_time_ms = now;
        if duration.is_zero() {
            return false;
        }
        self.expiration_time_ms = expiry_at(now, duration);
        true
    }

    /// Copies access/expiration/hit fields from `other` iff the ids
    /// match. Returns whether the copy was applied.
    pub fn update_metadata(&mut self, other: &HolderMeta) -> bool {
        if other.id != self.id {
            return false;
        }
        self.last_access_time_ms = other.last_access_time_ms;
        self.expiration_time_ms = other.expiration_time_ms;
        self.hit_count = other.hit_count;
        true
    }

    /// Serializes the header for an arena block.
    pub(crate) fn to_bytes(&self) -> [u8; META_BYTES] {
        let mut buf = [0u8; META_BYTES];
        buf[0..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.creation_time_ms.to_le_bytes());
        buf[16..24].copy_from_slice(&self.last_access_time_ms.to_le_bytes());
        buf[24..32].copy_from_slice(&self.expiration_time_ms.to_le_bytes());
        buf[32..40].copy_from_slice(&self.hit_count.to_le_bytes());
        buf
    }

    /// Reads the header out of an arena block.
    pub(crate) fn from_bytes(buf: &[u8]) -> Self {
        let word = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i * 8..i * 8 + 8]);
            u64::from_le_bytes(b)
        };
        HolderMeta {
            id: word(0),
            creation_time_ms: word(1),
            last_access_time_ms: word(2),
            expiration_time_ms: word(3),
            hit_count: word(4),
        }
    }
}

/// Absolute expiration for a lifetime starting at `now`.
///
/// Overflow saturates to `u64::MAX`, which is the never-expire sentinel.
fn expiry_at(now: u64, duration: ExpiryDuration) -> u64 {
    match duration.as_millis() {
        None => NO_EXPIRE,
        Some(ms) => now.saturating_add(ms),
    }
}

/// Detached snapshot of a stored entry.
///
/// Handed to the upper tier on fault and consumed by `flush` and
/// `install_mapping`. The payload is a copy; the resident mapping in the
/// lower tier stays authoritative. Deserialization is deferred until
/// [`ValueHolder::value`] is called.
#[derive(Debug, Clone)]
pub struct ValueHolder {
    meta: HolderMeta,
    binary: Bytes,
}

impl ValueHolder {
    pub fn new(meta: HolderMeta, binary: Bytes) -> Self {
        ValueHolder { meta, binary }
    }

    #[inline]
    pub fn meta(&self) -> &HolderMeta {
        &self.meta
    }

    #[inline]
    pub fn meta_mut(&mut self) -> &mut HolderMeta {
        &mut self.meta
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.meta.id
    }

    /// The encoded payload this holder crossed the tier boundary with.
    #[inline]
    pub fn binary(&self) -> &Bytes {
        &self.binary
    }

    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        self.meta.is_expired(now)
    }

    /// Records an access on the detached copy; see [`HolderMeta::accessed`].
    pub fn accessed(&mut self, now: u64, duration: ExpiryDuration) -> bool {
        self.meta.accessed(now, duration)
    }

    /// Decodes the payload.
    pub fn value<V>(&self, codec: &dyn ValueCodec<V>) -> StoreResult<V> {
        codec.decode(&self.binary).map_err(StoreError::access)
    }
}
