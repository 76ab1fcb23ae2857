//! # Off-Heap Authoritative Tier
//!
//! Concurrent, segmented key/value store keeping entry payloads in
//! explicitly managed arena memory, with time-based expiry, eviction
//! under memory pressure, batched change events, and the fault/flush
//! protocol an upper caching tier drives.
//!
//! ## Structure Overview
//!
//! ```text
//! OffHeapStore<K, V>
//!   ├── SegmentedMap<K>
//!   │     └── Segment (open-addressed table, one write lock each)
//!   │           └── Slot { hash, key, block, flags }
//!   │                 └── BlockHandle -> PageArena block
//!   │                       [40B holder header | encoded payload]
//!   ├── PageArena (pages + free lists, byte budget)
//!   ├── StoreEventDispatcher (per-operation EventSink)
//!   └── collaborators: TimeSource, ExpiryPolicy, EvictionVeto,
//!       ValueCodec, InvalidationListener
//! ```

mod arena;
mod events;
mod holder;
mod map;
mod segment;
mod stats;
mod tier;

pub use events::{
    EventSink, FiringMode, ListenerDispatcher, NoopDispatcher, StoreEvent, StoreEventDispatcher,
    StoreEventListener,
};
pub use holder::{HolderMeta, ValueHolder, NO_EXPIRE};
pub use stats::{
    ConditionalOutcome, FlushOutcome, OperationCounters, PutOutcome, RemoveOutcome, StatsSnapshot,
};
pub use tier::{
    InvalidationListener, NoopInvalidation, OffHeapStore, StoreBuilder, StoreIter, SweeperHandle,
};

// Re-export the collaborator contracts so most callers only need this
// crate.
pub use strata_common::{
    BytesCodec, EvictionVeto, ExpiryDuration, ExpiryPolicy, FnVeto, JsonCodec, ManualTimeSource,
    NoExpiry, NoVeto, StoreError, StoreResult, SystemTimeSource, TimeSource, TimeToIdle,
    TimeToLive, ValueCodec,
};
