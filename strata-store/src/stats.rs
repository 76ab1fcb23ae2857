//! # Store Statistics
//!
//! Outcome enums returned by facade operations plus the relaxed atomic
//! counters behind them. Counters are observed outside any lock; exact
//! consistency with map contents is not promised, only eventual
//! agreement once in-flight operations release their segments.

use std::sync::atomic::{AtomicU64, Ordering};

/// Result of a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// A new mapping was written.
    Put,
    /// An existing live mapping was replaced.
    Replaced,
    /// The creation policy suppressed the write.
    Noop,
}

/// Result of a `remove`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    Miss,
}

/// Result of a conditional remove/replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalOutcome {
    /// The expected value matched and the mutation applied.
    Hit,
    /// A live mapping was present but did not match.
    MissPresent,
    /// No live mapping was present.
    MissAbsent,
}

/// Result of a `flush` from the upper tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Hit,
    Miss,
}

/// Per-operation outcome counters.
///
/// Field-per-counter in the accumulator pattern; each record is a single
/// relaxed `fetch_add`.
#[derive(Debug, Default)]
pub(crate) struct StoreStats {
    pub get_hit: AtomicU64,
    pub get_miss: AtomicU64,
    pub put_put: AtomicU64,
    pub put_replaced: AtomicU64,
    pub put_noop: AtomicU64,
    pub put_if_absent_put: AtomicU64,
    pub put_if_absent_hit: AtomicU64,
    pub remove_removed: AtomicU64,
    pub remove_miss: AtomicU64,
    pub conditional_remove_hit: AtomicU64,
    pub conditional_remove_miss_present: AtomicU64,
    pub conditional_remove_miss_absent: AtomicU64,
    pub replace_replaced: AtomicU64,
    pub replace_miss: AtomicU64,
    pub conditional_replace_hit: AtomicU64,
    pub conditional_replace_miss_present: AtomicU64,
    pub conditional_replace_miss_absent: AtomicU64,
    pub compute_put: AtomicU64,
    pub compute_removed: AtomicU64,
    pub compute_noop: AtomicU64,
    pub compute_if_absent_put: AtomicU64,
    pub compute_if_absent_hit: AtomicU64,
    pub compute_if_absent_noop: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
    pub get_and_fault_hit: AtomicU64,
    pub get_and_fault_miss: AtomicU64,
    pub flush_hit: AtomicU64,
    pub flush_miss: AtomicU64,
    pub compute_if_absent_and_fault: AtomicU64,
    pub invalidations: AtomicU64,
    pub get_and_removes: AtomicU64,
    pub install_mappings: AtomicU64,
}

impl StoreStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub(crate) fn operations(&self) -> OperationCounters {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        OperationCounters {
            get_hit: load(&self.get_hit),
            get_miss: load(&self.get_miss),
            put_put: load(&self.put_put),
            put_replaced: load(&self.put_replaced),
            put_noop: load(&self.put_noop),
            put_if_absent_put: load(&self.put_if_absent_put),
            put_if_absent_hit: load(&self.put_if_absent_hit),
            remove_removed: load(&self.remove_removed),
            remove_miss: load(&self.remove_miss),
            conditional_remove_hit: load(&self.conditional_remove_hit),
            conditional_remove_miss_present: load(&self.conditional_remove_miss_present),
            conditional_remove_miss_absent: load(&self.conditional_remove_miss_absent),
            replace_replaced: load(&self.replace_replaced),
            replace_miss: load(&self.replace_miss),
            conditional_replace_hit: load(&self.conditional_replace_hit),
            conditional_replace_miss_present: load(&self.conditional_replace_miss_present),
            conditional_replace_miss_absent: load(&self.conditional_replace_miss_absent),
            compute_put: load(&self.compute_put),
            compute_removed: load(&self.compute_removed),
            compute_noop: load(&self.compute_noop),
            compute_if_absent_put: load(&self.compute_if_absent_put),
            compute_if_absent_hit: load(&self.compute_if_absent_hit),
            compute_if_absent_noop: load(&self.compute_if_absent_noop),
            evictions: load(&self.evictions),
            expirations: load(&self.expirations),
            get_and_fault_hit: load(&self.get_and_fault_hit),
            get_and_fault_miss: load(&self.get_and_fault_miss),
            flush_hit: load(&self.flush_hit),
            flush_miss: load(&self.flush_miss),
            compute_if_absent_and_fault: load(&self.compute_if_absent_and_fault),
            invalidations: load(&self.invalidations),
            get_and_removes: load(&self.get_and_removes),
            install_mappings: load(&self.install_mappings),
        }
    }
}

/// Point-in-time copy of the operation counters.
#[derive(Debug, Clone, Default)]
pub struct OperationCounters {
    pub get_hit: u64,
    pub get_miss: u64,
    pub put_put: u64,
    pub put_replaced: u64,
    pub put_noop: u64,
    pub put_if_absent_put: u64,
    pub put_if_absent_hit: u64,
    pub remove_removed: u64,
    pub remove_miss: u64,
    pub conditional_remove_hit: u64,
    pub conditional_remove_miss_present: u64,
    pub conditional_remove_miss_absent: u64,
    pub replace_replaced: u64,
    pub replace_miss: u64,
    pub conditional_replace_hit: u64,
    pub conditional_replace_miss_present: u64,
    pub conditional_replace_miss_absent: u64,
    pub compute_put: u64,
    pub compute_removed: u64,
    pub compute_noop: u64,
    pub compute_if_absent_put: u64,
    pub compute_if_absent_hit: u64,
    pub compute_if_absent_noop: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub get_and_fault_hit: u64,
    pub get_and_fault_miss: u64,
    pub flush_hit: u64,
    pub flush_miss: u64,
    pub compute_if_absent_and_fault: u64,
    pub invalidations: u64,
    pub get_and_removes: u64,
    pub install_mappings: u64,
}

/// Point-in-time memory and table statistics plus operation counters.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    /// Bytes reserved in arena pages.
    pub allocated_memory: u64,
    /// Bytes held by live arena blocks (headers included).
    pub occupied_memory: u64,
    /// Bytes reserved for entry payloads.
    pub data_allocated_memory: u64,
    /// Bytes held by live entry payloads.
    pub data_occupied_memory: u64,
    /// Number of live entries.
    pub data_size: u64,
    /// Payload bytes held by pinned or vetoed entries.
    pub data_vital_memory: u64,
    /// Number of live entries, as a 64-bit count.
    pub long_size: u64,
    /// Block bytes held by pinned or vetoed entries.
    pub vital_memory: u64,
    /// Tombstoned slots across all segments.
    pub removed_slot_count: u64,
    /// Longest probe distance observed in any segment.
    pub reprobe_length: u64,
    /// Occupied slots across all segments.
    pub used_slot_count: u64,
    /// Total table slots across all segments.
    pub table_capacity: u64,
    /// Per-operation outcome counters.
    pub operations: OperationCounters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_and_snapshot() {
        let stats = StoreStats::default();
        StoreStats::bump(&stats.get_hit);
        StoreStats::bump(&stats.get_hit);
        StoreStats::add(&stats.expirations, 3);
        StoreStats::add(&stats.evictions, 0);

        let ops = stats.operations();
        assert_eq!(ops.get_hit, 2);
        assert_eq!(ops.expirations, 3);
        assert_eq!(ops.evictions, 0);
        assert_eq!(ops.get_miss, 0);
    }
}
