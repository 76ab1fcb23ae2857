//! # Eviction Veto
//!
//! Lets the caller protect individual entries from capacity eviction.
//! A veto only shields an entry from the eviction scan; explicit removes,
//! expiry, and invalidation still apply. A failing veto is logged by the
//! store and treated as "not vetoed".

/// Capacity-eviction refusal policy.
pub trait EvictionVeto<K, V>: Send + Sync {
    /// Returns true to refuse evicting this entry.
    fn vetoes(&self, key: &K, value: &V) -> anyhow::Result<bool>;
}

/// Default policy: nothing is vetoed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVeto;

impl<K, V> EvictionVeto<K, V> for NoVeto {
    fn vetoes(&self, _key: &K, _value: &V) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Veto driven by a plain predicate, handy in tests and small setups.
pub struct FnVeto<F>(pub F);

impl<K, V, F> EvictionVeto<K, V> for FnVeto<F>
where
    F: Fn(&K, &V) -> bool + Send + Sync,
{
    fn vetoes(&self, key: &K, value: &V) -> anyhow::Result<bool> {
        Ok((self.0)(key, value))
    }
}
