//! # Expiry Policy
//!
//! Decides how long entries live. The store consults the policy at three
//! points: entry creation, successful read, and value update. Policies are
//! fallible; the store logs a failing policy and applies the documented
//! default (immediate expiry), so a broken policy can never wedge the map.

use std::time::Duration;

/// A lifetime decision returned by an [`ExpiryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryDuration {
    /// The entry never expires.
    Forever,
    /// The entry expires this long after the decision point. A zero
    /// duration means "already expired".
    Finite(Duration),
}

impl ExpiryDuration {
    /// Immediate expiry.
    pub const ZERO: ExpiryDuration = ExpiryDuration::Finite(Duration::ZERO);

    /// Returns true for the zero (expire now) duration.
    #[inline]
    pub fn is_zero(&self) -> bool {
        matches!(self, ExpiryDuration::Finite(d) if d.is_zero())
    }

    /// Duration in whole milliseconds, rounding sub-millisecond values up
    /// so a non-zero duration never collapses to an instant expiry.
    pub fn as_millis(&self) -> Option<u64> {
        match self {
            ExpiryDuration::Forever => None,
            ExpiryDuration::Finite(d) => {
                if d.is_zero() {
                    Some(0)
                } else {
                    Some(u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1))
                }
            }
        }
    }
}

/// Per-entry lifetime policy.
///
/// `for_access` and `for_update` may return `Ok(None)` to leave the
/// current expiration unchanged (or, on update, to carry the previous
/// holder's expiration forward). Errors are contained by the store and
/// treated as [`ExpiryDuration::ZERO`].
pub trait ExpiryPolicy<K, V>: Send + Sync {
    /// Lifetime of a newly created mapping. A zero duration suppresses
    /// the installation entirely.
    fn for_creation(&self, key: &K, value: &V) -> anyhow::Result<ExpiryDuration>;

    /// Lifetime extension applied when a read observes a live entry.
    fn for_access(&self, key: &K) -> anyhow::Result<Option<ExpiryDuration>>;

    /// Lifetime of an updated mapping. `old` is the value being replaced.
    fn for_update(&self, key: &K, old: Option<&V>, new: &V)
        -> anyhow::Result<Option<ExpiryDuration>>;
}

/// Entries never expire.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExpiry;

impl<K, V> ExpiryPolicy<K, V> for NoExpiry {
    fn for_creation(&self, _key: &K, _value: &V) -> anyhow::Result<ExpiryDuration> {
        Ok(ExpiryDuration::Forever)
    }

    fn for_access(&self, _key: &K) -> anyhow::Result<Option<ExpiryDuration>> {
        Ok(None)
    }

    fn for_update(
        &self,
        _key: &K,
        _old: Option<&V>,
        _new: &V,
    ) -> anyhow::Result<Option<ExpiryDuration>> {
        Ok(None)
    }
}

/// Fixed time-to-live from creation or update; reads do not extend it.
#[derive(Debug, Clone, Copy)]
pub struct TimeToLive(pub Duration);

impl<K, V> ExpiryPolicy<K, V> for TimeToLive {
    fn for_creation(&self, _key: &K, _value: &V) -> anyhow::Result<ExpiryDuration> {
        Ok(ExpiryDuration::Finite(self.0))
    }

    fn for_access(&self, _key: &K) -> anyhow::Result<Option<ExpiryDuration>> {
        Ok(None)
    }

    fn for_update(
        &self,
        _key: &K,
        _old: Option<&V>,
        _new: &V,
    ) -> anyhow::Result<Option<ExpiryDuration>> {
        Ok(Some(ExpiryDuration::Finite(self.0)))
    }
}

/// Sliding window: every touch (create, read, update) restarts the clock.
#[derive(Debug, Clone, Copy)]
pub struct TimeToIdle(pub Duration);

impl<K, V> ExpiryPolicy<K, V> for TimeToIdle {
    fn for_creation(&self, _key: &K, _value: &V) -> anyhow::Result<ExpiryDuration> {
        Ok(ExpiryDuration::Finite(self.0))
    }

    fn for_access(&self, _key: &K) -> anyhow::Result<Option<ExpiryDuration>> {
        Ok(Some(ExpiryDuration::Finite(self.0)))
    }

    fn for_update(
        &self,
        _key: &K,
        _old: Option<&V>,
        _new: &V,
    ) -> anyhow::Result<Option<ExpiryDuration>> {
        Ok(Some(ExpiryDuration::Finite(self.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_detection() {
        assert!(ExpiryDuration::ZERO.is_zero());
        assert!(!ExpiryDuration::Forever.is_zero());
        assert!(!ExpiryDuration::Finite(Duration::from_millis(1)).is_zero());
    }

    #[test]
    fn sub_millisecond_rounds_up() {
        let d = ExpiryDuration::Finite(Duration::from_nanos(100));
        assert_eq!(d.as_millis(), Some(1));
        assert_eq!(ExpiryDuration::ZERO.as_millis(), Some(0));
        assert_eq!(ExpiryDuration::Forever.as_millis(), None);
    }

    #[test]
    fn ttl_policy_shape() {
        let ttl = TimeToLive(Duration::from_secs(1));
        let created =
            <TimeToLive as ExpiryPolicy<&str, &str>>::for_creation(&ttl, &"k", &"v").unwrap();
        assert_eq!(created, ExpiryDuration::Finite(Duration::from_secs(1)));
        let accessed = <TimeToLive as ExpiryPolicy<&str, &str>>::for_access(&ttl, &"k").unwrap();
        assert_eq!(accessed, None);
    }
}
