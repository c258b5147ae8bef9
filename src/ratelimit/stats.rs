//! Gate decision counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters describing gate decisions on this node.
///
/// Cloning shares the underlying counters.
#[derive(Debug, Clone, Default)]
pub struct GateStats {
    inner: Arc<StatsInner>,
}

#[derive(Debug, Default)]
struct StatsInner {
    /// Requests admitted after consulting the counter or skipping limiting
    admitted: AtomicU64,
    /// Requests denied from the local decision cache
    denied_cached: AtomicU64,
    /// Requests denied by a fresh counter verdict
    denied_evaluated: AtomicU64,
    /// Requests admitted because the counter could not be reached
    remote_failures: AtomicU64,
    /// Deny decisions that could not be cached
    cache_write_failures: AtomicU64,
}

impl GateStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_admitted(&self) {
        self.inner.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_denied_cached(&self) {
        self.inner.denied_cached.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_denied_evaluated(&self) {
        self.inner.denied_evaluated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remote_failure(&self) {
        self.inner.remote_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_write_failure(&self) {
        self.inner
            .cache_write_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            admitted: self.inner.admitted.load(Ordering::Relaxed),
            denied_cached: self.inner.denied_cached.load(Ordering::Relaxed),
            denied_evaluated: self.inner.denied_evaluated.load(Ordering::Relaxed),
            remote_failures: self.inner.remote_failures.load(Ordering::Relaxed),
            cache_write_failures: self.inner.cache_write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`GateStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
    pub admitted: u64,
    pub denied_cached: u64,
    pub denied_evaluated: u64,
    pub remote_failures: u64,
    pub cache_write_failures: u64,
}

impl StatsSnapshot {
    /// Total denials from either source.
    pub fn denied(&self) -> u64 {
        self.denied_cached + self.denied_evaluated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let stats = GateStats::new();
        let other = stats.clone();

        stats.record_admitted();
        other.record_denied_cached();
        other.record_denied_evaluated();
        stats.record_remote_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.admitted, 1);
        assert_eq!(snapshot.denied(), 2);
        assert_eq!(snapshot.remote_failures, 1);
        assert_eq!(snapshot.cache_write_failures, 0);
    }
}
