//! In-process counter store.
//!
//! Suitable for a single node or for tests. Counters live in a mutex-guarded
//! map and expire lazily.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::sliding_window::CounterStore;
use super::CounterError;

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: u64,
    expires_at: Instant,
}

/// An in-memory [`CounterStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: Mutex<HashMap<String, Counter>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired counters.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.counters.lock().retain(|_, c| c.expires_at > now);
    }

    /// Number of stored counters, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.counters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.lock().is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<u64, CounterError> {
        let now = Instant::now();
        let counters = self.counters.lock();
        Ok(counters
            .get(key)
            .filter(|c| c.expires_at > now)
            .map_or(0, |c| c.value))
    }

    async fn incr(&self, key: &str, expiry: Duration) -> Result<u64, CounterError> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(expiry)
            .ok_or_else(|| CounterError::InvalidWindow(format!("expiry {expiry:?} is too long")))?;
        let mut counters = self.counters.lock();
        let counter = counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at: now,
        });

        if counter.expires_at <= now {
            counter.value = 0;
        }
        counter.value += 1;
        counter.expires_at = expires_at;
        Ok(counter.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_counter_reads_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.get("nope").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_incr_counts_up() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("k", Duration::from_secs(10)).await.unwrap(), 1);
        assert_eq!(store.incr("k", Duration::from_secs(10)).await.unwrap(), 2);
        assert_eq!(store.get("k").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_shared_through_arc() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let value = tokio_test::assert_ok!(tokio_test::block_on(
            store.incr("k", Duration::from_secs(10))
        ));
        assert_eq!(value, 1);
        assert_eq!(tokio_test::block_on(store.get("k")).unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counters_expire() {
        let store = MemoryStore::new();
        store.incr("k", Duration::from_secs(10)).await.unwrap();
        store.incr("k", Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.get("k").await.unwrap(), 0);
        assert_eq!(store.incr("k", Duration::from_secs(10)).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.incr("short", Duration::from_secs(1)).await.unwrap();
        store.incr("long", Duration::from_secs(100)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        store.purge_expired();
        assert_eq!(store.len(), 1);
        assert!(!store.is_empty());
    }
}
