//! Node-local cache of recent deny decisions.
//!
//! The cache only ever holds "exceeded" verdicts. A hit short-circuits the
//! request without a round trip to the shared counter; a miss means nothing
//! more than "ask the counter". Entries expire on their own and are never
//! deleted explicitly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use super::key::NamespacedKey;

/// Cache write failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    /// No room left even after dropping expired entries.
    #[error("decision cache is full ({capacity} entries)")]
    Full { capacity: usize },
}

/// Outcome of a successful [`LocalDecisionCache::put_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    /// The entry was stored.
    Inserted,
    /// An unexpired entry for the key was already present and was kept.
    AlreadyExists,
}

/// A cached deny decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedDenial {
    /// Estimate reported by the counter when the entry was written.
    pub estimated_count: u64,
    /// Time left until the entry expires.
    pub remaining: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    expires_at: Instant,
    estimated_count: u64,
}

/// Deny-decision cache shared by every request handled on this node.
///
/// `capacity` is a hard bound: slots are reserved before an insert, so
/// concurrent writers of distinct keys cannot overshoot it.
#[derive(Debug)]
pub struct LocalDecisionCache {
    entries: DashMap<String, Slot>,
    /// Reserved slots; equal to `entries.len()` outside of an insert.
    occupied: AtomicUsize,
    capacity: usize,
}

impl LocalDecisionCache {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            occupied: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Look up an unexpired deny decision.
    pub fn get(&self, key: &NamespacedKey) -> Option<CachedDenial> {
        let now = Instant::now();
        let slot = *self.entries.get(key.as_str())?.value();

        if slot.expires_at > now {
            return Some(CachedDenial {
                estimated_count: slot.estimated_count,
                remaining: slot.expires_at - now,
            });
        }

        if self
            .entries
            .remove_if(key.as_str(), |_, slot| slot.expires_at <= now)
            .is_some()
        {
            self.release(1);
        }
        None
    }

    /// Store a deny decision unless an unexpired one already exists.
    ///
    /// Losing a race to a concurrent writer is reported as
    /// [`CacheWrite::AlreadyExists`], not as an error.
    pub fn put_if_absent(
        &self,
        key: &NamespacedKey,
        ttl: Duration,
        estimated_count: u64,
    ) -> Result<CacheWrite, CacheError> {
        let now = Instant::now();
        let slot = Slot {
            expires_at: now + ttl,
            estimated_count,
        };

        match self.entries.entry(key.as_str().to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    Ok(CacheWrite::AlreadyExists)
                } else {
                    occupied.insert(slot);
                    Ok(CacheWrite::Inserted)
                }
            }
            Entry::Vacant(vacant) => {
                // Purging takes every shard lock, so it cannot run while
                // this entry is held.
                if !self.reserve() {
                    drop(vacant);
                    self.purge_expired_at(now);
                    return self.insert_new(key, slot, now);
                }
                vacant.insert(slot);
                Ok(CacheWrite::Inserted)
            }
        }
    }

    /// Second insert attempt for a new key, after purging.
    fn insert_new(
        &self,
        key: &NamespacedKey,
        slot: Slot,
        now: Instant,
    ) -> Result<CacheWrite, CacheError> {
        match self.entries.entry(key.as_str().to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    Ok(CacheWrite::AlreadyExists)
                } else {
                    occupied.insert(slot);
                    Ok(CacheWrite::Inserted)
                }
            }
            Entry::Vacant(vacant) => {
                if !self.reserve() {
                    return Err(CacheError::Full {
                        capacity: self.capacity,
                    });
                }
                vacant.insert(slot);
                Ok(CacheWrite::Inserted)
            }
        }
    }

    /// Claim one slot, failing when the cache is at capacity.
    fn reserve(&self) -> bool {
        self.occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |occupied| {
                (occupied < self.capacity).then_some(occupied + 1)
            })
            .is_ok()
    }

    fn release(&self, slots: usize) {
        self.occupied.fetch_sub(slots, Ordering::AcqRel);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let removed = AtomicUsize::new(0);
        self.entries.retain(|_, slot| {
            let keep = slot.expires_at > now;
            if !keep {
                removed.fetch_add(1, Ordering::Relaxed);
            }
            keep
        });
        let removed = removed.into_inner();
        self.release(removed);
        removed
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Periodically purge expired entries.
    ///
    /// The task stops on its own once the cache has been dropped.
    pub fn spawn_purger(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.purge_expired();
                if removed > 0 {
                    trace!(removed = removed, "Purged expired decisions");
                }
            }
        })
    }
}
