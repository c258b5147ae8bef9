//! Sliding-window counting over a keyed TTL store.
//!
//! Each key has one plain counter per fixed window, stored under
//! `namespace:key:window_id` with an expiry of two windows. The count for
//! the sliding window ending now is estimated from the previous fixed
//! window, weighted by how much of it still overlaps, plus the current
//! fixed window.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

use super::{CounterError, CounterReply, CounterWindow, RemoteCounter};

/// A shared key/value store of expiring counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current value of a counter. Missing or expired counters read as 0.
    async fn get(&self, key: &str) -> Result<u64, CounterError>;

    /// Increment a counter by one, (re)setting its expiry, and return the
    /// new value.
    async fn incr(&self, key: &str, expiry: Duration) -> Result<u64, CounterError>;
}

#[async_trait]
impl<S: CounterStore + ?Sized> CounterStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<u64, CounterError> {
        (**self).get(key).await
    }

    async fn incr(&self, key: &str, expiry: Duration) -> Result<u64, CounterError> {
        (**self).incr(key, expiry).await
    }
}

/// Wall-clock source, as time since the Unix epoch.
///
/// Every proxy instance must agree on window boundaries, so this is wall
/// time rather than a monotonic clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// Counts of the two fixed windows overlapping the sliding window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSample {
    /// Count of the previous fixed window
    pub previous: u64,
    /// Count of the current fixed window
    pub current: u64,
    /// Time elapsed since the current fixed window started
    pub elapsed: Duration,
    /// Window size
    pub size: Duration,
}

impl WindowSample {
    /// Estimated number of requests in the sliding window.
    pub fn estimate(&self) -> f64 {
        let size = self.size.as_secs_f64();
        if size == 0.0 {
            return self.current as f64;
        }
        let overlap = (size - self.elapsed.as_secs_f64()).max(0.0) / size;
        self.previous as f64 * overlap + self.current as f64
    }

    /// The estimate rounded to a whole count.
    pub fn estimated_count(&self) -> u64 {
        self.estimate().round() as u64
    }

    /// How long until the estimate drops below `limit`, or `None` if it is
    /// already below.
    ///
    /// Never longer than the rest of the current fixed window: after that
    /// the estimate has to be recomputed from fresh counts anyway.
    pub fn cooldown(&self, limit: u64) -> Option<Duration> {
        if self.estimate() < limit as f64 {
            return None;
        }

        let remaining = self.size.saturating_sub(self.elapsed);
        if self.previous == 0 || self.current >= limit {
            return Some(remaining);
        }

        // The previous window's contribution decays linearly; find when it
        // has decayed enough for the estimate to fall under the limit.
        let previous_rate = self.previous as f64 / self.size.as_secs_f64();
        let headroom = (limit - self.current) as f64 / previous_rate;
        let delay = (remaining.as_secs_f64() - headroom).clamp(0.0, remaining.as_secs_f64());
        Some(Duration::from_secs_f64(delay))
    }
}

/// [`RemoteCounter`] that runs the sliding-window estimate against a
/// shared [`CounterStore`].
pub struct SlidingWindowCounter<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S> fmt::Debug for SlidingWindowCounter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowCounter").finish_non_exhaustive()
    }
}

impl<S: CounterStore> SlidingWindowCounter<S> {
    /// Create a counter using the system wall clock.
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create a counter with a custom clock.
    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }
}

/// Store key of one fixed window's counter.
fn sample_key(window: &CounterWindow, key: &str, window_id: u64) -> String {
    format!("{}:{}:{}", window.namespace(), key, window_id)
}

#[async_trait]
impl<S: CounterStore> RemoteCounter for SlidingWindowCounter<S> {
    async fn process(&self, window: &CounterWindow, key: &str) -> Result<CounterReply, CounterError> {
        let size_ms = window.size_ms();
        let now_ms = u64::try_from(self.clock.now().as_millis()).unwrap_or(u64::MAX);
        let window_id = now_ms / size_ms;

        let current_key = sample_key(window, key, window_id);
        let (previous, current) = match window_id.checked_sub(1) {
            Some(previous_id) => {
                let previous_key = sample_key(window, key, previous_id);
                futures::try_join!(self.store.get(&previous_key), self.store.get(&current_key))?
            }
            // The first window since the epoch has no predecessor.
            None => (0, self.store.get(&current_key).await?),
        };

        let mut sample = WindowSample {
            previous,
            current,
            elapsed: Duration::from_millis(now_ms % size_ms),
            size: window.size(),
        };

        if let Some(cooldown) = sample.cooldown(window.limit()) {
            debug!(
                namespace = %window.namespace(),
                key = %key,
                estimate = sample.estimate(),
                cooldown_ms = cooldown.as_millis() as u64,
                "Sliding window exceeded"
            );
            return Ok(CounterReply::exceeded(sample.estimated_count(), cooldown));
        }

        sample.current = self.store.incr(&current_key, window.size() * 2).await?;

        trace!(
            namespace = %window.namespace(),
            key = %key,
            estimate = sample.estimate(),
            "Counted request"
        );

        Ok(CounterReply::admitted(sample.estimated_count()))
    }
}
