//! Shared counter contract and its implementations.
//!
//! The gate treats the counter as an opaque dependency: it hands over a
//! window (namespace, limit, size) and a key, and gets back the current
//! estimate plus an optional cooldown. A cooldown means the window is
//! exceeded.

mod memory;
mod redis_store;
mod sliding_window;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;
pub use self::sliding_window::{Clock, CounterStore, SlidingWindowCounter, SystemClock, WindowSample};

/// Errors reported by a counter. The gate fails open on all of them.
#[derive(Debug, Error)]
pub enum CounterError {
    /// The window parameters cannot be counted against.
    #[error("invalid counter window: {0}")]
    InvalidWindow(String),

    /// The backing store failed or is unreachable.
    #[error("counter store error: {0}")]
    Store(String),

    /// The call did not complete in time.
    #[error("counter call timed out after {0:?}")]
    Timeout(Duration),
}

impl From<redis::RedisError> for CounterError {
    fn from(err: redis::RedisError) -> Self {
        CounterError::Store(err.to_string())
    }
}

/// Namespace, limit and size a key is counted against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterWindow {
    namespace: String,
    limit: u64,
    size: Duration,
    size_ms: u64,
}

impl CounterWindow {
    /// Bind a window. Fails on an empty namespace, a zero limit, a window
    /// shorter than one millisecond, or one too long to count in
    /// milliseconds.
    pub fn new(namespace: impl Into<String>, limit: u64, size: Duration) -> Result<Self, CounterError> {
        let namespace = namespace.into();
        if namespace.is_empty() {
            return Err(CounterError::InvalidWindow("namespace is empty".to_string()));
        }
        if limit == 0 {
            return Err(CounterError::InvalidWindow("limit must be positive".to_string()));
        }
        if size.as_millis() == 0 {
            return Err(CounterError::InvalidWindow(format!(
                "window size {size:?} is too small"
            )));
        }
        // Counters are kept for two windows.
        let size_ms = u64::try_from(size.as_millis())
            .ok()
            .filter(|ms| ms.checked_mul(2).is_some() && size.checked_mul(2).is_some())
            .ok_or_else(|| {
                CounterError::InvalidWindow(format!("window size {size:?} is too large"))
            })?;
        Ok(Self {
            namespace,
            limit,
            size,
            size_ms,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn size(&self) -> Duration {
        self.size
    }

    /// Window size in whole milliseconds, never zero.
    pub fn size_ms(&self) -> u64 {
        self.size_ms
    }
}

/// Result of counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterReply {
    /// Current estimate of requests in the window.
    pub estimated_count: u64,
    /// Present when the window is exceeded: how long the client should
    /// back off before it is worth asking again.
    pub cooldown: Option<Duration>,
}

impl CounterReply {
    /// A reply admitting the request.
    pub fn admitted(estimated_count: u64) -> Self {
        Self {
            estimated_count,
            cooldown: None,
        }
    }

    /// A reply reporting the window as exceeded.
    pub fn exceeded(estimated_count: u64, cooldown: Duration) -> Self {
        Self {
            estimated_count,
            cooldown: Some(cooldown),
        }
    }

    pub fn is_exceeded(&self) -> bool {
        self.cooldown.is_some()
    }
}

/// A fleet-wide counter consulted when no cached decision exists.
///
/// Implementations must be safe to call concurrently; the gate takes no
/// locks around them.
#[async_trait]
pub trait RemoteCounter: Send + Sync {
    /// Count one request for `key` against `window` and report whether the
    /// window is exceeded.
    async fn process(&self, window: &CounterWindow, key: &str) -> Result<CounterReply, CounterError>;
}

/// Stands in for a counter store that could not be reached at startup.
///
/// Every call fails, so the gate admits every request.
#[derive(Debug, Clone)]
pub struct UnavailableCounter {
    reason: String,
}

impl UnavailableCounter {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl RemoteCounter for UnavailableCounter {
    async fn process(&self, _window: &CounterWindow, _key: &str) -> Result<CounterReply, CounterError> {
        Err(CounterError::Store(self.reason.clone()))
    }
}
