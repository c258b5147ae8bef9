//! Redis-backed counter store.
//!
//! Connections are held in a fixed pool of multiplexed connection managers
//! used round-robin. Each manager reconnects on its own after a failure;
//! a failed call surfaces as a [`CounterError`] and the gate fails open.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::sliding_window::CounterStore;
use super::CounterError;
use crate::config::RemoteConfig;
use crate::error::{Result, ThrottleError};

/// A [`CounterStore`] shared through Redis.
pub struct RedisStore {
    connections: Arc<Vec<ConnectionManager>>,
    next: AtomicUsize,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("pool_size", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect a pool of `remote.pool_size` connections.
    pub async fn connect(remote: &RemoteConfig) -> Result<Self> {
        if !remote.is_configured() {
            return Err(ThrottleError::Config(
                "remote host and port must be set".to_string(),
            ));
        }
        if remote.pool_size == 0 {
            return Err(ThrottleError::Config(
                "remote.pool_size must be greater than 0".to_string(),
            ));
        }

        let client = Client::open(remote.url())?;
        let deadline = connect_deadline(remote.connect_timeout());
        let mut connections = Vec::with_capacity(remote.pool_size);
        for _ in 0..remote.pool_size {
            let connect = client.get_connection_manager_with_config(manager_config(remote));
            let connection = tokio::time::timeout(deadline, connect)
                .await
                .map_err(|_| ThrottleError::ConnectTimeout(deadline))??;
            connections.push(connection);
        }

        info!(
            host = %remote.host,
            port = remote.port,
            pool_size = remote.pool_size,
            "Connected to counter store"
        );

        Self::from_connections(connections)
    }

    /// Build a store from already established connections.
    pub fn from_connections(connections: Vec<ConnectionManager>) -> Result<Self> {
        if connections.is_empty() {
            return Err(ThrottleError::Config(
                "at least one connection is required".to_string(),
            ));
        }
        Ok(Self {
            connections: Arc::new(connections),
            next: AtomicUsize::new(0),
        })
    }

    /// Number of pooled connections.
    pub fn pool_size(&self) -> usize {
        self.connections.len()
    }

    fn connection(&self) -> ConnectionManager {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.connections[index % self.connections.len()].clone()
    }
}

/// Reconnect attempts after the first failed connect.
const CONNECT_RETRIES: usize = 1;

fn manager_config(remote: &RemoteConfig) -> ConnectionManagerConfig {
    let connect_timeout = remote.connect_timeout();
    ConnectionManagerConfig::new()
        .set_connection_timeout(connect_timeout)
        .set_response_timeout(remote.idle_timeout())
        .set_number_of_retries(CONNECT_RETRIES)
        .set_max_delay(u64::try_from(connect_timeout.as_millis()).unwrap_or(u64::MAX))
}

/// Upper bound on establishing one pooled connection: every attempt plus
/// the backoff between them.
fn connect_deadline(connect_timeout: Duration) -> Duration {
    let attempts = CONNECT_RETRIES as u32 + 1;
    connect_timeout.saturating_mul(attempts * 2)
}

impl Clone for RedisStore {
    fn clone(&self) -> Self {
        Self {
            connections: Arc::clone(&self.connections),
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> std::result::Result<u64, CounterError> {
        let mut conn = self.connection();
        let value: Option<u64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn incr(&self, key: &str, expiry: Duration) -> std::result::Result<u64, CounterError> {
        let mut conn = self.connection();
        let expiry_ms = i64::try_from(expiry.as_millis()).unwrap_or(i64::MAX);

        let (value,): (u64,) = redis::pipe()
            .atomic()
            .incr(key, 1u64)
            .pexpire(key, expiry_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(key = %key, value = value, "Incremented counter");
        Ok(value)
    }
}
