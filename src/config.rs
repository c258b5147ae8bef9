//! Configuration management for the global throttle.

use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, ThrottleError};
use crate::ratelimit::Policy;

/// Environment variable prefix for configuration overrides.
const ENV_PREFIX: &str = "GLOBAL_THROTTLE";

/// Main configuration for the global throttle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Shared counter connection
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Status code returned on deny
    #[serde(default = "default_status_code")]
    pub status_code: u16,

    /// Local decision cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Route policies by route name
    #[serde(default)]
    pub routes: HashMap<String, Policy>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            status_code: default_status_code(),
            cache: CacheConfig::default(),
            routes: HashMap::new(),
        }
    }
}

/// Connection parameters for the shared counter store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Store host. Empty means unconfigured.
    #[serde(default)]
    pub host: String,

    /// Store port. `0` means unconfigured.
    #[serde(default)]
    pub port: u16,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Idle/read timeout in milliseconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Number of pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Upper bound on a single counter call in milliseconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            connect_timeout_ms: default_connect_timeout(),
            idle_timeout_ms: default_idle_timeout(),
            pool_size: default_pool_size(),
            call_timeout_ms: default_call_timeout(),
        }
    }
}

impl RemoteConfig {
    /// Whether a counter store has been configured at all.
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Connection URL for the store.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

fn default_status_code() -> u16 {
    429
}

fn default_connect_timeout() -> u64 {
    50
}

fn default_idle_timeout() -> u64 {
    10_000
}

fn default_pool_size() -> usize {
    50
}

fn default_call_timeout() -> u64 {
    100
}

/// Local decision cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached decisions
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Cooldowns at or below this many milliseconds are not cached
    #[serde(default = "default_min_ttl")]
    pub min_ttl_ms: u64,

    /// Cap on how long a cached deny may live, in milliseconds
    #[serde(default)]
    pub max_ttl_ms: Option<u64>,

    /// Interval between expired-entry sweeps in milliseconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            min_ttl_ms: default_min_ttl(),
            max_ttl_ms: None,
            purge_interval_ms: default_purge_interval(),
        }
    }
}

impl CacheConfig {
    pub fn min_ttl(&self) -> Duration {
        Duration::from_millis(self.min_ttl_ms)
    }

    pub fn max_ttl(&self) -> Option<Duration> {
        self.max_ttl_ms.map(Duration::from_millis)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_min_ttl() -> u64 {
    1
}

fn default_purge_interval() -> u64 {
    1_000
}

impl ThrottleConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttle configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ThrottleConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file, overridden by
    /// `GLOBAL_THROTTLE__*` environment variables.
    ///
    /// Route names are taken from the file verbatim; the environment can
    /// override every other setting but not the route table.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        let mut routes = HashMap::new();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading throttle configuration");
            let contents = std::fs::read_to_string(path)?;
            // The layered loader folds map keys to lowercase.
            routes = serde_yaml::from_str::<ThrottleConfig>(&contents)?.routes;
            builder = builder.add_source(config::File::from_str(
                &contents,
                config::FileFormat::Yaml,
            ));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: ThrottleConfig = builder.build()?.try_deserialize()?;
        config.routes = routes;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot be used.
    pub fn validate(&self) -> Result<()> {
        self.status_code()?;
        if self.remote.pool_size == 0 {
            return Err(ThrottleError::Config(
                "remote.pool_size must be greater than 0".to_string(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(ThrottleError::Config(
                "cache.capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// The denial status code.
    pub fn status_code(&self) -> Result<StatusCode> {
        StatusCode::from_u16(self.status_code).map_err(|_| {
            ThrottleError::Config(format!("invalid status_code {}", self.status_code))
        })
    }

    /// Look up a route policy by name.
    pub fn route(&self, name: &str) -> Result<&Policy> {
        self.routes
            .get(name)
            .ok_or_else(|| ThrottleError::UnknownRoute(name.to_string()))
    }
}
