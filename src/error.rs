//! Error types for the global throttle.

use thiserror::Error;

/// Main error type for configuration and setup operations.
///
/// Request-time failures never surface as this type: the gate degrades
/// them to an admit verdict.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown route requested from the configuration
    #[error("Unknown route: {0}")]
    UnknownRoute(String),

    /// Counter store setup errors
    #[error("Counter store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Counter store did not accept a connection in time
    #[error("Counter store connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for ThrottleError {
    fn from(err: config::ConfigError) -> Self {
        ThrottleError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for ThrottleError {
    fn from(err: serde_yaml::Error) -> Self {
        ThrottleError::Config(err.to_string())
    }
}

/// Result type alias for global throttle operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;
