//! Tower middleware enforcing a route's rate limit policy on `http` services.
//!
//! The client address is taken from the [`RemoteAddr`](crate::ratelimit::RemoteAddr)
//! request extension, which the server inserts when it accepts the connection.

mod layer;

pub use layer::{GlobalRateLimit, GlobalRateLimitLayer, RateLimitOutcome};
