//! Global Throttle - Fleet-wide Request Rate Limiting
//!
//! This crate decides, per inbound HTTP request, whether a route's request
//! budget shared by every proxy instance is exhausted. Counting happens in a
//! shared sliding-window counter; deny decisions are cached on each node for
//! their cooldown so a client over its limit stops generating remote calls.
//! Every internal failure lets the request through.

pub mod config;
pub mod counter;
pub mod error;
pub mod middleware;
pub mod ratelimit;
