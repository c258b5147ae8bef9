//! Per-route rate limit policy.
//!
//! A policy is produced by the routing layer when a route is (re)loaded and is
//! handed to the gate by reference for every request on that route. It is
//! never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::key::DEFAULT_KEY;

/// Rate limit policy for a single route.
///
/// Equality compares the ignore rule without regard to element order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Identifies the route's limit scope; shared by every proxy instance
    /// that talks to the same counter keyspace.
    #[serde(default)]
    pub namespace: String,

    /// Requests admitted per window. `0` disables limiting.
    #[serde(default)]
    pub limit: u64,

    /// Window size in seconds. `0` disables limiting.
    #[serde(default)]
    pub window_size: u64,

    /// Key expression evaluated per request. Empty means `$remote_addr`.
    #[serde(default)]
    pub key: String,

    /// Header-based bypass rule.
    #[serde(default)]
    pub ignored_header: IgnoreRule,
}

impl Policy {
    /// Create a policy keyed on the client address.
    pub fn new(namespace: impl Into<String>, limit: u64, window_size: u64) -> Self {
        Self {
            namespace: namespace.into(),
            limit,
            window_size,
            key: DEFAULT_KEY.to_string(),
            ignored_header: IgnoreRule::default(),
        }
    }

    /// Replace the key expression.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Replace the ignore rule.
    pub fn with_ignored_header(mut self, rule: IgnoreRule) -> Self {
        self.ignored_header = rule;
        self
    }

    /// The window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_size)
    }

    /// The effective key expression.
    pub fn key_expression(&self) -> &str {
        if self.key.is_empty() {
            DEFAULT_KEY
        } else {
            &self.key
        }
    }

    /// Whether the policy itself limits anything.
    pub fn is_active(&self) -> bool {
        self.limit > 0 && self.window_size > 0
    }
}

/// Derive a namespace from a stable route identifier.
///
/// Dashes are stripped so that UUID-style identifiers stay compact in the
/// counter keyspace.
pub fn namespace_for_route(route_id: &str) -> String {
    route_id.replace('-', "")
}

/// Header name followed by the values that exempt a request.
///
/// Stored as a flat list so that it can be read straight from a
/// comma-separated annotation. A rule with fewer than two elements is
/// malformed and never exempts anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IgnoreRule(Vec<String>);

impl IgnoreRule {
    /// Build a rule from a header name and its bypass values.
    pub fn new<I, V>(header: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let mut elements = vec![header.into()];
        elements.extend(values.into_iter().map(Into::into));
        Self(elements)
    }

    /// Build a rule from the raw list form, trimming whitespace.
    pub fn from_elements<I, V>(elements: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: AsRef<str>,
    {
        Self(
            elements
                .into_iter()
                .map(|e| e.as_ref().trim().to_string())
                .collect(),
        )
    }

    /// Whether the rule names a header and at least one value.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() >= 2
    }

    /// The header name, if the rule is well formed.
    pub fn header(&self) -> Option<&str> {
        if self.is_well_formed() {
            self.0.first().map(String::as_str)
        } else {
            None
        }
    }

    /// The bypass values.
    pub fn values(&self) -> &[String] {
        if self.is_well_formed() {
            &self.0[1..]
        } else {
            &[]
        }
    }

    /// The raw elements.
    pub fn elements(&self) -> &[String] {
        &self.0
    }
}

impl PartialEq for IgnoreRule {
    /// Order-insensitive comparison of the elements.
    fn eq(&self, other: &Self) -> bool {
        if self.0.len() != other.0.len() {
            return false;
        }
        let mut left: Vec<&String> = self.0.iter().collect();
        let mut right: Vec<&String> = other.0.iter().collect();
        left.sort();
        right.sort();
        left == right
    }
}

impl Eq for IgnoreRule {}
