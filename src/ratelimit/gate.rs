//! Per-request rate limit decision.
//!
//! The gate runs, for every request on a limited route:
//!
//! 1. the enabled check (counter configured, policy active, not exempted),
//! 2. key resolution,
//! 3. a lookup in the local decision cache,
//! 4. on a miss, a call to the shared counter, caching any deny it returns.
//!
//! Every internal failure degrades to admitting the request. The only
//! outcome a caller has to act on is a deny.

use http::StatusCode;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::{RemoteConfig, ThrottleConfig};
use crate::counter::{CounterError, CounterWindow, RemoteCounter};
use crate::error::Result;

use super::cache::{CacheWrite, LocalDecisionCache};
use super::ignore::should_ignore;
use super::key::{self, NamespacedKey};
use super::policy::Policy;
use super::request::RequestAttributes;
use super::stats::GateStats;

/// Where a deny decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictSource {
    /// Reused from the local decision cache without calling the counter.
    Cached,
    /// Freshly computed by the shared counter.
    Evaluated,
}

impl VerdictSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictSource::Cached => "cached",
            VerdictSource::Evaluated => "evaluated",
        }
    }
}

/// Details of a deny decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    /// Status the request should be terminated with.
    pub status: StatusCode,
    pub source: VerdictSource,
    /// Counter estimate behind the decision.
    pub estimated_count: u64,
    /// How long the client should back off, when known.
    pub cooldown: Option<Duration>,
}

/// Outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Let the request through.
    Admit,
    /// Short-circuit the request.
    Deny(Denial),
    /// The counter could not be consulted; the request is let through.
    RemoteUnavailable,
}

impl Verdict {
    /// Whether the request proceeds. True for both admit variants.
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Verdict::Deny(_))
    }

    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Verdict::Deny(denial) => Some(denial),
            _ => None,
        }
    }
}

/// Tunables of the gate.
#[derive(Debug, Clone)]
pub struct GateOptions {
    /// Counter connection; an unconfigured remote disables limiting.
    pub remote: RemoteConfig,
    /// Status used to deny requests.
    pub status_code: StatusCode,
    /// Cache TTLs at or below this are not written.
    pub min_cache_ttl: Duration,
    /// Upper bound on how long a deny stays cached.
    pub max_cache_ttl: Option<Duration>,
    /// Upper bound on one counter call.
    pub call_timeout: Duration,
}

impl Default for GateOptions {
    fn default() -> Self {
        let config = ThrottleConfig::default();
        Self {
            call_timeout: config.remote.call_timeout(),
            remote: config.remote,
            status_code: StatusCode::TOO_MANY_REQUESTS,
            min_cache_ttl: config.cache.min_ttl(),
            max_cache_ttl: config.cache.max_ttl(),
        }
    }
}

impl GateOptions {
    /// Derive options from a loaded configuration.
    pub fn from_config(config: &ThrottleConfig) -> Result<Self> {
        Ok(Self {
            remote: config.remote.clone(),
            status_code: config.status_code()?,
            min_cache_ttl: config.cache.min_ttl(),
            max_cache_ttl: config.cache.max_ttl(),
            call_timeout: config.remote.call_timeout(),
        })
    }
}

/// Whether limiting applies to this request at all.
///
/// Cheap and free of side effects; runs on every request.
pub fn is_enabled<R: RequestAttributes + ?Sized>(
    remote: &RemoteConfig,
    policy: &Policy,
    request: &R,
) -> bool {
    remote.is_configured() && policy.is_active() && !should_ignore(&policy.ignored_header, request)
}

/// The per-request decision orchestrator.
///
/// Safe to share between any number of concurrent requests.
pub struct Gate {
    counter: Arc<dyn RemoteCounter>,
    cache: Arc<LocalDecisionCache>,
    options: GateOptions,
    stats: GateStats,
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("options", &self.options)
            .field("cached_decisions", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl Gate {
    /// Create a gate around a counter and a node-local cache.
    pub fn new(
        counter: Arc<dyn RemoteCounter>,
        cache: Arc<LocalDecisionCache>,
        options: GateOptions,
    ) -> Self {
        Self {
            counter,
            cache,
            options,
            stats: GateStats::new(),
        }
    }

    pub fn options(&self) -> &GateOptions {
        &self.options
    }

    pub fn cache(&self) -> &Arc<LocalDecisionCache> {
        &self.cache
    }

    pub fn stats(&self) -> &GateStats {
        &self.stats
    }

    /// Evaluate a request end to end.
    ///
    /// The request is only read before the counter call; use
    /// [`Gate::admission_key`] and [`Gate::check`] directly when the request
    /// cannot be borrowed across an await point.
    pub async fn evaluate<R: RequestAttributes + Sync + ?Sized>(
        &self,
        policy: &Policy,
        request: &R,
    ) -> Verdict {
        match self.admission_key(policy, request) {
            Some(key) => self.check(policy, &key).await,
            None => Verdict::Admit,
        }
    }

    /// Resolve the key a request is limited under, or `None` when limiting
    /// does not apply to it.
    pub fn admission_key<R: RequestAttributes + ?Sized>(
        &self,
        policy: &Policy,
        request: &R,
    ) -> Option<NamespacedKey> {
        if !is_enabled(&self.options.remote, policy, request) {
            trace!(namespace = %policy.namespace, "Rate limiting not enabled for request");
            return None;
        }

        let key_value = key::resolve(policy, request);
        Some(NamespacedKey::new(&policy.namespace, &key_value))
    }

    /// Decide on a resolved key: local cache first, then the counter.
    pub async fn check(&self, policy: &Policy, key: &NamespacedKey) -> Verdict {
        if let Some(hit) = self.cache.get(key) {
            self.stats.record_denied_cached();
            debug!(
                namespace = %key.namespace(),
                key = %key.key_value(),
                estimated_count = hit.estimated_count,
                "Rate limit exceeded (cached)"
            );
            return Verdict::Deny(Denial {
                status: self.options.status_code,
                source: VerdictSource::Cached,
                estimated_count: hit.estimated_count,
                cooldown: Some(hit.remaining),
            });
        }

        let reply = match self.call_counter(policy, key).await {
            Ok(reply) => reply,
            Err(err) => {
                self.stats.record_remote_failure();
                warn!(
                    namespace = %key.namespace(),
                    key = %key.key_value(),
                    error = %err,
                    "Rate limit counter unavailable, admitting request"
                );
                return Verdict::RemoteUnavailable;
            }
        };

        let Some(cooldown) = reply.cooldown else {
            self.stats.record_admitted();
            trace!(
                namespace = %key.namespace(),
                key = %key.key_value(),
                estimated_count = reply.estimated_count,
                "Request admitted"
            );
            return Verdict::Admit;
        };

        self.remember(key, cooldown, reply.estimated_count);
        self.stats.record_denied_evaluated();
        info!(
            namespace = %key.namespace(),
            key = %key.key_value(),
            estimated_count = reply.estimated_count,
            cooldown_ms = cooldown.as_millis() as u64,
            "Rate limit exceeded"
        );

        Verdict::Deny(Denial {
            status: self.options.status_code,
            source: VerdictSource::Evaluated,
            estimated_count: reply.estimated_count,
            cooldown: Some(cooldown),
        })
    }

    async fn call_counter(
        &self,
        policy: &Policy,
        key: &NamespacedKey,
    ) -> std::result::Result<crate::counter::CounterReply, CounterError> {
        let window = CounterWindow::new(policy.namespace.as_str(), policy.limit, policy.window())?;
        let timeout = self.options.call_timeout;
        tokio::time::timeout(timeout, self.counter.process(&window, key.key_value()))
            .await
            .map_err(|_| CounterError::Timeout(timeout))?
    }

    /// Cache a deny for the cooldown, best effort.
    fn remember(&self, key: &NamespacedKey, cooldown: Duration, estimated_count: u64) {
        let ttl = match self.options.max_cache_ttl {
            Some(max) => cooldown.min(max),
            None => cooldown,
        };

        if ttl <= self.options.min_cache_ttl {
            trace!(key = %key, ttl_us = ttl.as_micros() as u64, "Cooldown too short to cache");
            return;
        }

        match self.cache.put_if_absent(key, ttl, estimated_count) {
            Ok(CacheWrite::Inserted) => trace!(key = %key, ttl_ms = ttl.as_millis() as u64, "Cached deny"),
            Ok(CacheWrite::AlreadyExists) => trace!(key = %key, "Deny already cached"),
            Err(err) => {
                self.stats.record_cache_write_failure();
                warn!(key = %key, error = %err, "Failed to cache deny decision");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{CounterReply, MemoryStore, SlidingWindowCounter, UnavailableCounter};
    use crate::ratelimit::policy::IgnoreRule;
    use crate::ratelimit::request::RemoteAddr;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// What the mock counter does when called.
    #[derive(Debug, Clone)]
    enum Behavior {
        Reply(CounterReply),
        Fail,
        Hang,
    }

    #[derive(Debug)]
    struct MockCounter {
        behavior: Mutex<Behavior>,
        calls: AtomicUsize,
        last_key: Mutex<Option<String>>,
    }

    impl MockCounter {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior: Mutex::new(behavior),
                calls: AtomicUsize::new(0),
                last_key: Mutex::new(None),
            })
        }

        fn set(&self, behavior: Behavior) {
            *self.behavior.lock() = behavior;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteCounter for MockCounter {
        async fn process(
            &self,
            _window: &CounterWindow,
            key: &str,
        ) -> std::result::Result<CounterReply, CounterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_key.lock() = Some(key.to_string());
            let behavior = self.behavior.lock().clone();
            match behavior {
                Behavior::Reply(reply) => Ok(reply),
                Behavior::Fail => Err(CounterError::Store("connection refused".to_string())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(CounterReply::admitted(0))
                }
            }
        }
    }

    fn options() -> GateOptions {
        GateOptions {
            remote: RemoteConfig {
                host: "counters".to_string(),
                port: 11211,
                ..RemoteConfig::default()
            },
            ..GateOptions::default()
        }
    }

    fn gate_with(counter: Arc<MockCounter>, options: GateOptions) -> Gate {
        Gate::new(counter, Arc::new(LocalDecisionCache::new(128)), options)
    }

    fn policy() -> Policy {
        Policy::new("ns1", 10, 60)
    }

    fn request(addr: &str, headers: &[(&str, &str)]) -> http::Request<()> {
        let mut builder = http::Request::builder().uri("/checkout");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut request = builder.body(()).unwrap();
        request
            .extensions_mut()
            .insert(RemoteAddr(addr.parse().unwrap()));
        request
    }

    fn exceeded(count: u64, secs: u64) -> Behavior {
        Behavior::Reply(CounterReply::exceeded(count, Duration::from_secs(secs)))
    }

    #[tokio::test]
    async fn test_zero_limit_or_window_always_admits() {
        let counter = MockCounter::new(exceeded(11, 5));
        let gate = gate_with(counter.clone(), options());
        let req = request("10.0.0.1", &[]);

        assert_eq!(gate.evaluate(&Policy::new("ns1", 0, 60), &req).await, Verdict::Admit);
        assert_eq!(gate.evaluate(&Policy::new("ns1", 10, 0), &req).await, Verdict::Admit);
        assert_eq!(counter.calls(), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_remote_admits() {
        let counter = MockCounter::new(exceeded(11, 5));
        let gate = gate_with(counter.clone(), GateOptions::default());

        let verdict = gate.evaluate(&policy(), &request("10.0.0.1", &[])).await;
        assert_eq!(verdict, Verdict::Admit);
        assert_eq!(counter.calls(), 0);
    }

    #[test]
    fn test_is_enabled() {
        let remote = options().remote;
        let req = request("10.0.0.1", &[("X-Debug", "1")]);
        assert!(is_enabled(&remote, &policy(), &req));
        assert!(!is_enabled(&RemoteConfig::default(), &policy(), &req));
        assert!(!is_enabled(&remote, &Policy::new("ns1", 0, 60), &req));

        let ignoring = policy().with_ignored_header(IgnoreRule::new("X-Debug", ["1"]));
        assert!(!is_enabled(&remote, &ignoring, &req));
    }

    #[tokio::test]
    async fn test_admits_when_counter_admits() {
        let counter = MockCounter::new(Behavior::Reply(CounterReply::admitted(3)));
        let gate = gate_with(counter.clone(), options());

        let verdict = gate.evaluate(&policy(), &request("10.0.0.1", &[])).await;
        assert_eq!(verdict, Verdict::Admit);
        assert_eq!(counter.calls(), 1);
        assert_eq!(counter.last_key.lock().as_deref(), Some("10.0.0.1"));
        assert!(gate.cache().is_empty());
        assert_eq!(gate.stats().snapshot().admitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deny_is_cached_and_reused() {
        let counter = MockCounter::new(exceeded(11, 5));
        let gate = gate_with(counter.clone(), options());
        let req = request("10.0.0.1", &[]);

        // 11th request in the window: fresh deny, cached for the cooldown.
        let verdict = gate.evaluate(&policy(), &req).await;
        let denial = verdict.denial().unwrap();
        assert_eq!(denial.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denial.source, VerdictSource::Evaluated);
        assert_eq!(denial.estimated_count, 11);
        assert_eq!(denial.cooldown, Some(Duration::from_secs(5)));

        let cached = gate.cache().get(&NamespacedKey::new("ns1", "10.0.0.1")).unwrap();
        assert_eq!(cached.remaining, Duration::from_secs(5));

        // 12th request 2s later: denied from cache without calling the counter.
        tokio::time::advance(Duration::from_secs(2)).await;
        let verdict = gate.evaluate(&policy(), &req).await;
        let denial = verdict.denial().unwrap();
        assert_eq!(denial.source, VerdictSource::Cached);
        assert_eq!(denial.estimated_count, 11);
        assert_eq!(denial.cooldown, Some(Duration::from_secs(3)));
        assert_eq!(counter.calls(), 1);

        // Once the cooldown has passed the counter is consulted again.
        tokio::time::advance(Duration::from_secs(3)).await;
        counter.set(Behavior::Reply(CounterReply::admitted(4)));
        assert_eq!(gate.evaluate(&policy(), &req).await, Verdict::Admit);
        assert_eq!(counter.calls(), 2);

        let stats = gate.stats().snapshot();
        assert_eq!(stats.denied_evaluated, 1);
        assert_eq!(stats.denied_cached, 1);
        assert_eq!(stats.admitted, 1);
    }

    #[tokio::test]
    async fn test_cache_is_keyed_per_client() {
        let counter = MockCounter::new(exceeded(11, 5));
        let gate = gate_with(counter.clone(), options());

        gate.evaluate(&policy(), &request("10.0.0.1", &[])).await;
        counter.set(Behavior::Reply(CounterReply::admitted(1)));

        let verdict = gate.evaluate(&policy(), &request("10.0.0.2", &[])).await;
        assert_eq!(verdict, Verdict::Admit);
        assert_eq!(counter.calls(), 2);
    }

    #[tokio::test]
    async fn test_ignored_request_bypasses_cache_and_counter() {
        let counter = MockCounter::new(exceeded(11, 5));
        let gate = gate_with(counter.clone(), options());
        let policy = policy().with_ignored_header(IgnoreRule::new("X-Debug", ["1"]));

        // The client is over the limit...
        let verdict = gate.evaluate(&policy, &request("10.0.0.1", &[])).await;
        assert!(!verdict.is_admitted());
        assert_eq!(counter.calls(), 1);

        // ...but a request carrying the bypass header is still admitted.
        let verdict = gate
            .evaluate(&policy, &request("10.0.0.1", &[("X-Debug", "1")]))
            .await;
        assert_eq!(verdict, Verdict::Admit);
        assert_eq!(counter.calls(), 1);
    }

    #[tokio::test]
    async fn test_counter_error_fails_open_without_caching() {
        let counter = MockCounter::new(Behavior::Fail);
        let gate = gate_with(counter.clone(), options());

        let verdict = gate.evaluate(&policy(), &request("10.0.0.1", &[])).await;
        assert_eq!(verdict, Verdict::RemoteUnavailable);
        assert!(verdict.is_admitted());
        assert!(gate.cache().is_empty());
        assert_eq!(gate.stats().snapshot().remote_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_timeout_fails_open() {
        let counter = MockCounter::new(Behavior::Hang);
        let gate = gate_with(counter.clone(), options());

        let verdict = gate.evaluate(&policy(), &request("10.0.0.1", &[])).await;
        assert_eq!(verdict, Verdict::RemoteUnavailable);
        assert!(gate.cache().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_window_fails_open() {
        let counter = MockCounter::new(exceeded(11, 5));
        let gate = gate_with(counter.clone(), options());

        let verdict = gate
            .evaluate(&Policy::new("", 10, 60), &request("10.0.0.1", &[]))
            .await;
        assert_eq!(verdict, Verdict::RemoteUnavailable);
        assert_eq!(counter.calls(), 0);
    }

    #[tokio::test]
    async fn test_short_cooldown_is_not_cached() {
        let counter = MockCounter::new(Behavior::Reply(CounterReply::exceeded(
            11,
            Duration::from_micros(500),
        )));
        let gate = gate_with(counter.clone(), options());
        let req = request("10.0.0.1", &[]);

        let verdict = gate.evaluate(&policy(), &req).await;
        assert!(!verdict.is_admitted());
        assert!(gate.cache().is_empty());

        gate.evaluate(&policy(), &req).await;
        assert_eq!(counter.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_cache_ttl_caps_cached_deny() {
        let counter = MockCounter::new(exceeded(11, 300));
        let options = GateOptions {
            max_cache_ttl: Some(Duration::from_secs(2)),
            ..options()
        };
        let gate = gate_with(counter.clone(), options);
        let req = request("10.0.0.1", &[]);

        let denial = gate.evaluate(&policy(), &req).await.denial().cloned().unwrap();
        assert_eq!(denial.cooldown, Some(Duration::from_secs(300)));

        tokio::time::advance(Duration::from_secs(2)).await;
        gate.evaluate(&policy(), &req).await;
        assert_eq!(counter.calls(), 2);
    }

    #[tokio::test]
    async fn test_capped_ttl_below_minimum_is_not_cached() {
        let counter = MockCounter::new(exceeded(11, 5));
        let options = GateOptions {
            min_cache_ttl: Duration::from_millis(10),
            max_cache_ttl: Some(Duration::from_millis(5)),
            ..options()
        };
        let gate = gate_with(counter.clone(), options);

        let verdict = gate.evaluate(&policy(), &request("10.0.0.1", &[])).await;
        assert!(!verdict.is_admitted());
        assert!(gate.cache().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_window_fails_open() {
        let counter = MockCounter::new(exceeded(11, 5));
        let gate = gate_with(counter.clone(), options());

        let verdict = gate
            .evaluate(&Policy::new("ns1", 10, u64::MAX), &request("10.0.0.1", &[]))
            .await;
        assert_eq!(verdict, Verdict::RemoteUnavailable);
        assert_eq!(counter.calls(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_store_admits_every_request() {
        let gate = Gate::new(
            Arc::new(UnavailableCounter::new("connection refused")),
            Arc::new(LocalDecisionCache::new(16)),
            options(),
        );
        let req = request("10.0.0.1", &[]);

        for _ in 0..3 {
            assert_eq!(gate.evaluate(&policy(), &req).await, Verdict::RemoteUnavailable);
        }
        assert!(gate.cache().is_empty());
        assert_eq!(gate.stats().snapshot().remote_failures, 3);
    }

    #[tokio::test]
    async fn test_repeated_denies_write_cache_once() {
        let counter = MockCounter::new(exceeded(11, 5));
        let cache = Arc::new(LocalDecisionCache::new(128));
        let gate = Gate::new(counter.clone(), cache.clone(), options());
        let key = NamespacedKey::new("ns1", "10.0.0.1");

        // Two requests that both missed the cache before either wrote to it.
        assert!(!gate.check(&policy(), &key).await.is_admitted());
        let again = cache.put_if_absent(&key, Duration::from_secs(5), 11);
        assert_eq!(again, Ok(CacheWrite::AlreadyExists));
        assert_eq!(gate.stats().snapshot().cache_write_failures, 0);
    }

    #[tokio::test]
    async fn test_full_cache_still_denies() {
        let counter = MockCounter::new(exceeded(11, 5));
        let gate = Gate::new(counter.clone(), Arc::new(LocalDecisionCache::new(1)), options());

        gate.evaluate(&policy(), &request("10.0.0.1", &[])).await;
        let verdict = gate.evaluate(&policy(), &request("10.0.0.2", &[])).await;

        assert_eq!(verdict.denial().unwrap().source, VerdictSource::Evaluated);
        assert_eq!(gate.stats().snapshot().cache_write_failures, 1);
    }

    #[tokio::test]
    async fn test_custom_status_code() {
        let counter = MockCounter::new(exceeded(11, 5));
        let options = GateOptions {
            status_code: StatusCode::SERVICE_UNAVAILABLE,
            ..options()
        };
        let gate = gate_with(counter, options);

        let verdict = gate.evaluate(&policy(), &request("10.0.0.1", &[])).await;
        assert_eq!(verdict.denial().unwrap().status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_end_to_end_with_sliding_window() {
        let counter = Arc::new(SlidingWindowCounter::new(MemoryStore::new()));
        let gate = Gate::new(counter, Arc::new(LocalDecisionCache::new(128)), options());
        let policy = Policy::new("ns1", 3, 60);
        let req = request("10.0.0.1", &[]);

        for _ in 0..3 {
            assert_eq!(gate.evaluate(&policy, &req).await, Verdict::Admit);
        }
        let verdict = gate.evaluate(&policy, &req).await;
        assert!(!verdict.is_admitted());
    }
}
