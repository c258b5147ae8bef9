use futures::future::BoxFuture;
use http::header::RETRY_AFTER;
use http::{HeaderValue, Request, Response};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

use crate::ratelimit::{Denial, Gate, Policy, Verdict, VerdictSource};

/// What the rate limiter decided for a request.
///
/// Inserted into the extensions of forwarded requests and of deny
/// responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitOutcome {
    /// Limiting did not apply to the request.
    NotLimited,
    /// Counted and admitted.
    Admitted,
    /// Admitted because the counter could not be consulted.
    RemoteUnavailable,
    /// Short-circuited.
    Denied(Denial),
}

impl RateLimitOutcome {
    /// Source of a deny, `None` for any admit.
    pub fn source(&self) -> Option<VerdictSource> {
        match self {
            RateLimitOutcome::Denied(denial) => Some(denial.source),
            _ => None,
        }
    }
}

impl From<Verdict> for RateLimitOutcome {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Admit => RateLimitOutcome::Admitted,
            Verdict::RemoteUnavailable => RateLimitOutcome::RemoteUnavailable,
            Verdict::Deny(denial) => RateLimitOutcome::Denied(denial),
        }
    }
}

/// Applies a route's [`Policy`] to every request of the wrapped service.
#[derive(Debug, Clone)]
pub struct GlobalRateLimitLayer {
    gate: Arc<Gate>,
    policy: Arc<Policy>,
}

impl GlobalRateLimitLayer {
    pub fn new(gate: Arc<Gate>, policy: Policy) -> Self {
        Self {
            gate,
            policy: Arc::new(policy),
        }
    }
}

impl<S> Layer<S> for GlobalRateLimitLayer {
    type Service = GlobalRateLimit<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GlobalRateLimit {
            inner,
            gate: Arc::clone(&self.gate),
            policy: Arc::clone(&self.policy),
        }
    }
}

/// Middleware produced by [`GlobalRateLimitLayer`].
#[derive(Debug, Clone)]
pub struct GlobalRateLimit<S> {
    inner: S,
    gate: Arc<Gate>,
    policy: Arc<Policy>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for GlobalRateLimit<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        // Resolve the key up front so the request is not borrowed across the
        // counter call.
        let key = self.gate.admission_key(&self.policy, &request);
        let gate = Arc::clone(&self.gate);
        let policy = Arc::clone(&self.policy);

        // The clone may not be ready; keep the one that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let outcome = match key {
                Some(key) => RateLimitOutcome::from(gate.check(&policy, &key).await),
                None => RateLimitOutcome::NotLimited,
            };

            if let RateLimitOutcome::Denied(denial) = &outcome {
                return Ok(deny_response(denial, outcome.clone()));
            }

            request.extensions_mut().insert(outcome);
            inner.call(request).await
        })
    }
}

fn deny_response<B: Default>(denial: &Denial, outcome: RateLimitOutcome) -> Response<B> {
    let mut response = Response::new(B::default());
    *response.status_mut() = denial.status;
    if let Some(cooldown) = denial.cooldown {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(cooldown)));
    }
    response.extensions_mut().insert(outcome);
    response
}

/// Whole seconds to wait, rounded up.
fn retry_after_secs(cooldown: Duration) -> u64 {
    let secs = cooldown.as_secs();
    if cooldown.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
