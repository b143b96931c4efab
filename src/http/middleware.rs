//! Admission control middleware.
//!
//! Every request not on the bypass list is identified, matched to a policy
//! and checked against the rate limiter before it reaches the wrapped
//! service. Denied requests get a 429 with quota headers; admitted responses
//! carry the same `X-RateLimit-*` headers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::ratelimit::{
    ClientIdentifier, Decision, IdentifyClient, RateLimit, RateLimiter, RequestInfo, RuleSelector,
};

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Authenticated caller, inserted into request extensions by the
/// authentication layer that runs before admission control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Quota headers for a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset: u64,
    /// Only set on rejections
    pub retry_after: Option<u64>,
}

impl QuotaHeaders {
    /// Headers for `decision`. A fail-open decision has no quota; the policy's
    /// limit, zero remaining and one window from `now` are reported instead.
    pub fn for_decision(policy: &RateLimit, decision: &Decision, now: f64) -> Self {
        match decision.quota {
            Some(quota) => Self {
                limit: quota.limit,
                remaining: quota.remaining,
                reset: quota.reset,
                retry_after: None,
            },
            None => Self {
                limit: policy.requests(),
                remaining: 0,
                reset: (now + policy.window_secs() as f64).ceil() as u64,
                retry_after: None,
            },
        }
    }

    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset));
        if let Some(retry_after) = self.retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
        }
        headers
    }
}

#[derive(Debug, Clone, Serialize)]
struct RejectionBody {
    error: &'static str,
    message: String,
    retry_after: f64,
}

/// A request refused by admission control. Renders as a 429 response.
#[derive(Debug, Clone)]
pub struct Rejection {
    message: String,
    retry_after: f64,
    headers: QuotaHeaders,
}

impl Rejection {
    pub fn new(policy: &RateLimit, decision: &Decision, now: f64) -> Self {
        let mut headers = QuotaHeaders::for_decision(policy, decision, now);
        let retry_after = (headers.reset as f64 - now).max(0.0);
        headers.retry_after = Some(retry_after.ceil() as u64);

        Self {
            message: format!(
                "Too many requests. Limit: {} per {}s",
                headers.limit,
                policy.window_secs()
            ),
            retry_after,
            headers,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Seconds until the client may retry.
    pub fn retry_after(&self) -> f64 {
        self.retry_after
    }

    pub fn headers(&self) -> &QuotaHeaders {
        &self.headers
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let body = RejectionBody {
            error: "Rate limit exceeded",
            message: self.message,
            retry_after: self.retry_after,
        };
        (
            StatusCode::TOO_MANY_REQUESTS,
            self.headers.to_header_map(),
            Json(body),
        )
            .into_response()
    }
}

/// Everything the admission middleware needs, shared across requests.
#[derive(Clone)]
pub struct AdmissionControl {
    limiter: Arc<RateLimiter>,
    rules: Arc<RuleSelector>,
    identifier: Arc<dyn IdentifyClient>,
    bypass_paths: Arc<[String]>,
}

impl AdmissionControl {
    /// Create admission control with the default client identifier and
    /// `/health` and `/metrics` bypassed.
    pub fn new(limiter: Arc<RateLimiter>, rules: Arc<RuleSelector>) -> Self {
        Self {
            limiter,
            rules,
            identifier: Arc::new(ClientIdentifier),
            bypass_paths: Arc::from(vec!["/health".to_string(), "/metrics".to_string()]),
        }
    }

    pub fn with_identifier(mut self, identifier: Arc<dyn IdentifyClient>) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn with_bypass_paths(mut self, paths: Vec<String>) -> Self {
        self.bypass_paths = Arc::from(paths);
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn is_bypassed(&self, path: &str) -> bool {
        self.bypass_paths.iter().any(|p| p == path)
    }

    /// Check `request` against an explicit policy, bypassing the rule table.
    ///
    /// For handlers that carry their own limit in addition to, or instead of,
    /// the path-based one.
    pub async fn guard(&self, request: &RequestInfo, policy: &RateLimit) -> Result<Decision, Rejection> {
        let client_key = self.identifier.identify(request);
        let now = self.limiter.now();
        let decision = self.limiter.check_at(now, &client_key, policy).await;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(Rejection::new(policy, &decision, now))
        }
    }
}

/// Collect the request attributes used for identification and rule matching.
pub fn request_info(request: &Request) -> RequestInfo {
    let forwarded_for = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let peer_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let user_id = request
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|user| user.0.clone());

    RequestInfo {
        method: request.method().to_string(),
        path: request.uri().path().to_string(),
        peer_addr,
        forwarded_for,
        user_id,
    }
}

/// Axum middleware enforcing admission control.
///
/// Install with `axum::middleware::from_fn_with_state(control, admission_middleware)`.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn admission_middleware(
    State(control): State<AdmissionControl>,
    request: Request,
    next: Next,
) -> Response {
    if control.is_bypassed(request.uri().path()) {
        return next.run(request).await;
    }

    let info = request_info(&request);
    let client_key = control.identifier.identify(&info);
    let policy = *control.rules.select(&info.path);

    let now = control.limiter.now();
    let decision = control.limiter.check_at(now, &client_key, &policy).await;

    if !decision.allowed {
        debug!(client = %client_key, "Rejecting request");
        return Rejection::new(&policy, &decision, now).into_response();
    }

    let mut response = next.run(request).await;
    let headers = QuotaHeaders::for_decision(&policy, &decision, now).to_header_map();
    response.headers_mut().extend(headers);
    response
}
