//! Core rate limiter implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, trace, warn};

use super::algorithms;
use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use super::policy::{RateLimit, Strategy};
use crate::store::{CounterStore, StoreError, StoredBucket};

/// Counters describing what the limiter has decided so far.
#[derive(Debug, Default)]
pub struct LimiterStats {
    checks: AtomicU64,
    admitted: AtomicU64,
    denied: AtomicU64,
    fail_open: AtomicU64,
    corrupt_state: AtomicU64,
}

/// Point-in-time copy of [`LimiterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub checks: u64,
    pub admitted: u64,
    pub denied: u64,
    pub fail_open: u64,
    pub corrupt_state: u64,
}

impl LimiterStats {
    fn record(&self, decision: &Decision) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        if decision.allowed {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }
        if decision.is_fail_open() {
            self.fail_open.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_corrupt(&self) {
        self.corrupt_state.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            checks: self.checks.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
            corrupt_state: self.corrupt_state.load(Ordering::Relaxed),
        }
    }
}

/// The rate limiter: runs one of four strategies against a shared counter store.
///
/// A `RateLimiter` holds no per-client state of its own; everything lives in
/// the [`CounterStore`], so any number of limiters (in one process or many)
/// pointed at the same store enforce the same limits. Cheap to share behind
/// an `Arc`.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    stats: LimiterStats,
}

impl RateLimiter {
    /// Create a rate limiter using the system clock.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            stats: LimiterStats::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn stats(&self) -> &LimiterStats {
        &self.stats
    }

    /// Current time according to the limiter's clock.
    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    /// Check whether `identifier` may make one more request under `policy`.
    ///
    /// Never fails: if the counter store cannot be consulted the request is
    /// admitted (fail open) and the decision carries no quota.
    pub async fn check(&self, identifier: &str, policy: &RateLimit) -> Decision {
        let now = self.clock.now();
        self.check_at(now, identifier, policy).await
    }

    /// Like [`check`](Self::check), with `now` already read by the caller.
    pub async fn check_at(&self, now: f64, identifier: &str, policy: &RateLimit) -> Decision {
        let strategy = policy.strategy();

        trace!(
            identifier = %identifier,
            strategy = %strategy,
            requests = policy.requests(),
            window = policy.window_secs(),
            "Checking rate limit"
        );

        let result = match strategy {
            Strategy::FixedWindow => self.fixed_window(now, identifier, policy).await,
            Strategy::SlidingWindow => self.sliding_window(now, identifier, policy).await,
            Strategy::TokenBucket | Strategy::LeakyBucket => {
                self.bucket(now, identifier, policy).await
            }
        };

        let decision = match result {
            Ok(decision) => decision,
            Err(StoreError::Unavailable(reason)) => {
                warn!(
                    identifier = %identifier,
                    strategy = %strategy,
                    error = %reason,
                    "Counter store unavailable, allowing request"
                );
                Decision::fail_open(strategy)
            }
            Err(e @ StoreError::Corrupt { .. }) => {
                self.stats.record_corrupt();
                error!(
                    identifier = %identifier,
                    strategy = %strategy,
                    error = %e,
                    "Corrupt rate limit state, allowing request"
                );
                Decision::fail_open(strategy)
            }
        };

        if !decision.allowed {
            debug!(
                identifier = %identifier,
                strategy = %strategy,
                limit = policy.requests(),
                window = policy.window_secs(),
                "Rate limit exceeded"
            );
        }

        self.stats.record(&decision);
        decision
    }

    async fn fixed_window(
        &self,
        now: f64,
        identifier: &str,
        policy: &RateLimit,
    ) -> Result<Decision, StoreError> {
        let window_start = algorithms::fixed_window_start(now, policy);
        let key = format!("{}:{}", state_key(identifier, policy), window_start);
        let count = self
            .store
            .incr_with_expiry(&key, policy.window_secs())
            .await?;
        Ok(algorithms::fixed_window(count, window_start, policy))
    }

    async fn sliding_window(
        &self,
        now: f64,
        identifier: &str,
        policy: &RateLimit,
    ) -> Result<Decision, StoreError> {
        let key = state_key(identifier, policy);
        let window_start = now - policy.window_secs() as f64;
        // Unique per request so simultaneous requests are all logged.
        let member = format!("{}-{}", now, uuid::Uuid::new_v4());
        let prior = self
            .store
            .sorted_set_prune_count_add(&key, now, window_start, &member, policy.window_secs())
            .await?;
        Ok(algorithms::sliding_window(prior, now, policy))
    }

    /// Token and leaky bucket. The store applies the whole step atomically
    /// and reports the state it started from; the decision is derived from
    /// that same state, so it matches what was written.
    async fn bucket(
        &self,
        now: f64,
        identifier: &str,
        policy: &RateLimit,
    ) -> Result<Decision, StoreError> {
        let key = state_key(identifier, policy);
        let ttl = policy.window_secs().saturating_mul(2);

        let prior = match self.store.bucket_step(&key, now, policy, ttl).await? {
            StoredBucket::Corrupt(detail) => {
                self.stats.record_corrupt();
                error!(key = %key, error = %detail, "Corrupt bucket state, bucket was reset");
                None
            }
            stored => stored.state(),
        };

        let (decision, _) = algorithms::bucket(now, policy, prior);
        Ok(decision)
    }
}

/// Store key for `identifier` under `policy`: `{strategy}:{requests/window}:{identifier}`.
///
/// Policies sharing a strategy never share state.
fn state_key(identifier: &str, policy: &RateLimit) -> String {
    format!(
        "{}:{}:{}",
        policy.strategy().key_prefix(),
        policy.key_segment(),
        identifier
    )
}
