//! The four throttling strategies as pure functions of time, policy and
//! stored state.
//!
//! Nothing here touches the counter store; [`super::RateLimiter`] performs the
//! store round trips and feeds their results through these functions.

use super::decision::{ceil_secs, Decision, Quota};
use super::policy::{RateLimit, Strategy};
use crate::store::{HashFields, StoreError};

/// Start of the aligned fixed window containing `now`, in whole seconds.
pub fn fixed_window_start(now: f64, policy: &RateLimit) -> u64 {
    let secs = now.max(0.0).floor() as u64;
    secs - secs % policy.window_secs()
}

/// Decide a fixed window check given the post-increment counter value.
///
/// Requests are counted per aligned window, so up to `2 * requests` can pass
/// within one window length when they straddle a boundary.
pub fn fixed_window(count: i64, window_start: u64, policy: &RateLimit) -> Decision {
    let requests = i64::from(policy.requests());
    let quota = Quota::new(
        policy.requests(),
        (requests - count) as f64,
        window_start.saturating_add(policy.window_secs()),
    );
    Decision::new(count <= requests, Strategy::FixedWindow, quota)
}

/// Decide a sliding window check given the number of requests already logged
/// in the trailing window (excluding this one).
pub fn sliding_window(prior_count: u64, now: f64, policy: &RateLimit) -> Decision {
    let count = prior_count + 1;
    let requests = u64::from(policy.requests());
    let quota = Quota::new(
        policy.requests(),
        requests as f64 - count as f64,
        (now + policy.window_secs() as f64).floor() as u64,
    );
    Decision::new(count <= requests, Strategy::SlidingWindow, quota)
}

/// Persisted state of a token or leaky bucket.
///
/// `level` is the token count for a token bucket and the queued volume for a
/// leaky bucket; `updated_at` is the last refill or leak time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub level: f64,
    pub updated_at: f64,
}

impl BucketState {
    /// Hash field names used by `strategy`: `[level, updated_at]`.
    pub fn field_names(strategy: Strategy) -> [&'static str; 2] {
        match strategy {
            Strategy::LeakyBucket => ["volume", "last_leak"],
            _ => ["tokens", "last_refill"],
        }
    }

    pub fn to_fields(&self, strategy: Strategy) -> HashFields {
        let [level, updated_at] = Self::field_names(strategy);
        let mut fields = HashFields::new();
        fields.insert(level.to_string(), self.level.to_string());
        fields.insert(updated_at.to_string(), self.updated_at.to_string());
        fields
    }

    /// Parse stored fields, rejecting anything the limiter could not have written.
    pub fn from_fields(key: &str, strategy: Strategy, fields: &HashFields) -> Result<Self, StoreError> {
        let [level, updated_at] = Self::field_names(strategy);
        Ok(Self {
            level: parse_field(key, fields, level)?,
            updated_at: parse_field(key, fields, updated_at)?,
        })
    }
}

fn parse_field(key: &str, fields: &HashFields, name: &str) -> Result<f64, StoreError> {
    let raw = fields
        .get(name)
        .ok_or_else(|| StoreError::corrupt(key, format!("missing field {}", name)))?;
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(value),
        _ => Err(StoreError::corrupt(
            key,
            format!("field {} holds {:?}, expected a non-negative number", name, raw),
        )),
    }
}

/// Seconds elapsed since `since`. Clock skew between instances sharing a
/// store can put `since` in the future; that counts as no time passing.
fn elapsed(now: f64, since: f64) -> f64 {
    (now - since).max(0.0)
}

/// Token bucket: credit refills at `requests / window` per second up to the
/// bucket capacity, each admitted request spends one token.
pub fn token_bucket(now: f64, policy: &RateLimit, state: Option<BucketState>) -> (Decision, BucketState) {
    let capacity = policy.capacity();
    let rate = policy.rate();

    let tokens = match state {
        None => capacity,
        Some(s) => (s.level + elapsed(now, s.updated_at) * rate).min(capacity),
    };

    let (allowed, tokens) = if tokens >= 1.0 {
        (true, tokens - 1.0)
    } else {
        (false, tokens)
    };

    let reset = if tokens >= 1.0 {
        ceil_secs(now)
    } else {
        ceil_secs(now + (1.0 - tokens) / rate)
    };

    let decision = Decision::new(
        allowed,
        Strategy::TokenBucket,
        Quota::new(policy.requests(), tokens, reset),
    );
    (
        decision,
        BucketState {
            level: tokens,
            updated_at: now,
        },
    )
}

/// Run the token or leaky bucket step for `policy`'s strategy.
pub fn bucket(now: f64, policy: &RateLimit, state: Option<BucketState>) -> (Decision, BucketState) {
    match policy.strategy() {
        Strategy::LeakyBucket => leaky_bucket(now, policy, state),
        _ => token_bucket(now, policy, state),
    }
}

/// Leaky bucket: each admitted request adds one unit of volume, which drains
/// at `requests / window` per second; requests are refused while full.
pub fn leaky_bucket(now: f64, policy: &RateLimit, state: Option<BucketState>) -> (Decision, BucketState) {
    let capacity = policy.capacity();
    let rate = policy.rate();

    let volume = match state {
        None => 0.0,
        Some(s) => (s.level - elapsed(now, s.updated_at) * rate).max(0.0),
    };

    let (allowed, volume) = if volume < capacity {
        (true, volume + 1.0)
    } else {
        (false, volume)
    };

    let overflow = volume + 1.0 - capacity;
    let reset = if overflow <= 0.0 {
        ceil_secs(now)
    } else {
        ceil_secs(now + overflow / rate)
    };

    let decision = Decision::new(
        allowed,
        Strategy::LeakyBucket,
        Quota::new(policy.requests(), capacity - volume, reset),
    );
    (
        decision,
        BucketState {
            level: volume,
            updated_at: now,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(requests: u32, window: u64, strategy: Strategy) -> RateLimit {
        RateLimit::new(requests, window, strategy).unwrap()
    }

    #[test]
    fn test_fixed_window_alignment() {
        let p = policy(5, 10, Strategy::FixedWindow);
        assert_eq!(fixed_window_start(9.9, &p), 0);
        assert_eq!(fixed_window_start(10.1, &p), 10);
        assert_eq!(fixed_window_start(1_700_000_007.0, &p), 1_700_000_000);
    }

    #[test]
    fn test_fixed_window_decision() {
        let p = policy(5, 10, Strategy::FixedWindow);

        let d = fixed_window(5, 0, &p);
        assert!(d.allowed);
        assert_eq!(d.quota.unwrap().remaining, 0);
        assert_eq!(d.quota.unwrap().reset, 10);

        let d = fixed_window(6, 0, &p);
        assert!(!d.allowed);
        assert_eq!(d.quota.unwrap().remaining, 0);
    }

    #[test]
    fn test_sliding_window_decision() {
        let p = policy(5, 10, Strategy::SlidingWindow);

        let d = sliding_window(0, 100.5, &p);
        assert!(d.allowed);
        assert_eq!(d.quota.unwrap().remaining, 4);
        assert_eq!(d.quota.unwrap().reset, 110);

        assert!(sliding_window(4, 100.5, &p).allowed);
        assert!(!sliding_window(5, 100.5, &p).allowed);
    }

    #[test]
    fn test_token_bucket_starts_full() {
        let p = policy(60, 60, Strategy::TokenBucket);
        let (d, s) = token_bucket(0.0, &p, None);
        assert!(d.allowed);
        assert_eq!(s.level, 59.0);
        assert_eq!(d.quota.unwrap().remaining, 59);
    }

    #[test]
    fn test_token_bucket_refills_at_rate() {
        let p = policy(60, 60, Strategy::TokenBucket);
        let empty = BucketState {
            level: 0.0,
            updated_at: 0.0,
        };

        let (d, s) = token_bucket(0.5, &p, Some(empty));
        assert!(!d.allowed);
        assert_eq!(s.level, 0.5);
        assert_eq!(d.quota.unwrap().reset, 1);

        let (d, s) = token_bucket(1.0, &p, Some(empty));
        assert!(d.allowed);
        assert_eq!(s.level, 0.0);
    }

    #[test]
    fn test_token_bucket_caps_at_capacity() {
        let p = policy(60, 60, Strategy::TokenBucket).with_burst(10).unwrap();
        let state = BucketState {
            level: 2.0,
            updated_at: 0.0,
        };
        let (_, s) = token_bucket(1000.0, &p, Some(state));
        assert_eq!(s.level, 9.0);
    }

    #[test]
    fn test_leaky_bucket_fills_then_drains() {
        let p = policy(60, 60, Strategy::LeakyBucket).with_burst(10).unwrap();
        let full = BucketState {
            level: 10.0,
            updated_at: 5.0,
        };

        let (d, s) = leaky_bucket(5.0, &p, Some(full));
        assert!(!d.allowed);
        assert_eq!(s.level, 10.0);
        assert_eq!(d.quota.unwrap().reset, 6);

        let (d, s) = leaky_bucket(6.0, &p, Some(full));
        assert!(d.allowed);
        assert_eq!(s.level, 10.0);
    }

    #[test]
    fn test_leaky_bucket_starts_empty() {
        let p = policy(5, 10, Strategy::LeakyBucket);
        let (d, s) = leaky_bucket(0.0, &p, None);
        assert!(d.allowed);
        assert_eq!(s.level, 1.0);
        assert_eq!(d.quota.unwrap().remaining, 4);
    }

    #[test]
    fn test_bucket_dispatches_on_strategy() {
        let token = policy(5, 10, Strategy::TokenBucket);
        assert_eq!(bucket(0.0, &token, None).1.level, 4.0);

        let leaky = policy(5, 10, Strategy::LeakyBucket);
        assert_eq!(bucket(0.0, &leaky, None).1.level, 1.0);
    }

    #[test]
    fn test_clock_skew_counts_as_no_elapsed_time() {
        let p = policy(10, 10, Strategy::TokenBucket);
        let future = BucketState {
            level: 0.0,
            updated_at: 50.0,
        };
        let (d, s) = token_bucket(40.0, &p, Some(future));
        assert!(!d.allowed);
        assert_eq!(s.level, 0.0);
    }

    #[test]
    fn test_bucket_state_fields() {
        let state = BucketState {
            level: 4.25,
            updated_at: 1_700_000_000.5,
        };
        let fields = state.to_fields(Strategy::LeakyBucket);
        assert!(fields.contains_key("volume"));
        assert!(fields.contains_key("last_leak"));
        let parsed = BucketState::from_fields("k", Strategy::LeakyBucket, &fields).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_bucket_state_rejects_garbage() {
        let mut fields = HashFields::new();
        fields.insert("tokens".to_string(), "lots".to_string());
        fields.insert("last_refill".to_string(), "12".to_string());
        let err = BucketState::from_fields("k", Strategy::TokenBucket, &fields).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));

        fields.remove("tokens");
        assert!(BucketState::from_fields("k", Strategy::TokenBucket, &fields).is_err());

        fields.insert("tokens".to_string(), "-1".to_string());
        assert!(BucketState::from_fields("k", Strategy::TokenBucket, &fields).is_err());
    }
}
