//! Rate limit policies and throttling strategies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::FloodgateError;

/// Longest accepted window: one year.
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// The algorithm used to enforce a rate limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Counter reset at aligned window boundaries
    #[default]
    FixedWindow,
    /// Timestamp log over a moving window
    SlidingWindow,
    /// Refilling request credit
    TokenBucket,
    /// Draining request backlog
    LeakyBucket,
}

impl Strategy {
    /// Name used in decisions, logs and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::FixedWindow => "fixed_window",
            Strategy::SlidingWindow => "sliding_window",
            Strategy::TokenBucket => "token_bucket",
            Strategy::LeakyBucket => "leaky_bucket",
        }
    }

    /// Prefix for counter store keys owned by this strategy.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Strategy::FixedWindow => "fixed",
            Strategy::SlidingWindow => "sliding",
            Strategy::TokenBucket => "token",
            Strategy::LeakyBucket => "leaky",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed_window" => Ok(Strategy::FixedWindow),
            "sliding_window" => Ok(Strategy::SlidingWindow),
            "token_bucket" => Ok(Strategy::TokenBucket),
            "leaky_bucket" => Ok(Strategy::LeakyBucket),
            other => Err(FloodgateError::Config(format!(
                "unknown rate limit strategy: {}",
                other
            ))),
        }
    }
}

/// An immutable rate limit policy.
///
/// Policies are validated on construction (and on deserialization), so a
/// `RateLimit` value always has `requests > 0`, `0 < window <= MAX_WINDOW_SECS`
/// and, when set, `burst >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRateLimit")]
pub struct RateLimit {
    requests: u32,
    window: u64,
    strategy: Strategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    burst: Option<u32>,
}

/// Unvalidated policy as it appears in configuration files.
#[derive(Debug, Deserialize)]
struct RawRateLimit {
    requests: u32,
    window: u64,
    #[serde(default)]
    strategy: Strategy,
    #[serde(default)]
    burst: Option<u32>,
}

impl TryFrom<RawRateLimit> for RateLimit {
    type Error = FloodgateError;

    fn try_from(raw: RawRateLimit) -> Result<Self, Self::Error> {
        let limit = RateLimit::new(raw.requests, raw.window, raw.strategy)?;
        match raw.burst {
            Some(burst) => limit.with_burst(burst),
            None => Ok(limit),
        }
    }
}

impl RateLimit {
    /// Create a policy allowing `requests` per `window_secs` seconds.
    pub fn new(requests: u32, window_secs: u64, strategy: Strategy) -> crate::error::Result<Self> {
        if requests == 0 {
            return Err(FloodgateError::Config(
                "rate limit requests must be positive".to_string(),
            ));
        }
        if window_secs == 0 {
            return Err(FloodgateError::Config(
                "rate limit window must be positive".to_string(),
            ));
        }
        if window_secs > MAX_WINDOW_SECS {
            return Err(FloodgateError::Config(format!(
                "rate limit window of {}s exceeds the maximum of {}s",
                window_secs, MAX_WINDOW_SECS
            )));
        }
        Ok(Self {
            requests,
            window: window_secs,
            strategy,
            burst: None,
        })
    }

    /// Fixed window policy for built-in defaults. Callers guarantee non-zero arguments.
    pub(crate) const fn fixed(requests: u32, window_secs: u64) -> Self {
        Self {
            requests,
            window: window_secs,
            strategy: Strategy::FixedWindow,
            burst: None,
        }
    }

    /// Override the bucket capacity used by the token and leaky bucket strategies.
    pub fn with_burst(mut self, burst: u32) -> crate::error::Result<Self> {
        if burst == 0 {
            return Err(FloodgateError::Config(
                "rate limit burst must be at least 1".to_string(),
            ));
        }
        self.burst = Some(burst);
        Ok(self)
    }

    pub fn requests(&self) -> u32 {
        self.requests
    }

    /// Window length in seconds.
    pub fn window_secs(&self) -> u64 {
        self.window
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn burst(&self) -> Option<u32> {
        self.burst
    }

    /// Bucket capacity: `burst` if configured, otherwise `requests`.
    pub fn capacity(&self) -> f64 {
        f64::from(self.burst.unwrap_or(self.requests))
    }

    /// Steady-state rate in requests per second.
    pub fn rate(&self) -> f64 {
        f64::from(self.requests) / self.window as f64
    }

    /// Key segment that keeps this policy's counters apart from those of other
    /// policies using the same strategy: `requests/window[/burst]`.
    pub fn key_segment(&self) -> String {
        match self.burst {
            Some(burst) => format!("{}/{}/{}", self.requests, self.window, burst),
            None => format!("{}/{}", self.requests, self.window),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_zero_requests() {
        assert!(RateLimit::new(0, 60, Strategy::FixedWindow).is_err());
    }

    #[test]
    fn test_new_rejects_zero_window() {
        assert!(RateLimit::new(10, 0, Strategy::SlidingWindow).is_err());
    }

    #[test]
    fn test_new_rejects_oversized_window() {
        assert!(RateLimit::new(10, MAX_WINDOW_SECS, Strategy::TokenBucket).is_ok());
        assert!(RateLimit::new(10, MAX_WINDOW_SECS + 1, Strategy::TokenBucket).is_err());
        assert!(serde_yaml::from_str::<RateLimit>("{ requests: 5, window: 18446744073709551615 }").is_err());
    }

    #[test]
    fn test_key_segment_distinguishes_policies() {
        let auth = RateLimit::new(5, 60, Strategy::FixedWindow).unwrap();
        let default = RateLimit::new(100, 60, Strategy::FixedWindow).unwrap();
        assert_eq!(auth.key_segment(), "5/60");
        assert_ne!(auth.key_segment(), default.key_segment());

        let burst = RateLimit::new(5, 60, Strategy::TokenBucket)
            .unwrap()
            .with_burst(8)
            .unwrap();
        assert_eq!(burst.key_segment(), "5/60/8");
    }

    #[test]
    fn test_burst_must_be_positive() {
        let limit = RateLimit::new(10, 60, Strategy::TokenBucket).unwrap();
        assert!(limit.with_burst(0).is_err());
        assert_eq!(limit.with_burst(3).unwrap().burst(), Some(3));
    }

    #[test]
    fn test_capacity_defaults_to_requests() {
        let limit = RateLimit::new(60, 60, Strategy::LeakyBucket).unwrap();
        assert_eq!(limit.capacity(), 60.0);
        assert_eq!(limit.rate(), 1.0);

        let limit = limit.with_burst(10).unwrap();
        assert_eq!(limit.capacity(), 10.0);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("token_bucket".parse::<Strategy>().unwrap(), Strategy::TokenBucket);
        assert_eq!(Strategy::LeakyBucket.to_string(), "leaky_bucket");
        assert!("adaptive".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let limit: RateLimit =
            serde_yaml::from_str("{ requests: 5, window: 10, strategy: sliding_window }").unwrap();
        assert_eq!(limit.requests(), 5);
        assert_eq!(limit.strategy(), Strategy::SlidingWindow);

        let limit: RateLimit = serde_yaml::from_str("{ requests: 100, window: 60 }").unwrap();
        assert_eq!(limit.strategy(), Strategy::FixedWindow);

        assert!(serde_yaml::from_str::<RateLimit>("{ requests: 0, window: 60 }").is_err());
        assert!(serde_yaml::from_str::<RateLimit>("{ requests: 5, window: 60, burst: 0 }").is_err());
        assert!(
            serde_yaml::from_str::<RateLimit>("{ requests: 5, window: 60, strategy: gcra }").is_err()
        );
    }
}
