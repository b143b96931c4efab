//! Admission decisions and their quota metadata.

use serde::Serialize;

use super::policy::Strategy;

/// Quota information attached to a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quota {
    /// Requests allowed per window
    pub limit: u32,
    /// Informational remaining allowance, always within `[0, limit]`
    pub remaining: u32,
    /// Unix timestamp (seconds) at which more requests become available
    pub reset: u64,
}

impl Quota {
    /// Build a quota, clamping `remaining` into `[0, limit]`.
    pub fn new(limit: u32, remaining: f64, reset: u64) -> Self {
        let remaining = remaining.floor().clamp(0.0, f64::from(limit)) as u32;
        Self {
            limit,
            remaining,
            reset,
        }
    }

    /// Seconds from `now` until `reset`, never negative.
    pub fn retry_after(&self, now: f64) -> f64 {
        (self.reset as f64 - now).max(0.0)
    }
}

/// The outcome of one rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub strategy: Strategy,
    /// `None` when the check failed open and nothing is known about the quota.
    pub quota: Option<Quota>,
}

impl Decision {
    pub fn new(allowed: bool, strategy: Strategy, quota: Quota) -> Self {
        Self {
            allowed,
            strategy,
            quota: Some(quota),
        }
    }

    /// Admit without metadata because the counter store could not be consulted.
    pub fn fail_open(strategy: Strategy) -> Self {
        Self {
            allowed: true,
            strategy,
            quota: None,
        }
    }

    pub fn is_fail_open(&self) -> bool {
        self.quota.is_none()
    }
}

/// Round a timestamp up to whole seconds so a reset never precedes `now`.
pub(crate) fn ceil_secs(at: f64) -> u64 {
    at.ceil().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_clamps_remaining() {
        assert_eq!(Quota::new(5, -3.0, 10).remaining, 0);
        assert_eq!(Quota::new(5, 9.7, 10).remaining, 5);
        assert_eq!(Quota::new(5, 2.9, 10).remaining, 2);
    }

    #[test]
    fn test_retry_after_never_negative() {
        let quota = Quota::new(5, 0.0, 100);
        assert_eq!(quota.retry_after(90.5), 9.5);
        assert_eq!(quota.retry_after(120.0), 0.0);
    }

    #[test]
    fn test_fail_open_has_no_quota() {
        let decision = Decision::fail_open(Strategy::TokenBucket);
        assert!(decision.allowed);
        assert!(decision.is_fail_open());
    }
}
