//! Rate limiting logic: policies, strategies and rule matching.

pub mod algorithms;
mod clock;
mod decision;
mod identity;
mod limiter;
mod policy;
mod rules;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{Decision, Quota};
pub use identity::{ClientIdentifier, IdentifyClient, RequestInfo};
pub use limiter::{LimiterStats, RateLimiter, StatsSnapshot};
pub use policy::{RateLimit, Strategy, MAX_WINDOW_SECS};
pub use rules::{Category, CategoryDefaults, PathOverride, RuleSelector};
