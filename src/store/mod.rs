//! Counter stores backing the rate limiter.
//!
//! A [`CounterStore`] exposes the handful of atomic primitives the rate
//! limiting strategies need. Two implementations exist: [`RedisStore`], shared
//! by every process pointed at the same Redis database, and [`MemoryStore`],
//! private to one process and used when Redis cannot be reached at startup.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::ratelimit::algorithms::BucketState;
use crate::ratelimit::{Clock, RateLimit};

/// Field/value pairs of a hash entry.
pub type HashFields = BTreeMap<String, String>;

/// Errors returned by counter store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached or did not answer in time.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The store answered, but the value at `key` is not what the limiter wrote.
    #[error("corrupt counter state at {key}: {detail}")]
    Corrupt { key: String, detail: String },
}

impl StoreError {
    pub(crate) fn corrupt(key: &str, detail: impl Into<String>) -> Self {
        StoreError::Corrupt {
            key: key.to_string(),
            detail: detail.into(),
        }
    }
}

/// Bucket state as found by [`CounterStore::bucket_step`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoredBucket {
    /// No state yet; the step started from a fresh bucket.
    Absent,
    Valid(BucketState),
    /// State that could not be parsed; the step started from a fresh bucket.
    Corrupt(String),
}

impl StoredBucket {
    /// The state the step started from, `None` for a fresh bucket.
    pub fn state(&self) -> Option<BucketState> {
        match self {
            StoredBucket::Valid(state) => Some(*state),
            StoredBucket::Absent | StoredBucket::Corrupt(_) => None,
        }
    }
}

/// Atomic primitives required by the rate limiting strategies.
///
/// Every operation is a single atomic step on the store, so concurrent
/// checks against the same key stay correct without limiter-side locking.
/// TTLs are whole seconds; stores clamp values they cannot represent.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short backend name for logs and health output.
    fn name(&self) -> &'static str;

    /// Round trip to the store.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Increment the integer at `key` (created at 0 if absent), reset its
    /// expiry to `ttl_secs`, and return the incremented value.
    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> Result<i64, StoreError>;

    /// Drop members scored below `window_start`, count what is left, add
    /// `member` scored at `now`, reset expiry. Returns the count before the add.
    async fn sorted_set_prune_count_add(
        &self,
        key: &str,
        now: f64,
        window_start: f64,
        member: &str,
        ttl_secs: u64,
    ) -> Result<u64, StoreError>;

    /// Read `fields` of the hash at `key`. `None` when the hash does not exist.
    async fn hash_get(&self, key: &str, fields: &[&str]) -> Result<Option<HashFields>, StoreError>;

    /// Write `values` into the hash at `key` and reset its expiry.
    async fn hash_set_with_expiry(
        &self,
        key: &str,
        values: &HashFields,
        ttl_secs: u64,
    ) -> Result<(), StoreError>;

    /// Apply one token or leaky bucket step to the hash at `key` as a single
    /// atomic operation: read the state, refill or leak it up to `now`, spend
    /// or queue one request if there is room, write it back and reset expiry.
    ///
    /// Returns the state found before the step. Unreadable state is replaced
    /// by a fresh bucket and reported as [`StoredBucket::Corrupt`].
    async fn bucket_step(
        &self,
        key: &str,
        now: f64,
        policy: &RateLimit,
        ttl_secs: u64,
    ) -> Result<StoredBucket, StoreError>;

    /// Remove expired entries eagerly. Returns how many were removed.
    ///
    /// Stores with native expiry have nothing to do here.
    fn purge_expired(&self) -> usize {
        0
    }
}

/// Select the counter store for this process.
///
/// When Redis is configured it is probed once; if it answers it is used for
/// the lifetime of the process, otherwise the in-process memory store is.
pub async fn connect_store(config: &StoreConfig, clock: Arc<dyn Clock>) -> Arc<dyn CounterStore> {
    if let Some(ref redis_config) = config.redis {
        match RedisStore::connect(redis_config, &config.key_prefix).await {
            Ok(store) => {
                info!(
                    host = %redis_config.host,
                    port = redis_config.port,
                    db = redis_config.db,
                    "Rate limiter Redis connection established"
                );
                return Arc::new(store);
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Redis unavailable for rate limiting, using in-process memory store; \
                     counters are not shared with other instances"
                );
            }
        }
    } else {
        info!("No Redis configured, using in-process memory store for rate limiting");
    }

    Arc::new(MemoryStore::new(clock))
}

/// Periodically purge expired entries from `store`.
///
/// Returns `None` when `interval` is zero. The task runs until aborted.
pub fn spawn_sweeper(store: Arc<dyn CounterStore>, interval: Duration) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                debug!(store = store.name(), purged, "Purged expired rate limit entries");
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;
    use crate::ratelimit::ManualClock;

    #[tokio::test]
    async fn test_connect_without_redis_uses_memory() {
        let config = StoreConfig {
            redis: None,
            ..StoreConfig::default()
        };
        let store = connect_store(&config, Arc::new(ManualClock::new(0.0))).await;
        assert_eq!(store.name(), "memory");
    }

    #[tokio::test]
    async fn test_connect_falls_back_when_redis_unreachable() {
        // Nothing listens on port 1; the probe fails fast with a refusal.
        let config = StoreConfig {
            redis: Some(RedisConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                connect_timeout_ms: 200,
                ..RedisConfig::default()
            }),
            ..StoreConfig::default()
        };
        let store = connect_store(&config, Arc::new(ManualClock::new(0.0))).await;
        assert_eq!(store.name(), "memory");
        assert_eq!(store.incr_with_expiry("k", 10).await.unwrap(), 1);
    }

    #[test]
    fn test_sweeper_disabled_with_zero_interval() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new(Arc::new(ManualClock::new(0.0))));
        assert!(spawn_sweeper(store, Duration::ZERO).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_expired_entries() {
        let clock = Arc::new(ManualClock::new(0.0));
        let memory = Arc::new(MemoryStore::new(clock.clone()));
        memory.incr_with_expiry("short", 1).await.unwrap();
        memory.incr_with_expiry("long", 600).await.unwrap();
        assert_eq!(memory.len(), 2);

        let handle = spawn_sweeper(memory.clone(), Duration::from_secs(5)).unwrap();
        clock.advance(10.0);
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(memory.len(), 1);
        handle.abort();
    }
}
