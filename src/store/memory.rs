//! In-process counter store.
//!
//! Used when Redis is not configured or did not answer the startup probe.
//! State lives only in this process, so instances behind a load balancer each
//! enforce their own copy of every limit while running in this mode.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tracing::trace;

use super::{CounterStore, HashFields, StoreError, StoredBucket};
use crate::ratelimit::algorithms::{self, BucketState};
use crate::ratelimit::{Clock, RateLimit};

#[derive(Debug, Clone)]
enum Value {
    Counter(i64),
    SortedSet(Vec<(f64, String)>),
    Hash(HashFields),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Counter(_) => "counter",
            Value::SortedSet(_) => "sorted set",
            Value::Hash(_) => "hash",
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: f64,
}

impl Entry {
    fn is_expired(&self, now: f64) -> bool {
        now >= self.expires_at
    }
}

/// Counter store backed by a sharded concurrent map.
///
/// Each operation holds the shard lock for its key for the whole
/// read-modify-write, which gives the same per-key atomicity Redis provides.
/// Expired entries are dropped lazily when touched, or in bulk by
/// [`CounterStore::purge_expired`].
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of entries currently held, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lock the live entry for `key`, replacing it with `init()` if it is
    /// missing or expired.
    fn live_entry(
        &self,
        key: &str,
        now: f64,
        init: impl FnOnce() -> Value,
    ) -> RefMut<'_, String, Entry> {
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Counter(0),
            expires_at: f64::NEG_INFINITY,
        });
        if slot.is_expired(now) {
            trace!(key = %key, "Evicting expired entry");
            *slot = Entry {
                value: init(),
                expires_at: f64::INFINITY,
            };
        }
        slot
    }

    fn wrong_type(key: &str, expected: &str, found: &Value) -> StoreError {
        StoreError::corrupt(
            key,
            format!("expected {} but found {}", expected, found.type_name()),
        )
    }
}

fn ttl_deadline(now: f64, ttl_secs: u64) -> f64 {
    now + ttl_secs as f64
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> Result<i64, StoreError> {
        let now = self.clock.now();
        let mut slot = self.live_entry(key, now, || Value::Counter(0));
        let entry = slot.value_mut();
        match entry.value {
            Value::Counter(ref mut count) => {
                *count += 1;
                entry.expires_at = ttl_deadline(now, ttl_secs);
                Ok(*count)
            }
            ref other => Err(Self::wrong_type(key, "counter", other)),
        }
    }

    async fn sorted_set_prune_count_add(
        &self,
        key: &str,
        now: f64,
        window_start: f64,
        member: &str,
        ttl_secs: u64,
    ) -> Result<u64, StoreError> {
        let clock_now = self.clock.now();
        let mut slot = self.live_entry(key, clock_now, || Value::SortedSet(Vec::new()));
        let entry = slot.value_mut();
        match entry.value {
            Value::SortedSet(ref mut members) => {
                members.retain(|(score, _)| *score >= window_start);
                let count = members.len() as u64;
                match members.iter_mut().find(|(_, m)| m == member) {
                    Some(existing) => existing.0 = now,
                    None => members.push((now, member.to_string())),
                }
                entry.expires_at = ttl_deadline(clock_now, ttl_secs);
                Ok(count)
            }
            ref other => Err(Self::wrong_type(key, "sorted set", other)),
        }
    }

    async fn hash_get(&self, key: &str, fields: &[&str]) -> Result<Option<HashFields>, StoreError> {
        let now = self.clock.now();
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if entry.is_expired(now) {
            return Ok(None);
        }
        match entry.value {
            Value::Hash(ref hash) => {
                let found: HashFields = fields
                    .iter()
                    .filter_map(|f| hash.get(*f).map(|v| (f.to_string(), v.clone())))
                    .collect();
                Ok(if found.is_empty() { None } else { Some(found) })
            }
            ref other => Err(Self::wrong_type(key, "hash", other)),
        }
    }

    async fn hash_set_with_expiry(
        &self,
        key: &str,
        values: &HashFields,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut slot = self.live_entry(key, now, || Value::Hash(HashFields::new()));
        let entry = slot.value_mut();
        match entry.value {
            Value::Hash(ref mut hash) => {
                hash.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
                entry.expires_at = ttl_deadline(now, ttl_secs);
                Ok(())
            }
            ref other => Err(Self::wrong_type(key, "hash", other)),
        }
    }

    async fn bucket_step(
        &self,
        key: &str,
        now: f64,
        policy: &RateLimit,
        ttl_secs: u64,
    ) -> Result<StoredBucket, StoreError> {
        let strategy = policy.strategy();
        let clock_now = self.clock.now();
        // The entry stays locked from read to write back.
        let mut slot = self.live_entry(key, clock_now, || Value::Hash(HashFields::new()));
        let entry = slot.value_mut();
        match entry.value {
            Value::Hash(ref mut hash) => {
                let names = BucketState::field_names(strategy);
                let stored = if names.iter().all(|name| !hash.contains_key(*name)) {
                    StoredBucket::Absent
                } else {
                    match BucketState::from_fields(key, strategy, hash) {
                        Ok(state) => StoredBucket::Valid(state),
                        Err(e) => StoredBucket::Corrupt(e.to_string()),
                    }
                };

                let (_, next) = algorithms::bucket(now, policy, stored.state());
                hash.extend(next.to_fields(strategy));
                entry.expires_at = ttl_deadline(clock_now, ttl_secs);
                Ok(stored)
            }
            ref other => Err(Self::wrong_type(key, "hash", other)),
        }
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, Strategy};

    fn store_at(start: f64) -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(start));
        let store = MemoryStore::new(clock.clone());
        (clock, store)
    }

    fn fields(pairs: &[(&str, &str)]) -> HashFields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_incr_counts_and_expires() {
        let (clock, store) = store_at(1000.0);

        assert_eq!(store.incr_with_expiry("a", 10).await.unwrap(), 1);
        assert_eq!(store.incr_with_expiry("a", 10).await.unwrap(), 2);

        clock.advance(10.0);
        assert_eq!(store.incr_with_expiry("a", 10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sorted_set_prunes_old_members() {
        let (_clock, store) = store_at(0.0);

        for (i, t) in [1.0, 2.0, 3.0].iter().enumerate() {
            let prior = store
                .sorted_set_prune_count_add("s", *t, *t - 10.0, &format!("m{}", i), 10)
                .await
                .unwrap();
            assert_eq!(prior, i as u64);
        }

        // Window [2.5, 12.5): members at 1.0 and 2.0 fall out.
        let prior = store
            .sorted_set_prune_count_add("s", 12.5, 2.5, "m3", 10)
            .await
            .unwrap();
        assert_eq!(prior, 1);
    }

    #[tokio::test]
    async fn test_sorted_set_same_member_is_not_duplicated() {
        let (_clock, store) = store_at(0.0);
        store.sorted_set_prune_count_add("s", 1.0, 0.0, "x", 10).await.unwrap();
        let prior = store.sorted_set_prune_count_add("s", 1.0, 0.0, "x", 10).await.unwrap();
        assert_eq!(prior, 1);
        let prior = store.sorted_set_prune_count_add("s", 1.0, 0.0, "y", 10).await.unwrap();
        assert_eq!(prior, 1);
    }

    #[tokio::test]
    async fn test_hash_get_absent_and_expired() {
        let (clock, store) = store_at(0.0);
        assert!(store.hash_get("h", &["tokens"]).await.unwrap().is_none());

        store
            .hash_set_with_expiry("h", &fields(&[("tokens", "4.5")]), 20)
            .await
            .unwrap();
        let got = store.hash_get("h", &["tokens", "missing"]).await.unwrap().unwrap();
        assert_eq!(got.get("tokens").map(String::as_str), Some("4.5"));
        assert!(!got.contains_key("missing"));

        clock.advance(20.0);
        assert!(store.hash_get("h", &["tokens"]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bucket_step_writes_back_state() {
        let (clock, store) = store_at(100.0);
        let p = RateLimit::new(2, 10, Strategy::TokenBucket).unwrap();

        let stored = store.bucket_step("b", 100.0, &p, 20).await.unwrap();
        assert_eq!(stored, StoredBucket::Absent);

        let stored = store.bucket_step("b", 100.0, &p, 20).await.unwrap();
        assert_eq!(
            stored,
            StoredBucket::Valid(BucketState {
                level: 1.0,
                updated_at: 100.0
            })
        );

        let got = store.hash_get("b", &["tokens", "last_refill"]).await.unwrap().unwrap();
        assert_eq!(got, fields(&[("tokens", "0"), ("last_refill", "100")]));

        // Denied steps keep the bucket empty.
        store.bucket_step("b", 100.0, &p, 20).await.unwrap();
        let got = store.hash_get("b", &["tokens"]).await.unwrap().unwrap();
        assert_eq!(got["tokens"], "0");

        clock.advance(20.0);
        assert_eq!(
            store.bucket_step("b", 120.0, &p, 20).await.unwrap(),
            StoredBucket::Absent
        );
    }

    #[tokio::test]
    async fn test_bucket_step_resets_corrupt_state() {
        let (_clock, store) = store_at(0.0);
        let p = RateLimit::new(3, 30, Strategy::LeakyBucket).unwrap();
        store
            .hash_set_with_expiry("b", &fields(&[("volume", "-2"), ("last_leak", "0")]), 60)
            .await
            .unwrap();

        let stored = store.bucket_step("b", 1.0, &p, 60).await.unwrap();
        assert!(matches!(stored, StoredBucket::Corrupt(_)));
        assert!(stored.state().is_none());

        let got = store.hash_get("b", &["volume", "last_leak"]).await.unwrap().unwrap();
        assert_eq!(got, fields(&[("volume", "1"), ("last_leak", "1")]));
    }

    #[tokio::test]
    async fn test_wrong_type_is_corrupt() {
        let (_clock, store) = store_at(0.0);
        store.incr_with_expiry("k", 10).await.unwrap();

        let err = store.hash_get("k", &["tokens"]).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));

        let p = RateLimit::new(1, 10, Strategy::TokenBucket).unwrap();
        let err = store.bucket_step("k", 1.0, &p, 20).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));

        let err = store
            .sorted_set_prune_count_add("k", 1.0, 0.0, "m", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (clock, store) = store_at(0.0);
        store.incr_with_expiry("short", 5).await.unwrap();
        store.incr_with_expiry("long", 50).await.unwrap();
        assert_eq!(store.len(), 2);

        clock.advance(6.0);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
