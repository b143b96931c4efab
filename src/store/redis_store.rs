//! Redis-backed counter store shared by every instance of the service.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, ErrorKind, RedisError, RedisResult, Script};
use tokio::time::timeout;
use tracing::trace;

use super::{CounterStore, HashFields, StoreError, StoredBucket};
use crate::config::RedisConfig;
use crate::ratelimit::algorithms::BucketState;
use crate::ratelimit::{RateLimit, Strategy};

/// One token or leaky bucket step, applied atomically.
///
/// `ARGV`: now, capacity, rate, ttl, `token` or `leaky`, level field name,
/// timestamp field name. Returns `{status, level, updated_at}` describing the
/// state found before the step, where status is `absent`, `valid` or
/// `corrupt`. Numbers travel as `%.17g` strings so no precision is lost.
const BUCKET_STEP_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local leaky = ARGV[5] == 'leaky'

local raw = redis.call('HMGET', KEYS[1], ARGV[6], ARGV[7])
local level = tonumber(raw[1])
local updated_at = tonumber(raw[2])

local status = 'valid'
if not raw[1] and not raw[2] then
  status = 'absent'
elseif level == nil or updated_at == nil
    or level ~= level or updated_at ~= updated_at
    or level < 0 or updated_at < 0
    or level == math.huge or updated_at == math.huge then
  status = 'corrupt'
end

local next_level
if leaky then
  local volume = 0
  if status == 'valid' then
    volume = math.max(0, level - math.max(0, now - updated_at) * rate)
  end
  if volume < capacity then
    volume = volume + 1
  end
  next_level = volume
else
  local tokens = capacity
  if status == 'valid' then
    tokens = math.min(capacity, level + math.max(0, now - updated_at) * rate)
  end
  if tokens >= 1 then
    tokens = tokens - 1
  end
  next_level = tokens
end

redis.call('HSET', KEYS[1], ARGV[6], string.format('%.17g', next_level),
  ARGV[7], string.format('%.17g', now))
redis.call('EXPIRE', KEYS[1], ttl)

if status == 'valid' then
  return {status, string.format('%.17g', level), string.format('%.17g', updated_at)}
end
return {status, raw[1] or '', raw[2] or ''}
";

/// Counter store on a Redis database.
///
/// Multi-command operations run as `MULTI`/`EXEC` pipelines or Lua scripts so
/// each one is a single atomic round trip. Every command is bounded by the
/// configured command timeout; a timeout is reported as
/// [`StoreError::Unavailable`].
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
    command_timeout: Duration,
    bucket_step: Script,
}

impl RedisStore {
    /// Connect and probe the server with `PING`.
    pub async fn connect(config: &RedisConfig, key_prefix: &str) -> Result<Self, StoreError> {
        let client = Client::open(config.connection_url())
            .map_err(|e| StoreError::Unavailable(format!("invalid Redis address: {}", e)))?;

        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let conn = timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                StoreError::Unavailable(format!(
                    "timed out connecting to Redis after {}ms",
                    config.connect_timeout_ms
                ))
            })?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let store = Self {
            conn,
            key_prefix: key_prefix.to_string(),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            bucket_step: Script::new(BUCKET_STEP_SCRIPT),
        };
        store.ping().await?;
        Ok(store)
    }

    fn namespaced(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    /// Await a Redis future under the command timeout and classify its error.
    async fn run<T, F>(&self, key: &str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match timeout(self.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(key, e)),
            Err(_) => Err(StoreError::Unavailable(format!(
                "Redis command on {} timed out after {}ms",
                key,
                self.command_timeout.as_millis()
            ))),
        }
    }
}

/// Redis `EXPIRE` takes a signed count of seconds.
fn expiry_secs(ttl_secs: u64) -> i64 {
    i64::try_from(ttl_secs).unwrap_or(i64::MAX)
}

/// Replies that do not match what the limiter wrote are corruption; anything
/// else is treated as a communication failure. Errors raised inside a script
/// carry the original `WRONGTYPE` text in their detail.
fn classify(key: &str, err: RedisError) -> StoreError {
    if err.kind() == ErrorKind::TypeError
        || err.code() == Some("WRONGTYPE")
        || err.to_string().contains("WRONGTYPE")
    {
        StoreError::corrupt(key, err.to_string())
    } else {
        StoreError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("PING");
        let _pong: String = self.run("PING", cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> Result<i64, StoreError> {
        let full = self.namespaced(key);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .incr(&full, 1)
            .expire(&full, expiry_secs(ttl_secs))
            .ignore();

        let (count,): (i64,) = self.run(&full, pipe.query_async(&mut conn)).await?;
        trace!(key = %full, count = count, "INCR");
        Ok(count)
    }

    async fn sorted_set_prune_count_add(
        &self,
        key: &str,
        now: f64,
        window_start: f64,
        member: &str,
        ttl_secs: u64,
    ) -> Result<u64, StoreError> {
        let full = self.namespaced(key);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        // "(x" is an exclusive bound: only scores strictly below window_start go.
        pipe.atomic()
            .zrembyscore(&full, "-inf", format!("({}", window_start))
            .ignore()
            .zcard(&full)
            .zadd(&full, member, now)
            .ignore()
            .expire(&full, expiry_secs(ttl_secs))
            .ignore();

        let (count,): (u64,) = self.run(&full, pipe.query_async(&mut conn)).await?;
        Ok(count)
    }

    async fn hash_get(&self, key: &str, fields: &[&str]) -> Result<Option<HashFields>, StoreError> {
        let full = self.namespaced(key);
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(&full).arg(fields);

        let values: Vec<Option<String>> = self.run(&full, cmd.query_async(&mut conn)).await?;
        let found: HashFields = fields
            .iter()
            .zip(values)
            .filter_map(|(field, value)| value.map(|v| (field.to_string(), v)))
            .collect();

        Ok(if found.is_empty() { None } else { Some(found) })
    }

    async fn hash_set_with_expiry(
        &self,
        key: &str,
        values: &HashFields,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let full = self.namespaced(key);
        let mut conn = self.conn.clone();
        let pairs: Vec<(&str, &str)> = values
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(&full, &pairs)
            .ignore()
            .expire(&full, expiry_secs(ttl_secs))
            .ignore();

        let _: () = self.run(&full, pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn bucket_step(
        &self,
        key: &str,
        now: f64,
        policy: &RateLimit,
        ttl_secs: u64,
    ) -> Result<StoredBucket, StoreError> {
        let strategy = policy.strategy();
        let [level_field, time_field] = BucketState::field_names(strategy);
        let mode = match strategy {
            Strategy::LeakyBucket => "leaky",
            _ => "token",
        };
        let full = self.namespaced(key);
        let mut conn = self.conn.clone();

        let mut invocation = self.bucket_step.key(&full);
        invocation
            .arg(now.to_string())
            .arg(policy.capacity().to_string())
            .arg(policy.rate().to_string())
            .arg(expiry_secs(ttl_secs))
            .arg(mode)
            .arg(level_field)
            .arg(time_field);

        let (status, level, updated_at): (String, String, String) =
            self.run(&full, invocation.invoke_async(&mut conn)).await?;
        trace!(key = %full, status = %status, "Bucket step");

        match status.as_str() {
            "absent" => Ok(StoredBucket::Absent),
            "valid" => {
                let mut found = HashFields::new();
                found.insert(level_field.to_string(), level);
                found.insert(time_field.to_string(), updated_at);
                BucketState::from_fields(&full, strategy, &found).map(StoredBucket::Valid)
            }
            "corrupt" => Ok(StoredBucket::Corrupt(format!(
                "{} = {:?}, {} = {:?}",
                level_field, level, time_field, updated_at
            ))),
            other => Err(StoreError::corrupt(
                &full,
                format!("unexpected bucket script status {:?}", other),
            )),
        }
    }
}
