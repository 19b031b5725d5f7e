//! Redis-backed cache store.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, FromRedisValue, Pipeline, RedisError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CacheEntry, CacheStore};
use crate::config::DEFAULT_REDIS_CONNECT_TIMEOUT_MS;
use crate::error::ConfigError;

/// How long to stop dialing after a failed connect.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Keys fetched per SCAN round trip.
const SCAN_COUNT: usize = 500;

/// Counter handing out sorted-set insertion sequences.
const ZSET_SEQ_KEY: &str = "__multiorm:zset_seq";

/// Digits of the sequence prefix; a `:` follows it.
const SEQ_WIDTH: usize = 20;

/// Rescore an existing member in place, or add it under the next sequence.
/// Returns 1 when the member is new.
const ZADD_SCRIPT: &str = r#"
local offset = tonumber(ARGV[3]) + 2
for _, stored in ipairs(redis.call('ZRANGE', KEYS[1], 0, -1)) do
    if string.sub(stored, offset) == ARGV[2] then
        redis.call('ZADD', KEYS[1], ARGV[1], stored)
        return 0
    end
end
local seq = redis.call('INCR', KEYS[2])
redis.call('ZADD', KEYS[1], ARGV[1], string.format('%0' .. ARGV[3] .. 'd', seq) .. ':' .. ARGV[2])
return 1
"#;

/// Remove a member whatever its sequence. Returns 1 when it existed.
const ZREM_SCRIPT: &str = r#"
local offset = tonumber(ARGV[2]) + 2
for _, stored in ipairs(redis.call('ZRANGE', KEYS[1], 0, -1)) do
    if string.sub(stored, offset) == ARGV[1] then
        return redis.call('ZREM', KEYS[1], stored)
    end
end
return 0
"#;

/// Member name of a stored sorted-set entry.
fn strip_seq(mut stored: String) -> String {
    if stored.len() > SEQ_WIDTH && stored.as_bytes()[SEQ_WIDTH] == b':' {
        stored.drain(..=SEQ_WIDTH);
    }
    stored
}

/// Store over a shared multiplexed Redis connection.
///
/// The connection is opened on first use and re-opened after I/O failures.
/// Every command failure is logged and turned into the operation's empty
/// value. Bulk operations are pipelined; counters use `INCRBY`/`DECRBY`.
/// Sorted-set members are stored behind a zero-padded insertion sequence so
/// that Redis's lexicographic tie-break orders equal scores by first insertion.
pub struct RedisCacheStore {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    retry_after: parking_lot::Mutex<Option<Instant>>,
    connect_timeout: Duration,
    default_ttl_secs: u64,
}

impl RedisCacheStore {
    /// Prepare a store for `url`; no connection is made yet.
    pub fn open(url: &str, default_ttl_secs: u64) -> Result<Self, ConfigError> {
        let client = Client::open(url)
            .map_err(|e| ConfigError::Invalid(format!("redis url `{url}`: {e}")))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            retry_after: parking_lot::Mutex::new(None),
            connect_timeout: Duration::from_millis(DEFAULT_REDIS_CONNECT_TIMEOUT_MS),
            default_ttl_secs,
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn connection(&self) -> Option<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Some(conn.clone());
        }

        if let Some(until) = *self.retry_after.lock() {
            if Instant::now() < until {
                return None;
            }
        }

        match tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => {
                info!("connected to redis cache");
                *self.retry_after.lock() = None;
                *guard = Some(conn.clone());
                Some(conn)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "redis connect failed");
                *self.retry_after.lock() = Some(Instant::now() + RECONNECT_BACKOFF);
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.connect_timeout.as_millis() as u64,
                    "redis connect timed out"
                );
                *self.retry_after.lock() = Some(Instant::now() + RECONNECT_BACKOFF);
                None
            }
        }
    }

    async fn on_error(&self, op: &'static str, error: &RedisError) {
        warn!(op, error = %error, "redis command failed");
        if error.is_io_error() || error.is_connection_dropped() {
            debug!("dropping redis connection");
            *self.connection.lock().await = None;
        }
    }

    async fn run<T: FromRedisValue>(&self, op: &'static str, cmd: &Cmd) -> Option<T> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<T> = cmd.query_async(&mut conn).await;
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.on_error(op, &e).await;
                None
            }
        }
    }

    async fn run_pipeline<T: FromRedisValue>(
        &self,
        op: &'static str,
        pipe: &Pipeline,
    ) -> Option<T> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<T> = pipe.query_async(&mut conn).await;
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.on_error(op, &e).await;
                None
            }
        }
    }

    fn set_cmd(key: &str, value: &[u8], ttl_secs: u64) -> Cmd {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if ttl_secs > 0 {
            cmd.arg("EX").arg(ttl_secs);
        }
        cmd
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Option<CacheEntry<Vec<u8>>> {
        let mut pipe = redis::pipe();
        pipe.cmd("GET").arg(key).cmd("PTTL").arg(key);
        let (value, pttl): (Option<Vec<u8>>, i64) = self.run_pipeline("get", &pipe).await?;
        let value = value?;

        let now = now_ms();
        Some(CacheEntry {
            value,
            ttl_secs: if pttl > 0 { (pttl as u64).div_ceil(1000) } else { 0 },
            created_at_ms: now,
            access_count: 0,
            last_accessed_ms: now,
        })
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>) {
        let ttl = ttl_secs.unwrap_or(self.default_ttl_secs);
        let _: Option<()> = self.run("set", &Self::set_cmd(key, &value, ttl)).await;
    }

    async fn del(&self, key: &str) -> bool {
        let removed: Option<i64> = self.run("del", redis::cmd("DEL").arg(key)).await;
        removed.unwrap_or(0) > 0
    }

    async fn exists(&self, key: &str) -> bool {
        let found: Option<i64> = self.run("exists", redis::cmd("EXISTS").arg(key)).await;
        found.unwrap_or(0) > 0
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> bool {
        let updated: Option<i64> = if ttl_secs == 0 {
            // PERSIST answers 0 for keys that had no expiry; check existence instead
            let _: Option<i64> = self.run("persist", redis::cmd("PERSIST").arg(key)).await;
            self.run("exists", redis::cmd("EXISTS").arg(key)).await
        } else {
            self.run("expire", redis::cmd("EXPIRE").arg(key).arg(ttl_secs))
                .await
        };
        updated.unwrap_or(0) > 0
    }

    async fn ttl(&self, key: &str) -> i64 {
        let ttl: Option<i64> = self.run("ttl", redis::cmd("TTL").arg(key)).await;
        match ttl {
            Some(secs) if secs >= 0 => secs,
            _ => -1,
        }
    }

    async fn keys(&self, pattern: Option<&str>) -> Vec<String> {
        let pattern = pattern.unwrap_or("*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let page: Option<(u64, Vec<String>)> = self
                .run(
                    "scan",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT),
                )
                .await;
            let Some((next, batch)) = page else {
                return Vec::new();
            };
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.retain(|k| k != ZSET_SEQ_KEY);
        keys.sort();
        keys.dedup();
        keys
    }

    async fn mget(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        if keys.is_empty() {
            return Vec::new();
        }
        let values: Option<Vec<Option<Vec<u8>>>> =
            self.run("mget", redis::cmd("MGET").arg(keys)).await;
        values.unwrap_or_else(|| vec![None; keys.len()])
    }

    async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl_secs: Option<u64>) {
        if entries.is_empty() {
            return;
        }
        let ttl = ttl_secs.unwrap_or(self.default_ttl_secs);
        let mut pipe = redis::pipe();
        for (key, value) in &entries {
            pipe.add_command(Self::set_cmd(key, value, ttl)).ignore();
        }
        let _: Option<()> = self.run_pipeline("mset", &pipe).await;
    }

    async fn mdel(&self, keys: &[String]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        let removed: Option<i64> = self.run("mdel", redis::cmd("DEL").arg(keys)).await;
        removed.unwrap_or(0).max(0) as u64
    }

    async fn increment(&self, key: &str, by: i64) -> i64 {
        self.run("incrby", redis::cmd("INCRBY").arg(key).arg(by))
            .await
            .unwrap_or(0)
    }

    async fn decrement(&self, key: &str, by: i64) -> i64 {
        self.run("decrby", redis::cmd("DECRBY").arg(key).arg(by))
            .await
            .unwrap_or(0)
    }

    async fn hget(&self, key: &str, field: &str) -> Option<Vec<u8>> {
        let value: Option<Option<Vec<u8>>> =
            self.run("hget", redis::cmd("HGET").arg(key).arg(field)).await;
        value.flatten()
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> bool {
        let added: Option<i64> = self
            .run("hset", redis::cmd("HSET").arg(key).arg(field).arg(value))
            .await;
        added.unwrap_or(0) > 0
    }

    async fn hdel(&self, key: &str, field: &str) -> bool {
        let removed: Option<i64> = self.run("hdel", redis::cmd("HDEL").arg(key).arg(field)).await;
        removed.unwrap_or(0) > 0
    }

    async fn hgetall(&self, key: &str) -> BTreeMap<String, Vec<u8>> {
        let map: Option<HashMap<String, Vec<u8>>> =
            self.run("hgetall", redis::cmd("HGETALL").arg(key)).await;
        map.map(|m| m.into_iter().collect()).unwrap_or_default()
    }

    async fn sadd(&self, key: &str, member: &str) -> bool {
        let added: Option<i64> = self.run("sadd", redis::cmd("SADD").arg(key).arg(member)).await;
        added.unwrap_or(0) > 0
    }

    async fn srem(&self, key: &str, member: &str) -> bool {
        let removed: Option<i64> = self.run("srem", redis::cmd("SREM").arg(key).arg(member)).await;
        removed.unwrap_or(0) > 0
    }

    async fn smembers(&self, key: &str) -> Vec<String> {
        let members: Option<Vec<String>> = self.run("smembers", redis::cmd("SMEMBERS").arg(key)).await;
        let mut members = members.unwrap_or_default();
        members.sort();
        members
    }

    async fn sismember(&self, key: &str, member: &str) -> bool {
        let found: Option<i64> = self
            .run("sismember", redis::cmd("SISMEMBER").arg(key).arg(member))
            .await;
        found.unwrap_or(0) > 0
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> bool {
        let added: Option<i64> = self
            .run(
                "zadd",
                redis::cmd("EVAL")
                    .arg(ZADD_SCRIPT)
                    .arg(2)
                    .arg(key)
                    .arg(ZSET_SEQ_KEY)
                    .arg(score)
                    .arg(member)
                    .arg(SEQ_WIDTH),
            )
            .await;
        added.unwrap_or(0) > 0
    }

    async fn zrem(&self, key: &str, member: &str) -> bool {
        let removed: Option<i64> = self
            .run(
                "zrem",
                redis::cmd("EVAL")
                    .arg(ZREM_SCRIPT)
                    .arg(1)
                    .arg(key)
                    .arg(member)
                    .arg(SEQ_WIDTH),
            )
            .await;
        removed.unwrap_or(0) > 0
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Vec<String> {
        let stored: Option<Vec<String>> = self
            .run("zrange", redis::cmd("ZRANGE").arg(key).arg(start).arg(stop))
            .await;
        stored.unwrap_or_default().into_iter().map(strip_seq).collect()
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Vec<String> {
        let stored: Option<Vec<String>> = self
            .run(
                "zrangebyscore",
                redis::cmd("ZRANGEBYSCORE").arg(key).arg(min).arg(max),
            )
            .await;
        stored.unwrap_or_default().into_iter().map(strip_seq).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_a_config_error() {
        assert!(matches!(
            RedisCacheStore::open("not a url", 60),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_open() {
        // Port 1 on loopback refuses connections
        let store = RedisCacheStore::open("redis://127.0.0.1:1/", 60)
            .unwrap()
            .with_connect_timeout(Duration::from_millis(200));

        store.set("k", b"v".to_vec(), None).await;
        assert!(store.get("k").await.is_none());
        assert!(!store.exists("k").await);
        assert_eq!(store.ttl("k").await, -1);
        assert_eq!(store.increment("n", 1).await, 0);
        assert!(store.keys(None).await.is_empty());
        assert_eq!(store.mget(&["a".into(), "b".into()]).await, vec![None, None]);
        assert!(store.zrange("z", 0, -1).await.is_empty());
    }

    #[test]
    fn test_sequence_prefix_orders_ties_by_insertion() {
        let stored: Vec<String> = [(9u64, "zeta"), (10, "alpha"), (11, "")]
            .iter()
            .map(|(seq, member)| format!("{seq:0width$}:{member}", width = SEQ_WIDTH))
            .collect();
        let mut sorted = stored.clone();
        sorted.sort();
        assert_eq!(sorted, stored);

        let members: Vec<String> = stored.into_iter().map(strip_seq).collect();
        assert_eq!(members, vec!["zeta", "alpha", ""]);
        assert_eq!(strip_seq("plain".to_string()), "plain");
    }

    #[tokio::test]
    #[ignore = "needs a redis server on 127.0.0.1:6379"]
    async fn test_sorted_set_ties_follow_insertion_order() {
        let store = RedisCacheStore::open("redis://127.0.0.1:6379/", 60).unwrap();
        let key = format!("multiorm:test:zset:{}", now_ms());

        assert!(store.zadd(&key, 1.0, "zeta").await);
        assert!(store.zadd(&key, 1.0, "alpha").await);
        assert!(store.zadd(&key, 0.5, "mid").await);
        assert!(!store.zadd(&key, 1.0, "zeta").await);
        assert_eq!(store.zrange(&key, 0, -1).await, vec!["mid", "zeta", "alpha"]);
        assert_eq!(store.zrangebyscore(&key, 1.0, 1.0).await, vec!["zeta", "alpha"]);

        assert!(store.zrem(&key, "zeta").await);
        assert!(!store.zrem(&key, "zeta").await);
        assert_eq!(store.zrange(&key, 0, -1).await, vec!["mid", "alpha"]);
        store.del(&key).await;
    }
}
