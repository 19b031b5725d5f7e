//! Best-effort cache stores.
//!
//! A [`CacheStore`] is a key/value store with TTLs, counters, and hash, set,
//! and sorted-set collections. Stores never return errors: transport and
//! decoding failures are logged and collapse to the operation's empty value
//! (a miss, `false`, `0`, or an empty list), so the cache can only ever make
//! the router faster, never wrong.
//!
//! Backends:
//! - [`MemoryCacheStore`] - bounded LRU in process memory
//! - [`RedisCacheStore`] - shared store over a multiplexed Redis connection
//!
//! Wrappers that transform values on the way in and out:
//! - [`CompressedCacheStore`] - zlib with a raw/deflated header byte
//! - [`EncryptedCacheStore`] - ChaCha20-Poly1305 with a per-value nonce

mod clock;
mod codec;
mod compression;
mod encryption;
mod glob;
mod memory;
mod redis_store;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{CacheBackendConfig, CacheConfig};
use crate::error::ConfigError;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{CodecCacheStore, CodecError, ValueCodec};
pub use compression::{CompressedCacheStore, DeflateCodec};
pub use encryption::{ChaChaCodec, EncryptedCacheStore};
pub use glob::glob_match;
pub use memory::MemoryCacheStore;
pub use redis_store::RedisCacheStore;

/// A cached value with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    /// Lifetime in seconds; 0 means the entry never expires.
    pub ttl_secs: u64,
    pub created_at_ms: u64,
    pub access_count: u64,
    pub last_accessed_ms: u64,
}

impl<T> CacheEntry<T> {
    /// Replace the value, keeping the bookkeeping.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheEntry<U> {
        CacheEntry {
            value: f(self.value),
            ttl_secs: self.ttl_secs,
            created_at_ms: self.created_at_ms,
            access_count: self.access_count,
            last_accessed_ms: self.last_accessed_ms,
        }
    }

    /// Fallible [`map`](Self::map).
    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<CacheEntry<U>, E> {
        Ok(CacheEntry {
            value: f(self.value)?,
            ttl_secs: self.ttl_secs,
            created_at_ms: self.created_at_ms,
            access_count: self.access_count,
            last_accessed_ms: self.last_accessed_ms,
        })
    }
}

/// Key/value store contract shared by every backend and wrapper.
///
/// `ttl_secs` of `None` applies the store default; `Some(0)` stores without
/// expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a value. Expired entries are deleted and reported as a miss.
    async fn get(&self, key: &str) -> Option<CacheEntry<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>);
    /// Returns true when the key existed.
    async fn del(&self, key: &str) -> bool;
    async fn exists(&self, key: &str) -> bool;
    /// Restart the key's lifetime with a new TTL. Returns false when absent.
    async fn expire(&self, key: &str, ttl_secs: u64) -> bool;
    /// Remaining lifetime in seconds, `-1` when absent or persistent.
    async fn ttl(&self, key: &str) -> i64;
    /// Live keys matching a glob pattern (`*`, `?`); all keys when `None`.
    async fn keys(&self, pattern: Option<&str>) -> Vec<String>;

    async fn mget(&self, keys: &[String]) -> Vec<Option<Vec<u8>>>;
    async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl_secs: Option<u64>);
    /// Returns the number of keys removed.
    async fn mdel(&self, keys: &[String]) -> u64;

    /// Add `by` to a decimal counter, creating it at 0. Returns the new value.
    async fn increment(&self, key: &str, by: i64) -> i64;
    async fn decrement(&self, key: &str, by: i64) -> i64;

    async fn hget(&self, key: &str, field: &str) -> Option<Vec<u8>>;
    /// Returns true when the field is new.
    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> bool;
    async fn hdel(&self, key: &str, field: &str) -> bool;
    async fn hgetall(&self, key: &str) -> BTreeMap<String, Vec<u8>>;

    /// Returns true when the member is new.
    async fn sadd(&self, key: &str, member: &str) -> bool;
    async fn srem(&self, key: &str, member: &str) -> bool;
    async fn smembers(&self, key: &str) -> Vec<String>;
    async fn sismember(&self, key: &str, member: &str) -> bool;

    /// Insert or rescore a member. Returns true when the member is new.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> bool;
    async fn zrem(&self, key: &str, member: &str) -> bool;
    /// Members by ascending score between rank `start` and `stop` inclusive;
    /// negative ranks count from the end.
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Vec<String>;
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Vec<String>;
}

/// JSON helpers over any [`CacheStore`].
#[async_trait]
pub trait CacheStoreExt: CacheStore {
    /// Fetch and decode a JSON value. Decode failures are a miss.
    async fn get_json<T>(&self, key: &str) -> Option<CacheEntry<T>>
    where
        T: DeserializeOwned + Send,
    {
        let entry = self.get(key).await?;
        match entry.try_map(|bytes| serde_json::from_slice::<T>(&bytes)) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding undecodable cache entry");
                None
            }
        }
    }

    /// Encode and store a JSON value. Returns false when encoding fails.
    async fn set_json<T>(&self, key: &str, value: &T, ttl_secs: Option<u64>) -> bool
    where
        T: Serialize + Sync,
    {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                self.set(key, bytes, ttl_secs).await;
                true
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to encode cache value");
                false
            }
        }
    }
}

impl<S: CacheStore + ?Sized> CacheStoreExt for S {}

/// Hit, miss, and eviction counters for a store.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Entries dropped to respect the capacity bound.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Entries dropped because their TTL elapsed.
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Calculate hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }
}

/// Resolve Redis-style inclusive rank bounds against a collection length.
///
/// Returns `None` when the range is empty.
pub(crate) fn rank_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Build the store described by `config`, wrappers included.
///
/// Values are compressed before they are encrypted, so the compression
/// wrapper sits outermost.
pub fn build_cache_store(config: &CacheConfig) -> Result<Arc<dyn CacheStore>, ConfigError> {
    config.validate()?;

    let mut store: Arc<dyn CacheStore> = match &config.backend {
        CacheBackendConfig::Memory { max_entries } => Arc::new(MemoryCacheStore::new(
            *max_entries,
            config.default_ttl_secs,
        )),
        CacheBackendConfig::Redis {
            url,
            connect_timeout_ms,
        } => Arc::new(
            RedisCacheStore::open(url, config.default_ttl_secs)?
                .with_connect_timeout(Duration::from_millis(*connect_timeout_ms)),
        ),
    };

    if let Some(encryption) = &config.encryption {
        store = Arc::new(EncryptedCacheStore::new(
            store,
            ChaChaCodec::from_passphrase(&encryption.passphrase)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?,
        ));
    }
    if let Some(compression) = &config.compression {
        store = Arc::new(CompressedCacheStore::new(
            store,
            DeflateCodec::new(compression.level, compression.min_size),
        ));
    }

    tracing::info!(
        backend = match config.backend {
            CacheBackendConfig::Memory { .. } => "memory",
            CacheBackendConfig::Redis { .. } => "redis",
        },
        compressed = config.compression.is_some(),
        encrypted = config.encryption.is_some(),
        "cache store ready"
    );
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_range() {
        assert_eq!(rank_range(5, 0, -1), Some((0, 4)));
        assert_eq!(rank_range(5, 1, 2), Some((1, 2)));
        assert_eq!(rank_range(5, -2, -1), Some((3, 4)));
        assert_eq!(rank_range(5, 0, 100), Some((0, 4)));
        assert_eq!(rank_range(5, 3, 1), None);
        assert_eq!(rank_range(0, 0, -1), None);
        assert_eq!(rank_range(5, 7, 9), None);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = MemoryCacheStore::new(8, 60);
        assert!(store.set_json("k", &vec![1, 2, 3], None).await);
        let entry = store.get_json::<Vec<i32>>("k").await.unwrap();
        assert_eq!(entry.value, vec![1, 2, 3]);
        assert_eq!(entry.ttl_secs, 60);

        store.set("bad", b"not json".to_vec(), None).await;
        assert!(store.get_json::<Vec<i32>>("bad").await.is_none());
    }

    #[tokio::test]
    async fn test_build_wrapped_store_round_trips() {
        let config = CacheConfig::memory(16)
            .with_compression(crate::config::CompressionConfig {
                level: 6,
                min_size: 8,
            })
            .with_encryption("passphrase");
        let store = build_cache_store(&config).unwrap();

        let value = b"a value long enough to be compressed ......".to_vec();
        store.set("k", value.clone(), Some(10)).await;
        assert_eq!(store.get("k").await.unwrap().value, value);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        assert!(build_cache_store(&CacheConfig::memory(0)).is_err());
    }
}
