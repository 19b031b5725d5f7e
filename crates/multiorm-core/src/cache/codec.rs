//! Value-transforming cache wrappers.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use super::{CacheEntry, CacheStore};

/// Errors raised while encoding or decoding a stored value.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

/// A reversible transformation applied to stored values.
pub trait ValueCodec: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;
    fn encode(&self, plain: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Wraps another store and passes values through a [`ValueCodec`].
///
/// Only values are transformed: plain values, bulk values and hash field
/// values. Keys, counters, set members and sorted-set members pass through
/// untouched. A value that fails to decode is reported as a miss and never
/// as an error. A value that fails to encode removes the key, so a later
/// read misses instead of returning the value it should have replaced.
pub struct CodecCacheStore<C> {
    inner: Arc<dyn CacheStore>,
    codec: C,
}

impl<C: ValueCodec> CodecCacheStore<C> {
    pub fn new(inner: Arc<dyn CacheStore>, codec: C) -> Self {
        Self { inner, codec }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    fn encode(&self, key: &str, value: &[u8]) -> Option<Vec<u8>> {
        match self.codec.encode(value) {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                warn!(key, codec = self.codec.name(), error = %e, "failed to encode cache value");
                None
            }
        }
    }

    fn decode(&self, key: &str, stored: &[u8]) -> Option<Vec<u8>> {
        match self.codec.decode(stored) {
            Ok(plain) => Some(plain),
            Err(e) => {
                warn!(key, codec = self.codec.name(), error = %e, "treating undecodable cache value as a miss");
                None
            }
        }
    }
}

#[async_trait]
impl<C: ValueCodec> CacheStore for CodecCacheStore<C> {
    async fn get(&self, key: &str) -> Option<CacheEntry<Vec<u8>>> {
        let entry = self.inner.get(key).await?;
        let plain = self.decode(key, &entry.value)?;
        Some(entry.map(|_| plain))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>) {
        match self.encode(key, &value) {
            Some(encoded) => self.inner.set(key, encoded, ttl_secs).await,
            None => {
                self.inner.del(key).await;
            }
        }
    }

    async fn del(&self, key: &str) -> bool {
        self.inner.del(key).await
    }

    async fn exists(&self, key: &str) -> bool {
        self.inner.exists(key).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> bool {
        self.inner.expire(key, ttl_secs).await
    }

    async fn ttl(&self, key: &str) -> i64 {
        self.inner.ttl(key).await
    }

    async fn keys(&self, pattern: Option<&str>) -> Vec<String> {
        self.inner.keys(pattern).await
    }

    async fn mget(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        self.inner
            .mget(keys)
            .await
            .into_iter()
            .zip(keys)
            .map(|(stored, key)| stored.and_then(|bytes| self.decode(key, &bytes)))
            .collect()
    }

    async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl_secs: Option<u64>) {
        let mut encoded = Vec::with_capacity(entries.len());
        let mut rejected = Vec::new();
        for (key, value) in entries {
            match self.encode(&key, &value) {
                Some(bytes) => encoded.push((key, bytes)),
                None => rejected.push(key),
            }
        }
        if !rejected.is_empty() {
            self.inner.mdel(&rejected).await;
        }
        self.inner.mset(encoded, ttl_secs).await;
    }

    async fn mdel(&self, keys: &[String]) -> u64 {
        self.inner.mdel(keys).await
    }

    async fn increment(&self, key: &str, by: i64) -> i64 {
        self.inner.increment(key, by).await
    }

    async fn decrement(&self, key: &str, by: i64) -> i64 {
        self.inner.decrement(key, by).await
    }

    async fn hget(&self, key: &str, field: &str) -> Option<Vec<u8>> {
        let stored = self.inner.hget(key, field).await?;
        self.decode(key, &stored)
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> bool {
        match self.encode(key, &value) {
            Some(encoded) => self.inner.hset(key, field, encoded).await,
            None => {
                self.inner.hdel(key, field).await;
                false
            }
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> bool {
        self.inner.hdel(key, field).await
    }

    async fn hgetall(&self, key: &str) -> BTreeMap<String, Vec<u8>> {
        self.inner
            .hgetall(key)
            .await
            .into_iter()
            .filter_map(|(field, stored)| Some((field, self.decode(key, &stored)?)))
            .collect()
    }

    async fn sadd(&self, key: &str, member: &str) -> bool {
        self.inner.sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> bool {
        self.inner.srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> Vec<String> {
        self.inner.smembers(key).await
    }

    async fn sismember(&self, key: &str, member: &str) -> bool {
        self.inner.sismember(key, member).await
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> bool {
        self.inner.zadd(key, score, member).await
    }

    async fn zrem(&self, key: &str, member: &str) -> bool {
        self.inner.zrem(key, member).await
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Vec<String> {
        self.inner.zrange(key, start, stop).await
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Vec<String> {
        self.inner.zrangebyscore(key, min, max).await
    }
}
