//! Bounded in-process cache store.

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::glob::glob_match;
use super::{rank_range, CacheEntry, CacheStats, CacheStore};

/// Value held under one key. Strings and collections share the keyspace.
#[derive(Debug, Clone)]
enum SlotData {
    Bytes(Vec<u8>),
    Hash(BTreeMap<String, Vec<u8>>),
    Set(BTreeSet<String>),
    SortedSet(Vec<ScoredMember>),
}

impl SlotData {
    fn kind(&self) -> &'static str {
        match self {
            SlotData::Bytes(_) => "string",
            SlotData::Hash(_) => "hash",
            SlotData::Set(_) => "set",
            SlotData::SortedSet(_) => "zset",
        }
    }

    /// Collections disappear with their last member.
    fn is_empty_collection(&self) -> bool {
        match self {
            SlotData::Bytes(_) => false,
            SlotData::Hash(map) => map.is_empty(),
            SlotData::Set(set) => set.is_empty(),
            SlotData::SortedSet(members) => members.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct ScoredMember {
    member: String,
    score: f64,
    /// Insertion sequence; breaks score ties.
    seq: u64,
}

#[derive(Debug, Clone)]
struct Slot {
    data: SlotData,
    ttl_secs: u64,
    created_at_ms: u64,
    access_count: u64,
    last_accessed_ms: u64,
}

impl Slot {
    fn new(data: SlotData, ttl_secs: u64, now_ms: u64) -> Self {
        Self {
            data,
            ttl_secs,
            created_at_ms: now_ms,
            access_count: 0,
            last_accessed_ms: now_ms,
        }
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        self.ttl_secs > 0
            && now_ms.saturating_sub(self.created_at_ms) >= self.ttl_secs.saturating_mul(1000)
    }

    fn touch(&mut self, now_ms: u64) {
        self.access_count += 1;
        self.last_accessed_ms = now_ms;
    }
}

/// In-memory store bounded to `max_entries` keys with LRU eviction.
///
/// Expiry is lazy: an expired key is removed when it is next looked at.
/// Reads through [`get`](CacheStore::get) and the collection readers count
/// as a use for eviction ordering; `exists` and `ttl` do not.
pub struct MemoryCacheStore {
    entries: Mutex<LruCache<String, Slot>>,
    default_ttl_secs: u64,
    clock: Arc<dyn Clock>,
    stats: CacheStats,
    next_seq: AtomicU64,
}

impl MemoryCacheStore {
    /// Create a store holding at most `max_entries` keys.
    pub fn new(max_entries: usize, default_ttl_secs: u64) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            default_ttl_secs,
            clock: Arc::new(SystemClock),
            stats: CacheStats::default(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Use a different time source (tests drive expiry with a manual clock).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of keys held, including expired keys not yet looked at.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    /// Live slot for `key`, dropping it first if it has expired.
    fn live<'a>(
        &self,
        entries: &'a mut LruCache<String, Slot>,
        key: &str,
        now_ms: u64,
        promote: bool,
    ) -> Option<&'a mut Slot> {
        if entries.peek(key).is_some_and(|slot| slot.is_expired(now_ms)) {
            entries.pop(key);
            self.stats.record_expiration();
            debug!(key, "cache entry expired");
            return None;
        }
        if promote {
            entries.get_mut(key)
        } else {
            entries.peek_mut(key)
        }
    }

    fn insert(&self, entries: &mut LruCache<String, Slot>, key: String, slot: Slot) {
        if let Some((evicted, _)) = entries.push(key.clone(), slot) {
            if evicted != key {
                self.stats.record_eviction();
                debug!(key = %evicted, "evicted least recently used cache entry");
            }
        }
    }

    fn read_bytes(
        &self,
        entries: &mut LruCache<String, Slot>,
        key: &str,
        now_ms: u64,
    ) -> Option<CacheEntry<Vec<u8>>> {
        let Some(slot) = self.live(entries, key, now_ms, true) else {
            self.stats.record_miss();
            return None;
        };
        let SlotData::Bytes(value) = &slot.data else {
            warn!(key, kind = slot.data.kind(), "get on a non-string cache key");
            self.stats.record_miss();
            return None;
        };
        let value = value.clone();
        slot.touch(now_ms);
        self.stats.record_hit();
        Some(CacheEntry {
            value,
            ttl_secs: slot.ttl_secs,
            created_at_ms: slot.created_at_ms,
            access_count: slot.access_count,
            last_accessed_ms: slot.last_accessed_ms,
        })
    }

    /// Read a live slot, counting the read as a use.
    fn read_slot<R>(&self, key: &str, f: impl FnOnce(&SlotData) -> R) -> Option<R> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        let slot = self.live(&mut entries, key, now, true)?;
        slot.touch(now);
        Some(f(&slot.data))
    }

    /// Mutate a live slot, or create one with `create` when absent.
    ///
    /// Collections left empty by `f` are removed.
    fn update_slot<R>(
        &self,
        key: &str,
        create: impl FnOnce() -> Option<SlotData>,
        f: impl FnOnce(&mut SlotData) -> R,
    ) -> Option<R> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        if let Some(slot) = self.live(&mut entries, key, now, true) {
            slot.touch(now);
            let result = f(&mut slot.data);
            if slot.data.is_empty_collection() {
                entries.pop(key);
            }
            return Some(result);
        }

        let mut data = create()?;
        let result = f(&mut data);
        if !data.is_empty_collection() {
            self.insert(&mut entries, key.to_string(), Slot::new(data, 0, now));
        }
        Some(result)
    }

    fn add_to_counter(&self, key: &str, by: i64) -> i64 {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        let Some(slot) = self.live(&mut entries, key, now, true) else {
            let slot = Slot::new(SlotData::Bytes(by.to_string().into_bytes()), 0, now);
            self.insert(&mut entries, key.to_string(), slot);
            return by;
        };

        let current = match &slot.data {
            SlotData::Bytes(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok()),
            _ => None,
        };
        let Some(next) = current.and_then(|c| c.checked_add(by)) else {
            warn!(key, "counter update on a non-integer or overflowing value");
            return 0;
        };
        slot.data = SlotData::Bytes(next.to_string().into_bytes());
        slot.touch(now);
        next
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_MAX_ENTRIES,
            crate::config::DEFAULT_CACHE_TTL_SECS,
        )
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Option<CacheEntry<Vec<u8>>> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        self.read_bytes(&mut entries, key, now)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>) {
        let now = self.clock.now_ms();
        let ttl = ttl_secs.unwrap_or(self.default_ttl_secs);
        let mut entries = self.entries.lock();
        self.insert(
            &mut entries,
            key.to_string(),
            Slot::new(SlotData::Bytes(value), ttl, now),
        );
    }

    async fn del(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        if self.live(&mut entries, key, now, false).is_none() {
            return false;
        }
        entries.pop(key).is_some()
    }

    async fn exists(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        self.live(&mut entries, key, now, false).is_some()
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> bool {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        match self.live(&mut entries, key, now, false) {
            Some(slot) => {
                slot.ttl_secs = ttl_secs;
                slot.created_at_ms = now;
                true
            }
            None => false,
        }
    }

    async fn ttl(&self, key: &str) -> i64 {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        match self.live(&mut entries, key, now, false) {
            Some(slot) if slot.ttl_secs > 0 => {
                let expires_at = slot.created_at_ms + slot.ttl_secs * 1000;
                let remaining_ms = expires_at.saturating_sub(now);
                remaining_ms.div_ceil(1000) as i64
            }
            _ => -1,
        }
    }

    async fn keys(&self, pattern: Option<&str>) -> Vec<String> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();

        let mut expired = Vec::new();
        let mut matched = Vec::new();
        for (key, slot) in entries.iter() {
            if slot.is_expired(now) {
                expired.push(key.clone());
            } else if pattern.map_or(true, |p| glob_match(key, p)) {
                matched.push(key.clone());
            }
        }
        for key in expired {
            entries.pop(&key);
            self.stats.record_expiration();
        }

        matched.sort();
        matched
    }

    async fn mget(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        keys.iter()
            .map(|key| self.read_bytes(&mut entries, key, now).map(|e| e.value))
            .collect()
    }

    async fn mset(&self, items: Vec<(String, Vec<u8>)>, ttl_secs: Option<u64>) {
        let now = self.clock.now_ms();
        let ttl = ttl_secs.unwrap_or(self.default_ttl_secs);
        let mut entries = self.entries.lock();
        for (key, value) in items {
            self.insert(&mut entries, key, Slot::new(SlotData::Bytes(value), ttl, now));
        }
    }

    async fn mdel(&self, keys: &[String]) -> u64 {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        let mut removed = 0;
        for key in keys {
            if self.live(&mut entries, key, now, false).is_some() {
                entries.pop(key.as_str());
                removed += 1;
            }
        }
        removed
    }

    async fn increment(&self, key: &str, by: i64) -> i64 {
        self.add_to_counter(key, by)
    }

    async fn decrement(&self, key: &str, by: i64) -> i64 {
        self.add_to_counter(key, by.saturating_neg())
    }

    async fn hget(&self, key: &str, field: &str) -> Option<Vec<u8>> {
        self.read_slot(key, |data| match data {
            SlotData::Hash(map) => map.get(field).cloned(),
            _ => None,
        })
        .flatten()
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> bool {
        self.update_slot(
            key,
            || Some(SlotData::Hash(BTreeMap::new())),
            |data| match data {
                SlotData::Hash(map) => map.insert(field.to_string(), value).is_none(),
                other => {
                    warn!(key, kind = other.kind(), "hset on a non-hash cache key");
                    false
                }
            },
        )
        .unwrap_or(false)
    }

    async fn hdel(&self, key: &str, field: &str) -> bool {
        self.update_slot(
            key,
            || None,
            |data| match data {
                SlotData::Hash(map) => map.remove(field).is_some(),
                _ => false,
            },
        )
        .unwrap_or(false)
    }

    async fn hgetall(&self, key: &str) -> BTreeMap<String, Vec<u8>> {
        self.read_slot(key, |data| match data {
            SlotData::Hash(map) => map.clone(),
            _ => BTreeMap::new(),
        })
        .unwrap_or_default()
    }

    async fn sadd(&self, key: &str, member: &str) -> bool {
        self.update_slot(
            key,
            || Some(SlotData::Set(BTreeSet::new())),
            |data| match data {
                SlotData::Set(set) => set.insert(member.to_string()),
                other => {
                    warn!(key, kind = other.kind(), "sadd on a non-set cache key");
                    false
                }
            },
        )
        .unwrap_or(false)
    }

    async fn srem(&self, key: &str, member: &str) -> bool {
        self.update_slot(
            key,
            || None,
            |data| match data {
                SlotData::Set(set) => set.remove(member),
                _ => false,
            },
        )
        .unwrap_or(false)
    }

    async fn smembers(&self, key: &str) -> Vec<String> {
        self.read_slot(key, |data| match data {
            SlotData::Set(set) => set.iter().cloned().collect(),
            _ => Vec::new(),
        })
        .unwrap_or_default()
    }

    async fn sismember(&self, key: &str, member: &str) -> bool {
        self.read_slot(key, |data| match data {
            SlotData::Set(set) => set.contains(member),
            _ => false,
        })
        .unwrap_or(false)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> bool {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.update_slot(
            key,
            || Some(SlotData::SortedSet(Vec::new())),
            |data| match data {
                SlotData::SortedSet(members) => {
                    let added = match members.iter_mut().find(|m| m.member == member) {
                        Some(existing) => {
                            existing.score = score;
                            false
                        }
                        None => {
                            members.push(ScoredMember {
                                member: member.to_string(),
                                score,
                                seq,
                            });
                            true
                        }
                    };
                    members.sort_by(|a, b| a.score.total_cmp(&b.score).then(a.seq.cmp(&b.seq)));
                    added
                }
                other => {
                    warn!(key, kind = other.kind(), "zadd on a non-zset cache key");
                    false
                }
            },
        )
        .unwrap_or(false)
    }

    async fn zrem(&self, key: &str, member: &str) -> bool {
        self.update_slot(
            key,
            || None,
            |data| match data {
                SlotData::SortedSet(members) => {
                    let before = members.len();
                    members.retain(|m| m.member != member);
                    members.len() != before
                }
                _ => false,
            },
        )
        .unwrap_or(false)
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Vec<String> {
        self.read_slot(key, |data| match data {
            SlotData::SortedSet(members) => match rank_range(members.len(), start, stop) {
                Some((from, to)) => members[from..=to]
                    .iter()
                    .map(|m| m.member.clone())
                    .collect(),
                None => Vec::new(),
            },
            _ => Vec::new(),
        })
        .unwrap_or_default()
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Vec<String> {
        self.read_slot(key, |data| match data {
            SlotData::SortedSet(members) => members
                .iter()
                .filter(|m| m.score >= min && m.score <= max)
                .map(|m| m.member.clone())
                .collect(),
            _ => Vec::new(),
        })
        .unwrap_or_default()
    }
}
