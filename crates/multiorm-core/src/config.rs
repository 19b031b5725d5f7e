//! Router, cache, and adapter configuration.
//!
//! Every type is a builder-style struct with a `Default`, and also
//! deserializes from JSON so a whole deployment can be described in one file
//! (see [`MultiOrmConfig`]).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use multiorm_proto::ProviderId;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Queries slower than this are counted as slow (milliseconds).
pub const DEFAULT_SLOW_QUERY_THRESHOLD_MS: u64 = 1000;

/// Cache TTL applied when a query does not set one (seconds).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

/// Prefix of every query-cache key written by the router.
pub const DEFAULT_CACHE_KEY_PREFIX: &str = "multiorm:query";

/// Provider used when no preference rule, primary, or fallback matches.
pub const DEFAULT_PROVIDER: ProviderId = ProviderId::Sqlite;

/// Capacity of the in-memory cache store.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Redis connect timeout (milliseconds).
pub const DEFAULT_REDIS_CONNECT_TIMEOUT_MS: u64 = 2_000;

/// Payloads smaller than this are stored uncompressed (bytes).
pub const DEFAULT_COMPRESSION_MIN_SIZE: usize = 256;

/// SQLite busy timeout (milliseconds).
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Sled page cache size (bytes).
pub const DEFAULT_SLED_CACHE_CAPACITY: u64 = 64 * 1024 * 1024;

/// Routing and bookkeeping policy for the query router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    /// Provider used for queries no preference rule claims.
    pub primary: ProviderId,
    /// Providers tried in order when the primary is disconnected.
    pub fallbacks: Vec<ProviderId>,
    /// Last-resort provider, chosen regardless of connectivity.
    pub default_provider: ProviderId,
    pub slow_query_threshold_ms: u64,
    pub default_cache_ttl_secs: u64,
    /// Deadline applied to adapter calls when the query sets none.
    pub default_timeout_ms: Option<u64>,
    pub cache_key_prefix: String,
}

impl RouterConfig {
    /// Configuration with the given primary provider and no fallbacks.
    pub fn new(primary: ProviderId) -> Self {
        Self {
            primary,
            fallbacks: Vec::new(),
            default_provider: DEFAULT_PROVIDER,
            slow_query_threshold_ms: DEFAULT_SLOW_QUERY_THRESHOLD_MS,
            default_cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            default_timeout_ms: None,
            cache_key_prefix: DEFAULT_CACHE_KEY_PREFIX.to_string(),
        }
    }

    /// Set the ordered fallback list.
    pub fn with_fallbacks(mut self, fallbacks: impl IntoIterator<Item = ProviderId>) -> Self {
        self.fallbacks = fallbacks.into_iter().collect();
        self
    }

    pub fn with_default_provider(mut self, provider: ProviderId) -> Self {
        self.default_provider = provider;
        self
    }

    pub fn with_slow_query_threshold_ms(mut self, threshold_ms: u64) -> Self {
        self.slow_query_threshold_ms = threshold_ms;
        self
    }

    pub fn with_default_cache_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.default_cache_ttl_secs = ttl_secs;
        self
    }

    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_cache_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache_key_prefix = prefix.into();
        self
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for provider in &self.fallbacks {
            if !seen.insert(*provider) {
                return Err(ConfigError::Invalid(format!(
                    "fallback provider `{provider}` is listed twice"
                )));
            }
        }
        if self.slow_query_threshold_ms == 0 {
            return Err(ConfigError::Invalid(
                "slow query threshold must be positive".into(),
            ));
        }
        if self.cache_key_prefix.is_empty() {
            return Err(ConfigError::Invalid("cache key prefix is empty".into()));
        }
        Ok(())
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PROVIDER).with_fallbacks([ProviderId::Sled, ProviderId::Memory])
    }
}

/// Which cache backend to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheBackendConfig {
    /// Bounded in-process LRU store.
    #[serde(rename_all = "camelCase")]
    Memory { max_entries: usize },
    /// Distributed key-value store.
    #[serde(rename_all = "camelCase")]
    Redis {
        url: String,
        #[serde(default = "default_connect_timeout")]
        connect_timeout_ms: u64,
    },
}

fn default_connect_timeout() -> u64 {
    DEFAULT_REDIS_CONNECT_TIMEOUT_MS
}

impl Default for CacheBackendConfig {
    fn default() -> Self {
        CacheBackendConfig::Memory {
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Deflate settings for the compression wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompressionConfig {
    /// zlib level, 0-9.
    pub level: u32,
    pub min_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            level: 6,
            min_size: DEFAULT_COMPRESSION_MIN_SIZE,
        }
    }
}

/// Key material for the encryption wrapper.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub passphrase: String,
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("passphrase", &"[REDACTED]")
            .finish()
    }
}

/// Cache store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub backend: CacheBackendConfig,
    /// TTL for `set` calls that pass none (seconds, 0 = no expiry).
    pub default_ttl_secs: u64,
    pub compression: Option<CompressionConfig>,
    pub encryption: Option<EncryptionConfig>,
}

impl CacheConfig {
    /// In-memory store holding at most `max_entries` keys.
    pub fn memory(max_entries: usize) -> Self {
        Self {
            backend: CacheBackendConfig::Memory { max_entries },
            default_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            compression: None,
            encryption: None,
        }
    }

    /// Redis-backed store.
    pub fn redis(url: impl Into<String>) -> Self {
        Self {
            backend: CacheBackendConfig::Redis {
                url: url.into(),
                connect_timeout_ms: DEFAULT_REDIS_CONNECT_TIMEOUT_MS,
            },
            ..Self::memory(DEFAULT_MAX_ENTRIES)
        }
    }

    pub fn with_default_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.default_ttl_secs = ttl_secs;
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn with_encryption(mut self, passphrase: impl Into<String>) -> Self {
        self.encryption = Some(EncryptionConfig {
            passphrase: passphrase.into(),
        });
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.backend {
            CacheBackendConfig::Memory { max_entries: 0 } => {
                return Err(ConfigError::Invalid(
                    "memory cache needs at least one entry".into(),
                ))
            }
            CacheBackendConfig::Redis { url, .. } if url.is_empty() => {
                return Err(ConfigError::Invalid("redis url is empty".into()))
            }
            _ => {}
        }
        if let Some(compression) = &self.compression {
            if compression.level > 9 {
                return Err(ConfigError::Invalid(format!(
                    "compression level {} is out of range 0-9",
                    compression.level
                )));
            }
        }
        if let Some(encryption) = &self.encryption {
            if encryption.passphrase.is_empty() {
                return Err(ConfigError::Invalid("encryption passphrase is empty".into()));
            }
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::memory(DEFAULT_MAX_ENTRIES)
    }
}

/// SQLite adapter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SqliteConfig {
    /// Database file; `None` opens a private in-memory database.
    pub path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
}

impl SqliteConfig {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::in_memory()
        }
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Sled adapter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SledConfig {
    /// Database directory; `None` uses a temporary database removed on drop.
    pub path: Option<PathBuf>,
    pub cache_capacity_bytes: u64,
    /// Background flush interval; `None` flushes after every write.
    pub flush_every_ms: Option<u64>,
    /// Compress pages on disk.
    pub compression: bool,
}

impl SledConfig {
    pub fn temporary() -> Self {
        Self {
            path: None,
            cache_capacity_bytes: DEFAULT_SLED_CACHE_CAPACITY,
            flush_every_ms: Some(500),
            compression: false,
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::temporary()
        }
    }

    pub fn with_flush_every_ms(mut self, flush_every_ms: Option<u64>) -> Self {
        self.flush_every_ms = flush_every_ms;
        self
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    /// Convert to sled configuration.
    pub(crate) fn to_sled_config(&self) -> sled::Config {
        let mut config = sled::Config::new()
            .cache_capacity(self.cache_capacity_bytes)
            .use_compression(self.compression)
            .flush_every_ms(self.flush_every_ms);
        match &self.path {
            Some(path) => config = config.path(path),
            None => config = config.temporary(true),
        }
        config
    }
}

impl Default for SledConfig {
    fn default() -> Self {
        Self::temporary()
    }
}

/// In-process adapter settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Label used in logs.
    pub name: Option<String>,
}

/// Adapters to construct; absent sections are not registered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptersConfig {
    pub sqlite: Option<SqliteConfig>,
    pub sled: Option<SledConfig>,
    pub memory: Option<MemoryConfig>,
}

impl AdaptersConfig {
    /// All three adapters with ephemeral storage.
    pub fn ephemeral() -> Self {
        Self {
            sqlite: Some(SqliteConfig::in_memory()),
            sled: Some(SledConfig::temporary()),
            memory: Some(MemoryConfig::default()),
        }
    }

    /// True when the section for `provider` is present.
    pub fn contains(&self, provider: ProviderId) -> bool {
        match provider {
            ProviderId::Sqlite => self.sqlite.is_some(),
            ProviderId::Sled => self.sled.is_some(),
            ProviderId::Memory => self.memory.is_some(),
        }
    }
}

/// Umbrella configuration loaded by the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiOrmConfig {
    pub router: RouterConfig,
    pub cache: CacheConfig,
    pub adapters: AdaptersConfig,
}

impl MultiOrmConfig {
    /// Parse a configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.router.validate()?;
        self.cache.validate()?;
        if !self.adapters.contains(self.router.primary) {
            return Err(ConfigError::Invalid(format!(
                "primary provider `{}` has no adapter section",
                self.router.primary
            )));
        }
        Ok(())
    }
}
