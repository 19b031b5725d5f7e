//! Backend adapters.
//!
//! An adapter executes provider-agnostic [`DatabaseQuery`] values against one
//! storage engine and normalizes the outcome into a [`QueryResult`]. Every
//! adapter honours the same per-kind rules:
//!
//! - `select` filters (conjunction), orders, paginates, then projects
//! - `insert` takes one row or a batch and returns the rows with their ids
//! - `update` returns the rows after mutation, `delete` the rows it removed
//! - transactions apply all sub-queries or none of them
//! - a call that fails with [`AdapterError::Timeout`] has changed nothing
//!
//! Adapters:
//! - [`SqliteAdapter`] - rusqlite, the only one that runs raw SQL
//! - [`SledAdapter`] - sled trees, atomic batched bulk inserts
//! - [`MemoryAdapter`] - in-process tables with relation loading

mod memory;
mod relations;
pub mod rows;
mod sled_kv;
mod sql;
mod sqlite;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use multiorm_proto::{DatabaseQuery, ProviderId, QueryResult, TransactionOptions, TransactionResult};
use tracing::{info, warn};

use crate::config::AdaptersConfig;
use crate::error::AdapterError;

pub use memory::MemoryAdapter;
pub use sled_kv::SledAdapter;
pub use sqlite::SqliteAdapter;

/// How well an adapter handles the workloads the router routes by.
///
/// Ranks are relative: 0 means unsupported, higher is better.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterCapabilities {
    pub raw_sql: u8,
    pub relations: u8,
    pub bulk_insert: u8,
}

/// Point in time by which an adapter call must be done.
///
/// Adapters check it before their commit point, so a call either commits in
/// time or fails with [`AdapterError::Timeout`] without effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    budget_ms: u64,
}

impl Deadline {
    /// `budget_ms` from now.
    pub fn after_ms(budget_ms: u64) -> Self {
        Self {
            at: Instant::now() + Duration::from_millis(budget_ms),
            budget_ms,
        }
    }

    pub fn from_timeout(timeout_ms: Option<u64>) -> Option<Self> {
        timeout_ms.map(Self::after_ms)
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn budget_ms(&self) -> u64 {
        self.budget_ms
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn timeout(&self) -> AdapterError {
        AdapterError::Timeout(self.budget_ms)
    }

    pub fn check(&self) -> Result<(), AdapterError> {
        if self.is_expired() {
            Err(self.timeout())
        } else {
            Ok(())
        }
    }
}

/// [`Deadline::check`] for calls that may have no deadline.
pub(crate) fn check_deadline(deadline: Option<Deadline>) -> Result<(), AdapterError> {
    deadline.map_or(Ok(()), |d| d.check())
}

/// A storage backend the router can dispatch to.
///
/// Deadlines travel in the options: `QueryOptions::timeout_ms` for
/// [`execute`](Self::execute) and `TransactionOptions::timeout_ms` for
/// [`execute_transaction`](Self::execute_transaction). Implementations
/// enforce them themselves; callers never cancel an adapter call midway.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Identity of this backend.
    fn provider(&self) -> ProviderId;

    fn capabilities(&self) -> AdapterCapabilities;

    /// Open the underlying connection. On failure the adapter stays
    /// disconnected and the error is returned once.
    async fn connect(&self) -> Result<(), AdapterError>;

    async fn disconnect(&self) -> Result<(), AdapterError>;

    fn is_connected(&self) -> bool;

    async fn execute(&self, query: &DatabaseQuery) -> Result<QueryResult, AdapterError>;

    /// Run all queries in one atomic transaction. On error nothing the
    /// transaction did is visible.
    async fn execute_transaction(
        &self,
        queries: &[DatabaseQuery],
        options: &TransactionOptions,
    ) -> Result<TransactionResult, AdapterError>;
}

/// Adapters indexed by provider; at most one per provider.
#[derive(Clone, Default)]
pub struct AdapterSet {
    slots: [Option<Arc<dyn DatabaseAdapter>>; ProviderId::COUNT],
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own provider id, replacing any previous one.
    pub fn with(mut self, adapter: Arc<dyn DatabaseAdapter>) -> Self {
        self.insert(adapter);
        self
    }

    pub fn insert(&mut self, adapter: Arc<dyn DatabaseAdapter>) {
        let index = adapter.provider().index();
        self.slots[index] = Some(adapter);
    }

    pub fn get(&self, provider: ProviderId) -> Option<&Arc<dyn DatabaseAdapter>> {
        self.slots[provider.index()].as_ref()
    }

    /// True when an adapter is registered for `provider` and connected.
    pub fn is_connected(&self, provider: ProviderId) -> bool {
        self.get(provider).is_some_and(|a| a.is_connected())
    }

    /// Registered adapters in provider order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DatabaseAdapter>> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connect every adapter, logging failures. Returns the failures.
    pub async fn connect_all(&self) -> Vec<(ProviderId, AdapterError)> {
        let mut failures = Vec::new();
        for adapter in self.iter() {
            let provider = adapter.provider();
            match adapter.connect().await {
                Ok(()) => info!(%provider, "adapter connected"),
                Err(e) => {
                    warn!(%provider, error = %e, "adapter failed to connect");
                    failures.push((provider, e));
                }
            }
        }
        failures
    }

    pub async fn disconnect_all(&self) {
        for adapter in self.iter() {
            let provider = adapter.provider();
            if let Err(e) = adapter.disconnect().await {
                warn!(%provider, error = %e, "adapter failed to disconnect cleanly");
            }
        }
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|a| (a.provider(), a.is_connected())))
            .finish()
    }
}

/// Construct (but do not connect) the adapters named in `config`.
pub fn build_adapters(config: &AdaptersConfig) -> AdapterSet {
    let mut set = AdapterSet::new();
    if let Some(sqlite) = &config.sqlite {
        set.insert(Arc::new(SqliteAdapter::new(sqlite.clone())));
    }
    if let Some(sled) = &config.sled {
        set.insert(Arc::new(SledAdapter::new(sled.clone())));
    }
    if let Some(memory) = &config.memory {
        set.insert(Arc::new(MemoryAdapter::with_config(memory.clone())));
    }
    set
}
