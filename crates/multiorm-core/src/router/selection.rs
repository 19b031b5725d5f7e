//! Deterministic provider selection.

use std::fmt;

use multiorm_proto::{DatabaseQuery, ProviderId};

use crate::adapter::{AdapterCapabilities, AdapterSet};
use crate::config::RouterConfig;

/// Workload a query prefers a specialised adapter for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    RawSql,
    Relations,
    BulkInsert,
}

impl Workload {
    /// Workload of a query, if any preference rule applies.
    pub fn of(query: &DatabaseQuery) -> Option<Self> {
        if query.is_raw() {
            Some(Workload::RawSql)
        } else if query.has_includes() {
            Some(Workload::Relations)
        } else if query.is_bulk_insert() {
            Some(Workload::BulkInsert)
        } else {
            None
        }
    }

    fn rank(self, capabilities: AdapterCapabilities) -> u8 {
        match self {
            Workload::RawSql => capabilities.raw_sql,
            Workload::Relations => capabilities.relations,
            Workload::BulkInsert => capabilities.bulk_insert,
        }
    }
}

/// Which rule picked the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    Preferred(Workload),
    Primary,
    /// Position in the fallback list.
    Fallback(usize),
    Default,
}

/// A routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub provider: ProviderId,
    pub reason: SelectionReason,
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            SelectionReason::Preferred(workload) => {
                write!(f, "{} (preferred for {workload:?})", self.provider)
            }
            SelectionReason::Primary => write!(f, "{} (primary)", self.provider),
            SelectionReason::Fallback(i) => write!(f, "{} (fallback #{})", self.provider, i + 1),
            SelectionReason::Default => write!(f, "{} (default)", self.provider),
        }
    }
}

/// Pick the provider for a query; the first matching rule wins.
///
/// 1. raw SQL, relation includes and bulk inserts go to the connected
///    adapter ranked best for that workload (ties by provider order)
/// 2. the primary, when connected
/// 3. the first connected fallback
/// 4. the default provider, whatever its state
pub fn select(query: &DatabaseQuery, adapters: &AdapterSet, config: &RouterConfig) -> Selection {
    if let Some(workload) = Workload::of(query) {
        if let Some(provider) = best_for(workload, adapters) {
            return Selection {
                provider,
                reason: SelectionReason::Preferred(workload),
            };
        }
    }

    if adapters.is_connected(config.primary) {
        return Selection {
            provider: config.primary,
            reason: SelectionReason::Primary,
        };
    }

    if let Some((i, provider)) = config
        .fallbacks
        .iter()
        .enumerate()
        .find(|(_, provider)| adapters.is_connected(**provider))
    {
        return Selection {
            provider: *provider,
            reason: SelectionReason::Fallback(i),
        };
    }

    Selection {
        provider: config.default_provider,
        reason: SelectionReason::Default,
    }
}

fn best_for(workload: Workload, adapters: &AdapterSet) -> Option<ProviderId> {
    let mut best: Option<(u8, ProviderId)> = None;
    for adapter in adapters.iter().filter(|adapter| adapter.is_connected()) {
        let rank = workload.rank(adapter.capabilities());
        if rank > 0 && best.map_or(true, |(top, _)| rank > top) {
            best = Some((rank, adapter.provider()));
        }
    }
    best.map(|(_, provider)| provider)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::adapter::{DatabaseAdapter, MemoryAdapter, SledAdapter, SqliteAdapter};
    use crate::config::{SledConfig, SqliteConfig};
    use multiorm_proto::{record, InsertQuery, RawQuery};

    async fn connected_set() -> (AdapterSet, Arc<MemoryAdapter>) {
        let memory = Arc::new(MemoryAdapter::new());
        let set = AdapterSet::new()
            .with(Arc::new(SqliteAdapter::new(SqliteConfig::in_memory())))
            .with(Arc::new(SledAdapter::new(SledConfig::temporary())))
            .with(memory.clone());
        assert!(set.connect_all().await.is_empty());
        (set, memory)
    }

    #[tokio::test]
    async fn test_preference_rules() {
        let (set, _) = connected_set().await;
        let config = RouterConfig::new(ProviderId::Sled);

        let raw: DatabaseQuery = RawQuery::new("SELECT 1").into();
        let include: DatabaseQuery = DatabaseQuery::select("orders").include("customer").into();
        let bulk: DatabaseQuery =
            InsertQuery::many("events", vec![record([("a", 1)]), record([("a", 2)])]).into();
        let single: DatabaseQuery = InsertQuery::one("events", record([("a", 1)])).into();

        assert_eq!(select(&raw, &set, &config).provider, ProviderId::Sqlite);
        assert_eq!(select(&include, &set, &config).provider, ProviderId::Memory);
        assert_eq!(select(&bulk, &set, &config).provider, ProviderId::Sled);
        assert_eq!(
            select(&single, &set, &config),
            Selection {
                provider: ProviderId::Sled,
                reason: SelectionReason::Primary
            }
        );
    }

    #[tokio::test]
    async fn test_preference_falls_through_when_disconnected() {
        let (set, memory) = connected_set().await;
        memory.disconnect().await.unwrap();
        let config = RouterConfig::new(ProviderId::Sled);

        // Memory is the only relation loader; with it gone the primary serves.
        let include: DatabaseQuery = DatabaseQuery::select("orders").include("customer").into();
        assert_eq!(
            select(&include, &set, &config).reason,
            SelectionReason::Primary
        );
    }

    #[tokio::test]
    async fn test_fallback_and_default() {
        let (set, memory) = connected_set().await;
        let query: DatabaseQuery = DatabaseQuery::select("t").into();

        let config = RouterConfig::new(ProviderId::Memory)
            .with_fallbacks([ProviderId::Sled, ProviderId::Sqlite]);
        memory.disconnect().await.unwrap();
        assert_eq!(
            select(&query, &set, &config),
            Selection {
                provider: ProviderId::Sled,
                reason: SelectionReason::Fallback(0)
            }
        );

        let only_memory = RouterConfig::new(ProviderId::Memory)
            .with_fallbacks([ProviderId::Memory])
            .with_default_provider(ProviderId::Memory);
        assert_eq!(
            select(&query, &set, &only_memory).reason,
            SelectionReason::Default
        );
    }

    #[tokio::test]
    async fn test_selection_is_deterministic() {
        let (set, _) = connected_set().await;
        let config = RouterConfig::default();
        let query: DatabaseQuery = RawQuery::new("SELECT 1").into();

        let first = select(&query, &set, &config);
        for _ in 0..100 {
            assert_eq!(select(&query, &set, &config), first);
        }
    }
}
