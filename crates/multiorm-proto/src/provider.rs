//! Backend provider identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Identity of one of the three storage backends.
///
/// The set is closed, so per-provider state is kept in fixed-size arrays
/// indexed by [`ProviderId::index`] rather than in string-keyed maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// Embedded SQL engine (rusqlite).
    Sqlite,
    /// Embedded ordered key-value store (sled).
    Sled,
    /// In-process relational table store.
    Memory,
}

impl ProviderId {
    /// Number of providers.
    pub const COUNT: usize = 3;

    /// All providers in their canonical (tie-breaking) order.
    pub const ALL: [ProviderId; Self::COUNT] =
        [ProviderId::Sqlite, ProviderId::Sled, ProviderId::Memory];

    /// Stable array index for this provider.
    pub const fn index(self) -> usize {
        match self {
            ProviderId::Sqlite => 0,
            ProviderId::Sled => 1,
            ProviderId::Memory => 2,
        }
    }

    /// Lowercase name used in config files, logs, and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            ProviderId::Sqlite => "sqlite",
            ProviderId::Sled => "sled",
            ProviderId::Memory => "memory",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(ProviderId::Sqlite),
            "sled" => Ok(ProviderId::Sled),
            "memory" => Ok(ProviderId::Memory),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}
