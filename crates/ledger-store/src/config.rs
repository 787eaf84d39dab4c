use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection settings for [`crate::Store`].
///
/// Missing JSON fields fall back to [`StoreConfig::default`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Database file. `None` opens a private in-memory database.
    pub path: Option<PathBuf>,
    /// Pool size for file databases. In-memory stores always use one connection.
    pub max_connections: u32,
    /// Upper bound on waiting for a pooled connection.
    pub connection_timeout_ms: u64,
    /// Upper bound on waiting for SQLite's write lock.
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 8,
            connection_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.is_none()
    }

    // r2d2 panics on a zero connection timeout.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms.max(1))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn pool_size(&self) -> u32 {
        if self.is_in_memory() {
            1
        } else {
            self.max_connections.max(1)
        }
    }
}
