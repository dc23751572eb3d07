// Connection pooling.
//
// Two provider families share one generic object-pool core: ordinary pools
// hand out plain backend connections, XA pools hand out backend sessions
// (physical XA connections with their cached logical handle). Providers are
// selected by priority at startup; pools are keyed server-side by the
// connection hash of the datasource they serve.

pub mod core;
pub mod housekeeping;
pub mod provider;
pub mod standard;
pub mod xa;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{ConnectionSettings, IsolationLevel};

pub use self::core::{BorrowInfo, ObjectPool, PoolEntry, PoolableFactory};
pub use housekeeping::Housekeeper;
pub use provider::{ConnectionPool, PoolProvider, ProviderRegistry, XaPoolProvider, XaSessionPool};
pub use standard::{PooledConnection, StandardConnectionPool, StandardPoolProvider};
pub use xa::{BackendSession, PooledXaSession, XaBackendPool, XaBackendPoolProvider};

/// Everything needed to build one pool: how to connect plus how to size and
/// police it.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub connection: ConnectionSettings,
    /// Driver id hint; resolved from the URL when absent.
    pub driver_class: Option<String>,
    pub max_pool_size: usize,
    pub min_idle: usize,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    /// An aged resource is only recycled once it has also been idle this
    /// long; busy resources are never recycled mid-borrow.
    pub idle_before_recycle: Duration,
    pub validation_query: Option<String>,
}

impl PoolSettings {
    pub fn new(connection: ConnectionSettings) -> Self {
        Self {
            connection,
            driver_class: None,
            max_pool_size: 10,
            min_idle: 1,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            idle_before_recycle: Duration::from_secs(30),
            validation_query: None,
        }
    }

    pub fn default_isolation(&self) -> IsolationLevel {
        self.connection.default_isolation
    }
}

/// Point-in-time pool counters, serialized as-is into the diagnostics log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatistics {
    pub active: usize,
    pub idle: usize,
    pub waiters: usize,
    pub max: usize,
    pub created: u64,
    pub destroyed: u64,
    pub borrowed: u64,
    pub returned: u64,
}
