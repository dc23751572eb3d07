// Ordinary connection pool provider.
//
// The universal provider: works with any registered driver, validates with
// `is_valid` (plus the configured validation query, when present) and
// resets connections on passivation so no local-transaction or isolation
// state leaks between borrowers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::backend::{BackendConnection, Driver, DriverRegistry};
use crate::config::{DiagnosticsConfig, LeakDetectionConfig};
use crate::error::Result;

use super::core::{ObjectPool, PoolEntry, PoolableFactory};
use super::housekeeping::{Housekeeper, Housekept};
use super::provider::{ConnectionPool, PoolProvider};
use super::{PoolSettings, PoolStatistics};

/// Driver-side probe timeout used on borrow and during idle sweeps.
pub(crate) const VALIDATION_TIMEOUT: Duration = Duration::from_secs(5);

/// A borrowed ordinary connection.
pub type PooledConnection = Arc<PoolEntry<Arc<dyn BackendConnection>>>;

struct ConnectionFactory {
    driver: Arc<dyn Driver>,
    settings: PoolSettings,
}

#[async_trait]
impl PoolableFactory for ConnectionFactory {
    type Resource = Arc<dyn BackendConnection>;

    async fn create(&self) -> Result<Self::Resource> {
        self.driver.connect(&self.settings.connection).await
    }

    async fn validate(&self, conn: &Self::Resource) -> bool {
        if !conn.is_valid(VALIDATION_TIMEOUT).await {
            return false;
        }
        if let Some(query) = &self.settings.validation_query {
            if conn.execute_query(query, &[]).await.is_err() {
                return false;
            }
        }
        true
    }

    async fn passivate(&self, conn: &Self::Resource) -> Result<()> {
        if !conn.auto_commit() {
            conn.rollback().await?;
        }
        conn.clear_warnings().await?;
        conn.set_auto_commit(true).await?;
        conn.set_transaction_isolation(self.settings.default_isolation())
            .await?;
        Ok(())
    }

    async fn destroy(&self, conn: &Self::Resource) {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "error closing pooled connection");
        }
    }
}

/// Ordinary pool backed by the generic object-pool core.
pub struct StandardConnectionPool {
    inner: Arc<ObjectPool<ConnectionFactory>>,
    housekeeper: Housekeeper,
}

impl StandardConnectionPool {
    pub async fn open(
        name: &str,
        driver: Arc<dyn Driver>,
        settings: PoolSettings,
        leak: LeakDetectionConfig,
        diagnostics: DiagnosticsConfig,
    ) -> Result<Self> {
        let factory = ConnectionFactory {
            driver,
            settings: settings.clone(),
        };
        let inner = Arc::new(ObjectPool::new(name, factory, settings));
        inner.set_enhanced_leak_tracking(leak.enhanced);
        inner.ensure_min_idle().await?;

        let inner_dyn: Arc<dyn Housekept> = inner.clone();
        let weak: std::sync::Weak<dyn Housekept> = Arc::downgrade(&inner_dyn);
        let housekeeper = Housekeeper::start(weak, leak, diagnostics);
        Ok(Self { inner, housekeeper })
    }
}

#[async_trait]
impl ConnectionPool for StandardConnectionPool {
    async fn borrow(&self) -> Result<PooledConnection> {
        self.inner.borrow().await
    }

    async fn give_back(&self, conn: PooledConnection) {
        self.inner.give_back(conn).await
    }

    async fn invalidate(&self, conn: PooledConnection) {
        self.inner.invalidate(conn).await
    }

    fn statistics(&self) -> PoolStatistics {
        self.inner.statistics()
    }

    async fn resize(&self, max_size: usize, min_idle: usize) -> Result<()> {
        self.inner.resize(max_size, min_idle).await
    }

    async fn close(&self) {
        self.housekeeper.stop();
        self.inner.close().await;
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Default provider for ordinary pools.
pub struct StandardPoolProvider {
    drivers: Arc<DriverRegistry>,
    leak: LeakDetectionConfig,
    diagnostics: DiagnosticsConfig,
}

impl StandardPoolProvider {
    pub fn new(
        drivers: Arc<DriverRegistry>,
        leak: LeakDetectionConfig,
        diagnostics: DiagnosticsConfig,
    ) -> Self {
        Self {
            drivers,
            leak,
            diagnostics,
        }
    }
}

#[async_trait]
impl PoolProvider for StandardPoolProvider {
    fn id(&self) -> &str {
        "universal"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn available(&self) -> bool {
        true
    }

    fn matches(&self, settings: &PoolSettings) -> bool {
        self.drivers.driver_for_url(&settings.connection.url).is_ok()
    }

    async fn create_pool(
        &self,
        name: &str,
        settings: PoolSettings,
    ) -> Result<Arc<dyn ConnectionPool>> {
        let driver = self.drivers.driver_for_url(&settings.connection.url)?;
        let pool = StandardConnectionPool::open(
            name,
            driver,
            settings,
            self.leak.clone(),
            self.diagnostics.clone(),
        )
        .await?;
        Ok(Arc::new(pool))
    }
}
