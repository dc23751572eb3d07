// Pool provider discovery.
//
// Providers are registered explicitly at startup and sorted by priority;
// the first provider that is available and matches the pool settings wins.
// Selection is deterministic: priority descending, then registration order.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::backend::XaDataSource;
use crate::error::{OjpError, Result};

use super::standard::PooledConnection;
use super::xa::PooledXaSession;
use super::{PoolSettings, PoolStatistics};

/// A pool of ordinary backend connections.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn borrow(&self) -> Result<PooledConnection>;

    async fn give_back(&self, conn: PooledConnection);

    async fn invalidate(&self, conn: PooledConnection);

    fn statistics(&self) -> PoolStatistics;

    async fn resize(&self, max_size: usize, min_idle: usize) -> Result<()>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A pool of XA backend sessions.
#[async_trait]
pub trait XaSessionPool: Send + Sync {
    async fn borrow(&self) -> Result<PooledXaSession>;

    async fn give_back(&self, session: PooledXaSession);

    async fn invalidate(&self, session: PooledXaSession);

    fn statistics(&self) -> PoolStatistics;

    async fn resize(&self, max_size: usize, min_idle: usize) -> Result<()>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Factory for ordinary pools.
#[async_trait]
pub trait PoolProvider: Send + Sync {
    fn id(&self) -> &str;

    fn priority(&self) -> i32;

    fn available(&self) -> bool;

    fn matches(&self, _settings: &PoolSettings) -> bool {
        true
    }

    async fn create_pool(
        &self,
        name: &str,
        settings: PoolSettings,
    ) -> Result<Arc<dyn ConnectionPool>>;
}

/// Factory for XA pools.
#[async_trait]
pub trait XaPoolProvider: Send + Sync {
    fn id(&self) -> &str;

    fn priority(&self) -> i32;

    fn available(&self) -> bool;

    fn matches(&self, _settings: &PoolSettings) -> bool {
        true
    }

    async fn create_pool(
        &self,
        name: &str,
        settings: PoolSettings,
        datasource: Arc<dyn XaDataSource>,
    ) -> Result<Arc<dyn XaSessionPool>>;
}

/// Explicit provider lists, both families.
#[derive(Default)]
pub struct ProviderRegistry {
    ordinary: RwLock<Vec<Arc<dyn PoolProvider>>>,
    xa: RwLock<Vec<Arc<dyn XaPoolProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_ordinary(&self, provider: Arc<dyn PoolProvider>) {
        let mut list = self.ordinary.write();
        list.push(provider);
        list.sort_by_key(|p| std::cmp::Reverse(p.priority()));
    }

    pub fn register_xa(&self, provider: Arc<dyn XaPoolProvider>) {
        let mut list = self.xa.write();
        list.push(provider);
        list.sort_by_key(|p| std::cmp::Reverse(p.priority()));
    }

    pub fn select_ordinary(&self, settings: &PoolSettings) -> Result<Arc<dyn PoolProvider>> {
        self.ordinary
            .read()
            .iter()
            .find(|p| p.available() && p.matches(settings))
            .cloned()
            .ok_or_else(|| OjpError::Unavailable("no ordinary pool provider available".into()))
    }

    pub fn select_xa(&self, settings: &PoolSettings) -> Result<Arc<dyn XaPoolProvider>> {
        self.xa
            .read()
            .iter()
            .find(|p| p.available() && p.matches(settings))
            .cloned()
            .ok_or_else(|| OjpError::Unavailable("no XA pool provider available".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ConnectionSettings;

    struct FakeProvider {
        id: String,
        priority: i32,
        available: bool,
    }

    #[async_trait]
    impl PoolProvider for FakeProvider {
        fn id(&self) -> &str {
            &self.id
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn available(&self) -> bool {
            self.available
        }

        async fn create_pool(
            &self,
            _name: &str,
            _settings: PoolSettings,
        ) -> Result<Arc<dyn ConnectionPool>> {
            Err(OjpError::Internal("fake".into()))
        }
    }

    fn settings() -> PoolSettings {
        PoolSettings::new(ConnectionSettings::new("jdbc:mem:t", "u", "p"))
    }

    #[test]
    fn test_highest_priority_available_wins() {
        let registry = ProviderRegistry::new();
        registry.register_ordinary(Arc::new(FakeProvider {
            id: "low".into(),
            priority: 0,
            available: true,
        }));
        registry.register_ordinary(Arc::new(FakeProvider {
            id: "high-unavailable".into(),
            priority: 100,
            available: false,
        }));
        registry.register_ordinary(Arc::new(FakeProvider {
            id: "mid".into(),
            priority: 50,
            available: true,
        }));

        let selected = registry.select_ordinary(&settings()).unwrap();
        assert_eq!(selected.id(), "mid");
    }

    #[test]
    fn test_no_provider_is_unavailable() {
        let registry = ProviderRegistry::new();
        assert!(registry.select_ordinary(&settings()).is_err());
        assert!(registry.select_xa(&settings()).is_err());
    }
}
