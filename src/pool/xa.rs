// XA pool provider and the backend session it hands out.
//
// A `BackendSession` wraps one physical XA connection. The logical handle
// is resolved once at construction and cached for the session's whole
// life: clients keep a reference to it, so post-transaction cleanup must
// reset state on that same handle instead of asking the driver for a fresh
// one (a fresh handle leaves the cached reference pointing at a stale
// connection on several drivers).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{
    BackendConnection, IsolationLevel, XaConnection, XaDataSource, XaResource,
};
use crate::config::{DiagnosticsConfig, LeakDetectionConfig};
use crate::error::Result;

use super::core::{ObjectPool, PoolEntry, PoolableFactory};
use super::housekeeping::{Housekeeper, Housekept};
use super::provider::{XaPoolProvider, XaSessionPool};
use super::standard::VALIDATION_TIMEOUT;
use super::{PoolSettings, PoolStatistics};

/// A borrowed XA backend session.
pub type PooledXaSession = Arc<PoolEntry<Arc<BackendSession>>>;

/// One pooled physical XA connection with its cached logical handle.
pub struct BackendSession {
    session_id: Uuid,
    xa_connection: Arc<dyn XaConnection>,
    logical: Arc<dyn BackendConnection>,
    resource: Arc<dyn XaResource>,
    default_isolation: IsolationLevel,
    created_at: Instant,
    last_borrow: Mutex<Option<Instant>>,
    last_return: Mutex<Option<Instant>>,
    borrowing_task: Mutex<Option<String>>,
    /// While set, the session is exempt from return, reset and eviction;
    /// a prepared branch on it is waiting for its commit/rollback decision.
    pinned: AtomicBool,
}

impl BackendSession {
    pub fn new(xa_connection: Arc<dyn XaConnection>, default_isolation: IsolationLevel) -> Self {
        let logical = xa_connection.logical_connection();
        let resource = xa_connection.xa_resource();
        Self {
            session_id: Uuid::new_v4(),
            xa_connection,
            logical,
            resource,
            default_isolation,
            created_at: Instant::now(),
            last_borrow: Mutex::new(None),
            last_return: Mutex::new(None),
            borrowing_task: Mutex::new(None),
            pinned: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// The cached logical handle. Always the same `Arc` for this session.
    pub fn logical(&self) -> Arc<dyn BackendConnection> {
        Arc::clone(&self.logical)
    }

    pub fn xa_resource(&self) -> Arc<dyn XaResource> {
        Arc::clone(&self.resource)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn pin(&self) {
        self.pinned.store(true, Ordering::SeqCst);
    }

    pub fn unpin(&self) {
        self.pinned.store(false, Ordering::SeqCst);
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::SeqCst)
    }

    pub fn mark_borrowed(&self, task: String) {
        *self.last_borrow.lock() = Some(Instant::now());
        *self.borrowing_task.lock() = Some(task);
    }

    pub fn mark_returned(&self) {
        *self.last_return.lock() = Some(Instant::now());
        *self.borrowing_task.lock() = None;
    }

    /// Full reset on pool passivation: abandon local work, restore
    /// autocommit and the configured isolation level.
    pub async fn reset(&self) -> Result<()> {
        if !self.logical.auto_commit() {
            self.logical.rollback().await?;
        }
        self.logical.clear_warnings().await?;
        self.logical.set_auto_commit(true).await?;
        self.logical
            .set_transaction_isolation(self.default_isolation)
            .await?;
        Ok(())
    }

    /// Post-transaction cleanup after commit/rollback of an XA branch.
    ///
    /// Resets isolation and warnings on the cached logical handle only;
    /// the session stays bound to its logical client session and is NOT
    /// returned to the pool here.
    pub async fn sanitize_after_transaction(&self) -> Result<()> {
        self.logical
            .set_transaction_isolation(self.default_isolation)
            .await?;
        self.logical.clear_warnings().await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.xa_connection.close().await
    }
}

struct XaSessionFactory {
    datasource: Arc<dyn XaDataSource>,
    default_isolation: IsolationLevel,
}

#[async_trait]
impl PoolableFactory for XaSessionFactory {
    type Resource = Arc<BackendSession>;

    async fn create(&self) -> Result<Self::Resource> {
        let xa_connection = self.datasource.xa_connection().await?;
        Ok(Arc::new(BackendSession::new(
            xa_connection,
            self.default_isolation,
        )))
    }

    async fn validate(&self, session: &Self::Resource) -> bool {
        session.logical().is_valid(VALIDATION_TIMEOUT).await
    }

    async fn passivate(&self, session: &Self::Resource) -> Result<()> {
        session.mark_returned();
        session.reset().await
    }

    async fn destroy(&self, session: &Self::Resource) {
        if let Err(e) = session.close().await {
            debug!(session = %session.session_id(), error = %e, "error closing XA session");
        }
    }

    fn is_pinned(&self, session: &Self::Resource) -> bool {
        session.is_pinned()
    }
}

/// XA pool backed by the generic object-pool core.
pub struct XaBackendPool {
    inner: Arc<ObjectPool<XaSessionFactory>>,
    housekeeper: Housekeeper,
}

impl XaBackendPool {
    pub async fn open(
        name: &str,
        datasource: Arc<dyn XaDataSource>,
        settings: PoolSettings,
        leak: LeakDetectionConfig,
        diagnostics: DiagnosticsConfig,
    ) -> Result<Self> {
        let factory = XaSessionFactory {
            datasource,
            default_isolation: settings.default_isolation(),
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
impl XaSessionPool for XaBackendPool {
    async fn borrow(&self) -> Result<PooledXaSession> {
        let entry = self.inner.borrow().await?;
        entry
            .resource()
            .mark_borrowed(format!("{:?}", std::thread::current().id()));
        Ok(entry)
    }

    async fn give_back(&self, session: PooledXaSession) {
        self.inner.give_back(session).await
    }

    async fn invalidate(&self, session: PooledXaSession) {
        self.inner.invalidate(session).await
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

/// Default provider for XA pools.
pub struct XaBackendPoolProvider {
    leak: LeakDetectionConfig,
    diagnostics: DiagnosticsConfig,
}

impl XaBackendPoolProvider {
    pub fn new(leak: LeakDetectionConfig, diagnostics: DiagnosticsConfig) -> Self {
        Self { leak, diagnostics }
    }
}

#[async_trait]
impl XaPoolProvider for XaBackendPoolProvider {
    fn id(&self) -> &str {
        "universal-xa"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn available(&self) -> bool {
        true
    }

    async fn create_pool(
        &self,
        name: &str,
        settings: PoolSettings,
        datasource: Arc<dyn XaDataSource>,
    ) -> Result<Arc<dyn XaSessionPool>> {
        let pool = XaBackendPool::open(
            name,
            datasource,
            settings,
            self.leak.clone(),
            self.diagnostics.clone(),
        )
        .await?;
        Ok(Arc::new(pool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryXaDataSource;
    use crate::backend::ConnectionSettings;
    use std::time::Duration;

    fn settings() -> PoolSettings {
        let mut s = PoolSettings::new(ConnectionSettings::new("jdbc:mem:xa", "u", "p"));
        s.max_pool_size = 2;
        s.connection_timeout = Duration::from_millis(100);
        s
    }

    fn quiet() -> (LeakDetectionConfig, DiagnosticsConfig) {
        (
            LeakDetectionConfig {
                interval: Duration::ZERO,
                timeout: Duration::from_secs(300),
                enhanced: false,
            },
            DiagnosticsConfig {
                enabled: false,
                interval: Duration::from_secs(60),
            },
        )
    }

    async fn open_pool() -> XaBackendPool {
        let (leak, diag) = quiet();
        XaBackendPool::open(
            "xa-test",
            Arc::new(MemoryXaDataSource::new("jdbc:mem:xa")),
            settings(),
            leak,
            diag,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_logical_handle_is_stable() {
        let pool = open_pool().await;
        let entry = pool.borrow().await.unwrap();
        let a = entry.resource().logical();
        let b = entry.resource().logical();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_sanitize_restores_isolation_on_same_handle() {
        let pool = open_pool().await;
        let entry = pool.borrow().await.unwrap();
        let session = Arc::clone(entry.resource());

        let logical = session.logical();
        logical
            .set_transaction_isolation(IsolationLevel::Serializable)
            .await
            .unwrap();
        session.sanitize_after_transaction().await.unwrap();

        // Same handle, back at the configured default.
        assert_eq!(
            logical.transaction_isolation(),
            IsolationLevel::ReadCommitted
        );
        assert!(Arc::ptr_eq(&logical, &session.logical()));
    }

    #[tokio::test]
    async fn test_pinned_session_not_returned() {
        let pool = open_pool().await;
        let entry = pool.borrow().await.unwrap();
        entry.resource().pin();

        pool.give_back(Arc::clone(&entry)).await;
        // Still counted active; the idle set stays empty.
        let stats = pool.statistics();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.idle, 0);

        entry.resource().unpin();
        pool.give_back(entry).await;
        let stats = pool.statistics();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_sequential_borrows_reuse_one_physical_connection() {
        let datasource = Arc::new(MemoryXaDataSource::new("jdbc:mem:xa"));
        let (leak, diag) = quiet();
        let pool = XaBackendPool::open("xa-test", datasource.clone(), settings(), leak, diag)
            .await
            .unwrap();

        for _ in 0..4 {
            let entry = pool.borrow().await.unwrap();
            pool.give_back(entry).await;
        }
        assert_eq!(datasource.created_count(), 1);
    }
}
