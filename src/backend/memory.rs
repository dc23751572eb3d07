// In-memory backend driver.
//
// The default driver for local runs and the test double for everything
// above the backend contract. Statements are recorded rather than parsed:
// queries echo their SQL back as a single row, updates count as one row
// touched. Transaction and XA bookkeeping is honest enough to exercise the
// pool, session and transaction layers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{OjpError, Result};

use super::connection::{
    BackendConnection, ConnectionSettings, ExecuteOutcome, XaConnection, XaDataSource, XaResource,
};
use super::driver::Driver;
use super::types::{
    ColumnMeta, IsolationLevel, QueryResult, Row, SqlValue, XaEndFlags, XaRecoverScan,
    XaStartFlags, XaVote, Xid,
};

#[derive(Debug, Default)]
struct ConnState {
    committed: Vec<String>,
    pending: Vec<String>,
    warnings: Vec<String>,
    isolation: IsolationLevel,
    auto_commit: bool,
}

/// One in-memory logical connection.
pub struct MemoryConnection {
    url: String,
    state: Mutex<ConnState>,
    closed: AtomicBool,
    poisoned: AtomicBool,
    isolation_resets: AtomicU64,
}

impl MemoryConnection {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: Mutex::new(ConnState {
                auto_commit: true,
                ..ConnState::default()
            }),
            closed: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            isolation_resets: AtomicU64::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Statements visible after commit.
    pub fn committed_statements(&self) -> Vec<String> {
        self.state.lock().committed.clone()
    }

    /// Statements executed inside the open local transaction.
    pub fn pending_statements(&self) -> Vec<String> {
        self.state.lock().pending.clone()
    }

    /// Marks the connection invalid so validation fails.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    /// How many times the isolation level has been set.
    pub fn isolation_set_count(&self) -> u64 {
        self.isolation_resets.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OjpError::backend("08003", "connection is closed"));
        }
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(OjpError::TransientBackend("connection poisoned".into()));
        }
        Ok(())
    }

    fn record(&self, sql: &str) {
        let mut state = self.state.lock();
        if state.auto_commit {
            state.committed.push(sql.to_string());
        } else {
            state.pending.push(sql.to_string());
        }
    }
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<ExecuteOutcome> {
        let head = sql.trim_start().to_ascii_uppercase();
        if head.starts_with("SELECT") {
            Ok(ExecuteOutcome::Rows(self.execute_query(sql, params).await?))
        } else {
            Ok(ExecuteOutcome::Update(self.execute_update(sql, params).await?))
        }
    }

    async fn execute_query(&self, sql: &str, _params: &[SqlValue]) -> Result<QueryResult> {
        self.ensure_open()?;
        self.record(sql);
        Ok(QueryResult {
            columns: vec![ColumnMeta {
                name: "statement".to_string(),
                type_name: "VARCHAR".to_string(),
            }],
            rows: vec![Row {
                values: vec![SqlValue::Text(sql.to_string())],
            }],
        })
    }

    async fn execute_update(&self, sql: &str, _params: &[SqlValue]) -> Result<u64> {
        self.ensure_open()?;
        self.record(sql);
        Ok(1)
    }

    async fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        state.committed.extend(pending);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        self.state.lock().pending.clear();
        Ok(())
    }

    async fn set_auto_commit(&self, enabled: bool) -> Result<()> {
        self.ensure_open()?;
        self.state.lock().auto_commit = enabled;
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        self.state.lock().auto_commit
    }

    async fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()> {
        self.ensure_open()?;
        self.isolation_resets.fetch_add(1, Ordering::SeqCst);
        self.state.lock().isolation = level;
        Ok(())
    }

    fn transaction_isolation(&self) -> IsolationLevel {
        self.state.lock().isolation
    }

    async fn clear_warnings(&self) -> Result<()> {
        self.state.lock().warnings.clear();
        Ok(())
    }

    async fn is_valid(&self, _timeout: Duration) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.poisoned.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Default in-tree driver for `jdbc:mem:` URLs.
pub struct MemoryDriver {
    _private: (),
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn id(&self) -> &str {
        "mem"
    }

    fn accepts_url(&self, url: &str) -> bool {
        url.starts_with("jdbc:mem:") || url.starts_with("mem:")
    }

    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn BackendConnection>> {
        if !self.accepts_url(&settings.url) {
            return Err(OjpError::DriverMissing(settings.url.clone()));
        }
        let conn = MemoryConnection::new(settings.url.clone());
        conn.set_auto_commit(settings.auto_commit).await?;
        conn.set_transaction_isolation(settings.default_isolation)
            .await?;
        Ok(Arc::new(conn))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemXaBranch {
    Started,
    Ended,
    Prepared,
}

/// Branch table scoped to one in-memory "database", shared by every
/// connection a datasource hands out, the way a real backend's recover
/// reports prepared branches regardless of which connection asks.
type SharedBranches = Arc<Mutex<HashMap<Xid, MemXaBranch>>>;

/// XA face of one in-memory physical connection.
pub struct MemoryXaResource {
    branches: SharedBranches,
    timeout: Mutex<Option<Duration>>,
}

impl MemoryXaResource {
    fn new(branches: SharedBranches) -> Self {
        Self {
            branches,
            timeout: Mutex::new(None),
        }
    }
}

#[async_trait]
impl XaResource for MemoryXaResource {
    async fn start(&self, xid: &Xid, flags: XaStartFlags) -> Result<()> {
        let mut branches = self.branches.lock();
        match flags {
            XaStartFlags::NoFlags => {
                branches.insert(xid.clone(), MemXaBranch::Started);
            }
            XaStartFlags::Join | XaStartFlags::Resume => {
                branches.insert(xid.clone(), MemXaBranch::Started);
            }
        }
        Ok(())
    }

    async fn end(&self, xid: &Xid, _flags: XaEndFlags) -> Result<()> {
        self.branches.lock().insert(xid.clone(), MemXaBranch::Ended);
        Ok(())
    }

    async fn prepare(&self, xid: &Xid) -> Result<XaVote> {
        self.branches.lock().insert(xid.clone(), MemXaBranch::Prepared);
        Ok(XaVote::Ok)
    }

    async fn commit(&self, xid: &Xid, _one_phase: bool) -> Result<()> {
        self.branches.lock().remove(xid);
        Ok(())
    }

    async fn rollback(&self, xid: &Xid) -> Result<()> {
        self.branches.lock().remove(xid);
        Ok(())
    }

    async fn forget(&self, xid: &Xid) -> Result<()> {
        self.branches.lock().remove(xid);
        Ok(())
    }

    async fn recover(&self, _scan: XaRecoverScan) -> Result<Vec<Xid>> {
        Ok(self
            .branches
            .lock()
            .iter()
            .filter(|(_, s)| **s == MemXaBranch::Prepared)
            .map(|(x, _)| x.clone())
            .collect())
    }

    async fn set_transaction_timeout(&self, timeout: Duration) -> Result<bool> {
        *self.timeout.lock() = Some(timeout);
        Ok(true)
    }
}

/// One in-memory physical XA connection.
///
/// The logical handle is created once and cached; every call to
/// `logical_connection` returns that same handle.
pub struct MemoryXaConnection {
    logical: Arc<MemoryConnection>,
    resource: Arc<MemoryXaResource>,
}

impl MemoryXaConnection {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_branches(url, Arc::new(Mutex::new(HashMap::new())))
    }

    fn with_branches(url: impl Into<String>, branches: SharedBranches) -> Self {
        Self {
            logical: Arc::new(MemoryConnection::new(url)),
            resource: Arc::new(MemoryXaResource::new(branches)),
        }
    }

    pub fn memory_connection(&self) -> Arc<MemoryConnection> {
        Arc::clone(&self.logical)
    }
}

#[async_trait]
impl XaConnection for MemoryXaConnection {
    fn logical_connection(&self) -> Arc<dyn BackendConnection> {
        Arc::clone(&self.logical) as Arc<dyn BackendConnection>
    }

    fn xa_resource(&self) -> Arc<dyn XaResource> {
        Arc::clone(&self.resource) as Arc<dyn XaResource>
    }

    async fn close(&self) -> Result<()> {
        self.logical.close().await
    }
}

/// Factory for in-memory XA connections.
pub struct MemoryXaDataSource {
    url: String,
    created: AtomicU64,
    branches: SharedBranches,
}

impl MemoryXaDataSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            created: AtomicU64::new(0),
            branches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Physical connections created so far.
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl XaDataSource for MemoryXaDataSource {
    async fn xa_connection(&self) -> Result<Arc<dyn XaConnection>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryXaConnection::with_branches(
            self.url.clone(),
            Arc::clone(&self.branches),
        )))
    }

    fn id(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_autocommit_records_directly() {
        let conn = MemoryConnection::new("jdbc:mem:t");
        conn.execute_update("INSERT INTO t VALUES (1)", &[]).await.unwrap();
        assert_eq!(conn.committed_statements().len(), 1);
        assert!(conn.pending_statements().is_empty());
    }

    #[tokio::test]
    async fn test_local_transaction_commit_and_rollback() {
        let conn = MemoryConnection::new("jdbc:mem:t");
        conn.set_auto_commit(false).await.unwrap();

        conn.execute_update("INSERT INTO t VALUES (1)", &[]).await.unwrap();
        assert!(conn.committed_statements().is_empty());
        conn.commit().await.unwrap();
        assert_eq!(conn.committed_statements().len(), 1);

        conn.execute_update("INSERT INTO t VALUES (2)", &[]).await.unwrap();
        conn.rollback().await.unwrap();
        assert_eq!(conn.committed_statements().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_statements() {
        let conn = MemoryConnection::new("jdbc:mem:t");
        conn.close().await.unwrap();
        let err = conn.execute_update("INSERT", &[]).await.unwrap_err();
        assert!(matches!(err, OjpError::Backend { .. }));
        assert!(!conn.is_valid(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_poisoned_connection_is_transient() {
        let conn = MemoryConnection::new("jdbc:mem:t");
        conn.poison();
        let err = conn.execute_update("INSERT", &[]).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_xa_connection_reuses_logical_handle() {
        let xa = MemoryXaConnection::new("jdbc:mem:xa");
        let a = xa.logical_connection();
        let b = xa.logical_connection();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_xa_recover_lists_prepared_only() {
        let xa = MemoryXaConnection::new("jdbc:mem:xa");
        let res = xa.xa_resource();
        let x1 = Xid::new(1, b"a".to_vec(), b"1".to_vec());
        let x2 = Xid::new(1, b"b".to_vec(), b"1".to_vec());

        res.start(&x1, XaStartFlags::NoFlags).await.unwrap();
        res.end(&x1, XaEndFlags::Success).await.unwrap();
        res.prepare(&x1).await.unwrap();

        res.start(&x2, XaStartFlags::NoFlags).await.unwrap();

        let prepared = res.recover(XaRecoverScan::Start).await.unwrap();
        assert_eq!(prepared, vec![x1.clone()]);

        res.commit(&x1, false).await.unwrap();
        assert!(res.recover(XaRecoverScan::Start).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_is_database_scoped() {
        let ds = MemoryXaDataSource::new("jdbc:mem:xa");
        let c1 = ds.xa_connection().await.unwrap();
        let c2 = ds.xa_connection().await.unwrap();
        let x = Xid::new(1, b"shared".to_vec(), b"1".to_vec());

        let res1 = c1.xa_resource();
        res1.start(&x, XaStartFlags::NoFlags).await.unwrap();
        res1.end(&x, XaEndFlags::Success).await.unwrap();
        res1.prepare(&x).await.unwrap();

        // A different connection to the same database sees the branch.
        let seen = c2.xa_resource().recover(XaRecoverScan::Start).await.unwrap();
        assert_eq!(seen, vec![x]);
        assert_eq!(ds.created_count(), 2);
    }

    #[test]
    fn test_driver_url_filter() {
        let driver = MemoryDriver::new();
        assert!(driver.accepts_url("jdbc:mem:orders"));
        assert!(!driver.accepts_url("jdbc:postgresql://x"));

        let settings = ConnectionSettings::new("jdbc:mem:orders", "app", "secret");
        let conn = tokio_test::block_on(driver.connect(&settings)).unwrap();
        assert!(conn.auto_commit());
    }
}
