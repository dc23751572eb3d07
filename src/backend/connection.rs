// Connection-level contract between the proxy and backend drivers.
//
// A `BackendConnection` is the logical handle statements run on; an
// `XaConnection` pairs one logical handle with the XA resource of the same
// physical connection. Both are handed out as `Arc<dyn ...>` so sessions,
// pools and the transaction registry can share them without copying driver
// state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::types::{
    IsolationLevel, QueryResult, SqlValue, XaEndFlags, XaRecoverScan, XaStartFlags, XaVote, Xid,
};

/// Parameters a driver needs to open one physical connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub url: String,
    pub user: String,
    pub password: String,
    pub auto_commit: bool,
    pub default_isolation: IsolationLevel,
    /// Driver-specific extras, passed through untouched.
    pub properties: HashMap<String, String>,
}

impl ConnectionSettings {
    pub fn new(url: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: user.into(),
            password: password.into(),
            auto_commit: true,
            default_isolation: IsolationLevel::default(),
            properties: HashMap::new(),
        }
    }
}

/// Result of a generic `execute` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecuteOutcome {
    /// Statement produced an update count.
    Update(u64),
    /// Statement produced a result set.
    Rows(QueryResult),
}

/// A logical connection to one backend database.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<ExecuteOutcome>;

    async fn execute_query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult>;

    async fn execute_update(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    async fn set_auto_commit(&self, enabled: bool) -> Result<()>;

    fn auto_commit(&self) -> bool;

    async fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()>;

    fn transaction_isolation(&self) -> IsolationLevel;

    async fn clear_warnings(&self) -> Result<()>;

    /// Liveness probe with a driver-side timeout.
    async fn is_valid(&self, timeout: Duration) -> bool;

    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// The XA face of one physical connection.
#[async_trait]
pub trait XaResource: Send + Sync {
    async fn start(&self, xid: &Xid, flags: XaStartFlags) -> Result<()>;

    async fn end(&self, xid: &Xid, flags: XaEndFlags) -> Result<()>;

    async fn prepare(&self, xid: &Xid) -> Result<XaVote>;

    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()>;

    async fn rollback(&self, xid: &Xid) -> Result<()>;

    async fn forget(&self, xid: &Xid) -> Result<()>;

    /// Prepared xids known to the backend.
    async fn recover(&self, scan: XaRecoverScan) -> Result<Vec<Xid>>;

    /// Returns false if the backend ignored the requested timeout.
    async fn set_transaction_timeout(&self, timeout: Duration) -> Result<bool>;
}

/// One physical XA-capable connection.
///
/// `logical_connection` MUST return the same handle for the lifetime of the
/// physical connection. Post-transaction cleanup resets state on that handle
/// in place; swapping in a fresh handle breaks the reference the client
/// session already holds.
#[async_trait]
pub trait XaConnection: Send + Sync {
    fn logical_connection(&self) -> Arc<dyn BackendConnection>;

    fn xa_resource(&self) -> Arc<dyn XaResource>;

    async fn close(&self) -> Result<()>;
}

/// Factory for XA connections, one per configured XA datasource.
#[async_trait]
pub trait XaDataSource: Send + Sync {
    async fn xa_connection(&self) -> Result<Arc<dyn XaConnection>>;

    fn id(&self) -> &str;
}
