// Client sessions and their scoped resources.
//
// A session owns everything a client opened through it: statements, result
// sets, LOB buffers and at most one backend connection. Termination frees
// the whole arena atomically. Sessions are addressed by UUID and pooled
// per connection hash.

pub mod registry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::backend::{BackendConnection, QueryResult, Row};
use crate::pool::{ConnectionPool, PooledConnection, PooledXaSession, XaSessionPool};

pub use registry::SessionRegistry;

/// Stable fingerprint of the connection parameters a pool serves.
///
/// Computed from `(url, user, password digest, isXA, datasource name)`;
/// the raw password never appears in the fingerprint input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnHash(String);

impl ConnHash {
    pub fn compute(
        url: &str,
        user: &str,
        password: &str,
        is_xa: bool,
        datasource_name: Option<&str>,
    ) -> Self {
        let password_digest = hex::encode(Sha256::digest(password.as_bytes()));
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update([0]);
        hasher.update(user.as_bytes());
        hasher.update([0]);
        hasher.update(password_digest.as_bytes());
        hasher.update([0]);
        hasher.update([u8::from(is_xa)]);
        hasher.update([0]);
        hasher.update(datasource_name.unwrap_or("").as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wraps a fingerprint received on the wire.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Fingerprints are long; logs only need a prefix.
        write!(f, "{}", &self.0[..self.0.len().min(12)])
    }
}

/// The backend connection a session currently holds.
pub enum BackendHandle {
    /// Unpooled connection created directly from a driver.
    Direct(Arc<dyn BackendConnection>),
    /// Borrowed from an ordinary pool.
    Pooled {
        pool: Arc<dyn ConnectionPool>,
        entry: PooledConnection,
    },
    /// Borrowed from an XA pool; stays bound for the session's lifetime.
    Xa {
        pool: Arc<dyn XaSessionPool>,
        entry: PooledXaSession,
    },
}

impl BackendHandle {
    /// The logical connection statements run on by default.
    pub fn connection(&self) -> Arc<dyn BackendConnection> {
        match self {
            BackendHandle::Direct(conn) => Arc::clone(conn),
            BackendHandle::Pooled { entry, .. } => Arc::clone(entry.resource()),
            BackendHandle::Xa { entry, .. } => entry.resource().logical(),
        }
    }

    pub fn xa_entry(&self) -> Option<&PooledXaSession> {
        match self {
            BackendHandle::Xa { entry, .. } => Some(entry),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LobKind {
    Blob,
    Clob,
}

/// Session-scoped LOB buffer.
pub struct LobBuffer {
    kind: LobKind,
    data: Mutex<Vec<u8>>,
}

impl LobBuffer {
    pub fn new(kind: LobKind) -> Self {
        Self {
            kind,
            data: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> LobKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes `chunk` at `offset`, zero-filling any gap.
    pub fn write_at(&self, offset: usize, chunk: &[u8]) {
        let mut data = self.data.lock();
        let end = offset + chunk.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(chunk);
    }

    /// Reads at most `length` bytes starting at `offset`.
    pub fn read_at(&self, offset: usize, length: usize) -> Vec<u8> {
        let data = self.data.lock();
        if offset >= data.len() {
            return Vec::new();
        }
        let end = (offset + length).min(data.len());
        data[offset..end].to_vec()
    }
}

/// A prepared statement registered in the session arena.
pub struct PreparedStatement {
    pub sql: String,
    pub created_at: Instant,
}

/// A materialized result set being paged out to the client.
pub struct ResultSetCursor {
    result: QueryResult,
    position: AtomicUsize,
}

impl ResultSetCursor {
    pub fn new(result: QueryResult) -> Self {
        Self {
            result,
            position: AtomicUsize::new(0),
        }
    }

    pub fn columns(&self) -> &[crate::backend::ColumnMeta] {
        &self.result.columns
    }

    /// Next page of at most `fetch_size` rows; empty when drained.
    pub fn fetch(&self, fetch_size: usize) -> (Vec<Row>, bool) {
        let fetch_size = fetch_size.max(1);
        let start = self
            .position
            .fetch_add(fetch_size, Ordering::SeqCst)
            .min(self.result.rows.len());
        let end = (start + fetch_size).min(self.result.rows.len());
        let rows = self.result.rows[start..end].to_vec();
        let exhausted = end >= self.result.rows.len();
        (rows, exhausted)
    }
}

static ACTIVITY_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn millis_since_epoch() -> u64 {
    ACTIVITY_EPOCH.elapsed().as_millis() as u64
}

/// One client session.
impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_uuid", &self.session_uuid)
            .field("client_uuid", &self.client_uuid)
            .field("is_xa", &self.is_xa)
            .finish()
    }
}

pub struct Session {
    session_uuid: Uuid,
    client_uuid: Uuid,
    conn_hash: ConnHash,
    is_xa: bool,
    created_at: Instant,
    /// Monotonic activity stamp, millis since process start.
    last_activity: AtomicU64,
    backend: tokio::sync::Mutex<Option<BackendHandle>>,
    attributes: Mutex<HashMap<String, String>>,
    statements: DashMap<Uuid, PreparedStatement>,
    result_sets: DashMap<Uuid, Arc<ResultSetCursor>>,
    lobs: DashMap<Uuid, Arc<LobBuffer>>,
}

impl Session {
    pub fn new(client_uuid: Uuid, conn_hash: ConnHash, is_xa: bool) -> Self {
        Self {
            session_uuid: Uuid::new_v4(),
            client_uuid,
            conn_hash,
            is_xa,
            created_at: Instant::now(),
            last_activity: AtomicU64::new(millis_since_epoch()),
            backend: tokio::sync::Mutex::new(None),
            attributes: Mutex::new(HashMap::new()),
            statements: DashMap::new(),
            result_sets: DashMap::new(),
            lobs: DashMap::new(),
        }
    }

    pub fn session_uuid(&self) -> Uuid {
        self.session_uuid
    }

    pub fn client_uuid(&self) -> Uuid {
        self.client_uuid
    }

    pub fn conn_hash(&self) -> &ConnHash {
        &self.conn_hash
    }

    pub fn is_xa(&self) -> bool {
        self.is_xa
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Stamps activity. Monotonic: a stale stamp never overwrites a newer
    /// one, so the reaper cannot preempt an in-flight call.
    pub fn touch(&self) {
        let now = millis_since_epoch();
        self.last_activity.fetch_max(now, Ordering::SeqCst);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::SeqCst);
        Duration::from_millis(millis_since_epoch().saturating_sub(last))
    }

    /// The session's backend slot; None until lazily acquired.
    pub fn backend(&self) -> &tokio::sync::Mutex<Option<BackendHandle>> {
        &self.backend
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.lock().insert(name.into(), value.into());
    }

    pub fn attribute(&self, name: &str) -> Option<String> {
        self.attributes.lock().get(name).cloned()
    }

    pub fn clear_attributes(&self) {
        self.attributes.lock().clear();
    }

    pub fn add_statement(&self, statement: PreparedStatement) -> Uuid {
        let id = Uuid::new_v4();
        self.statements.insert(id, statement);
        id
    }

    pub fn statement_sql(&self, id: &Uuid) -> Option<String> {
        self.statements.get(id).map(|s| s.sql.clone())
    }

    pub fn close_statement(&self, id: &Uuid) -> bool {
        self.statements.remove(id).is_some()
    }

    pub fn add_result_set(&self, result: QueryResult) -> Uuid {
        let id = Uuid::new_v4();
        self.result_sets.insert(id, Arc::new(ResultSetCursor::new(result)));
        id
    }

    pub fn result_set(&self, id: &Uuid) -> Option<Arc<ResultSetCursor>> {
        self.result_sets.get(id).map(|r| Arc::clone(r.value()))
    }

    pub fn close_result_set(&self, id: &Uuid) -> bool {
        self.result_sets.remove(id).is_some()
    }

    pub fn add_lob(&self, kind: LobKind) -> Uuid {
        let id = Uuid::new_v4();
        self.lobs.insert(id, Arc::new(LobBuffer::new(kind)));
        id
    }

    pub fn lob(&self, id: &Uuid) -> Option<Arc<LobBuffer>> {
        self.lobs.get(id).map(|l| Arc::clone(l.value()))
    }

    pub fn open_resource_counts(&self) -> (usize, usize, usize) {
        (
            self.statements.len(),
            self.result_sets.len(),
            self.lobs.len(),
        )
    }

    /// Drops every statement, result set and LOB in one sweep.
    pub fn clear_resources(&self) {
        self.statements.clear();
        self.result_sets.clear();
        self.lobs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ColumnMeta;
    use crate::backend::SqlValue;

    fn hash() -> ConnHash {
        ConnHash::compute("jdbc:mem:t", "app", "secret", false, None)
    }

    #[test]
    fn test_conn_hash_is_stable_and_discriminating() {
        let a = ConnHash::compute("jdbc:mem:t", "app", "secret", false, None);
        let b = ConnHash::compute("jdbc:mem:t", "app", "secret", false, None);
        assert_eq!(a, b);

        // Any field flips the fingerprint.
        assert_ne!(a, ConnHash::compute("jdbc:mem:u", "app", "secret", false, None));
        assert_ne!(a, ConnHash::compute("jdbc:mem:t", "ops", "secret", false, None));
        assert_ne!(a, ConnHash::compute("jdbc:mem:t", "app", "other", false, None));
        assert_ne!(a, ConnHash::compute("jdbc:mem:t", "app", "secret", true, None));
        assert_ne!(
            a,
            ConnHash::compute("jdbc:mem:t", "app", "secret", false, Some("orders"))
        );
    }

    #[test]
    fn test_conn_hash_hides_password() {
        let h = ConnHash::compute("jdbc:mem:t", "app", "hunter2", false, None);
        assert!(!h.as_str().contains("hunter2"));
    }

    #[test]
    fn test_touch_is_monotonic() {
        let session = Session::new(Uuid::new_v4(), hash(), false);
        session.touch();
        let idle_before = session.idle_for();
        session.touch();
        assert!(session.idle_for() <= idle_before + Duration::from_millis(5));
    }

    #[test]
    fn test_resource_arena_lifecycle() {
        let session = Session::new(Uuid::new_v4(), hash(), false);

        let stmt = session.add_statement(PreparedStatement {
            sql: "SELECT 1".into(),
            created_at: Instant::now(),
        });
        let rs = session.add_result_set(QueryResult::default());
        let lob = session.add_lob(LobKind::Blob);

        assert_eq!(session.open_resource_counts(), (1, 1, 1));
        assert_eq!(session.statement_sql(&stmt).unwrap(), "SELECT 1");
        assert!(session.lob(&lob).is_some());
        assert!(session.close_statement(&stmt));
        assert!(session.close_result_set(&rs));

        session.clear_resources();
        assert_eq!(session.open_resource_counts(), (0, 0, 0));
    }

    #[test]
    fn test_lob_window_io() {
        let lob = LobBuffer::new(LobKind::Blob);
        lob.write_at(0, b"hello");
        lob.write_at(10, b"world");

        assert_eq!(lob.len(), 15);
        assert_eq!(lob.read_at(0, 5), b"hello");
        assert_eq!(lob.read_at(5, 5), vec![0u8; 5]);
        assert_eq!(lob.read_at(10, 100), b"world");
        assert!(lob.read_at(50, 10).is_empty());
    }

    #[test]
    fn test_result_set_paging() {
        let result = QueryResult {
            columns: vec![ColumnMeta {
                name: "n".into(),
                type_name: "INT".into(),
            }],
            rows: (0..5)
                .map(|i| Row {
                    values: vec![SqlValue::Int(i)],
                })
                .collect(),
        };
        let cursor = ResultSetCursor::new(result);

        let (page, done) = cursor.fetch(2);
        assert_eq!(page.len(), 2);
        assert!(!done);
        let (page, done) = cursor.fetch(2);
        assert_eq!(page.len(), 2);
        assert!(!done);
        let (page, done) = cursor.fetch(2);
        assert_eq!(page.len(), 1);
        assert!(done);
        let (page, done) = cursor.fetch(2);
        assert!(page.is_empty());
        assert!(done);
    }
}
