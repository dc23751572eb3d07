// Session and statement execution engine.
//
// Routes every operation addressed by session UUID onto the right backend
// connection: the session's own (lazily acquired) connection, or the
// backend session bound to the XA branch named in the request. All scoped
// resources live in the session arena and are freed on terminate.

pub mod reaper;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::adapter::{
    XaAdapterRegistry, XaDataSourceConfig, KEY_CLASS_NAME, KEY_PASSWORD, KEY_URL, KEY_USERNAME,
};
use crate::backend::{
    BackendConnection, ConnectionSettings, DriverRegistry, ExecuteOutcome, IsolationLevel, Row,
    SqlValue, XaEndFlags, XaRecoverScan, XaStartFlags, XaVote, Xid,
};
use crate::config::{resolve_placeholders, PropertySource, ServerConfig};
use crate::error::{OjpError, Result};
use crate::pool::{ConnectionPool, PoolSettings, ProviderRegistry, XaSessionPool};
use crate::scheduler::{operation_hash, AdmissionTicket, SlowQueryScheduler};
use crate::session::{
    BackendHandle, ConnHash, LobKind, PreparedStatement, Session, SessionRegistry,
};
use crate::xa::TxRegistry;

/// First page returned by `execute_query`.
pub struct QueryPage {
    pub result_set: Uuid,
    pub columns: Vec<crate::backend::ColumnMeta>,
    pub rows: Vec<Row>,
    pub exhausted: bool,
}

/// The server-side execution engine.
pub struct ProxyEngine {
    config: ServerConfig,
    props: PropertySource,
    drivers: Arc<DriverRegistry>,
    providers: Arc<ProviderRegistry>,
    xa_adapters: Arc<XaAdapterRegistry>,
    sessions: Arc<SessionRegistry>,
    tx: Arc<TxRegistry>,
    pools: DashMap<String, Arc<dyn ConnectionPool>>,
    xa_pools: DashMap<String, Arc<dyn XaSessionPool>>,
    schedulers: DashMap<String, Arc<SlowQueryScheduler>>,
    /// Unpooled datasources: a fresh backend connection per session.
    direct: DashMap<String, ConnectionSettings>,
    /// Resize targets received before the pool exists; applied at creation.
    pending_resizes: DashMap<String, (usize, usize)>,
    xa_timeouts: DashMap<Uuid, Duration>,
}

impl ProxyEngine {
    pub fn new(
        config: ServerConfig,
        props: PropertySource,
        drivers: Arc<DriverRegistry>,
        providers: Arc<ProviderRegistry>,
        xa_adapters: Arc<XaAdapterRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            props,
            drivers,
            providers,
            xa_adapters,
            sessions: Arc::new(SessionRegistry::new()),
            tx: Arc::new(TxRegistry::new()),
            pools: DashMap::new(),
            xa_pools: DashMap::new(),
            schedulers: DashMap::new(),
            direct: DashMap::new(),
            pending_resizes: DashMap::new(),
            xa_timeouts: DashMap::new(),
        })
    }

    /// Engine wired with the in-tree memory driver, the universal pool
    /// providers and the matching XA datasource adapter. External drivers
    /// and higher-priority providers can still be registered on top.
    pub fn with_default_providers(config: ServerConfig, props: PropertySource) -> Arc<Self> {
        let drivers = Arc::new(DriverRegistry::new());
        drivers.register(Arc::new(crate::backend::memory::MemoryDriver::new()));
        drivers.register_factory("mem", || {
            Arc::new(crate::backend::memory::MemoryDriver::new()) as Arc<dyn crate::backend::Driver>
        });

        let providers = Arc::new(ProviderRegistry::new());
        providers.register_ordinary(Arc::new(crate::pool::StandardPoolProvider::new(
            Arc::clone(&drivers),
            config.leak_detection.clone(),
            config.diagnostics.clone(),
        )));
        providers.register_xa(Arc::new(crate::pool::XaBackendPoolProvider::new(
            config.leak_detection.clone(),
            config.diagnostics.clone(),
        )));

        let xa_adapters = Arc::new(XaAdapterRegistry::new());
        xa_adapters.register("mem", |cfg| {
            let url = cfg
                .first_of(&[KEY_URL, "xa.URL", "xa.Url"])
                .unwrap_or("jdbc:mem:default")
                .to_string();
            Ok(Arc::new(crate::backend::memory::MemoryXaDataSource::new(url))
                as Arc<dyn crate::backend::XaDataSource>)
        });

        Self::new(config, props, drivers, providers, xa_adapters)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn tx_registry(&self) -> &TxRegistry {
        &self.tx
    }

    pub fn pool_statistics(&self, conn_hash: &str) -> Option<crate::pool::PoolStatistics> {
        if let Some(pool) = self.pools.get(conn_hash) {
            return Some(pool.statistics());
        }
        self.xa_pools.get(conn_hash).map(|p| p.statistics())
    }

    // ------------------------------------------------------------------
    // Connect / terminate
    // ------------------------------------------------------------------

    /// Opens a logical session. XA sessions acquire their backend session
    /// eagerly; ordinary sessions acquire on first statement.
    pub async fn connect(
        &self,
        client_uuid: Uuid,
        native_url: &str,
        user: &str,
        password: &str,
        datasource: Option<&str>,
        is_xa: bool,
    ) -> Result<Uuid> {
        let url = resolve_placeholders(native_url, &self.props)?;
        // The URL must be served by some registered driver before any pool
        // is built for it.
        self.drivers.driver_for_url(&url)?;

        let conn_hash = ConnHash::compute(&url, user, password, is_xa, datasource);
        let key = conn_hash.as_str().to_string();
        let settings = self.pool_settings(&url, user, password, datasource);

        self.schedulers.entry(key.clone()).or_insert_with(|| {
            SlowQueryScheduler::new(settings.max_pool_size, self.config.slow_query.clone())
        });

        if is_xa {
            if !self.config.xa.enabled {
                return Err(OjpError::Config("XA pooling is disabled".into()));
            }
            let pool = self.xa_pool(&key, &settings, datasource).await?;
            let entry = pool.borrow().await?;
            let session = self.sessions.create(client_uuid, conn_hash, true);
            *session.backend().lock().await = Some(BackendHandle::Xa { pool, entry });
            info!(session = %session.session_uuid(), conn_hash = %session.conn_hash(), "XA session connected");
            return Ok(session.session_uuid());
        }

        if self.is_unpooled(datasource) {
            self.direct.insert(key, settings.connection.clone());
        } else {
            self.ordinary_pool(&key, &settings).await?;
        }
        let session = self.sessions.create(client_uuid, conn_hash, false);
        debug!(session = %session.session_uuid(), conn_hash = %session.conn_hash(), "session connected");
        Ok(session.session_uuid())
    }

    /// Terminates a session: abandoned XA branches roll back first, the
    /// arena is freed, and the backend connection goes back to its pool
    /// (or closes, if unpooled).
    pub async fn terminate(&self, session_uuid: Uuid) -> Result<()> {
        let session = self
            .sessions
            .remove(&session_uuid)
            .ok_or_else(|| OjpError::StaleSession(session_uuid.to_string()))?;

        let rolled_back = self.tx.release_session(session_uuid).await;
        if !rolled_back.is_empty() {
            warn!(
                session = %session_uuid,
                branches = rolled_back.len(),
                "rolled back abandoned XA branches on terminate"
            );
        }

        session.clear_attributes();
        let (statements, result_sets, lobs) = session.open_resource_counts();
        if statements + result_sets + lobs > 0 {
            debug!(
                session = %session_uuid,
                statements, result_sets, lobs,
                "closing leftover session resources"
            );
        }
        session.clear_resources();

        let handle = session.backend().lock().await.take();
        match handle {
            Some(BackendHandle::Direct(conn)) => {
                if !conn.auto_commit() {
                    if let Err(e) = conn.rollback().await {
                        warn!(session = %session_uuid, error = %e, "rollback on terminate failed");
                    }
                }
                if let Err(e) = conn.close().await {
                    warn!(session = %session_uuid, error = %e, "close on terminate failed");
                }
            }
            Some(BackendHandle::Pooled { pool, entry }) => pool.give_back(entry).await,
            Some(BackendHandle::Xa { pool, entry }) => pool.give_back(entry).await,
            None => {}
        }

        self.xa_timeouts.remove(&session_uuid);
        info!(session = %session_uuid, "session terminated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    pub async fn execute(
        &self,
        session_uuid: Uuid,
        xid: Option<&Xid>,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<ExecuteOutcome> {
        let session = self.touched(session_uuid)?;
        let ticket = self.admit(&session, sql).await?;
        let conn = self.statement_connection(&session, xid).await?;
        let result = conn.execute(sql, params).await;
        self.complete(&session, ticket);
        self.surface(&session, result).await
    }

    pub async fn execute_query(
        &self,
        session_uuid: Uuid,
        xid: Option<&Xid>,
        sql: &str,
        params: &[SqlValue],
        fetch_size: u32,
    ) -> Result<QueryPage> {
        let session = self.touched(session_uuid)?;
        let ticket = self.admit(&session, sql).await?;
        let conn = self.statement_connection(&session, xid).await?;
        let result = conn.execute_query(sql, params).await;
        self.complete(&session, ticket);
        let result = self.surface(&session, result).await?;

        let columns = result.columns.clone();
        let result_set = session.add_result_set(result);
        let cursor = session
            .result_set(&result_set)
            .ok_or_else(|| OjpError::Internal("result set vanished from arena".into()))?;
        let (rows, exhausted) = cursor.fetch(fetch_size as usize);
        if exhausted {
            session.close_result_set(&result_set);
        }
        Ok(QueryPage {
            result_set,
            columns,
            rows,
            exhausted,
        })
    }

    pub async fn execute_update(
        &self,
        session_uuid: Uuid,
        xid: Option<&Xid>,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<u64> {
        let session = self.touched(session_uuid)?;
        let ticket = self.admit(&session, sql).await?;
        let conn = self.statement_connection(&session, xid).await?;
        let result = conn.execute_update(sql, params).await;
        self.complete(&session, ticket);
        self.surface(&session, result).await
    }

    pub fn prepare_statement(&self, session_uuid: Uuid, sql: &str) -> Result<Uuid> {
        let session = self.touched(session_uuid)?;
        Ok(session.add_statement(PreparedStatement {
            sql: sql.to_string(),
            created_at: std::time::Instant::now(),
        }))
    }

    /// Resolves a prepared statement id back to its SQL.
    pub fn prepared_sql(&self, session_uuid: Uuid, statement: &Uuid) -> Result<String> {
        let session = self.sessions.get(&session_uuid)?;
        session
            .statement_sql(statement)
            .ok_or_else(|| OjpError::StaleSession(format!("unknown statement {statement}")))
    }

    pub fn fetch_result_set(
        &self,
        session_uuid: Uuid,
        result_set: &Uuid,
        fetch_size: u32,
    ) -> Result<(Vec<Row>, bool)> {
        let session = self.touched(session_uuid)?;
        let cursor = session
            .result_set(result_set)
            .ok_or_else(|| OjpError::StaleSession(format!("unknown result set {result_set}")))?;
        let (rows, exhausted) = cursor.fetch(fetch_size as usize);
        if exhausted {
            session.close_result_set(result_set);
        }
        Ok((rows, exhausted))
    }

    // ------------------------------------------------------------------
    // LOBs
    // ------------------------------------------------------------------

    pub fn write_lob(
        &self,
        session_uuid: Uuid,
        lob: Option<Uuid>,
        kind: LobKind,
        offset: u64,
        chunk: &[u8],
    ) -> Result<(Uuid, u64)> {
        let session = self.touched(session_uuid)?;
        let lob_id = match lob {
            Some(id) => id,
            None => session.add_lob(kind),
        };
        let buffer = session
            .lob(&lob_id)
            .ok_or_else(|| OjpError::StaleSession(format!("unknown LOB {lob_id}")))?;
        buffer.write_at(offset as usize, chunk);
        Ok((lob_id, buffer.len() as u64))
    }

    pub fn read_lob(
        &self,
        session_uuid: Uuid,
        lob: &Uuid,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        let session = self.touched(session_uuid)?;
        let buffer = session
            .lob(lob)
            .ok_or_else(|| OjpError::StaleSession(format!("unknown LOB {lob}")))?;
        Ok(buffer.read_at(offset as usize, length as usize))
    }

    // ------------------------------------------------------------------
    // Local transaction control
    // ------------------------------------------------------------------

    pub async fn commit(&self, session_uuid: Uuid) -> Result<()> {
        let session = self.touched(session_uuid)?;
        let conn = self.acquire(&session).await?;
        conn.commit().await
    }

    pub async fn rollback(&self, session_uuid: Uuid) -> Result<()> {
        let session = self.touched(session_uuid)?;
        let conn = self.acquire(&session).await?;
        conn.rollback().await
    }

    pub async fn set_auto_commit(&self, session_uuid: Uuid, enabled: bool) -> Result<()> {
        let session = self.touched(session_uuid)?;
        let conn = self.acquire(&session).await?;
        conn.set_auto_commit(enabled).await
    }

    pub async fn set_transaction_isolation(
        &self,
        session_uuid: Uuid,
        level: IsolationLevel,
    ) -> Result<()> {
        let session = self.touched(session_uuid)?;
        let conn = self.acquire(&session).await?;
        conn.set_transaction_isolation(level).await
    }

    // ------------------------------------------------------------------
    // XA branch operations
    // ------------------------------------------------------------------

    pub async fn xa_start(
        &self,
        session_uuid: Uuid,
        xid: &Xid,
        flags: XaStartFlags,
    ) -> Result<()> {
        let (session, entry) = self.xa_session(session_uuid).await?;
        let timeout = self.xa_timeouts.get(&session_uuid).map(|t| *t);
        self.tx
            .start(xid, flags, &entry, session.session_uuid(), timeout)
            .await
    }

    pub async fn xa_end(&self, session_uuid: Uuid, xid: &Xid, flags: XaEndFlags) -> Result<()> {
        self.touched(session_uuid)?;
        self.tx.end(xid, flags).await
    }

    pub async fn xa_prepare(&self, session_uuid: Uuid, xid: &Xid) -> Result<XaVote> {
        self.touched(session_uuid)?;
        self.tx.prepare(xid).await
    }

    pub async fn xa_commit(&self, session_uuid: Uuid, xid: &Xid, one_phase: bool) -> Result<()> {
        self.touched(session_uuid)?;
        self.tx.commit(xid, one_phase).await
    }

    pub async fn xa_rollback(&self, session_uuid: Uuid, xid: &Xid) -> Result<()> {
        self.touched(session_uuid)?;
        self.tx.rollback(xid).await
    }

    pub async fn xa_forget(&self, session_uuid: Uuid, xid: &Xid) -> Result<()> {
        self.touched(session_uuid)?;
        self.tx.forget(xid).await
    }

    /// Prepared xids as observed by this node's backend.
    pub async fn xa_recover(&self, session_uuid: Uuid, scan: XaRecoverScan) -> Result<Vec<Xid>> {
        let (_, entry) = self.xa_session(session_uuid).await?;
        entry.resource().xa_resource().recover(scan).await
    }

    pub async fn xa_set_transaction_timeout(
        &self,
        session_uuid: Uuid,
        timeout: Duration,
    ) -> Result<bool> {
        let (_, entry) = self.xa_session(session_uuid).await?;
        self.xa_timeouts.insert(session_uuid, timeout);
        entry
            .resource()
            .xa_resource()
            .set_transaction_timeout(timeout)
            .await
    }

    // ------------------------------------------------------------------
    // Pool management
    // ------------------------------------------------------------------

    /// Dispatcher-issued resize of every pool serving a conn hash.
    pub async fn resize_pools(
        &self,
        conn_hash: &str,
        max_size: usize,
        min_idle: usize,
    ) -> Result<()> {
        let mut resized = false;
        if let Some(pool) = self.pools.get(conn_hash).map(|p| Arc::clone(p.value())) {
            pool.resize(max_size, min_idle).await?;
            resized = true;
        }
        if let Some(pool) = self.xa_pools.get(conn_hash).map(|p| Arc::clone(p.value())) {
            pool.resize(max_size, min_idle).await?;
            resized = true;
        }
        if !resized {
            // No pool yet for this hash on this node; remember the target
            // and apply it when the first connection arrives.
            debug!(conn_hash, max_size, min_idle, "resize deferred until pool creation");
            self.pending_resizes
                .insert(conn_hash.to_string(), (max_size, min_idle));
        }
        Ok(())
    }

    /// Stops everything: sessions, pools, schedulers.
    pub async fn shutdown(&self) {
        for session in self.sessions.all() {
            let id = session.session_uuid();
            if let Err(e) = self.terminate(id).await {
                warn!(session = %id, error = %e, "terminate during shutdown failed");
            }
        }
        let pools: Vec<_> = self.pools.iter().map(|e| e.value().clone()).collect();
        for pool in pools {
            pool.close().await;
        }
        self.pools.clear();
        let xa_pools: Vec<_> = self.xa_pools.iter().map(|e| e.value().clone()).collect();
        for pool in xa_pools {
            pool.close().await;
        }
        self.xa_pools.clear();
        for entry in self.schedulers.iter() {
            entry.value().shutdown();
        }
        self.schedulers.clear();
        info!("engine shut down");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Looks up the session and stamps activity before the operation runs,
    /// so the reaper never selects a session with an in-flight call.
    fn touched(&self, session_uuid: Uuid) -> Result<Arc<Session>> {
        let session = self.sessions.get(&session_uuid)?;
        session.touch();
        Ok(session)
    }

    /// Lazy backend acquisition for a session's default connection.
    async fn acquire(&self, session: &Arc<Session>) -> Result<Arc<dyn BackendConnection>> {
        let mut guard = session.backend().lock().await;
        if let Some(handle) = guard.as_ref() {
            let conn = handle.connection();
            if conn.is_closed() {
                return Err(OjpError::StaleSession(format!(
                    "backend connection of session {} is closed",
                    session.session_uuid()
                )));
            }
            return Ok(conn);
        }

        let key = session.conn_hash().as_str().to_string();
        if let Some(settings) = self.direct.get(&key).map(|s| s.value().clone()) {
            let driver = self.drivers.driver_for_url(&settings.url)?;
            let conn = driver.connect(&settings).await?;
            *guard = Some(BackendHandle::Direct(Arc::clone(&conn)));
            return Ok(conn);
        }

        if session.is_xa() {
            // XA backends are bound eagerly at connect; reaching this point
            // means the binding is gone.
            return Err(OjpError::StaleSession(format!(
                "XA session {} has no bound backend session",
                session.session_uuid()
            )));
        }

        let pool = self
            .pools
            .get(&key)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| OjpError::StaleSession(format!("no pool for conn hash {key}")))?;
        let entry = pool.borrow().await?;
        let conn = Arc::clone(entry.resource());
        *guard = Some(BackendHandle::Pooled { pool, entry });
        Ok(conn)
    }

    /// The connection a statement must run on: the XA branch's backend
    /// session when an xid rides along, the session default otherwise.
    async fn statement_connection(
        &self,
        session: &Arc<Session>,
        xid: Option<&Xid>,
    ) -> Result<Arc<dyn BackendConnection>> {
        match xid {
            Some(xid) if session.is_xa() => {
                let bound = self.tx.bound_session(xid).await?;
                Ok(bound.resource().logical())
            }
            _ => self.acquire(session).await,
        }
    }

    async fn admit(&self, session: &Arc<Session>, sql: &str) -> Result<AdmissionTicket> {
        let scheduler = self
            .schedulers
            .get(session.conn_hash().as_str())
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| {
                OjpError::StaleSession(format!(
                    "no scheduler for conn hash {}",
                    session.conn_hash()
                ))
            })?;
        scheduler.admit(operation_hash(sql)).await
    }

    fn complete(&self, session: &Arc<Session>, ticket: AdmissionTicket) {
        if let Some(scheduler) = self.schedulers.get(session.conn_hash().as_str()) {
            scheduler.complete(ticket);
        }
    }

    /// Propagation policy: transient failures invalidate the broken pooled
    /// connection so the next statement re-borrows; everything else is
    /// surfaced verbatim.
    async fn surface<T>(&self, session: &Arc<Session>, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_transient() {
                let mut guard = session.backend().lock().await;
                // Only pooled handles are recoverable; direct and XA
                // handles stay with the session.
                if matches!(guard.as_ref(), Some(BackendHandle::Pooled { .. })) {
                    if let Some(BackendHandle::Pooled { pool, entry }) = guard.take() {
                        warn!(
                            session = %session.session_uuid(),
                            "invalidating backend connection after transient failure"
                        );
                        pool.invalidate(entry).await;
                    }
                }
            }
        }
        result
    }

    async fn xa_session(
        &self,
        session_uuid: Uuid,
    ) -> Result<(Arc<Session>, crate::pool::PooledXaSession)> {
        let session = self.touched(session_uuid)?;
        if !session.is_xa() {
            return Err(OjpError::XaProtocol(format!(
                "session {session_uuid} is not an XA session"
            )));
        }
        let guard = session.backend().lock().await;
        let entry = guard
            .as_ref()
            .and_then(|h| h.xa_entry())
            .map(Arc::clone)
            .ok_or_else(|| {
                OjpError::StaleSession(format!("XA session {session_uuid} has no backend session"))
            })?;
        drop(guard);
        Ok((session, entry))
    }

    fn is_unpooled(&self, datasource: Option<&str>) -> bool {
        datasource
            .and_then(|name| self.config.datasources.get(name))
            .and_then(|section| section.get("pooled"))
            .map(|v| v.eq_ignore_ascii_case("false"))
            .unwrap_or(false)
    }

    /// Base pool settings from server config, overridden by the named
    /// datasource section when one applies.
    fn pool_settings(
        &self,
        url: &str,
        user: &str,
        password: &str,
        datasource: Option<&str>,
    ) -> PoolSettings {
        let mut connection = ConnectionSettings::new(url, user, password);
        let mut settings = PoolSettings::new(connection.clone());

        if let Some(section) = datasource.and_then(|n| self.config.datasources.get(n)) {
            if let Some(v) = section.get("maxPoolSize").and_then(|v| v.parse().ok()) {
                settings.max_pool_size = v;
            }
            if let Some(v) = section.get("minIdle").and_then(|v| v.parse().ok()) {
                settings.min_idle = v;
            }
            if let Some(v) = section.get("connectionTimeoutMs").and_then(|v| v.parse().ok()) {
                settings.connection_timeout = Duration::from_millis(v);
            }
            if let Some(v) = section.get("idleTimeoutMs").and_then(|v| v.parse().ok()) {
                settings.idle_timeout = Duration::from_millis(v);
            }
            if let Some(v) = section.get("maxLifetimeMs").and_then(|v| v.parse().ok()) {
                settings.max_lifetime = Duration::from_millis(v);
            }
            if let Some(v) = section.get("validationQuery") {
                settings.validation_query = Some(v.clone());
            }
            if let Some(v) = section.get("autoCommit") {
                connection.auto_commit = !v.eq_ignore_ascii_case("false");
                settings.connection = connection.clone();
            }
            if let Some(v) = section.get("driverClass") {
                settings.driver_class = Some(v.clone());
            }
        }
        settings
    }

    async fn ordinary_pool(
        &self,
        key: &str,
        settings: &PoolSettings,
    ) -> Result<Arc<dyn ConnectionPool>> {
        if let Some(pool) = self.pools.get(key) {
            return Ok(Arc::clone(pool.value()));
        }
        let mut settings = settings.clone();
        if let Some((_, (max_size, min_idle))) = self.pending_resizes.remove(key) {
            settings.max_pool_size = max_size;
            settings.min_idle = min_idle;
        }
        let provider = self.providers.select_ordinary(&settings)?;
        let pool = provider
            .create_pool(&format!("pool-{}", &key[..key.len().min(12)]), settings)
            .await?;
        // First writer wins under concurrent connects for the same hash.
        let entry = self.pools.entry(key.to_string()).or_insert(pool);
        Ok(Arc::clone(entry.value()))
    }

    async fn xa_pool(
        &self,
        key: &str,
        settings: &PoolSettings,
        datasource: Option<&str>,
    ) -> Result<Arc<dyn XaSessionPool>> {
        if let Some(pool) = self.xa_pools.get(key) {
            return Ok(Arc::clone(pool.value()));
        }

        let mut xa_settings = settings.clone();
        xa_settings.max_pool_size = self.config.xa.max_pool_size;
        xa_settings.min_idle = self.config.xa.min_idle;
        xa_settings.connection_timeout = self.config.xa.connection_timeout;
        xa_settings.idle_timeout = self.config.xa.idle_timeout;
        xa_settings.max_lifetime = self.config.xa.max_lifetime;
        if let Some((_, (max_size, min_idle))) = self.pending_resizes.remove(key) {
            xa_settings.max_pool_size = max_size;
            xa_settings.min_idle = min_idle;
        }

        let mut ds_config = XaDataSourceConfig::default();
        ds_config.set(
            KEY_CLASS_NAME,
            settings
                .driver_class
                .clone()
                .unwrap_or_else(|| driver_hint(&settings.connection.url)),
        );
        ds_config.set(KEY_URL, settings.connection.url.clone());
        ds_config.set(KEY_USERNAME, settings.connection.user.clone());
        ds_config.set(KEY_PASSWORD, settings.connection.password.clone());
        if let Some(section) = datasource.and_then(|n| self.config.datasources.get(n)) {
            for (k, v) in section {
                if k.starts_with("xa.") {
                    ds_config.set(k.clone(), v.clone());
                }
            }
        }
        let ds = self.xa_adapters.create(&ds_config)?;

        let provider = self.providers.select_xa(&xa_settings)?;
        let pool = provider
            .create_pool(
                &format!("xa-pool-{}", &key[..key.len().min(12)]),
                xa_settings,
                ds,
            )
            .await?;
        let entry = self.xa_pools.entry(key.to_string()).or_insert(pool);
        Ok(Arc::clone(entry.value()))
    }
}

/// Driver id guess from a JDBC-style URL (`jdbc:mem:x` -> `mem`).
fn driver_hint(url: &str) -> String {
    let rest = url.strip_prefix("jdbc:").unwrap_or(url);
    rest.split(':').next().unwrap_or(rest).to_string()
}
