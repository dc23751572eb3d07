// Typed client facade over the multinode dispatcher.
//
// Applications hold one `ProxyClient` per cluster URL and open logical
// sessions from it; a `ClientSession` exposes the statement and
// transaction surface as plain methods and turns wire error responses
// back into typed errors with their stable kinds.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::backend::{
    ColumnMeta, ExecuteOutcome, IsolationLevel, Row, SqlValue, XaEndFlags, XaStartFlags, XaVote,
    Xid,
};
use crate::config::PropertySource;
use crate::error::{OjpError, Result};
use crate::wire::{Request, Response, SessionInfo, StatementRef};

use super::channel::{ChannelFactory, TcpChannelFactory};
use super::url::OjpUrl;
use super::{DispatcherOptions, MultinodeDispatcher};

const DEFAULT_MAX_FRAME: usize = 4 * 1024 * 1024;

impl DispatcherOptions {
    /// Client-side knobs from `ojp.client.*` properties.
    pub fn from_source(source: &PropertySource) -> Result<Self> {
        let mut options = DispatcherOptions::default();
        if let Some(v) = source.get("ojp.client.globalMaxPoolSize") {
            options.global_max_pool_size = v
                .parse()
                .map_err(|_| OjpError::Config(format!("bad ojp.client.globalMaxPoolSize: {v}")))?;
        }
        if let Some(v) = source.get("ojp.client.minIdlePerNode") {
            options.min_idle_per_node = v
                .parse()
                .map_err(|_| OjpError::Config(format!("bad ojp.client.minIdlePerNode: {v}")))?;
        }
        if let Some(v) = source.get("ojp.client.retryDelayMs") {
            let ms: u64 = v
                .parse()
                .map_err(|_| OjpError::Config(format!("bad ojp.client.retryDelayMs: {v}")))?;
            options.retry_delay = Duration::from_millis(ms);
        }
        if let Some(v) = source.get("ojp.client.initRetryDelayMs") {
            let ms: u64 = v
                .parse()
                .map_err(|_| OjpError::Config(format!("bad ojp.client.initRetryDelayMs: {v}")))?;
            options.init_retry_delay = Duration::from_millis(ms);
        }
        Ok(options)
    }
}

/// One logical-connection factory for a proxy cluster.
pub struct ProxyClient {
    dispatcher: Arc<MultinodeDispatcher>,
    user: String,
    password: String,
    datasource: Option<String>,
}

impl ProxyClient {
    /// Parses the cluster URL, connects the dispatcher over TCP and
    /// starts the background health prober.
    pub async fn connect(
        url: &str,
        user: &str,
        password: &str,
        options: DispatcherOptions,
    ) -> Result<Self> {
        let factory = Arc::new(TcpChannelFactory::new(DEFAULT_MAX_FRAME));
        Self::connect_with_factory(url, user, password, options, factory).await
    }

    /// Same, with an explicit channel factory.
    pub async fn connect_with_factory(
        url: &str,
        user: &str,
        password: &str,
        options: DispatcherOptions,
        factory: Arc<dyn ChannelFactory>,
    ) -> Result<Self> {
        let parsed = OjpUrl::parse(url)?;
        let dispatcher = MultinodeDispatcher::connect_cluster(factory, parsed, options).await;
        if dispatcher.connected_count() == 0 {
            return Err(OjpError::Unavailable(
                "no proxy endpoint reachable".to_string(),
            ));
        }
        dispatcher.start_health_probes();
        Ok(Self {
            dispatcher,
            user: user.to_string(),
            password: password.to_string(),
            datasource: None,
        })
    }

    pub fn with_datasource(mut self, name: impl Into<String>) -> Self {
        self.datasource = Some(name.into());
        self
    }

    pub fn dispatcher(&self) -> &Arc<MultinodeDispatcher> {
        &self.dispatcher
    }

    /// Opens a logical session; `is_xa` selects the XA pool family.
    pub async fn open_session(&self, is_xa: bool) -> Result<ClientSession> {
        let info = self
            .dispatcher
            .open_session(&self.user, &self.password, self.datasource.as_deref(), is_xa)
            .await?;
        Ok(ClientSession {
            dispatcher: Arc::clone(&self.dispatcher),
            info,
        })
    }

    /// Prepared xids across the cluster, for recovery.
    pub async fn recover(&self) -> Result<Vec<Xid>> {
        self.dispatcher
            .broadcast_recover(&self.user, &self.password, self.datasource.as_deref())
            .await
    }
}

/// A fully materialized query result on the client.
#[derive(Debug, Clone)]
pub struct QueryRows {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Row>,
}

/// One logical session, sticky to the server that created it.
pub struct ClientSession {
    dispatcher: Arc<MultinodeDispatcher>,
    info: SessionInfo,
}

impl ClientSession {
    pub fn session_uuid(&self) -> Uuid {
        self.info.session_uuid.expect("open session has a UUID")
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: Vec<SqlValue>,
        xid: Option<Xid>,
    ) -> Result<ExecuteOutcome> {
        match self
            .roundtrip(Request::Execute {
                session: self.info.clone(),
                xid,
                statement: StatementRef::Sql(sql.to_string()),
                params,
            })
            .await?
        {
            Response::Executed(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    pub async fn execute_update(
        &self,
        sql: &str,
        params: Vec<SqlValue>,
        xid: Option<Xid>,
    ) -> Result<u64> {
        match self
            .roundtrip(Request::ExecuteUpdate {
                session: self.info.clone(),
                xid,
                statement: StatementRef::Sql(sql.to_string()),
                params,
            })
            .await?
        {
            Response::UpdateCount(count) => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    /// Runs a query and drains every page into one result.
    pub async fn query(
        &self,
        sql: &str,
        params: Vec<SqlValue>,
        fetch_size: u32,
    ) -> Result<QueryRows> {
        let response = self
            .roundtrip(Request::ExecuteQuery {
                session: self.info.clone(),
                xid: None,
                statement: StatementRef::Sql(sql.to_string()),
                params,
                fetch_size,
            })
            .await?;
        let (result_set, columns, mut rows, mut exhausted) = match response {
            Response::ResultSet {
                result_set,
                columns,
                rows,
                exhausted,
            } => (result_set, columns, rows, exhausted),
            other => return Err(unexpected(other)),
        };

        while !exhausted {
            match self
                .roundtrip(Request::FetchResultSet {
                    session: self.info.clone(),
                    result_set,
                    fetch_size,
                })
                .await?
            {
                Response::Page {
                    rows: page,
                    exhausted: done,
                } => {
                    rows.extend(page);
                    exhausted = done;
                }
                other => return Err(unexpected(other)),
            }
        }
        Ok(QueryRows { columns, rows })
    }

    pub async fn commit(&self) -> Result<()> {
        self.done(Request::Commit {
            session: self.info.clone(),
        })
        .await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.done(Request::Rollback {
            session: self.info.clone(),
        })
        .await
    }

    pub async fn set_auto_commit(&self, enabled: bool) -> Result<()> {
        self.done(Request::SetAutoCommit {
            session: self.info.clone(),
            enabled,
        })
        .await
    }

    pub async fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()> {
        self.done(Request::SetTransactionIsolation {
            session: self.info.clone(),
            level,
        })
        .await
    }

    pub async fn xa_start(&self, xid: Xid, flags: XaStartFlags) -> Result<()> {
        self.done(Request::XaStart {
            session: self.info.clone(),
            xid,
            flags,
        })
        .await
    }

    pub async fn xa_end(&self, xid: Xid, flags: XaEndFlags) -> Result<()> {
        self.done(Request::XaEnd {
            session: self.info.clone(),
            xid,
            flags,
        })
        .await
    }

    pub async fn xa_prepare(&self, xid: Xid) -> Result<XaVote> {
        match self
            .roundtrip(Request::XaPrepare {
                session: self.info.clone(),
                xid,
            })
            .await?
        {
            Response::XaPrepared { vote } => Ok(vote),
            other => Err(unexpected(other)),
        }
    }

    pub async fn xa_commit(&self, xid: Xid, one_phase: bool) -> Result<()> {
        self.done(Request::XaCommit {
            session: self.info.clone(),
            xid,
            one_phase,
        })
        .await
    }

    pub async fn xa_rollback(&self, xid: Xid) -> Result<()> {
        self.done(Request::XaRollback {
            session: self.info.clone(),
            xid,
        })
        .await
    }

    /// Terminates the session on its sticky server.
    pub async fn close(self) -> Result<()> {
        self.dispatcher.close_session(&self.info).await
    }

    async fn roundtrip(&self, request: Request) -> Result<Response> {
        let response = self.dispatcher.call(self.session_uuid(), request).await?;
        match response {
            Response::Error {
                kind,
                message,
                sqlstate,
            } => Err(OjpError::from_wire(&kind, message, sqlstate)),
            other => Ok(other),
        }
    }

    async fn done(&self, request: Request) -> Result<()> {
        match self.roundtrip(request).await? {
            Response::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> OjpError {
    OjpError::Wire(format!("unexpected response: {response:?}"))
}
