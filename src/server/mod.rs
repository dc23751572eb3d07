// TCP front end.
//
// One accept loop, one task per client connection. Each connection reads
// length-delimited request frames, runs them through the engine and writes
// the response frame back. Within one connection (and therefore one
// logical session) requests are processed strictly in arrival order.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::{reaper, ProxyEngine};
use crate::error::{OjpError, Result};
use crate::wire::{read_frame, write_frame, Request, Response, SessionInfo, StatementRef};

/// The proxy server: engine plus listener lifecycle.
pub struct ProxyServer {
    engine: Arc<ProxyEngine>,
    shutdown_tx: watch::Sender<bool>,
    reaper: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProxyServer {
    pub fn new(engine: Arc<ProxyEngine>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let reaper_handle = reaper::start(&engine);
        Self {
            engine,
            shutdown_tx,
            reaper: parking_lot::Mutex::new(reaper_handle),
        }
    }

    pub fn engine(&self) -> &Arc<ProxyEngine> {
        &self.engine
    }

    /// Serves until `shutdown` is called.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, "proxy server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("listener stopping");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "client connected");
                            let engine = Arc::clone(&self.engine);
                            let shutdown = self.shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(engine, stream, shutdown).await {
                                    debug!(peer = %peer, error = %e, "connection closed with error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Stops the listener, the reaper and the engine.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
        self.engine.shutdown().await;
        info!("proxy server shut down");
    }
}

async fn serve_connection(
    engine: Arc<ProxyEngine>,
    mut stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let max_frame = engine.config().max_request_size;
    let idle_timeout = engine.config().connection_idle_timeout;

    loop {
        let request: Option<Request> = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            read = tokio::time::timeout(idle_timeout, read_frame(&mut stream, max_frame)) => {
                match read {
                    Ok(frame) => frame?,
                    Err(_) => {
                        debug!("closing idle client connection");
                        return Ok(());
                    }
                }
            }
        };
        let Some(request) = request else {
            return Ok(());
        };

        let response = match handle_request(&engine, request).await {
            Ok(response) => response,
            Err(e) => {
                if matches!(e, OjpError::Internal(_)) {
                    error!(error = %e, "request failed");
                }
                Response::from_error(&e)
            }
        };
        write_frame(&mut stream, &response, max_frame).await?;
    }
}

fn session_uuid(info: &SessionInfo) -> Result<Uuid> {
    info.session_uuid
        .ok_or_else(|| OjpError::StaleSession("request carries no session UUID".into()))
}

fn resolve_statement(
    engine: &ProxyEngine,
    session: Uuid,
    statement: &StatementRef,
) -> Result<String> {
    match statement {
        StatementRef::Sql(sql) => Ok(sql.clone()),
        StatementRef::Prepared(id) => engine.prepared_sql(session, id),
    }
}

/// Maps one wire request onto the engine.
pub async fn handle_request(engine: &Arc<ProxyEngine>, request: Request) -> Result<Response> {
    match request {
        Request::Connect {
            session,
            native_url,
            user,
            password,
            datasource,
        } => {
            let session_uuid = engine
                .connect(
                    session.client_uuid,
                    &native_url,
                    &user,
                    &password,
                    datasource.as_deref(),
                    session.is_xa,
                )
                .await?;
            Ok(Response::Connected { session_uuid })
        }
        Request::TerminateSession { session } => {
            engine.terminate(session_uuid(&session)?).await?;
            Ok(Response::Terminated)
        }
        Request::Execute {
            session,
            xid,
            statement,
            params,
        } => {
            let id = session_uuid(&session)?;
            let sql = resolve_statement(engine, id, &statement)?;
            let outcome = engine.execute(id, xid.as_ref(), &sql, &params).await?;
            Ok(Response::Executed(outcome))
        }
        Request::ExecuteQuery {
            session,
            xid,
            statement,
            params,
            fetch_size,
        } => {
            let id = session_uuid(&session)?;
            let sql = resolve_statement(engine, id, &statement)?;
            let page = engine
                .execute_query(id, xid.as_ref(), &sql, &params, fetch_size)
                .await?;
            Ok(Response::ResultSet {
                result_set: page.result_set,
                columns: page.columns,
                rows: page.rows,
                exhausted: page.exhausted,
            })
        }
        Request::ExecuteUpdate {
            session,
            xid,
            statement,
            params,
        } => {
            let id = session_uuid(&session)?;
            let sql = resolve_statement(engine, id, &statement)?;
            let count = engine.execute_update(id, xid.as_ref(), &sql, &params).await?;
            Ok(Response::UpdateCount(count))
        }
        Request::PrepareStatement { session, sql } => {
            let statement = engine.prepare_statement(session_uuid(&session)?, &sql)?;
            Ok(Response::StatementPrepared { statement })
        }
        Request::FetchResultSet {
            session,
            result_set,
            fetch_size,
        } => {
            let (rows, exhausted) =
                engine.fetch_result_set(session_uuid(&session)?, &result_set, fetch_size)?;
            Ok(Response::Page { rows, exhausted })
        }
        Request::ReadLob {
            session,
            lob,
            offset,
            length,
        } => {
            let data = engine.read_lob(session_uuid(&session)?, &lob, offset, length)?;
            Ok(Response::LobData { data })
        }
        Request::WriteLob {
            session,
            lob,
            kind,
            offset,
            chunk,
        } => {
            let (lob, length) =
                engine.write_lob(session_uuid(&session)?, lob, kind, offset, &chunk)?;
            Ok(Response::LobWritten { lob, length })
        }
        Request::Commit { session } => {
            engine.commit(session_uuid(&session)?).await?;
            Ok(Response::Done)
        }
        Request::Rollback { session } => {
            engine.rollback(session_uuid(&session)?).await?;
            Ok(Response::Done)
        }
        Request::SetAutoCommit { session, enabled } => {
            engine.set_auto_commit(session_uuid(&session)?, enabled).await?;
            Ok(Response::Done)
        }
        Request::SetTransactionIsolation { session, level } => {
            engine
                .set_transaction_isolation(session_uuid(&session)?, level)
                .await?;
            Ok(Response::Done)
        }
        Request::XaStart { session, xid, flags } => {
            engine.xa_start(session_uuid(&session)?, &xid, flags).await?;
            Ok(Response::Done)
        }
        Request::XaEnd { session, xid, flags } => {
            engine.xa_end(session_uuid(&session)?, &xid, flags).await?;
            Ok(Response::Done)
        }
        Request::XaPrepare { session, xid } => {
            let vote = engine.xa_prepare(session_uuid(&session)?, &xid).await?;
            Ok(Response::XaPrepared { vote })
        }
        Request::XaCommit {
            session,
            xid,
            one_phase,
        } => {
            engine
                .xa_commit(session_uuid(&session)?, &xid, one_phase)
                .await?;
            Ok(Response::Done)
        }
        Request::XaRollback { session, xid } => {
            engine.xa_rollback(session_uuid(&session)?, &xid).await?;
            Ok(Response::Done)
        }
        Request::XaForget { session, xid } => {
            engine.xa_forget(session_uuid(&session)?, &xid).await?;
            Ok(Response::Done)
        }
        Request::XaRecover { session, scan } => {
            let xids = engine.xa_recover(session_uuid(&session)?, scan).await?;
            Ok(Response::XaRecovered { xids })
        }
        Request::XaSetTransactionTimeout { session, seconds } => {
            engine
                .xa_set_transaction_timeout(
                    session_uuid(&session)?,
                    Duration::from_secs(seconds),
                )
                .await?;
            Ok(Response::Done)
        }
        Request::ResizePool {
            conn_hash,
            max_size,
            min_idle,
        } => {
            engine
                .resize_pools(&conn_hash, max_size as usize, min_idle as usize)
                .await?;
            Ok(Response::PoolResized)
        }
    }
}
