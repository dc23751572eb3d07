// Wire protocol model and framing.
//
// Requests and responses travel as length-delimited bincode frames: a
// big-endian u32 length prefix followed by the serialized payload. Every
// request carries the session address; statement requests additionally
// carry an optional XA branch id that routes them onto the branch's
// backend session.

use bytes::BytesMut;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::backend::{
    ColumnMeta, ExecuteOutcome, IsolationLevel, Row, SqlValue, XaEndFlags, XaRecoverScan,
    XaStartFlags, XaVote, Xid,
};
use crate::error::{OjpError, Result};
use crate::session::LobKind;

/// Session address carried on every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub client_uuid: Uuid,
    /// Absent on the initial connect.
    pub session_uuid: Option<Uuid>,
    pub conn_hash: String,
    pub is_xa: bool,
}

/// A statement body: literal SQL or a previously prepared statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StatementRef {
    Sql(String),
    Prepared(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Connect {
        session: SessionInfo,
        native_url: String,
        user: String,
        password: String,
        datasource: Option<String>,
    },
    TerminateSession {
        session: SessionInfo,
    },
    Execute {
        session: SessionInfo,
        xid: Option<Xid>,
        statement: StatementRef,
        params: Vec<SqlValue>,
    },
    ExecuteQuery {
        session: SessionInfo,
        xid: Option<Xid>,
        statement: StatementRef,
        params: Vec<SqlValue>,
        fetch_size: u32,
    },
    ExecuteUpdate {
        session: SessionInfo,
        xid: Option<Xid>,
        statement: StatementRef,
        params: Vec<SqlValue>,
    },
    PrepareStatement {
        session: SessionInfo,
        sql: String,
    },
    FetchResultSet {
        session: SessionInfo,
        result_set: Uuid,
        fetch_size: u32,
    },
    ReadLob {
        session: SessionInfo,
        lob: Uuid,
        offset: u64,
        length: u64,
    },
    WriteLob {
        session: SessionInfo,
        /// Absent to allocate a new LOB in the session arena.
        lob: Option<Uuid>,
        kind: LobKind,
        offset: u64,
        chunk: Vec<u8>,
    },
    Commit {
        session: SessionInfo,
    },
    Rollback {
        session: SessionInfo,
    },
    SetAutoCommit {
        session: SessionInfo,
        enabled: bool,
    },
    SetTransactionIsolation {
        session: SessionInfo,
        level: IsolationLevel,
    },
    XaStart {
        session: SessionInfo,
        xid: Xid,
        flags: XaStartFlags,
    },
    XaEnd {
        session: SessionInfo,
        xid: Xid,
        flags: XaEndFlags,
    },
    XaPrepare {
        session: SessionInfo,
        xid: Xid,
    },
    XaCommit {
        session: SessionInfo,
        xid: Xid,
        one_phase: bool,
    },
    XaRollback {
        session: SessionInfo,
        xid: Xid,
    },
    XaForget {
        session: SessionInfo,
        xid: Xid,
    },
    XaRecover {
        session: SessionInfo,
        scan: XaRecoverScan,
    },
    XaSetTransactionTimeout {
        session: SessionInfo,
        seconds: u64,
    },
    /// Dispatcher-issued rebalance of the pools serving one conn hash.
    ResizePool {
        conn_hash: String,
        max_size: u32,
        min_idle: u32,
    },
}

impl Request {
    /// The session address, when the request carries one.
    pub fn session(&self) -> Option<&SessionInfo> {
        match self {
            Request::Connect { session, .. }
            | Request::TerminateSession { session }
            | Request::Execute { session, .. }
            | Request::ExecuteQuery { session, .. }
            | Request::ExecuteUpdate { session, .. }
            | Request::PrepareStatement { session, .. }
            | Request::FetchResultSet { session, .. }
            | Request::ReadLob { session, .. }
            | Request::WriteLob { session, .. }
            | Request::Commit { session }
            | Request::Rollback { session }
            | Request::SetAutoCommit { session, .. }
            | Request::SetTransactionIsolation { session, .. }
            | Request::XaStart { session, .. }
            | Request::XaEnd { session, .. }
            | Request::XaPrepare { session, .. }
            | Request::XaCommit { session, .. }
            | Request::XaRollback { session, .. }
            | Request::XaForget { session, .. }
            | Request::XaRecover { session, .. }
            | Request::XaSetTransactionTimeout { session, .. } => Some(session),
            Request::ResizePool { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Connected {
        session_uuid: Uuid,
    },
    Terminated,
    Executed(ExecuteOutcome),
    UpdateCount(u64),
    ResultSet {
        result_set: Uuid,
        columns: Vec<ColumnMeta>,
        rows: Vec<Row>,
        exhausted: bool,
    },
    StatementPrepared {
        statement: Uuid,
    },
    Page {
        rows: Vec<Row>,
        exhausted: bool,
    },
    LobData {
        data: Vec<u8>,
    },
    LobWritten {
        lob: Uuid,
        length: u64,
    },
    Done,
    XaPrepared {
        vote: XaVote,
    },
    XaRecovered {
        xids: Vec<Xid>,
    },
    PoolResized,
    Error {
        kind: String,
        message: String,
        sqlstate: Option<String>,
    },
}

impl Response {
    pub fn from_error(error: &OjpError) -> Self {
        let sqlstate = match error {
            OjpError::Backend { sqlstate, .. } => Some(sqlstate.clone()),
            _ => None,
        };
        Response::Error {
            kind: error.kind().to_string(),
            message: error.to_string(),
            sqlstate,
        }
    }
}

/// Writes one length-delimited frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T, max_frame: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| OjpError::Wire(format!("encode: {e}")))?;
    if payload.len() > max_frame {
        return Err(OjpError::Wire(format!(
            "frame of {} bytes exceeds limit {max_frame}",
            payload.len()
        )));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-delimited frame; `None` on clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R, max_frame: usize) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max_frame {
        return Err(OjpError::Wire(format!(
            "frame of {len} bytes exceeds limit {max_frame}"
        )));
    }
    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await?;
    let (value, _) = bincode::serde::decode_from_slice(&payload, bincode::config::standard())
        .map_err(|e| OjpError::Wire(format!("decode: {e}")))?;
    Ok(Some(value))
}
