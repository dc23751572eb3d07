// Channel seam between the dispatcher and proxy servers.
//
// The default factory opens a persistent TCP connection per endpoint and
// serializes request frames over it. Tests plug in loopback channels that
// call an in-process engine directly.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{OjpError, Result};
use crate::wire::{read_frame, write_frame, Request, Response};

use super::url::EndpointAddr;

/// One open channel to a proxy server.
#[async_trait]
pub trait ProxyChannel: Send + Sync {
    /// One request/response exchange. Requests on one channel are
    /// serialized; a session's calls therefore keep arrival order.
    async fn call(&self, request: Request) -> Result<Response>;
}

/// Opens channels to endpoints.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open(&self, addr: &EndpointAddr) -> Result<Arc<dyn ProxyChannel>>;
}

/// TCP channel speaking the framed wire protocol.
pub struct TcpChannel {
    stream: Mutex<TcpStream>,
    max_frame: usize,
}

/// Socket-level failures are endpoint health events, not application
/// errors; they surface as transient so the dispatcher reacts.
fn as_transport_error(e: OjpError) -> OjpError {
    match e {
        OjpError::Io(msg) => OjpError::TransientBackend(msg),
        other => other,
    }
}

#[async_trait]
impl ProxyChannel for TcpChannel {
    async fn call(&self, request: Request) -> Result<Response> {
        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, &request, self.max_frame)
            .await
            .map_err(as_transport_error)?;
        match read_frame::<_, Response>(&mut *stream, self.max_frame)
            .await
            .map_err(as_transport_error)?
        {
            Some(response) => Ok(response),
            None => Err(OjpError::TransientBackend(
                "server closed the channel".into(),
            )),
        }
    }
}

/// Default factory: one persistent TCP connection per endpoint.
pub struct TcpChannelFactory {
    max_frame: usize,
}

impl TcpChannelFactory {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

#[async_trait]
impl ChannelFactory for TcpChannelFactory {
    async fn open(&self, addr: &EndpointAddr) -> Result<Arc<dyn ProxyChannel>> {
        let stream = TcpStream::connect((addr.host.as_str(), addr.port))
            .await
            .map_err(|e| OjpError::TransientBackend(format!("connect {addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| OjpError::Io(e.to_string()))?;
        Ok(Arc::new(TcpChannel {
            stream: Mutex::new(stream),
            max_frame: self.max_frame,
        }))
    }
}
