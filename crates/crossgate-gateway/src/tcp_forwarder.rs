//! TCP forwarding strategy: one dialed or accepted connection on each side,
//! glued together by a [`ForwardingSession`].

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crossgate_protocol::ConnectType;

use crate::error::GatewayError;
use crate::forwarder::{ForwardingSession, SessionStats};

/// Anything a forwarder endpoint can be backed by. TLS streams and plain
/// sockets both qualify, so either side of a pipe may be encrypted.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

/// One side of a TCP forwarder: either an address to dial when the
/// forwarder runs, or a connection that already exists.
pub enum Endpoint {
    Addr(String),
    Stream(Box<dyn Duplex>),
}

impl Endpoint {
    pub fn stream(conn: impl Duplex + 'static) -> Self {
        Endpoint::Stream(Box::new(conn))
    }

    async fn establish(self) -> Result<Box<dyn Duplex>, GatewayError> {
        match self {
            Endpoint::Addr(addr) => {
                let conn = TcpStream::connect(&addr)
                    .await
                    .map_err(GatewayError::Dial)?;
                Ok(Box::new(conn))
            }
            Endpoint::Stream(conn) => Ok(conn),
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Addr(addr) => f.debug_tuple("Addr").field(addr).finish(),
            Endpoint::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Plain TCP relay between a listener-side and a peer-side endpoint.
///
/// Both sides must be set before `run` is called; a half-configured
/// forwarder refuses to start instead of hanging on a missing side.
pub struct TcpForwarder {
    conn_id: String,
    listener: Option<Endpoint>,
    peer: Option<Endpoint>,
    peer_bytes: Bytes,
}

impl TcpForwarder {
    pub fn new(conn_id: impl Into<String>) -> Self {
        Self {
            conn_id: conn_id.into(),
            listener: None,
            peer: None,
            peer_bytes: Bytes::new(),
        }
    }

    pub fn set_listener(&mut self, endpoint: Endpoint) {
        self.listener = Some(endpoint);
    }

    pub fn set_peer(&mut self, endpoint: Endpoint) {
        self.peer = Some(endpoint);
    }

    /// Bytes from the peer that were read while parsing the control
    /// exchange. They are delivered to the listener side before copying
    /// begins.
    pub fn push_peer_bytes(&mut self, bytes: Bytes) {
        self.peer_bytes = bytes;
    }

    pub async fn run(self) -> Result<SessionStats, GatewayError> {
        let listener = self.listener.ok_or_else(|| {
            GatewayError::Protocol(format!("{}: no listener endpoint configured", self.conn_id))
        })?;
        let peer = self.peer.ok_or_else(|| {
            GatewayError::Protocol(format!("{}: no peer endpoint configured", self.conn_id))
        })?;

        let mut listener_conn = listener.establish().await?;
        let peer_conn = peer.establish().await?;

        if !self.peer_bytes.is_empty() {
            listener_conn.write_all(&self.peer_bytes).await?;
        }

        let session = ForwardingSession::new(self.conn_id, ConnectType::Tcp);
        session
            .run(listener_conn, peer_conn)
            .await
            .map_err(GatewayError::Io)
    }
}
