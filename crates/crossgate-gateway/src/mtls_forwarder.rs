//! Mutual-TLS forwarding strategy.
//!
//! The listening gateway runs the server role: it publishes an endpoint
//! label up front, dials the local destination service, and waits for
//! the remote gateway to attach on the data plane. The dialing
//! gateway runs the client role: it opens a mutual-TLS connection to the
//! remote data plane, attaches to the label from the connect reply, and
//! then the connection is the pipe.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Decoder, Encoder};

use crossgate_protocol::{ConnectType, DataPlaneMessage, FrameCodec};

use crate::data_plane::{AttachedConn, RendezvousRegistry};
use crate::error::GatewayError;
use crate::forwarder::{ForwardingSession, SessionStats};

/// How long the server role holds a published endpoint open before
/// concluding the remote side is not coming.
const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(30);

enum Role {
    /// Wait for the remote gateway to attach to `endpoint`, with the
    /// local destination already dialed.
    Server {
        local_addr: String,
        endpoint: String,
        rendezvous: RendezvousRegistry,
        attach: oneshot::Receiver<AttachedConn>,
    },
    /// Dial the remote data plane and attach to `endpoint`, splicing the
    /// accepted application connection onto it.
    Client {
        gateway_addr: String,
        server_name: String,
        endpoint: String,
        tls: Arc<ClientConfig>,
        inbound: TcpStream,
    },
}

pub struct MtlsForwarder {
    conn_id: String,
    role: Role,
}

impl MtlsForwarder {
    /// The endpoint label is registered here, at construction, so the
    /// remote side can never attach before the registration exists even
    /// if it reacts to the connect reply faster than the forwarder task
    /// gets scheduled.
    pub fn server(
        conn_id: impl Into<String>,
        local_addr: impl Into<String>,
        endpoint: impl Into<String>,
        rendezvous: RendezvousRegistry,
    ) -> Self {
        let endpoint = endpoint.into();
        let (tx, attach) = oneshot::channel();
        rendezvous.insert(endpoint.clone(), tx);
        Self {
            conn_id: conn_id.into(),
            role: Role::Server {
                local_addr: local_addr.into(),
                endpoint,
                rendezvous,
                attach,
            },
        }
    }

    pub fn client(
        conn_id: impl Into<String>,
        gateway_addr: impl Into<String>,
        server_name: impl Into<String>,
        endpoint: impl Into<String>,
        tls: Arc<ClientConfig>,
        inbound: TcpStream,
    ) -> Self {
        Self {
            conn_id: conn_id.into(),
            role: Role::Client {
                gateway_addr: gateway_addr.into(),
                server_name: server_name.into(),
                endpoint: endpoint.into(),
                tls,
                inbound,
            },
        }
    }

    pub async fn run(self) -> Result<SessionStats, GatewayError> {
        match self.role {
            Role::Server {
                local_addr,
                endpoint,
                rendezvous,
                attach,
            } => run_server(self.conn_id, local_addr, endpoint, rendezvous, attach).await,
            Role::Client {
                gateway_addr,
                server_name,
                endpoint,
                tls,
                inbound,
            } => run_client(self.conn_id, gateway_addr, server_name, endpoint, tls, inbound).await,
        }
    }
}

async fn run_server(
    conn_id: String,
    local_addr: String,
    endpoint: String,
    rendezvous: RendezvousRegistry,
    attach: oneshot::Receiver<AttachedConn>,
) -> Result<SessionStats, GatewayError> {
    let mut local_conn = match TcpStream::connect(&local_addr).await {
        Ok(conn) => conn,
        Err(e) => {
            rendezvous.remove(&endpoint);
            return Err(GatewayError::Dial(e));
        }
    };
    tracing::debug!("{}: waiting for attach on endpoint {}", conn_id, endpoint);

    let (peer_conn, early_bytes) = match tokio::time::timeout(RENDEZVOUS_TIMEOUT, attach).await {
        Ok(Ok(attached)) => attached,
        Ok(Err(_)) | Err(_) => {
            rendezvous.remove(&endpoint);
            return Err(GatewayError::Handshake(format!(
                "{}: remote side never attached to {}",
                conn_id, endpoint
            )));
        }
    };

    if !early_bytes.is_empty() {
        local_conn.write_all(&early_bytes).await?;
    }

    ForwardingSession::new(conn_id, ConnectType::Mtls)
        .run(local_conn, peer_conn)
        .await
        .map_err(GatewayError::Io)
}

async fn run_client(
    conn_id: String,
    gateway_addr: String,
    server_name: String,
    endpoint: String,
    tls: Arc<ClientConfig>,
    mut inbound: TcpStream,
) -> Result<SessionStats, GatewayError> {
    let tcp = TcpStream::connect(&gateway_addr)
        .await
        .map_err(GatewayError::Dial)?;
    let name = ServerName::try_from(server_name.clone())
        .map_err(|e| GatewayError::Handshake(format!("Bad server name {}: {}", server_name, e)))?;
    let mut tls_stream = TlsConnector::from(tls)
        .connect(name, tcp)
        .await
        .map_err(|e| GatewayError::Handshake(e.to_string()))?;

    let mut codec = FrameCodec::<DataPlaneMessage>::new();
    let mut out = BytesMut::new();
    codec.encode(DataPlaneMessage::Attach { endpoint }, &mut out)?;
    tls_stream.write_all(&out).await?;
    tls_stream.flush().await?;

    let mut buf = BytesMut::new();
    let reply = loop {
        if let Some(message) = codec.decode(&mut buf)? {
            break message;
        }
        let n = tokio::time::timeout(RENDEZVOUS_TIMEOUT, tls_stream.read_buf(&mut buf))
            .await
            .map_err(|_| {
                GatewayError::Handshake(format!("{}: attach reply timed out", conn_id))
            })??;
        if n == 0 {
            return Err(GatewayError::Protocol(
                "Connection closed before attach reply".to_string(),
            ));
        }
    };

    match reply {
        DataPlaneMessage::Attached => {}
        DataPlaneMessage::Refused { reason } => {
            return Err(GatewayError::Handshake(format!(
                "{}: attach refused: {}",
                conn_id, reason
            )));
        }
        other => {
            return Err(GatewayError::Protocol(format!(
                "Expected attach reply, got {:?}",
                other
            )));
        }
    }

    // Anything decoded past the reply is already pipe data.
    if !buf.is_empty() {
        inbound.write_all(&buf).await?;
    }

    ForwardingSession::new(conn_id, ConnectType::Mtls)
        .run(inbound, tls_stream)
        .await
        .map_err(GatewayError::Io)
}
