//! Mutual-TLS data plane.
//!
//! Every connection here is client-certificate authenticated. After the
//! handshake the first bytes decide what the connection is:
//!
//!   * an HTTP request head: the ingress authorization flow. The request
//!     is forwarded to the control plane's authorization endpoint and, on
//!     approval, the connection is hijacked into a raw pipe to the target
//!     service.
//!   * a length-prefixed frame: the rendezvous flow. A remote gateway
//!     attaches to an endpoint label published earlier in a connect
//!     reply, and the connection is handed to the forwarder waiting on
//!     that label.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::codec::{Decoder, Encoder};

use crossgate_protocol::{
    ConnectType, DataPlaneMessage, FrameCodec, AUTHORIZATION_HEADER, INGRESS_AUTH_PATH,
    TARGET_CLUSTER_HEADER, WILDCARD,
};

use crate::error::GatewayError;
use crate::forwarder::{ForwardingSession, SessionStats, SessionTracker};
use crate::http1;

/// A stream handed over at rendezvous, along with any bytes that arrived
/// after the attach frame and belong to the pipe.
pub type AttachedConn = (tokio_rustls::server::TlsStream<TcpStream>, Bytes);

/// Endpoint label -> the forwarder waiting for the remote side to attach.
pub type RendezvousRegistry = Arc<dashmap::DashMap<String, oneshot::Sender<AttachedConn>>>;

pub fn new_rendezvous_registry() -> RendezvousRegistry {
    Arc::new(dashmap::DashMap::new())
}

pub struct DataPlane {
    acceptor: TlsAcceptor,
    rendezvous: RendezvousRegistry,
    /// Control-plane authorization endpoint, e.g. `https://gw-a:9443/authz`.
    authz_url: String,
    api_client: reqwest::Client,
    tracker: Arc<SessionTracker>,
}

impl DataPlane {
    pub fn new(
        acceptor: TlsAcceptor,
        rendezvous: RendezvousRegistry,
        authz_url: String,
        api_client: reqwest::Client,
        tracker: Arc<SessionTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            acceptor,
            rendezvous,
            authz_url,
            api_client,
            tracker,
        })
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        tracing::info!(
            "Data plane listening on {}",
            listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let plane = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = plane.handle_connection(stream).await {
                    tracing::warn!("Data plane connection from {} failed: {}", peer_addr, e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), GatewayError> {
        let mut tls_stream = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| GatewayError::Handshake(e.to_string()))?;

        let mut buf = BytesMut::with_capacity(8 * 1024);
        while buf.is_empty() {
            let n = tls_stream.read_buf(&mut buf).await?;
            if n == 0 {
                return Err(GatewayError::Protocol(
                    "Connection closed before any data".to_string(),
                ));
            }
        }

        // HTTP request lines start with an ASCII method; frames start with
        // a length prefix whose high byte is zero.
        if buf[0].is_ascii_uppercase() {
            let request = http1::read_request(&mut tls_stream, &mut buf).await?;
            self.handle_authorize(tls_stream, buf, request).await
        } else {
            self.handle_rendezvous(tls_stream, buf).await
        }
    }

    /// Ingress authorization: forward the request to the control plane,
    /// then splice the caller onto the target the control plane named.
    async fn handle_authorize(
        &self,
        mut tls_stream: tokio_rustls::server::TlsStream<TcpStream>,
        leftover: BytesMut,
        request: http1::Request,
    ) -> Result<(), GatewayError> {
        if request.method != "POST" || request.path != INGRESS_AUTH_PATH {
            http1::write_response(&mut tls_stream, 404, "Not Found", &[], b"").await?;
            return Err(GatewayError::Protocol(format!(
                "Unexpected request {} {}",
                request.method, request.path
            )));
        }

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            if let (Ok(n), Ok(v)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                headers.insert(n, v);
            }
        }

        let upstream = self
            .api_client
            .post(&self.authz_url)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| GatewayError::Protocol(format!("Authorization forward failed: {}", e)))?;

        let status = upstream.status();
        if !status.is_success() {
            tracing::info!(
                "Ingress authorization refused with status {} for token {:?}",
                status,
                request.header(AUTHORIZATION_HEADER)
            );
            http1::write_response(
                &mut tls_stream,
                status.as_u16(),
                status.canonical_reason().unwrap_or("Denied"),
                &[],
                b"",
            )
            .await?;
            return Ok(());
        }

        let target = upstream
            .headers()
            .get(TARGET_CLUSTER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                GatewayError::Protocol(format!(
                    "Authorization reply carries no {} header",
                    TARGET_CLUSTER_HEADER
                ))
            })?;

        // The connection now becomes the data channel.
        http1::write_hijack_ok(&mut tls_stream).await?;

        let mut target_conn = match TcpStream::connect(&target).await {
            Ok(conn) => conn,
            Err(e) => {
                // Already hijacked; all we can do is close so the caller
                // sees end-of-stream instead of a hang.
                tracing::warn!("Dialing authorized target {} failed: {}", target, e);
                let _ = tls_stream.shutdown().await;
                return Err(GatewayError::Dial(e));
            }
        };

        if !leftover.is_empty() {
            target_conn.write_all(&leftover).await?;
        }

        let conn_id = crossgate_protocol::connection_id(
            WILDCARD,
            request.header(AUTHORIZATION_HEADER).unwrap_or(WILDCARD),
        );
        self.tracker.session_started();
        let result = ForwardingSession::new(conn_id, ConnectType::Mtls)
            .run(target_conn, tls_stream)
            .await;
        self.tracker.session_finished(&result);
        result.map(|_| ()).map_err(GatewayError::Io)
    }

    /// Rendezvous: match the attach frame against a waiting forwarder and
    /// hand the authenticated stream over, or refuse.
    async fn handle_rendezvous(
        &self,
        mut tls_stream: tokio_rustls::server::TlsStream<TcpStream>,
        mut buf: BytesMut,
    ) -> Result<(), GatewayError> {
        let mut codec = FrameCodec::<DataPlaneMessage>::new();
        let message = loop {
            if let Some(message) = codec.decode(&mut buf)? {
                break message;
            }
            let n = tls_stream.read_buf(&mut buf).await?;
            if n == 0 {
                return Err(GatewayError::Protocol(
                    "Connection closed before attach frame".to_string(),
                ));
            }
        };

        let endpoint = match message {
            DataPlaneMessage::Attach { endpoint } => endpoint,
            other => {
                return Err(GatewayError::Protocol(format!(
                    "Expected attach frame, got {:?}",
                    other
                )))
            }
        };

        let Some((_, waiter)) = self.rendezvous.remove(&endpoint) else {
            tracing::warn!("Attach to unknown endpoint {:?} refused", endpoint);
            let mut out = BytesMut::new();
            codec.encode(
                DataPlaneMessage::Refused {
                    reason: "unknown endpoint".to_string(),
                },
                &mut out,
            )?;
            tls_stream.write_all(&out).await?;
            let _ = tls_stream.shutdown().await;
            return Ok(());
        };

        let mut out = BytesMut::new();
        codec.encode(DataPlaneMessage::Attached, &mut out)?;
        tls_stream.write_all(&out).await?;
        tls_stream.flush().await?;

        tracing::debug!("Remote side attached to endpoint {}", endpoint);
        if waiter.send((tls_stream, buf.freeze())).is_err() {
            tracing::warn!("Forwarder for endpoint {} gave up before attach", endpoint);
        }
        Ok(())
    }
}

/// Timeout for the authorization round-trip when opening an egress
/// connection to a remote gateway.
const EGRESS_AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Client side of the single-dial egress flow: authorize against the
/// remote gateway's data plane and keep using the same mutual-TLS
/// connection as the data channel.
pub async fn initiate_egress(
    conn_id: String,
    gateway_addr: &str,
    server_name: &str,
    token: &str,
    tls: Arc<ClientConfig>,
    mut inbound: TcpStream,
) -> Result<SessionStats, GatewayError> {
    let tcp = TcpStream::connect(gateway_addr)
        .await
        .map_err(GatewayError::Dial)?;
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| GatewayError::Handshake(format!("Bad server name {}: {}", server_name, e)))?;
    let mut tls_stream = TlsConnector::from(tls)
        .connect(name, tcp)
        .await
        .map_err(|e| GatewayError::Handshake(e.to_string()))?;

    http1::write_request(
        &mut tls_stream,
        "POST",
        INGRESS_AUTH_PATH,
        server_name,
        &[(AUTHORIZATION_HEADER.to_string(), token.to_string())],
        b"",
    )
    .await?;

    let mut buf = BytesMut::new();
    let response = tokio::time::timeout(
        EGRESS_AUTH_TIMEOUT,
        http1::read_response(&mut tls_stream, &mut buf),
    )
    .await
    .map_err(|_| GatewayError::Handshake("Ingress authorization timed out".to_string()))??;

    if response.status != 200 {
        return Err(GatewayError::PolicyDenied);
    }

    // Bytes past the response head already belong to the data channel.
    if !buf.is_empty() {
        inbound.write_all(&buf).await?;
    }

    ForwardingSession::new(conn_id, ConnectType::Mtls)
        .run(inbound, tls_stream)
        .await
        .map_err(GatewayError::Io)
}
