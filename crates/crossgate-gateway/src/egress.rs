//! Egress side of an imported service.
//!
//! Each import binds a local listener. Every accepted application
//! connection is attributed to a source, arbitrated by the policy
//! engine, and on approval relayed to the owning gateway with the
//! configured dataplane strategy.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crossgate_protocol::{
    connection_id, dataplane_server_name, ConnectReply, ConnectRequest, CONNECT_PATH, WILDCARD,
};

use crate::config::DataplaneMode;
use crate::error::GatewayError;
use crate::forwarder::SessionTracker;
use crate::http1;
use crate::mtls_forwarder::MtlsForwarder;
use crate::policy::{ConnectionRequest, Direction, PolicyEngine};
use crate::store::{ServiceDirectory, SourceIdentifier};
use crate::tcp_forwarder::{Endpoint, TcpForwarder};

pub struct EgressService {
    /// Id of the imported service this listener fronts.
    import_id: String,
    identity: String,
    mode: DataplaneMode,
    store: Arc<ServiceDirectory>,
    policy: Arc<dyn PolicyEngine>,
    identifier: Arc<dyn SourceIdentifier>,
    /// Server-authenticated TLS for the control plane exchange.
    control_tls: Arc<ClientConfig>,
    /// Mutual TLS for the data plane.
    data_tls: Arc<ClientConfig>,
    tracker: Arc<SessionTracker>,
}

impl EgressService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        import_id: impl Into<String>,
        identity: impl Into<String>,
        mode: DataplaneMode,
        store: Arc<ServiceDirectory>,
        policy: Arc<dyn PolicyEngine>,
        identifier: Arc<dyn SourceIdentifier>,
        control_tls: Arc<ClientConfig>,
        data_tls: Arc<ClientConfig>,
        tracker: Arc<SessionTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            import_id: import_id.into(),
            identity: identity.into(),
            mode,
            store,
            policy,
            identifier,
            control_tls,
            data_tls,
            tracker,
        })
    }

    /// Accept loop for one imported service. Stops cleanly when the
    /// import is withdrawn.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        stop: CancellationToken,
    ) -> anyhow::Result<()> {
        tracing::info!(
            "Import {} listening on {}",
            self.import_id,
            listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    tracing::info!("Import {} listener stopped", self.import_id);
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    let service = Arc::clone(&self);
                    tokio::spawn(async move {
                        let outcome = Arc::clone(&service)
                            .handle_outgoing(stream, peer_addr.ip().to_string())
                            .await;
                        match outcome {
                            Ok(()) => {}
                            Err(GatewayError::PolicyDenied) => {
                                tracing::info!(
                                    "Denying outgoing connection from {} to {}",
                                    peer_addr,
                                    service.import_id
                                );
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "Outgoing connection from {} to {} failed: {}",
                                    peer_addr,
                                    service.import_id,
                                    e
                                );
                            }
                        }
                    });
                }
            }
        }
    }

    async fn handle_outgoing(
        self: Arc<Self>,
        inbound: TcpStream,
        source_ip: String,
    ) -> Result<(), GatewayError> {
        let source = self.store.lookup_source(&*self.identifier, &source_ip).await;

        let request = ConnectionRequest {
            source: source.id.clone(),
            destination: self.import_id.clone(),
            policy_hint: "forward".to_string(),
            peer_gateway: WILDCARD.to_string(),
            direction: Direction::Outgoing,
        };
        let decision = match self.policy.decide(&request).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(
                    "Policy engine failed for {} -> {}, treating as denial: {}",
                    source.id,
                    self.import_id,
                    e
                );
                return Err(GatewayError::PolicyDenied);
            }
        };
        if !decision.is_allow() {
            return Err(GatewayError::PolicyDenied);
        }

        // The policy may steer the connection to a specific gateway;
        // otherwise the import's configured owner is used.
        let gateway_id = decision
            .target_gateway
            .filter(|g| !g.is_empty())
            .or_else(|| {
                self.store
                    .remote_service(&self.import_id)
                    .and_then(|s| s.gateway)
            })
            .ok_or_else(|| {
                GatewayError::Lookup(format!("No gateway known for import {}", self.import_id))
            })?;
        let target = self.store.gateway_target(&gateway_id).ok_or_else(|| {
            GatewayError::Lookup(format!("No address known for gateway {}", gateway_id))
        })?;

        let conn_id = connection_id(&source.id, &self.import_id);
        tracing::info!(
            "Opening {} to gateway {} at {} ({})",
            conn_id,
            gateway_id,
            target,
            self.mode
        );

        let connect = ConnectRequest {
            id: source.id.clone(),
            id_dest: self.import_id.clone(),
            policy: "forward".to_string(),
            gateway_id: self.identity.clone(),
        };
        let (reply, control_conn, leftover) = connect_request(
            &target,
            &gateway_id,
            &connect,
            Arc::clone(&self.control_tls),
        )
        .await?;

        if !reply.connected {
            tracing::info!("Connect {} refused by gateway {}", conn_id, gateway_id);
            return Err(GatewayError::PolicyDenied);
        }

        self.tracker.session_started();
        let result = match self.mode {
            DataplaneMode::Tcp => {
                // The control connection carries the data from here on.
                let mut forward = TcpForwarder::new(conn_id);
                forward.set_listener(Endpoint::stream(inbound));
                forward.set_peer(Endpoint::stream(control_conn));
                forward.push_peer_bytes(leftover);
                forward.run().await
            }
            DataplaneMode::Mtls => {
                // A fresh mutual-TLS connection to the remote data plane;
                // the control connection is done.
                drop(control_conn);
                MtlsForwarder::client(
                    conn_id,
                    &target,
                    dataplane_server_name(&gateway_id),
                    reply.connect_destination,
                    Arc::clone(&self.data_tls),
                    inbound,
                )
                .run()
                .await
            }
        };
        self.tracker.session_finished(&result);
        result.map(|_| ())
    }
}

/// One connect exchange with a remote gateway's control plane. Returns
/// the parsed reply together with the TLS connection and any bytes read
/// past the reply, which belong to the data channel in TCP mode.
pub async fn connect_request(
    target_addr: &str,
    server_name: &str,
    request: &ConnectRequest,
    tls: Arc<ClientConfig>,
) -> Result<
    (
        ConnectReply,
        tokio_rustls::client::TlsStream<TcpStream>,
        Bytes,
    ),
    GatewayError,
> {
    let tcp = TcpStream::connect(target_addr)
        .await
        .map_err(GatewayError::Dial)?;
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| GatewayError::Handshake(format!("Bad server name {}: {}", server_name, e)))?;
    let mut tls_stream = TlsConnector::from(tls)
        .connect(name, tcp)
        .await
        .map_err(|e| GatewayError::Handshake(e.to_string()))?;

    let body = serde_json::to_vec(request).map_err(|e| GatewayError::Protocol(e.to_string()))?;
    http1::write_request(&mut tls_stream, "POST", CONNECT_PATH, server_name, &[], &body).await?;

    let mut buf = BytesMut::new();
    let response = http1::read_response(&mut tls_stream, &mut buf).await?;
    if response.status != 200 {
        return Err(GatewayError::Protocol(format!(
            "Connect exchange answered with status {}",
            response.status
        )));
    }
    let reply: ConnectReply = serde_json::from_slice(&response.body)
        .map_err(|e| GatewayError::Protocol(format!("Malformed connect reply: {}", e)))?;

    Ok((reply, tls_stream, buf.freeze()))
}
