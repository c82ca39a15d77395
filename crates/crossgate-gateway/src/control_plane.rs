//! Control plane: the `/connect` surface remote gateways talk to, and the
//! `/authz` endpoint the local data plane consults for ingress requests.
//!
//! A `/connect` request is arbitrated against the local service table and
//! the policy engine. An approved TCP-mode request hijacks the connection
//! itself into the data channel; an approved mTLS-mode request publishes a
//! rendezvous endpoint and answers with a connect reply pointing at it.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crossgate_protocol::{
    connection_id, remote_endpoint, ConnectReply, ConnectRequest, AUTHORIZATION_HEADER,
    CONNECT_PATH, INGRESS_AUTH_PATH, TARGET_CLUSTER_HEADER, WILDCARD,
};

use crate::config::DataplaneMode;
use crate::data_plane::RendezvousRegistry;
use crate::error::GatewayError;
use crate::forwarder::SessionTracker;
use crate::http1;
use crate::mtls_forwarder::MtlsForwarder;
use crate::policy::{ConnectionRequest, Direction, PolicyEngine};
use crate::store::ServiceDirectory;
use crate::tcp_forwarder::{Endpoint, TcpForwarder};

pub struct ControlPlane {
    identity: String,
    mode: DataplaneMode,
    acceptor: TlsAcceptor,
    store: Arc<ServiceDirectory>,
    policy: Arc<dyn PolicyEngine>,
    rendezvous: RendezvousRegistry,
    tracker: Arc<SessionTracker>,
}

impl ControlPlane {
    pub fn new(
        identity: impl Into<String>,
        mode: DataplaneMode,
        acceptor: TlsAcceptor,
        store: Arc<ServiceDirectory>,
        policy: Arc<dyn PolicyEngine>,
        rendezvous: RendezvousRegistry,
        tracker: Arc<SessionTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity: identity.into(),
            mode,
            acceptor,
            store,
            policy,
            rendezvous,
            tracker,
        })
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        tracing::info!(
            "Control plane for {} listening on {}",
            self.identity,
            listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let plane = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = plane.handle_connection(stream).await {
                    match e {
                        GatewayError::PolicyDenied => {
                            tracing::info!("Connection from {} denied by policy", peer_addr)
                        }
                        other => {
                            tracing::warn!("Control connection from {} failed: {}", peer_addr, other)
                        }
                    }
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
        let request = http1::read_request(&mut tls_stream, &mut buf).await?;

        match (request.method.as_str(), request.path.as_str()) {
            ("POST", CONNECT_PATH) => self.handle_connect(tls_stream, buf, request).await,
            ("POST", INGRESS_AUTH_PATH) => self.handle_authorization(tls_stream, request).await,
            (method, path) => {
                http1::write_response(&mut tls_stream, 404, "Not Found", &[], b"").await?;
                Err(GatewayError::Protocol(format!(
                    "Unexpected request {} {}",
                    method, path
                )))
            }
        }
    }

    /// Arbitrate a connect request from a remote gateway.
    async fn handle_connect(
        self: Arc<Self>,
        mut tls_stream: tokio_rustls::server::TlsStream<TcpStream>,
        leftover: BytesMut,
        request: http1::Request,
    ) -> Result<(), GatewayError> {
        let connect: ConnectRequest = match serde_json::from_slice(&request.body) {
            Ok(c) => c,
            Err(e) => {
                http1::write_response(&mut tls_stream, 400, "Bad Request", &[], b"").await?;
                return Err(GatewayError::Protocol(format!(
                    "Malformed connect request: {}",
                    e
                )));
            }
        };

        let conn_id = connection_id(&connect.id, &connect.id_dest);
        tracing::info!(
            "Connect request {} from gateway {} (policy {:?})",
            conn_id,
            connect.gateway_id,
            connect.policy
        );

        let Some(local) = self.store.local_service(&connect.id_dest) else {
            tracing::info!("Connect {} refused: unknown destination", conn_id);
            return self.refuse(tls_stream).await;
        };

        let decision = ConnectionRequest {
            source: connect.id.clone(),
            destination: connect.id_dest.clone(),
            policy_hint: connect.policy.clone(),
            peer_gateway: connect.gateway_id.clone(),
            direction: Direction::Incoming,
        };
        let allowed = match self.policy.decide(&decision).await {
            Ok(d) => d.is_allow(),
            Err(e) => {
                tracing::warn!("Policy engine failed for {}, treating as denial: {}", conn_id, e);
                false
            }
        };
        if !allowed {
            self.refuse(tls_stream).await?;
            return Err(GatewayError::PolicyDenied);
        }

        match self.mode {
            DataplaneMode::Tcp => {
                let reply = serde_json::to_vec(&ConnectReply::forward())
                    .map_err(|e| GatewayError::Protocol(e.to_string()))?;
                http1::write_response(&mut tls_stream, 200, "OK", &[], &reply).await?;

                // This connection is now the data channel.
                let mut forward = TcpForwarder::new(conn_id);
                forward.set_listener(Endpoint::Addr(local.address()));
                forward.set_peer(Endpoint::stream(tls_stream));
                forward.push_peer_bytes(leftover.freeze());

                self.tracker.session_started();
                let result = forward.run().await;
                self.tracker.session_finished(&result);
                result.map(|_| ())
            }
            DataplaneMode::Mtls => {
                let endpoint = remote_endpoint(&conn_id);
                let forward = MtlsForwarder::server(
                    conn_id.clone(),
                    local.address(),
                    endpoint.clone(),
                    Arc::clone(&self.rendezvous),
                );

                let tracker = Arc::clone(&self.tracker);
                let supervised_id = conn_id.clone();
                tokio::spawn(async move {
                    tracker.session_started();
                    let result = forward.run().await;
                    tracker.session_finished(&result);
                    if let Err(e) = result {
                        tracing::warn!("Forwarding session {} ended: {}", supervised_id, e);
                    }
                });

                let reply = serde_json::to_vec(&ConnectReply::mtls(endpoint))
                    .map_err(|e| GatewayError::Protocol(e.to_string()))?;
                http1::write_response(&mut tls_stream, 200, "OK", &[], &reply).await?;
                let _ = tls_stream.shutdown().await;
                Ok(())
            }
        }
    }

    async fn refuse(
        &self,
        mut tls_stream: tokio_rustls::server::TlsStream<TcpStream>,
    ) -> Result<(), GatewayError> {
        let reply = serde_json::to_vec(&ConnectReply::refused())
            .map_err(|e| GatewayError::Protocol(e.to_string()))?;
        http1::write_response(&mut tls_stream, 200, "OK", &[], &reply).await?;
        let _ = tls_stream.shutdown().await;
        Ok(())
    }

    /// Authorize an ingress request forwarded by the data plane. The
    /// bearer token names the destination service; approval is answered
    /// with the resolved target address in a header.
    async fn handle_authorization(
        &self,
        mut tls_stream: tokio_rustls::server::TlsStream<TcpStream>,
        request: http1::Request,
    ) -> Result<(), GatewayError> {
        // The connection is closed after one exchange; say so, since the
        // data plane's HTTP client would otherwise try to reuse it.
        let close = ("connection".to_string(), "close".to_string());

        let Some(token) = request.header(AUTHORIZATION_HEADER) else {
            http1::write_response(&mut tls_stream, 401, "Unauthorized", &[close.clone()], b"")
                .await?;
            return Err(GatewayError::Protocol(
                "Authorization request without token".to_string(),
            ));
        };
        let service_id = token.strip_prefix("Bearer ").unwrap_or(token).to_string();

        let Some(service) = self.store.local_service(&service_id) else {
            tracing::info!("Authorization refused: unknown service {:?}", service_id);
            http1::write_response(&mut tls_stream, 403, "Forbidden", &[close.clone()], b"").await?;
            return Ok(());
        };

        let decision = ConnectionRequest {
            source: WILDCARD.to_string(),
            destination: service_id.clone(),
            policy_hint: "forward".to_string(),
            peer_gateway: WILDCARD.to_string(),
            direction: Direction::Incoming,
        };
        let allowed = match self.policy.decide(&decision).await {
            Ok(d) => d.is_allow(),
            Err(e) => {
                tracing::warn!(
                    "Policy engine failed for ingress to {}, treating as denial: {}",
                    service_id,
                    e
                );
                false
            }
        };
        if !allowed {
            tracing::info!("Ingress to {} denied by policy", service_id);
            http1::write_response(&mut tls_stream, 403, "Forbidden", &[close.clone()], b"").await?;
            return Err(GatewayError::PolicyDenied);
        }

        http1::write_response(
            &mut tls_stream,
            200,
            "OK",
            &[
                (TARGET_CLUSTER_HEADER.to_string(), service.address()),
                close,
            ],
            b"",
        )
        .await?;
        Ok(())
    }
}
