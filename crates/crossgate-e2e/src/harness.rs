//! Test gateway harness for E2E tests
//!
//! Starts a complete gateway (SNI router, control plane, data plane) on
//! ephemeral ports with a generated test PKI and an injectable policy
//! engine. Peers reach the gateway through its published router address,
//! the same way real gateways do.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crossgate_gateway::{
    new_rendezvous_registry, ControlPlane, DataPlane, DataplaneMode, EgressService, Locality,
    NoWorkloadInfo, PolicyEngine, RendezvousRegistry, ServiceDirectory, ServiceRecord,
    SessionTracker, SniRouter,
};
use crossgate_protocol::{dataplane_server_name, INGRESS_AUTH_PATH};

use crate::certificates::TestCertificates;

/// A running test gateway
pub struct TestGateway {
    pub identity: String,
    pub mode: DataplaneMode,
    /// Published address peers connect to (SNI-routed)
    pub router_addr: SocketAddr,
    /// Internal control plane address
    pub control_addr: SocketAddr,
    /// Internal data plane address
    pub data_addr: SocketAddr,
    pub store: Arc<ServiceDirectory>,
    pub tracker: Arc<SessionTracker>,
    pub rendezvous: RendezvousRegistry,
    policy: Arc<dyn PolicyEngine>,
    certs: Arc<TestCertificates>,
    control_client_tls: Arc<ClientConfig>,
    data_client_tls: Arc<ClientConfig>,
    stop: CancellationToken,
}

impl TestGateway {
    /// Start a gateway with generated certificates and the given policy
    pub async fn start(
        identity: &str,
        mode: DataplaneMode,
        policy: Arc<dyn PolicyEngine>,
        certs: Arc<TestCertificates>,
    ) -> Self {
        init_crypto();
        let material = certs.material(identity);

        let control_acceptor = TlsAcceptor::from(Arc::new(
            material
                .server_config()
                .expect("Failed to load control plane TLS config"),
        ));
        let data_acceptor = TlsAcceptor::from(Arc::new(
            material
                .server_config_mutual()
                .expect("Failed to load data plane TLS config"),
        ));
        let control_client_tls = Arc::new(
            material
                .client_config()
                .expect("Failed to load control client TLS config"),
        );
        let data_client_tls = Arc::new(
            material
                .client_config_mutual()
                .expect("Failed to load data client TLS config"),
        );

        let store = ServiceDirectory::new();
        let rendezvous = new_rendezvous_registry();
        let tracker = SessionTracker::new();

        // Bind everything on ephemeral ports first so addresses are known
        // before the planes start.
        let control_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind control plane");
        let data_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind data plane");
        let router_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind router");

        let control_addr = control_listener.local_addr().unwrap();
        let data_addr = data_listener.local_addr().unwrap();
        let router_addr = router_listener.local_addr().unwrap();

        let control_plane = ControlPlane::new(
            identity,
            mode,
            control_acceptor,
            Arc::clone(&store),
            Arc::clone(&policy),
            Arc::clone(&rendezvous),
            Arc::clone(&tracker),
        );

        // The data plane consults this gateway's own authorization endpoint.
        let authz_url = format!(
            "https://{}:{}{}",
            identity,
            control_addr.port(),
            INGRESS_AUTH_PATH
        );
        let api_client = reqwest_client(identity, control_addr, &certs.ca_cert_pem);
        let data_plane = DataPlane::new(
            data_acceptor,
            Arc::clone(&rendezvous),
            authz_url,
            api_client,
            Arc::clone(&tracker),
        );

        let mut routes = HashMap::new();
        routes.insert(identity.to_string(), control_addr.to_string());
        routes.insert(dataplane_server_name(identity), data_addr.to_string());
        let router = SniRouter::new(routes);

        let stop = CancellationToken::new();
        spawn_plane(control_plane.run(control_listener), stop.clone());
        spawn_plane(data_plane.run(data_listener), stop.clone());
        spawn_plane(router.run(router_listener), stop.clone());

        // Give the planes a moment to start
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        Self {
            identity: identity.to_string(),
            mode,
            router_addr,
            control_addr,
            data_addr,
            store,
            tracker,
            rendezvous,
            policy,
            certs,
            control_client_tls,
            data_client_tls,
            stop,
        }
    }

    /// Expose a local service on this gateway
    pub fn expose(&self, id: &str, addr: SocketAddr, label: Option<&str>) {
        self.store.add_local(
            ServiceRecord {
                id: id.to_string(),
                ip: addr.ip().to_string(),
                port: addr.port(),
                description: String::new(),
                locality: Locality::Local,
                gateway: None,
            },
            label.map(str::to_string),
        );
    }

    /// Import a service owned by `remote` and bind a local egress listener
    /// for it. Returns the address applications connect to.
    pub async fn import_from(&self, remote: &TestGateway, import_id: &str) -> SocketAddr {
        self.store
            .add_peer(remote.identity.clone(), remote.router_addr.to_string());
        self.store.add_remote(ServiceRecord {
            id: import_id.to_string(),
            ip: "127.0.0.1".to_string(),
            port: 0,
            description: String::new(),
            locality: Locality::Remote,
            gateway: Some(remote.identity.clone()),
        });

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind egress listener");
        let addr = listener.local_addr().unwrap();

        let service = EgressService::new(
            import_id,
            self.identity.clone(),
            self.mode,
            Arc::clone(&self.store),
            Arc::clone(&self.policy),
            Arc::new(NoWorkloadInfo),
            Arc::clone(&self.control_client_tls),
            Arc::clone(&self.data_client_tls),
            Arc::clone(&self.tracker),
        );
        let import_stop = self.store.stop_token(import_id);
        let harness_stop = self.stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = harness_stop.cancelled() => {}
                result = service.run(listener, import_stop) => {
                    if let Err(e) = result {
                        tracing::error!("Egress listener error: {}", e);
                    }
                }
            }
        });

        addr
    }

    /// Mutual-TLS client config of another identity in the same fabric,
    /// for acting as that peer against this gateway.
    pub fn peer_data_tls(&self, identity: &str) -> Arc<ClientConfig> {
        Arc::new(
            self.certs
                .material(identity)
                .client_config_mutual()
                .expect("Failed to load peer client TLS config"),
        )
    }

    /// Server name the data plane answers to
    pub fn dataplane_name(&self) -> String {
        dataplane_server_name(&self.identity)
    }

    pub fn shutdown(&self) {
        self.stop.cancel();
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Install the ring crypto provider once per test process
pub fn init_crypto() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn spawn_plane(
    plane: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    stop: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            result = plane => {
                if let Err(e) = result {
                    tracing::error!("Plane stopped: {}", e);
                }
            }
            _ = stop.cancelled() => {}
        }
    });
}

fn reqwest_client(identity: &str, control_addr: SocketAddr, ca_pem: &str) -> reqwest::Client {
    reqwest::Client::builder()
        .add_root_certificate(
            reqwest::Certificate::from_pem(ca_pem.as_bytes()).expect("Failed to parse test CA"),
        )
        .resolve(identity, control_addr)
        .build()
        .expect("Failed to build API client")
}
