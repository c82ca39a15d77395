use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::EnvFilter;

use crossgate_common::TlsMaterial;
use crossgate_gateway::{
    new_rendezvous_registry, ControlPlane, DataPlane, EgressService, GatewayConfig, Locality,
    NoWorkloadInfo, RulePolicy, ServiceDirectory, ServiceRecord, SessionTracker, SniRouter,
};
use crossgate_protocol::{dataplane_server_name, INGRESS_AUTH_PATH};

/// Multi-cluster gateway - connects services across cluster boundaries
#[derive(Parser, Debug)]
#[command(name = "crossgate-gateway")]
#[command(about = "Policy-gated connectivity gateway between clusters")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "gateway.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("crossgate_gateway=info".parse()?)
                .add_directive("crossgate_common=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting gateway with config: {}", args.config);

    let config = GatewayConfig::load_and_resolve(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    tracing::info!("Gateway identity: {}", config.identity);
    tracing::info!("Published port: {}", config.listen_port);
    tracing::info!("Dataplane mode: {}", config.dataplane);

    let material = TlsMaterial::new(
        config.cert_pem.clone(),
        config.key_pem.clone(),
        config.ca_pem.clone(),
    );

    // Control plane authenticates callers at the application layer; the
    // data plane requires client certificates.
    let control_acceptor = TlsAcceptor::from(Arc::new(
        material
            .server_config()
            .context("Failed to load control plane TLS configuration")?,
    ));
    let data_acceptor = TlsAcceptor::from(Arc::new(
        material
            .server_config_mutual()
            .context("Failed to load data plane TLS configuration")?,
    ));
    let control_client_tls = Arc::new(
        material
            .client_config()
            .context("Failed to load control plane client TLS configuration")?,
    );
    let data_client_tls = Arc::new(
        material
            .client_config_mutual()
            .context("Failed to load data plane client TLS configuration")?,
    );

    // Shared state
    let store = ServiceDirectory::new();
    for service in &config.local_services {
        store.add_local(
            ServiceRecord {
                id: service.id.clone(),
                ip: service.ip.clone(),
                port: service.port,
                description: service.description.clone(),
                locality: Locality::Local,
                gateway: None,
            },
            service.label.clone(),
        );
    }
    for import in &config.imports {
        store.add_remote(ServiceRecord {
            id: import.id.clone(),
            ip: "127.0.0.1".to_string(),
            port: import.listen_port,
            description: String::new(),
            locality: Locality::Remote,
            gateway: Some(import.gateway.clone()),
        });
    }
    for (gateway_id, address) in &config.peers {
        store.add_peer(gateway_id.clone(), address.clone());
    }

    let policy = Arc::new(RulePolicy::new(
        config.policy.deny_sources.clone(),
        config.policy.deny_destinations.clone(),
        config.policy.deny_wildcard,
    ));
    let identifier = Arc::new(NoWorkloadInfo);
    let rendezvous = new_rendezvous_registry();
    let tracker = SessionTracker::new();

    let control_plane = ControlPlane::new(
        config.identity.clone(),
        config.dataplane,
        control_acceptor,
        Arc::clone(&store),
        policy.clone(),
        Arc::clone(&rendezvous),
        Arc::clone(&tracker),
    );

    // The data plane reaches the control plane's authorization endpoint
    // through its own TLS identity.
    let authz_url = format!(
        "https://{}:{}{}",
        config.identity, config.control_port, INGRESS_AUTH_PATH
    );
    let api_client = reqwest::Client::builder()
        .add_root_certificate(
            reqwest::Certificate::from_pem(material.ca_pem().as_bytes())
                .context("Failed to parse CA certificate for API client")?,
        )
        .resolve(
            &config.identity,
            SocketAddr::from(([127, 0, 0, 1], config.control_port)),
        )
        .build()
        .context("Failed to build API client")?;
    let data_plane = DataPlane::new(
        data_acceptor,
        Arc::clone(&rendezvous),
        authz_url,
        api_client,
        Arc::clone(&tracker),
    );

    // Published port: route by server name to the internal planes.
    let mut routes = HashMap::new();
    routes.insert(
        config.identity.clone(),
        format!("127.0.0.1:{}", config.control_port),
    );
    routes.insert(
        dataplane_server_name(&config.identity),
        format!("127.0.0.1:{}", config.data_port),
    );
    let router = SniRouter::new(routes);

    // One egress listener per imported service
    for import in &config.imports {
        let listener = TcpListener::bind(("0.0.0.0", import.listen_port))
            .await
            .with_context(|| format!("Failed to bind import listener for {}", import.id))?;
        let service = EgressService::new(
            import.id.clone(),
            config.identity.clone(),
            config.dataplane,
            Arc::clone(&store),
            policy.clone(),
            identifier.clone(),
            Arc::clone(&control_client_tls),
            Arc::clone(&data_client_tls),
            Arc::clone(&tracker),
        );
        let stop = store.stop_token(&import.id);
        tokio::spawn(async move {
            if let Err(e) = service.run(listener, stop).await {
                tracing::error!("Import listener stopped: {:?}", e);
            }
        });
    }

    let router_listener = TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .context("Failed to bind published listener")?;
    let control_listener = TcpListener::bind(("127.0.0.1", config.control_port))
        .await
        .context("Failed to bind control plane listener")?;
    let data_listener = TcpListener::bind(("127.0.0.1", config.data_port))
        .await
        .context("Failed to bind data plane listener")?;

    tokio::select! {
        result = control_plane.run(control_listener) => {
            tracing::error!("Control plane stopped: {:?}", result);
        }
        result = data_plane.run(data_listener) => {
            tracing::error!("Data plane stopped: {:?}", result);
        }
        result = router.run(router_listener) => {
            tracing::error!("SNI router stopped: {:?}", result);
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
    }

    tracing::info!("Gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
