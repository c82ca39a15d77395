//! Single-dial ingress flow: a peer opens one mutual-TLS connection to
//! the data plane, authorizes with a bearer token naming the destination
//! service, and the same connection becomes the data channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crossgate_e2e::{MockService, RecordingPolicy, TestCertificates, TestGateway};
use crossgate_gateway::{initiate_egress, DataplaneMode, GatewayError};

#[tokio::test]
async fn authorized_ingress_reaches_the_service() {
    let certs = Arc::new(TestCertificates::generate(&["gw-east", "gw-west"]));
    let east = TestGateway::start(
        "gw-east",
        DataplaneMode::Mtls,
        Arc::new(RecordingPolicy::allow()),
        Arc::clone(&certs),
    )
    .await;

    let backend = MockService::start().await;
    east.expose("backend", backend.addr(), None);

    // A local application socket pair standing in for the dialing side's
    // accepted connection.
    let app_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let app_addr = app_listener.local_addr().unwrap();
    let mut app = TcpStream::connect(app_addr).await.unwrap();
    let (inbound, _) = app_listener.accept().await.unwrap();

    let tls = east.peer_data_tls("gw-west");
    let gateway_addr = east.router_addr.to_string();
    let server_name = east.dataplane_name();
    let session = tokio::spawn(async move {
        initiate_egress(
            "wildcard:backend".to_string(),
            &gateway_addr,
            &server_name,
            "backend",
            tls,
            inbound,
        )
        .await
    });

    app.write_all(b"single dial").await.unwrap();
    app.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), app.read_to_end(&mut echoed))
        .await
        .expect("ingress relay should complete promptly")
        .unwrap();
    assert_eq!(echoed, b"single dial");

    let stats = session.await.unwrap().unwrap();
    assert_eq!(stats.to_peer, 11);
    assert_eq!(stats.from_peer, 11);
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn unknown_token_is_refused_before_any_dial() {
    let certs = Arc::new(TestCertificates::generate(&["gw-east", "gw-west"]));
    let east = TestGateway::start(
        "gw-east",
        DataplaneMode::Mtls,
        Arc::new(RecordingPolicy::allow()),
        Arc::clone(&certs),
    )
    .await;

    let backend = MockService::start().await;
    east.expose("backend", backend.addr(), None);

    let app_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let app_addr = app_listener.local_addr().unwrap();
    let _app = TcpStream::connect(app_addr).await.unwrap();
    let (inbound, _) = app_listener.accept().await.unwrap();

    let err = initiate_egress(
        "wildcard:phantom".to_string(),
        &east.router_addr.to_string(),
        &east.dataplane_name(),
        "phantom",
        east.peer_data_tls("gw-west"),
        inbound,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, GatewayError::PolicyDenied));
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn policy_denial_is_refused_with_no_session() {
    let certs = Arc::new(TestCertificates::generate(&["gw-east", "gw-west"]));
    let policy = Arc::new(RecordingPolicy::deny());
    let east = TestGateway::start(
        "gw-east",
        DataplaneMode::Mtls,
        policy.clone(),
        Arc::clone(&certs),
    )
    .await;

    let backend = MockService::start().await;
    east.expose("backend", backend.addr(), None);

    let app_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let app_addr = app_listener.local_addr().unwrap();
    let _app = TcpStream::connect(app_addr).await.unwrap();
    let (inbound, _) = app_listener.accept().await.unwrap();

    let err = initiate_egress(
        "wildcard:backend".to_string(),
        &east.router_addr.to_string(),
        &east.dataplane_name(),
        "backend",
        east.peer_data_tls("gw-west"),
        inbound,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, GatewayError::PolicyDenied));
    assert_eq!(backend.connection_count(), 0);
    assert_eq!(policy.request_count(), 1);
    assert_eq!(east.tracker.started(), 0);
}

#[tokio::test]
async fn unauthenticated_peer_cannot_reach_the_data_plane() {
    let certs = Arc::new(TestCertificates::generate(&["gw-east", "gw-west"]));
    let east = TestGateway::start(
        "gw-east",
        DataplaneMode::Mtls,
        Arc::new(RecordingPolicy::allow()),
        Arc::clone(&certs),
    )
    .await;

    let backend = MockService::start().await;
    east.expose("backend", backend.addr(), None);

    // Server-auth-only config: trusts the CA but presents no certificate.
    let no_client_cert = Arc::new(certs.material("gw-west").client_config().unwrap());

    let app_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let app_addr = app_listener.local_addr().unwrap();
    let _app = TcpStream::connect(app_addr).await.unwrap();
    let (inbound, _) = app_listener.accept().await.unwrap();

    let result = initiate_egress(
        "wildcard:backend".to_string(),
        &east.router_addr.to_string(),
        &east.dataplane_name(),
        "backend",
        no_client_cert,
        inbound,
    )
    .await;

    assert!(result.is_err());
    assert_eq!(backend.connection_count(), 0);
}
