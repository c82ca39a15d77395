//! End-to-end TCP-mode relay between two gateways.
//!
//! The connect exchange itself becomes the data channel: gw-west imports
//! a service exposed by gw-east, an application connects to the local
//! egress port, and bytes flow through both gateways to the echo service
//! and back.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crossgate_e2e::{MockService, RecordingPolicy, TestCertificates, TestGateway};
use crossgate_gateway::{DataplaneMode, Locality, ServiceRecord};

#[tokio::test]
async fn relays_bytes_through_both_gateways() {
    let certs = Arc::new(TestCertificates::generate(&["gw-east", "gw-west"]));

    let east_policy = Arc::new(RecordingPolicy::allow());
    let west_policy = Arc::new(RecordingPolicy::allow());
    let east = TestGateway::start(
        "gw-east",
        DataplaneMode::Tcp,
        east_policy.clone(),
        Arc::clone(&certs),
    )
    .await;
    let west = TestGateway::start(
        "gw-west",
        DataplaneMode::Tcp,
        west_policy.clone(),
        Arc::clone(&certs),
    )
    .await;

    let backend = MockService::start().await;
    east.expose("backend", backend.addr(), None);
    let egress_addr = west.import_from(&east, "backend").await;

    let mut app = TcpStream::connect(egress_addr).await.unwrap();
    app.write_all(b"hello across clusters").await.unwrap();
    app.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), app.read_to_end(&mut echoed))
        .await
        .expect("relay should complete promptly")
        .unwrap();
    assert_eq!(echoed, b"hello across clusters");

    assert_eq!(backend.connection_count(), 1);
    assert_eq!(backend.connections()[0].received_data, b"hello across clusters");

    // Both sides arbitrated the attempt: once outgoing, once incoming.
    let outgoing = west_policy.requests();
    assert_eq!(outgoing.len(), 1);
    assert_eq!(outgoing[0].destination, "backend");
    let incoming = east_policy.requests();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].destination, "backend");
    assert_eq!(incoming[0].peer_gateway, "gw-west");
}

#[tokio::test]
async fn remote_denial_closes_without_dialing_the_service() {
    let certs = Arc::new(TestCertificates::generate(&["gw-east", "gw-west"]));

    let east = TestGateway::start(
        "gw-east",
        DataplaneMode::Tcp,
        Arc::new(RecordingPolicy::deny()),
        Arc::clone(&certs),
    )
    .await;
    let west = TestGateway::start(
        "gw-west",
        DataplaneMode::Tcp,
        Arc::new(RecordingPolicy::allow()),
        Arc::clone(&certs),
    )
    .await;

    let backend = MockService::start().await;
    east.expose("backend", backend.addr(), None);
    let egress_addr = west.import_from(&east, "backend").await;

    let mut app = TcpStream::connect(egress_addr).await.unwrap();
    let mut buf = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), app.read_to_end(&mut buf))
        .await
        .expect("denied connection should be closed promptly, not hang")
        .unwrap();
    assert_eq!(n, 0, "denied connection should carry no data");

    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn local_denial_never_contacts_the_remote_gateway() {
    let certs = Arc::new(TestCertificates::generate(&["gw-east", "gw-west"]));

    let east_policy = Arc::new(RecordingPolicy::allow());
    let east = TestGateway::start(
        "gw-east",
        DataplaneMode::Tcp,
        east_policy.clone(),
        Arc::clone(&certs),
    )
    .await;
    let west = TestGateway::start(
        "gw-west",
        DataplaneMode::Tcp,
        Arc::new(RecordingPolicy::deny()),
        Arc::clone(&certs),
    )
    .await;

    let backend = MockService::start().await;
    east.expose("backend", backend.addr(), None);
    let egress_addr = west.import_from(&east, "backend").await;

    let mut app = TcpStream::connect(egress_addr).await.unwrap();
    let mut buf = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), app.read_to_end(&mut buf))
        .await
        .expect("denied connection should be closed promptly")
        .unwrap();
    assert_eq!(n, 0);

    assert_eq!(backend.connection_count(), 0);
    assert_eq!(east_policy.request_count(), 0, "remote gateway was consulted");
}

#[tokio::test]
async fn unknown_destination_is_refused() {
    let certs = Arc::new(TestCertificates::generate(&["gw-east", "gw-west"]));

    let east = TestGateway::start(
        "gw-east",
        DataplaneMode::Tcp,
        Arc::new(RecordingPolicy::allow()),
        Arc::clone(&certs),
    )
    .await;
    let west = TestGateway::start(
        "gw-west",
        DataplaneMode::Tcp,
        Arc::new(RecordingPolicy::allow()),
        Arc::clone(&certs),
    )
    .await;

    // Imported on gw-west, but gw-east never exposed it.
    let egress_addr = west.import_from(&east, "phantom").await;

    let mut app = TcpStream::connect(egress_addr).await.unwrap();
    let mut buf = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), app.read_to_end(&mut buf))
        .await
        .expect("refused connection should be closed promptly")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn policy_target_gateway_overrides_the_registered_owner() {
    let certs = Arc::new(TestCertificates::generate(&["gw-east", "gw-west"]));

    let east = TestGateway::start(
        "gw-east",
        DataplaneMode::Tcp,
        Arc::new(RecordingPolicy::allow()),
        Arc::clone(&certs),
    )
    .await;
    // The policy steers the connection to gw-east regardless of who the
    // import says owns the service.
    let west = TestGateway::start(
        "gw-west",
        DataplaneMode::Tcp,
        Arc::new(RecordingPolicy::allow_via("gw-east")),
        Arc::clone(&certs),
    )
    .await;

    let backend = MockService::start().await;
    east.expose("backend", backend.addr(), None);
    let egress_addr = west.import_from(&east, "backend").await;

    // Re-register the import under an owner no peer entry exists for. The
    // registered-owner path would fail the lookup; only the policy's
    // steering can reach gw-east.
    west.store.add_remote(ServiceRecord {
        id: "backend".to_string(),
        ip: "127.0.0.1".to_string(),
        port: 0,
        description: String::new(),
        locality: Locality::Remote,
        gateway: Some("gw-nowhere".to_string()),
    });

    let mut app = TcpStream::connect(egress_addr).await.unwrap();
    app.write_all(b"steered").await.unwrap();
    app.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), app.read_to_end(&mut echoed))
        .await
        .expect("steered relay should complete promptly")
        .unwrap();
    assert_eq!(echoed, b"steered");
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn policy_engine_failure_is_a_denial() {
    let certs = Arc::new(TestCertificates::generate(&["gw-east", "gw-west"]));

    let east = TestGateway::start(
        "gw-east",
        DataplaneMode::Tcp,
        Arc::new(RecordingPolicy::failing()),
        Arc::clone(&certs),
    )
    .await;
    let west = TestGateway::start(
        "gw-west",
        DataplaneMode::Tcp,
        Arc::new(RecordingPolicy::allow()),
        Arc::clone(&certs),
    )
    .await;

    let backend = MockService::start().await;
    east.expose("backend", backend.addr(), None);
    let egress_addr = west.import_from(&east, "backend").await;

    let mut app = TcpStream::connect(egress_addr).await.unwrap();
    let mut buf = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), app.read_to_end(&mut buf))
        .await
        .expect("connection should be refused promptly")
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(backend.connection_count(), 0);
}
