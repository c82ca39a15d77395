//! Mock TCP service for E2E tests
//!
//! A stand-in for a cluster workload behind a gateway: echoes data back or
//! sends a fixed response, and records every connection so tests can assert
//! whether the service was actually reached.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Behavior mode for the mock service
#[derive(Clone, Debug)]
pub enum ServiceMode {
    /// Echo back all received data
    Echo,
    /// Send a fixed response as soon as a connection arrives, then close
    FixedResponse(Vec<u8>),
}

/// A recorded connection
#[derive(Clone, Debug)]
pub struct RecordedConnection {
    /// All data received on this connection
    pub received_data: Vec<u8>,
    /// Peer address
    pub peer_addr: SocketAddr,
}

pub struct MockService {
    addr: SocketAddr,
    connections: Arc<RwLock<Vec<RecordedConnection>>>,
    stop: CancellationToken,
}

impl MockService {
    /// Start an echoing mock service on an ephemeral port
    pub async fn start() -> Self {
        Self::start_with_mode(ServiceMode::Echo).await
    }

    pub async fn start_with_mode(mode: ServiceMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock service");
        let addr = listener.local_addr().unwrap();

        let connections: Arc<RwLock<Vec<RecordedConnection>>> = Arc::new(RwLock::new(Vec::new()));
        let stop = CancellationToken::new();

        let accept_connections = Arc::clone(&connections);
        let accept_stop = stop.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_stop.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let Ok((mut conn, peer_addr)) = accepted else {
                    break;
                };
                let connections = Arc::clone(&accept_connections);
                let mode = mode.clone();
                tokio::spawn(async move {
                    let index = {
                        let mut guard = connections.write();
                        guard.push(RecordedConnection {
                            received_data: Vec::new(),
                            peer_addr,
                        });
                        guard.len() - 1
                    };

                    if let ServiceMode::FixedResponse(response) = &mode {
                        let _ = conn.write_all(response).await;
                        let _ = conn.shutdown().await;
                        return;
                    }

                    let mut buf = vec![0u8; 4096];
                    loop {
                        match conn.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                connections.write()[index]
                                    .received_data
                                    .extend_from_slice(&buf[..n]);
                                if conn.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    let _ = conn.shutdown().await;
                });
            }
        });

        Self {
            addr,
            connections,
            stop,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn connections(&self) -> Vec<RecordedConnection> {
        self.connections.read().clone()
    }
}

impl Drop for MockService {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
