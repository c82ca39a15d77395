//! Bidirectional byte forwarding between two established connections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crossgate_protocol::ConnectType;

const COPY_BUF_SIZE: usize = 8192;

/// Bytes moved by a completed session, one counter per direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Listener side -> peer side
    pub to_peer: u64,
    /// Peer side -> listener side
    pub from_peer: u64,
}

/// Session accounting shared by everything that spawns forwarders.
///
/// Callers spawn sessions as supervised tasks and record the outcome here,
/// so started and finished counts must always converge; a growing gap is a
/// leaked session.
#[derive(Debug, Default)]
pub struct SessionTracker {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl SessionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn session_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_finished<E>(&self, result: &Result<SessionStats, E>) {
        match result {
            Ok(_) => self.completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.started() - self.completed() - self.failed()
    }
}

/// A raw, byte-transparent pipe between one listener-side and one peer-side
/// connection.
///
/// Owns both connections for the lifetime of one accepted socket. Copies
/// concurrently in both directions; on EOF or error in one direction the
/// peer's write half is flushed and shut down so it can finish draining the
/// other way, and the session closes once both directions are done. Errors
/// terminate a direction immediately and are never retried here; retry is
/// the caller's call on the next attempt.
pub struct ForwardingSession {
    conn_id: String,
    strategy: ConnectType,
}

impl ForwardingSession {
    pub fn new(conn_id: impl Into<String>, strategy: ConnectType) -> Self {
        Self {
            conn_id: conn_id.into(),
            strategy,
        }
    }

    /// Run the pipe to completion. Returns per-direction byte counts, or
    /// the first I/O error observed in either direction.
    pub async fn run<A, B>(
        self,
        listener_conn: A,
        peer_conn: B,
    ) -> Result<SessionStats, std::io::Error>
    where
        A: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::info!(
            "Session {} started ({} strategy)",
            self.conn_id,
            self.strategy
        );

        let (mut listener_read, mut listener_write) = tokio::io::split(listener_conn);
        let (mut peer_read, mut peer_write) = tokio::io::split(peer_conn);

        let to_peer = copy_direction(&self.conn_id, "out", &mut listener_read, &mut peer_write);
        let from_peer = copy_direction(&self.conn_id, "in", &mut peer_read, &mut listener_write);

        // join, not try_join: a failed direction must not cancel the peer
        // before its half-close has propagated.
        let (to_peer, from_peer) = tokio::join!(to_peer, from_peer);

        match (to_peer, from_peer) {
            (Ok(to_peer), Ok(from_peer)) => {
                let stats = SessionStats { to_peer, from_peer };
                tracing::info!(
                    "Session {} closed: {} bytes out, {} bytes in",
                    self.conn_id,
                    stats.to_peer,
                    stats.from_peer
                );
                Ok(stats)
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::info!("Session {} closed with error: {}", self.conn_id, e);
                Err(e)
            }
        }
    }
}

/// Copy one direction until EOF or error, then propagate half-close.
///
/// Pending writes are flushed before shutdown so bytes already submitted
/// are delivered ahead of the peer observing end-of-stream.
async fn copy_direction<R, W>(
    conn_id: &str,
    direction: &str,
    read: &mut R,
    write: &mut W,
) -> Result<u64, std::io::Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total: u64 = 0;

    let result = loop {
        match read.read(&mut buf).await {
            Ok(0) => break Ok(total),
            Ok(n) => {
                if let Err(e) = write.write_all(&buf[..n]).await {
                    tracing::debug!("Session {} {} write error: {}", conn_id, direction, e);
                    break Err(e);
                }
                total += n as u64;
            }
            Err(e) => {
                tracing::debug!("Session {} {} read error: {}", conn_id, direction, e);
                break Err(e);
            }
        }
    };

    let _ = write.flush().await;
    let _ = write.shutdown().await;
    result
}
