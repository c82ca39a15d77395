use thiserror::Error;

/// Per-connection failure taxonomy.
///
/// Every variant is contained to the connection attempt that produced it:
/// accept loops log and continue, owned sockets are closed, nothing is
/// retried automatically.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Policy refused the attempt. A decision, not a failure; handled as a
    /// clean rejection and never retried.
    #[error("Connection denied by policy")]
    PolicyDenied,

    /// Unknown local service or unresolved identity.
    #[error("Lookup failed: {0}")]
    Lookup(String),

    /// The connection cannot be repurposed as a raw pipe.
    #[error("Transport does not support hijacking: {0}")]
    TransportCapability(String),

    /// Peer or destination unreachable.
    #[error("Dial failed: {0}")]
    Dial(#[source] std::io::Error),

    /// TLS handshake or certificate validation failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Malformed control message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crossgate_protocol::CodecError> for GatewayError {
    fn from(e: crossgate_protocol::CodecError) -> Self {
        GatewayError::Protocol(e.to_string())
    }
}
