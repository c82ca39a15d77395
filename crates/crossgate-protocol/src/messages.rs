use serde::{Deserialize, Serialize};

/// Forwarding strategy negotiated between two gateways
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectType {
    /// Plain TCP relay over the hijacked control-plane connection
    Tcp,
    /// Mutually authenticated TLS tunnel via a rendezvous endpoint
    Mtls,
}

impl ConnectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectType::Tcp => "tcp",
            ConnectType::Mtls => "mtls",
        }
    }
}

impl std::fmt::Display for ConnectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a `POST /connect` control-plane request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    /// Source service id at the requesting gateway
    pub id: String,
    /// Destination service id, expected to be local to the receiving gateway
    pub id_dest: String,
    /// Policy hint carried with the request
    pub policy: String,
    /// Identity of the requesting gateway
    pub gateway_id: String,
}

/// Body of a `POST /connect` reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectReply {
    /// Whether the connection attempt was accepted
    pub connected: bool,
    /// Negotiated relay mode: "forward" for the plain TCP relay on the
    /// already-open socket, "mtls" for a tunnel rendezvous
    pub connect_type: String,
    /// Where the caller should go next: "open-socket" to keep using the
    /// connection it already holds, or the rendezvous endpoint label
    pub connect_destination: String,
}

impl ConnectReply {
    /// Relay mode name used in TCP-mode replies.
    pub const FORWARD: &'static str = "forward";
    /// Destination marker telling the caller the reply socket is the pipe.
    pub const OPEN_SOCKET: &'static str = "open-socket";

    pub fn refused() -> Self {
        Self {
            connected: false,
            connect_type: String::new(),
            connect_destination: String::new(),
        }
    }

    pub fn forward() -> Self {
        Self {
            connected: true,
            connect_type: Self::FORWARD.to_string(),
            connect_destination: Self::OPEN_SOCKET.to_string(),
        }
    }

    pub fn mtls(endpoint: String) -> Self {
        Self {
            connected: true,
            connect_type: ConnectType::Mtls.as_str().to_string(),
            connect_destination: endpoint,
        }
    }
}

/// Rendezvous frames exchanged on a freshly established data-plane mTLS
/// connection, before raw forwarding begins
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataPlaneMessage {
    /// Request to attach this connection to a waiting rendezvous endpoint
    Attach {
        /// Endpoint label from the connect reply
        endpoint: String,
    },

    /// The endpoint matched; the stream is now a raw pipe
    Attached,

    /// No such endpoint (expired, already consumed, or never allocated)
    Refused {
        /// Reason for refusal
        reason: String,
    },
}
