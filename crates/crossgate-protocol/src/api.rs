//! Names, paths and identifiers shared by the control and data planes.

use uuid::Uuid;

/// Control-plane path for connection establishment requests.
pub const CONNECT_PATH: &str = "/connect";

/// Data-plane path for ingress authorization requests.
pub const INGRESS_AUTH_PATH: &str = "/authz";

/// Request header carrying the bearer token on ingress authorization.
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Response header naming the authorized target on ingress authorization.
pub const TARGET_CLUSTER_HEADER: &str = "target-cluster";

/// Service identity used when the originating workload cannot be resolved.
/// The policy engine decides whether wildcard traffic is permitted.
pub const WILDCARD: &str = "*";

/// Suffix appended to a gateway identity to form its data-plane server name.
pub const DATAPLANE_NAME_SUFFIX: &str = "-dataplane";

/// Substituted for wildcard markers inside connection ids so the id stays
/// safe as a log and metric key.
const WILDCARD_TOKEN: &str = "wildcard";

/// Derive the correlation id for a (source, destination) pair.
///
/// Deterministic: the same pair always yields the same id. Not unique across
/// concurrent attempts for the same pair; the mTLS rendezvous label adds a
/// per-attempt nonce where uniqueness matters.
pub fn connection_id(source: &str, destination: &str) -> String {
    format!("{}:{}", source, destination).replace(WILDCARD, WILDCARD_TOKEN)
}

/// Allocate a fresh rendezvous label for one mTLS connection attempt.
/// Never reused; lifetime is the single attempt.
pub fn remote_endpoint(conn_id: &str) -> String {
    format!("{}-{}", conn_id, Uuid::new_v4().simple())
}

/// The SNI name that routes to a gateway's data plane.
///
/// The gateway's bare identity routes to its control plane; this derived
/// name shares the same published port but reaches the mutually
/// authenticated data-plane listener.
pub fn dataplane_server_name(identity: &str) -> String {
    format!("{}{}", identity, DATAPLANE_NAME_SUFFIX)
}
