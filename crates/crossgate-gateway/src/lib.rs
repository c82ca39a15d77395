//! Crossgate gateway library
//!
//! The data plane of a multi-cluster connectivity gateway: SNI-routed front
//! door, policy-gated connection arbitration, and plain-TCP or mutually
//! authenticated TLS forwarding between a local service and a peer gateway.
//! Usable as a library to embed a gateway in other binaries or tests.

mod config;
mod control_plane;
mod data_plane;
mod egress;
mod error;
mod forwarder;
mod http1;
mod mtls_forwarder;
mod policy;
mod sni_router;
mod store;
mod tcp_forwarder;

pub use config::{DataplaneMode, GatewayConfig, ImportConfig, LocalServiceConfig, PolicyConfig, ResolvedGatewayConfig};
pub use control_plane::ControlPlane;
pub use data_plane::{initiate_egress, new_rendezvous_registry, DataPlane, RendezvousRegistry};
pub use egress::{connect_request, EgressService};
pub use error::GatewayError;
pub use forwarder::{ForwardingSession, SessionStats, SessionTracker};
pub use mtls_forwarder::MtlsForwarder;
pub use policy::{
    ConnectionRequest, Direction, PolicyAction, PolicyDecision, PolicyEngine, PolicyError,
    RulePolicy,
};
pub use sni_router::SniRouter;
pub use store::{
    Locality, NoWorkloadInfo, ServiceDirectory, ServiceRecord, SourceIdentifier,
};
pub use tcp_forwarder::{Endpoint, TcpForwarder};
