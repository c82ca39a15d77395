//! End-to-end test utilities for the Crossgate gateway
//!
//! Test harnesses for running full gateways against each other on
//! ephemeral ports, with a generated PKI, recording policy engines, and
//! mock workload services.

pub mod certificates;
pub mod harness;
pub mod mock_policy;
pub mod mock_service;

pub use certificates::TestCertificates;
pub use harness::TestGateway;
pub use mock_policy::RecordingPolicy;
pub use mock_service::{MockService, RecordedConnection, ServiceMode};
