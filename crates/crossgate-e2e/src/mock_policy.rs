//! Recording policy engine for E2E tests
//!
//! Wraps a fixed verdict and records every connection request it was asked
//! about, so tests can assert both the outcome and that arbitration
//! actually happened (or did not).

use async_trait::async_trait;
use parking_lot::RwLock;

use crossgate_gateway::{ConnectionRequest, PolicyDecision, PolicyEngine, PolicyError};

enum Verdict {
    Allow,
    Deny,
    /// Simulate an unreachable policy engine
    Fail,
}

pub struct RecordingPolicy {
    verdict: Verdict,
    /// Gateway override attached to allow decisions, if any
    target_gateway: Option<String>,
    requests: RwLock<Vec<ConnectionRequest>>,
}

impl RecordingPolicy {
    pub fn allow() -> Self {
        Self::new(Verdict::Allow)
    }

    pub fn deny() -> Self {
        Self::new(Verdict::Deny)
    }

    pub fn failing() -> Self {
        Self::new(Verdict::Fail)
    }

    pub fn allow_via(target_gateway: impl Into<String>) -> Self {
        let mut policy = Self::new(Verdict::Allow);
        policy.target_gateway = Some(target_gateway.into());
        policy
    }

    fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            target_gateway: None,
            requests: RwLock::new(Vec::new()),
        }
    }

    /// All requests arbitrated so far
    pub fn requests(&self) -> Vec<ConnectionRequest> {
        self.requests.read().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.read().len()
    }
}

#[async_trait]
impl PolicyEngine for RecordingPolicy {
    async fn decide(&self, request: &ConnectionRequest) -> Result<PolicyDecision, PolicyError> {
        self.requests.write().push(request.clone());
        match self.verdict {
            Verdict::Allow => {
                let mut decision = PolicyDecision::allow();
                decision.target_gateway = self.target_gateway.clone();
                Ok(decision)
            }
            Verdict::Deny => Ok(PolicyDecision::deny()),
            Verdict::Fail => Err(PolicyError::Unreachable("policy engine down".to_string())),
        }
    }
}
