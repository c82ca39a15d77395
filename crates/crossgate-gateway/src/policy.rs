use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;

/// Direction of a connection attempt relative to this gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// A remote gateway asking to reach a local service
    Incoming,
    /// A local workload's connection routed to a remote service
    Outgoing,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Incoming => f.write_str("incoming"),
            Direction::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// One observed connection attempt, built at the moment the attempt is seen
/// and immutable afterwards.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub source: String,
    pub destination: String,
    pub policy_hint: String,
    pub peer_gateway: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Allow,
    Deny,
}

/// Produced exactly once per ConnectionRequest; read-only afterwards.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    /// Suggested target gateway; None means "use the registered default".
    pub target_gateway: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            action: PolicyAction::Allow,
            target_gateway: None,
        }
    }

    pub fn deny() -> Self {
        Self {
            action: PolicyAction::Deny,
            target_gateway: None,
        }
    }

    pub fn is_allow(&self) -> bool {
        self.action == PolicyAction::Allow
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Policy engine unreachable: {0}")]
    Unreachable(String),

    #[error("Policy engine error: {0}")]
    Internal(String),
}

/// The policy collaborator, consulted once per connection attempt.
///
/// Callers treat an `Err` as a denial: if the engine cannot be reached the
/// attempt is refused, never waved through.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn decide(&self, request: &ConnectionRequest) -> Result<PolicyDecision, PolicyError>;
}

/// Config-driven policy: deny-listed sources and destinations, everything
/// else allowed. Wildcard traffic passes unless `deny_wildcard` is set,
/// which makes the "unknown sender" question an explicit rule.
pub struct RulePolicy {
    denied_sources: HashSet<String>,
    denied_destinations: HashSet<String>,
    deny_wildcard: bool,
}

impl RulePolicy {
    pub fn new(
        denied_sources: impl IntoIterator<Item = String>,
        denied_destinations: impl IntoIterator<Item = String>,
        deny_wildcard: bool,
    ) -> Self {
        Self {
            denied_sources: denied_sources.into_iter().collect(),
            denied_destinations: denied_destinations.into_iter().collect(),
            deny_wildcard,
        }
    }

    pub fn allow_all() -> Self {
        Self::new([], [], false)
    }
}

#[async_trait]
impl PolicyEngine for RulePolicy {
    async fn decide(&self, request: &ConnectionRequest) -> Result<PolicyDecision, PolicyError> {
        if self.deny_wildcard && request.source == crossgate_protocol::WILDCARD {
            return Ok(PolicyDecision::deny());
        }
        if self.denied_sources.contains(&request.source)
            || self.denied_destinations.contains(&request.destination)
        {
            return Ok(PolicyDecision::deny());
        }
        Ok(PolicyDecision::allow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(source: &str, destination: &str) -> ConnectionRequest {
        ConnectionRequest {
            source: source.to_string(),
            destination: destination.to_string(),
            policy_hint: "forward".to_string(),
            peer_gateway: "gw-peer".to_string(),
            direction: Direction::Outgoing,
        }
    }

    #[tokio::test]
    async fn allows_by_default() {
        let policy = RulePolicy::allow_all();
        let decision = policy.decide(&request("a", "b")).await.unwrap();
        assert!(decision.is_allow());
    }

    #[tokio::test]
    async fn denies_listed_destination() {
        let policy = RulePolicy::new([], ["secrets".to_string()], false);
        let decision = policy.decide(&request("a", "secrets")).await.unwrap();
        assert_eq!(decision.action, PolicyAction::Deny);
    }

    #[tokio::test]
    async fn wildcard_rule_is_explicit() {
        let open = RulePolicy::allow_all();
        let strict = RulePolicy::new([], [], true);

        let req = request(crossgate_protocol::WILDCARD, "b");
        assert!(open.decide(&req).await.unwrap().is_allow());
        assert_eq!(
            strict.decide(&req).await.unwrap().action,
            PolicyAction::Deny
        );
    }
}
