use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crossgate_protocol::WILDCARD;

/// Where a service runs relative to this gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    Local,
    Remote,
}

/// A service known to the gateway, local or remote
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub description: String,
    pub locality: Locality,
    /// Owning gateway id, set for remote records
    pub gateway: Option<String>,
}

impl ServiceRecord {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// The anonymous record handed to policy when the source workload
    /// cannot be identified.
    pub fn wildcard() -> Self {
        Self {
            id: WILDCARD.to_string(),
            ip: String::new(),
            port: 0,
            description: "unidentified workload".to_string(),
            locality: Locality::Local,
            gateway: None,
        }
    }
}

/// Collaborator that maps a source IP to its workload label.
///
/// Kubernetes label lookups live behind this trait; the gateway only
/// consumes the answer.
#[async_trait]
pub trait SourceIdentifier: Send + Sync {
    async fn workload_label(&self, ip: &str) -> Option<String>;
}

/// Identifier that knows nothing. Every lookup falls through to the IP
/// match and then to the wildcard identity.
pub struct NoWorkloadInfo;

#[async_trait]
impl SourceIdentifier for NoWorkloadInfo {
    async fn workload_label(&self, _ip: &str) -> Option<String> {
        None
    }
}

/// The gateway's service and peer directory.
///
/// Read-mostly: connection handlers perform concurrent lookups; mutation
/// happens only on the admin path. DashMap keeps readers lock-free with
/// respect to each other.
pub struct ServiceDirectory {
    /// Local service id -> record
    local: DashMap<String, ServiceRecord>,
    /// Remote (imported) service id -> record
    remote: DashMap<String, ServiceRecord>,
    /// Workload label -> local service id
    labels: DashMap<String, String>,
    /// Peer gateway id -> published address
    peers: DashMap<String, String>,
    /// Imported service id -> stop signal for its accept loop
    stops: DashMap<String, CancellationToken>,
}

impl ServiceDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            local: DashMap::new(),
            remote: DashMap::new(),
            labels: DashMap::new(),
            peers: DashMap::new(),
            stops: DashMap::new(),
        })
    }

    pub fn add_local(&self, record: ServiceRecord, label: Option<String>) {
        if let Some(label) = label {
            self.labels.insert(label, record.id.clone());
        }
        self.local.insert(record.id.clone(), record);
    }

    pub fn add_remote(&self, record: ServiceRecord) {
        self.remote.insert(record.id.clone(), record);
    }

    pub fn add_peer(&self, gateway_id: String, address: String) {
        self.peers.insert(gateway_id, address);
    }

    pub fn local_service(&self, id: &str) -> Option<ServiceRecord> {
        self.local.get(id).map(|r| r.clone())
    }

    pub fn remote_service(&self, id: &str) -> Option<ServiceRecord> {
        self.remote.get(id).map(|r| r.clone())
    }

    /// Published address of a peer gateway.
    pub fn gateway_target(&self, gateway_id: &str) -> Option<String> {
        self.peers.get(gateway_id).map(|a| a.clone())
    }

    /// Identify the local service behind an accepted connection.
    ///
    /// Lookup order: workload label, then source IP, then the wildcard
    /// identity. The wildcard is a real answer here; whether wildcard
    /// traffic may proceed is the policy engine's call, not ours.
    pub async fn lookup_source(
        &self,
        identifier: &dyn SourceIdentifier,
        source_ip: &str,
    ) -> ServiceRecord {
        if let Some(label) = identifier.workload_label(source_ip).await {
            if let Some(id) = self.labels.get(&label) {
                if let Some(record) = self.local.get(id.value()) {
                    return record.clone();
                }
            }
        }

        if let Some(record) = self.local.iter().find(|r| r.ip == source_ip) {
            return record.clone();
        }

        tracing::debug!(
            "No local service for source {}, falling back to wildcard identity",
            source_ip
        );
        ServiceRecord::wildcard()
    }

    /// Stop token for an imported service's accept loop. Created on first
    /// use; cancelling it stops accepting without touching in-flight
    /// sessions.
    pub fn stop_token(&self, service_id: &str) -> CancellationToken {
        self.stops
            .entry(service_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    pub fn stop_service(&self, service_id: &str) {
        if let Some((_, token)) = self.stops.remove(service_id) {
            token.cancel();
        }
    }
}
