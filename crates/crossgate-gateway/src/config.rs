//! Gateway configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (CROSSGATE_*)
//! 2. Config file (gateway.toml)
//! 3. Default values (where applicable)

use std::collections::HashMap;
use std::env;
use std::path::Path;

use serde::Deserialize;

/// Environment variable prefix
const ENV_PREFIX: &str = "CROSSGATE";

/// Which dataplane strategy this gateway offers and uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataplaneMode {
    Tcp,
    Mtls,
}

impl std::fmt::Display for DataplaneMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataplaneMode::Tcp => write!(f, "tcp"),
            DataplaneMode::Mtls => write!(f, "mtls"),
        }
    }
}

impl std::str::FromStr for DataplaneMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(DataplaneMode::Tcp),
            "mtls" => Ok(DataplaneMode::Mtls),
            other => Err(format!("Unknown dataplane mode: {}", other)),
        }
    }
}

/// A service this gateway exposes to its peers.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalServiceConfig {
    pub id: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub description: String,
    /// Workload label for source attribution, if the service has one.
    pub label: Option<String>,
}

/// A remote service imported from a peer gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    pub id: String,
    /// Gateway that owns the service.
    pub gateway: String,
    /// Local port applications connect to.
    pub listen_port: u16,
}

/// Static deny rules for the built-in policy engine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub deny_sources: Vec<String>,
    pub deny_destinations: Vec<String>,
    /// Deny connections whose source could not be attributed.
    pub deny_wildcard: bool,
}

/// Gateway configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Name this gateway is known by to its peers
    pub identity: Option<String>,

    /// Published port peers connect to (SNI-routed)
    pub listen_port: Option<u16>,

    /// Internal control plane port
    pub control_port: Option<u16>,

    /// Internal data plane port
    pub data_port: Option<u16>,

    /// Dataplane strategy: "tcp" or "mtls"
    pub dataplane: Option<DataplaneMode>,

    /// Gateway certificate (file path)
    #[serde(alias = "cert")]
    pub cert_file: Option<String>,

    /// Gateway private key (file path)
    #[serde(alias = "key")]
    pub key_file: Option<String>,

    /// Fabric CA certificate (file path)
    #[serde(alias = "ca_cert")]
    pub ca_file: Option<String>,

    /// Peer gateway id -> published address
    pub peers: Option<HashMap<String, String>>,

    /// Services exposed by this gateway
    pub local_services: Option<Vec<LocalServiceConfig>>,

    /// Services imported from peers
    pub imports: Option<Vec<ImportConfig>>,

    /// Static policy rules
    pub policy: Option<PolicyConfig>,
}

/// Resolved gateway configuration with certificate material loaded
#[derive(Debug)]
pub struct ResolvedGatewayConfig {
    pub identity: String,
    pub listen_port: u16,
    pub control_port: u16,
    pub data_port: u16,
    pub dataplane: DataplaneMode,
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: String,
    pub peers: HashMap<String, String>,
    pub local_services: Vec<LocalServiceConfig>,
    pub imports: Vec<ImportConfig>,
    pub policy: PolicyConfig,
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

/// Get environment variable as u16
fn get_env_u16(name: &str) -> Option<u16> {
    get_env(name).and_then(|v| v.parse().ok())
}

impl GatewayConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> Self {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path, e);
                }
            }
        }
        Self::default()
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedGatewayConfig> {
        // Identity: ENV > config > required
        let identity = get_env("IDENTITY").or(self.identity).ok_or_else(|| {
            anyhow::anyhow!("Gateway identity required. Set CROSSGATE_IDENTITY or identity in config")
        })?;

        // Ports: ENV > config > defaults
        let listen_port = get_env_u16("LISTEN_PORT").or(self.listen_port).unwrap_or(8443);
        let control_port = get_env_u16("CONTROL_PORT")
            .or(self.control_port)
            .unwrap_or(9443);
        let data_port = get_env_u16("DATA_PORT").or(self.data_port).unwrap_or(9444);

        // Dataplane: ENV > config > default mtls
        let dataplane = match get_env("DATAPLANE") {
            Some(v) => v.parse().map_err(|e| anyhow::anyhow!("{}", e))?,
            None => self.dataplane.unwrap_or(DataplaneMode::Mtls),
        };

        // Certificate material: ENV file path > config file path > required
        let cert_file = get_env("CERT_FILE").or(self.cert_file).ok_or_else(|| {
            anyhow::anyhow!("Certificate required. Set CROSSGATE_CERT_FILE or cert_file in config")
        })?;
        let key_file = get_env("KEY_FILE").or(self.key_file).ok_or_else(|| {
            anyhow::anyhow!("Private key required. Set CROSSGATE_KEY_FILE or key_file in config")
        })?;
        let ca_file = get_env("CA_FILE").or(self.ca_file).ok_or_else(|| {
            anyhow::anyhow!("CA certificate required. Set CROSSGATE_CA_FILE or ca_file in config")
        })?;

        let cert_pem = std::fs::read_to_string(&cert_file)
            .map_err(|e| anyhow::anyhow!("Failed to read certificate {}: {}", cert_file, e))?;
        let key_pem = std::fs::read_to_string(&key_file)
            .map_err(|e| anyhow::anyhow!("Failed to read private key {}: {}", key_file, e))?;
        let ca_pem = std::fs::read_to_string(&ca_file)
            .map_err(|e| anyhow::anyhow!("Failed to read CA certificate {}: {}", ca_file, e))?;

        Ok(ResolvedGatewayConfig {
            identity,
            listen_port,
            control_port,
            data_port,
            dataplane,
            cert_pem,
            key_pem,
            ca_pem,
            peers: self.peers.unwrap_or_default(),
            local_services: self.local_services.unwrap_or_default(),
            imports: self.imports.unwrap_or_default(),
            policy: self.policy.unwrap_or_default(),
        })
    }

    /// Load and resolve in one step
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedGatewayConfig> {
        Self::load(path).resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let toml = r#"
            identity = "gw-east"
            listen_port = 8443
            dataplane = "tcp"
            cert_file = "certs/gw-east.pem"
            key_file = "certs/gw-east.key"
            ca_file = "certs/ca.pem"

            [peers]
            gw-west = "west.example.com:8443"

            [[local_services]]
            id = "backend"
            ip = "10.0.0.5"
            port = 8080
            label = "app=backend"

            [[imports]]
            id = "frontend"
            gateway = "gw-west"
            listen_port = 3000

            [policy]
            deny_sources = ["batch-job"]
            deny_wildcard = true
        "#;

        let config: GatewayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.identity.as_deref(), Some("gw-east"));
        assert_eq!(config.dataplane, Some(DataplaneMode::Tcp));
        assert_eq!(config.peers.as_ref().unwrap()["gw-west"], "west.example.com:8443");
        assert_eq!(config.local_services.as_ref().unwrap()[0].id, "backend");
        assert_eq!(config.imports.as_ref().unwrap()[0].listen_port, 3000);
        let policy = config.policy.unwrap();
        assert_eq!(policy.deny_sources, vec!["batch-job"]);
        assert!(policy.deny_wildcard);
        assert!(policy.deny_destinations.is_empty());
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!("quic".parse::<DataplaneMode>().is_err());
        assert_eq!("mtls".parse::<DataplaneMode>().unwrap(), DataplaneMode::Mtls);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = GatewayConfig::load("/nonexistent/gateway.toml");
        assert!(config.identity.is_none());
        assert!(config.peers.is_none());
    }
}
