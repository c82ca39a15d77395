use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use crate::TransportError;

/// TLS material for one gateway: its certificate chain, private key and the
/// root CA used to authenticate peers.
///
/// The same material serves every role the gateway plays: mutually
/// authenticated data-plane tunnels, server-auth-only control-plane HTTPS
/// and outbound client connections.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    cert_pem: String,
    key_pem: String,
    ca_pem: String,
}

impl TlsMaterial {
    pub fn new(cert_pem: String, key_pem: String, ca_pem: String) -> Self {
        Self {
            cert_pem,
            key_pem,
            ca_pem,
        }
    }

    /// Read certificate, key and CA PEM files from disk.
    pub fn from_files(
        cert_path: &Path,
        key_path: &Path,
        ca_path: &Path,
    ) -> Result<Self, TransportError> {
        let read = |path: &Path| {
            std::fs::read_to_string(path).map_err(|e| {
                TransportError::Certificate(format!("Failed to read {:?}: {}", path, e))
            })
        };
        Ok(Self::new(read(cert_path)?, read(key_path)?, read(ca_path)?))
    }

    fn certs(&self) -> Result<Vec<CertificateDer<'static>>, TransportError> {
        parse_certs(&self.cert_pem)
    }

    fn key(&self) -> Result<PrivateKeyDer<'static>, TransportError> {
        let mut cursor = Cursor::new(self.key_pem.as_bytes());
        private_key(&mut cursor)
            .map_err(|e| TransportError::Certificate(format!("Failed to parse private key: {}", e)))?
            .ok_or_else(|| TransportError::Certificate("No private key found in PEM".to_string()))
    }

    fn root_store(&self) -> Result<RootCertStore, TransportError> {
        let mut root_store = RootCertStore::empty();
        for cert in parse_certs(&self.ca_pem)? {
            root_store.add(cert).map_err(|e| {
                TransportError::Certificate(format!("Failed to add CA certificate: {}", e))
            })?;
        }
        Ok(root_store)
    }

    /// Server config requiring a client certificate signed by the root CA.
    /// Used by the data plane (mutual authentication between gateways).
    pub fn server_config_mutual(&self) -> Result<ServerConfig, TransportError> {
        let client_verifier = WebPkiClientVerifier::builder(Arc::new(self.root_store()?))
            .build()
            .map_err(|e| TransportError::Tls(format!("Failed to build client verifier: {}", e)))?;

        ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(self.certs()?, self.key()?)
            .map_err(|e| TransportError::Tls(format!("Failed to build server config: {}", e)))
    }

    /// Server config without client authentication. Used by the control
    /// plane, which authenticates callers at the request level instead.
    pub fn server_config(&self) -> Result<ServerConfig, TransportError> {
        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.certs()?, self.key()?)
            .map_err(|e| TransportError::Tls(format!("Failed to build server config: {}", e)))
    }

    /// Client config presenting this gateway's certificate. Used to dial a
    /// peer gateway's data plane.
    pub fn client_config_mutual(&self) -> Result<ClientConfig, TransportError> {
        ClientConfig::builder()
            .with_root_certificates(self.root_store()?)
            .with_client_auth_cert(self.certs()?, self.key()?)
            .map_err(|e| TransportError::Tls(format!("Failed to build client config: {}", e)))
    }

    /// Client config verifying the peer against the root CA only. Used to
    /// dial a peer gateway's control plane.
    pub fn client_config(&self) -> Result<ClientConfig, TransportError> {
        Ok(ClientConfig::builder()
            .with_root_certificates(self.root_store()?)
            .with_no_client_auth())
    }

    /// The root CA PEM, for HTTP clients that need to trust peer gateways.
    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }
}

/// Parse all certificates from PEM content.
fn parse_certs(pem_content: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Certificate(format!("Failed to parse certificates: {}", e)))
}
