//! SNI-based front router.
//!
//! The published port multiplexes the control and data planes behind one
//! address. The router captures the TLS ClientHello without terminating
//! TLS, reads the server name, and relays the whole connection (captured
//! bytes first) to the matching internal listener. Unknown or absent
//! names are dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crossgate_protocol::ConnectType;

use crate::error::GatewayError;
use crate::forwarder::ForwardingSession;

/// A ClientHello that has not arrived within this window is not coming.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS record header is 5 bytes: type, version, length.
const RECORD_HEADER_LEN: usize = 5;
const RECORD_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const MAX_RECORD_LEN: usize = 16 * 1024 + 2048;

pub struct SniRouter {
    /// Exact server name -> internal listener address.
    routes: HashMap<String, String>,
}

impl SniRouter {
    pub fn new(routes: HashMap<String, String>) -> Arc<Self> {
        Arc::new(Self { routes })
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        tracing::info!(
            "SNI router listening on {} with {} route(s)",
            listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            self.routes.len()
        );
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let router = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = router.handle_connection(stream).await {
                    tracing::warn!("Routing connection from {} failed: {}", peer_addr, e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream) -> Result<(), GatewayError> {
        let (record, server_name) =
            tokio::time::timeout(HELLO_TIMEOUT, read_client_hello(&mut stream))
                .await
                .map_err(|_| {
                    GatewayError::Protocol("ClientHello did not arrive in time".to_string())
                })??;

        let Some(upstream_addr) = self.routes.get(&server_name) else {
            tracing::warn!("No route for server name {:?}, dropping connection", server_name);
            return Ok(());
        };

        let mut upstream = TcpStream::connect(upstream_addr)
            .await
            .map_err(GatewayError::Dial)?;
        // Replay the captured hello so the upstream sees a pristine
        // handshake.
        upstream.write_all(&record).await?;

        ForwardingSession::new(format!("sni:{}", server_name), ConnectType::Tcp)
            .run(stream, upstream)
            .await
            .map_err(GatewayError::Io)?;
        Ok(())
    }
}

/// Read exactly one TLS record and extract the SNI server name from the
/// ClientHello it carries. Returns the raw record bytes for replay.
async fn read_client_hello(stream: &mut TcpStream) -> Result<(Vec<u8>, String), GatewayError> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    stream.read_exact(&mut header).await?;

    if header[0] != RECORD_TYPE_HANDSHAKE {
        return Err(GatewayError::Protocol(format!(
            "Not a TLS handshake record (type {:#04x})",
            header[0]
        )));
    }
    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if record_len == 0 || record_len > MAX_RECORD_LEN {
        return Err(GatewayError::Protocol(format!(
            "Implausible TLS record length {}",
            record_len
        )));
    }

    let mut record = vec![0u8; RECORD_HEADER_LEN + record_len];
    record[..RECORD_HEADER_LEN].copy_from_slice(&header);
    stream.read_exact(&mut record[RECORD_HEADER_LEN..]).await?;

    let server_name = extract_sni(&record[RECORD_HEADER_LEN..])?;
    Ok((record, server_name))
}

/// Cursor over handshake bytes with bounds-checked reads.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, GatewayError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| GatewayError::Protocol("Truncated ClientHello".to_string()))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, GatewayError> {
        let hi = self.u8()?;
        let lo = self.u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn skip(&mut self, n: usize) -> Result<(), GatewayError> {
        if self.pos + n > self.buf.len() {
            return Err(GatewayError::Protocol("Truncated ClientHello".to_string()));
        }
        self.pos += n;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], GatewayError> {
        if self.pos + n > self.buf.len() {
            return Err(GatewayError::Protocol("Truncated ClientHello".to_string()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

/// Walk the ClientHello body (record payload, without the 5-byte record
/// header) to the server_name extension.
fn extract_sni(hello: &[u8]) -> Result<String, GatewayError> {
    let mut r = Reader::new(hello);

    if r.u8()? != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(GatewayError::Protocol(
            "Handshake message is not a ClientHello".to_string(),
        ));
    }
    r.skip(3)?; // handshake length
    r.skip(2)?; // client version
    r.skip(32)?; // random

    let session_id_len = r.u8()? as usize;
    r.skip(session_id_len)?;

    let cipher_suites_len = r.u16()? as usize;
    r.skip(cipher_suites_len)?;

    let compression_len = r.u8()? as usize;
    r.skip(compression_len)?;

    let extensions_len = r.u16()? as usize;
    let extensions = r.take(extensions_len)?;

    let mut r = Reader::new(extensions);
    while r.pos < extensions.len() {
        let ext_type = r.u16()?;
        let ext_len = r.u16()? as usize;
        if ext_type != 0x0000 {
            r.skip(ext_len)?;
            continue;
        }
        // server_name extension: list length, then entries of
        // (type, length, name).
        let mut names = Reader::new(r.take(ext_len)?);
        let _list_len = names.u16()?;
        let name_type = names.u8()?;
        if name_type != 0x00 {
            return Err(GatewayError::Protocol(format!(
                "Unsupported server name type {}",
                name_type
            )));
        }
        let name_len = names.u16()? as usize;
        let name = names.take(name_len)?;
        return String::from_utf8(name.to_vec())
            .map_err(|_| GatewayError::Protocol("Server name is not UTF-8".to_string()));
    }

    Err(GatewayError::Protocol(
        "ClientHello carries no server name".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal TLS 1.2 ClientHello carrying a single SNI entry. Layout
    /// mirrors what rustls sends, trimmed to the fields the parser walks.
    fn build_client_hello(server_name: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(name) = server_name {
            let name_bytes = name.as_bytes();
            let mut ext = Vec::new();
            ext.extend_from_slice(&((name_bytes.len() + 3) as u16).to_be_bytes()); // list len
            ext.push(0x00); // host_name
            ext.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
            ext.extend_from_slice(name_bytes);

            extensions.extend_from_slice(&0x0000u16.to_be_bytes()); // server_name
            extensions.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&ext);
        }
        // A second, unrelated extension the parser must step over.
        extensions.extend_from_slice(&0x000au16.to_be_bytes()); // supported_groups
        extensions.extend_from_slice(&4u16.to_be_bytes());
        extensions.extend_from_slice(&[0x00, 0x02, 0x00, 0x17]);

        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x03, 0x03]); // version
        hello.extend_from_slice(&[0u8; 32]); // random
        hello.push(0); // session id
        hello.extend_from_slice(&2u16.to_be_bytes()); // cipher suites
        hello.extend_from_slice(&[0x13, 0x01]);
        hello.push(1); // compression methods
        hello.push(0x00);
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);

        let mut handshake = vec![HANDSHAKE_TYPE_CLIENT_HELLO];
        let len = hello.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]); // 24-bit length
        handshake.extend_from_slice(&hello);
        handshake
    }

    #[test]
    fn extracts_server_name() {
        let hello = build_client_hello(Some("gw-east-dataplane"));
        assert_eq!(extract_sni(&hello).unwrap(), "gw-east-dataplane");
    }

    #[test]
    fn missing_sni_is_an_error() {
        let hello = build_client_hello(None);
        assert!(extract_sni(&hello).is_err());
    }

    #[test]
    fn truncated_hello_is_an_error() {
        let mut hello = build_client_hello(Some("gw-east"));
        hello.truncate(hello.len() / 2);
        assert!(extract_sni(&hello).is_err());
    }

    #[tokio::test]
    async fn routes_by_server_name_and_replays_the_hello() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let mut routes = HashMap::new();
        routes.insert("gw-east".to_string(), upstream_addr.to_string());
        let router_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let router_addr = router_listener.local_addr().unwrap();
        tokio::spawn(SniRouter::new(routes).run(router_listener));

        let handshake = build_client_hello(Some("gw-east"));
        let mut record = vec![RECORD_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);

        let mut client = TcpStream::connect(router_addr).await.unwrap();
        client.write_all(&record).await.unwrap();

        let (mut accepted, _) = upstream.accept().await.unwrap();
        let mut replayed = vec![0u8; record.len()];
        accepted.read_exact(&mut replayed).await.unwrap();
        assert_eq!(replayed, record);

        // The pipe stays transparent past the hello.
        client.write_all(b"post-hello").await.unwrap();
        let mut rest = [0u8; 10];
        accepted.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"post-hello");
    }

    #[tokio::test]
    async fn unknown_server_name_is_dropped() {
        let router_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let router_addr = router_listener.local_addr().unwrap();
        tokio::spawn(SniRouter::new(HashMap::new()).run(router_listener));

        let handshake = build_client_hello(Some("nobody"));
        let mut record = vec![RECORD_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);

        let mut client = TcpStream::connect(router_addr).await.unwrap();
        client.write_all(&record).await.unwrap();

        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "connection should be closed, not answered");
    }
}
