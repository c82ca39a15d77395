//! Minimal HTTP/1.1 framing over raw streams.
//!
//! The control and data planes keep ownership of their sockets so a request
//! can be answered and the same connection repurposed as a raw pipe. That
//! rules out handing the stream to a full HTTP server; instead the head is
//! framed by hand and the body read by content-length. Parsing works
//! against a caller-owned buffer: bytes already sniffed land there first,
//! and whatever remains after the body is the beginning of the raw pipe.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::GatewayError;

/// Upper bound on a request/response head. Anything larger is a protocol
/// violation on these internal surfaces.
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Upper bound on a control message body.
const MAX_BODY_SIZE: usize = 64 * 1024;

/// A parsed request head plus its body
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// A parsed response head plus its body
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn content_length(headers: &[(String, String)]) -> Result<usize, GatewayError> {
    match header_value(headers, "content-length") {
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map_err(|_| GatewayError::Protocol(format!("Invalid content-length: {}", v))),
        None => Ok(0),
    }
}

/// Read a full head (start line + headers) and the content-length body.
/// Consumes exactly the message from `buf`; bytes past the body stay in
/// `buf` for the caller.
async fn read_message<S>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<(String, Vec<(String, String)>, Vec<u8>), GatewayError>
where
    S: AsyncRead + Unpin,
{
    let head_end = loop {
        if let Some(end) = find_head_end(buf) {
            break end;
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(GatewayError::Protocol("HTTP head too large".to_string()));
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(GatewayError::Protocol(
                "Connection closed before HTTP head".to_string(),
            ));
        }
    };

    let head = buf.split_to(head_end + 4);
    let head_text = std::str::from_utf8(&head[..head.len() - 4])
        .map_err(|_| GatewayError::Protocol("HTTP head is not UTF-8".to_string()))?;

    let mut lines = head_text.split("\r\n");
    let start_line = lines
        .next()
        .ok_or_else(|| GatewayError::Protocol("Empty HTTP head".to_string()))?
        .to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| GatewayError::Protocol(format!("Malformed header line: {}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let body_len = content_length(&headers)?;
    if body_len > MAX_BODY_SIZE {
        return Err(GatewayError::Protocol(format!(
            "Body too large: {} bytes",
            body_len
        )));
    }
    while buf.len() < body_len {
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(GatewayError::Protocol(
                "Connection closed mid-body".to_string(),
            ));
        }
    }
    let body = buf.split_to(body_len).to_vec();

    Ok((start_line, headers, body))
}

/// Read one HTTP/1.1 request. `buf` may already hold sniffed bytes.
pub async fn read_request<S>(stream: &mut S, buf: &mut BytesMut) -> Result<Request, GatewayError>
where
    S: AsyncRead + Unpin,
{
    let (start_line, headers, body) = read_message(stream, buf).await?;

    let mut parts = start_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| GatewayError::Protocol("Missing method".to_string()))?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| GatewayError::Protocol("Missing request path".to_string()))?
        .to_string();
    match parts.next() {
        Some(v) if v.starts_with("HTTP/1.") => {}
        other => {
            return Err(GatewayError::Protocol(format!(
                "Unsupported HTTP version: {:?}",
                other
            )))
        }
    }

    Ok(Request {
        method,
        path,
        headers,
        body,
    })
}

/// Read one HTTP/1.1 response. Bytes past the body stay in `buf`.
pub async fn read_response<S>(stream: &mut S, buf: &mut BytesMut) -> Result<Response, GatewayError>
where
    S: AsyncRead + Unpin,
{
    let (start_line, headers, body) = read_message(stream, buf).await?;

    let mut parts = start_line.split_whitespace();
    match parts.next() {
        Some(v) if v.starts_with("HTTP/1.") => {}
        other => {
            return Err(GatewayError::Protocol(format!(
                "Not an HTTP response: {:?}",
                other
            )))
        }
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| GatewayError::Protocol("Missing status code".to_string()))?;

    Ok(Response {
        status,
        headers,
        body,
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Write a request with a body and flush it.
pub async fn write_request<S>(
    stream: &mut S,
    method: &str,
    path: &str,
    host: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> Result<(), GatewayError>
where
    S: AsyncWrite + Unpin,
{
    let mut out = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\n",
        method,
        path,
        host,
        body.len()
    );
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");

    stream.write_all(out.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

/// Write a response with a body and flush it.
pub async fn write_response<S>(
    stream: &mut S,
    status: u16,
    reason: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> Result<(), GatewayError>
where
    S: AsyncWrite + Unpin,
{
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n",
        status,
        reason,
        body.len()
    );
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");

    stream.write_all(out.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

/// Complete the HTTP exchange the peer expects and leave the stream raw:
/// the bare 200 line, nothing framed after it. A write failure here means
/// the connection cannot be repurposed as a pipe.
pub async fn write_hijack_ok<S>(stream: &mut S) -> Result<(), GatewayError>
where
    S: AsyncWrite + Unpin,
{
    let hijack = |e| GatewayError::TransportCapability(format!("hijack write failed: {}", e));
    stream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n")
        .await
        .map_err(hijack)?;
    stream.flush().await.map_err(hijack)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_request_with_body_and_leftover() {
        let raw =
            b"POST /connect HTTP/1.1\r\nHost: gw\r\nContent-Length: 4\r\n\r\nbodyEXTRA".to_vec();
        let mut cursor = std::io::Cursor::new(raw);
        let mut buf = BytesMut::new();

        let req = read_request(&mut cursor, &mut buf).await.unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/connect");
        assert_eq!(req.body, b"body");
        assert_eq!(req.header("host"), Some("gw"));
        // Bytes past the body stay buffered for the hijacked pipe.
        assert_eq!(&buf[..], b"EXTRA");
    }

    #[tokio::test]
    async fn parses_presniffed_bytes_from_buffer() {
        let mut buf = BytesMut::from(&b"POST /authz HT"[..]);
        let raw = b"TP/1.1\r\nContent-Length: 0\r\n\r\n".to_vec();
        let mut cursor = std::io::Cursor::new(raw);

        let req = read_request(&mut cursor, &mut buf).await.unwrap();
        assert_eq!(req.path, "/authz");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn parses_response_headers_case_insensitively() {
        let raw = b"HTTP/1.1 200 OK\r\nTarget-Cluster: 10.0.0.5:8080\r\nContent-Length: 0\r\n\r\n"
            .to_vec();
        let mut cursor = std::io::Cursor::new(raw);
        let mut buf = BytesMut::new();

        let resp = read_response(&mut cursor, &mut buf).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(
            header_value(&resp.headers, "target-cluster"),
            Some("10.0.0.5:8080")
        );
        assert!(resp.body.is_empty());
    }

    #[tokio::test]
    async fn rejects_non_http_junk() {
        let mut cursor = std::io::Cursor::new(b"\x16\x03\x01\x00\x05hello\r\n\r\n".to_vec());
        let mut buf = BytesMut::new();
        assert!(read_request(&mut cursor, &mut buf).await.is_err());
    }

    #[tokio::test]
    async fn rejects_truncated_body() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort".to_vec();
        let mut cursor = std::io::Cursor::new(raw);
        let mut buf = BytesMut::new();
        assert!(matches!(
            read_request(&mut cursor, &mut buf).await,
            Err(GatewayError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn hijack_reply_is_a_bare_status_line() {
        let mut out = Vec::new();
        write_hijack_ok(&mut out).await.unwrap();
        assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with(b"\r\n\r\n"));
        // No content-length: everything after the head is pipe data.
        assert!(!String::from_utf8_lossy(&out)
            .to_ascii_lowercase()
            .contains("content-length"));
    }

    #[tokio::test]
    async fn failed_hijack_write_is_a_capability_error() {
        let (mut stream, peer) = tokio::io::duplex(16);
        drop(peer);

        let err = write_hijack_ok(&mut stream).await.unwrap_err();
        assert!(matches!(err, GatewayError::TransportCapability(_)));
    }

    #[tokio::test]
    async fn request_roundtrip() {
        let mut out = Vec::new();
        write_request(
            &mut out,
            "POST",
            "/authz",
            "gw-east",
            &[("authorization".to_string(), "backend".to_string())],
            b"{}",
        )
        .await
        .unwrap();

        let mut cursor = std::io::Cursor::new(out);
        let mut buf = BytesMut::new();
        let req = read_request(&mut cursor, &mut buf).await.unwrap();
        assert_eq!(req.path, "/authz");
        assert_eq!(req.header("authorization"), Some("backend"));
        assert_eq!(req.body, b"{}");
    }
}
