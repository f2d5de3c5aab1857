//! Application protocol detection on the first bytes of a stream
//!
//! The sniffer peeks, never consumes: callers keep reading from the
//! same [`PeekableStream`] afterwards and see the inspected bytes.

use serde::{Deserialize, Serialize};

use crate::common::PeekableStream;

/// Bytes needed to discriminate the supported protocols: the longest
/// method token (`OPTIONS`) plus the following space.
const SNIFF_LEN: usize = 8;

const HTTP_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

/// Identified application protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Tls,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tls => "tls",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peek the initial bytes of the stream and classify them.
///
/// Returns `None` for anything that is neither an HTTP request line
/// nor a TLS record. The peeked bytes stay in the stream.
pub async fn sniff(stream: &mut PeekableStream) -> std::io::Result<Option<Protocol>> {
    let bytes = stream.peek(SNIFF_LEN).await?;

    if is_tls(bytes) {
        return Ok(Some(Protocol::Tls));
    }
    if is_http(bytes) {
        return Ok(Some(Protocol::Http));
    }
    Ok(None)
}

/// TLS record framing: handshake content type followed by a TLS
/// 1.0-1.3 record version.
fn is_tls(bytes: &[u8]) -> bool {
    bytes.len() >= 3 && bytes[0] == 0x16 && bytes[1] == 0x03 && (0x01..=0x04).contains(&bytes[2])
}

/// A recognized HTTP method token followed by a space.
fn is_http(bytes: &[u8]) -> bool {
    HTTP_METHODS.iter().any(|method| {
        let m = method.as_bytes();
        bytes.len() > m.len() && bytes.starts_with(m) && bytes[m.len()] == b' '
    })
}

/// Cap on how far the head/hello peeks reach into the stream.
const PEEK_LIMIT: usize = 16 * 1024;

/// Request line and host of a peeked HTTP request head.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpHead {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub host: String,
}

/// Peek the HTTP request head without consuming it.
///
/// Grows the peek window until the blank line ends the head, the
/// limit is hit, or the stream closes.
pub async fn peek_http_head(stream: &mut PeekableStream) -> std::io::Result<Option<HttpHead>> {
    let mut want = 512;
    loop {
        let bytes = stream.peek(want).await?;
        if let Some(end) = find_head_end(bytes) {
            return Ok(parse_http_head(&bytes[..end]));
        }
        if bytes.len() < want || want >= PEEK_LIMIT {
            // Head incomplete; parse what we have.
            return Ok(parse_http_head(bytes));
        }
        want *= 2;
    }
}

fn find_head_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_http_head(bytes: &[u8]) -> Option<HttpHead> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut lines = text.split("\r\n");

    let mut parts = lines.next()?.split(' ');
    let mut head = HttpHead {
        method: parts.next()?.to_string(),
        uri: parts.next()?.to_string(),
        version: parts.next().unwrap_or("HTTP/1.1").to_string(),
        host: String::new(),
    };

    for line in lines {
        if let Some(value) = line
            .strip_prefix("Host:")
            .or_else(|| line.strip_prefix("host:"))
        {
            head.host = value.trim().to_string();
            break;
        }
    }
    Some(head)
}

/// Fields of a peeked TLS ClientHello.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    pub server_name: String,
    pub version: String,
    /// The raw record bytes that were peeked.
    pub raw: Vec<u8>,
}

/// Peek the first TLS record and extract the ClientHello fields.
pub async fn peek_client_hello(
    stream: &mut PeekableStream,
) -> std::io::Result<Option<ClientHello>> {
    let header = stream.peek(5).await?;
    if !is_tls(header) || header.len() < 5 {
        return Ok(None);
    }
    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let total = (5 + record_len).min(PEEK_LIMIT);

    let bytes = stream.peek(total).await?;
    Ok(parse_client_hello(bytes))
}

/// Minimal ClientHello walk, just deep enough for the SNI extension.
fn parse_client_hello(bytes: &[u8]) -> Option<ClientHello> {
    let mut hello = ClientHello {
        raw: bytes.to_vec(),
        ..Default::default()
    };

    let body = bytes.get(5..)?;
    // Handshake type must be ClientHello.
    if *body.first()? != 0x01 {
        return None;
    }
    let mut cur = Cursor::new(body.get(4..)?);

    let version = cur.take(2)?;
    hello.version = tls_version(u16::from_be_bytes([version[0], version[1]]));
    cur.take(32)?; // random

    let session_len = cur.take(1)?[0] as usize;
    cur.take(session_len)?;

    let cipher_len = cur.take_u16()? as usize;
    cur.take(cipher_len)?;

    let compression_len = cur.take(1)?[0] as usize;
    cur.take(compression_len)?;

    // Extensions are optional; a hello without SNI still parses.
    let ext_bytes = cur
        .take_u16()
        .and_then(|len| cur.take(len as usize))
        .unwrap_or(&[]);
    let mut ext = Cursor::new(ext_bytes);
    loop {
        let Some(ext_type) = ext.take_u16() else { break };
        let Some(ext_len) = ext.take_u16() else { break };
        let Some(data) = ext.take(ext_len as usize) else {
            break;
        };
        if ext_type == 0x0000 {
            // server_name: list length, name type, name length, name.
            if let (Some(hi), Some(lo), Some(name)) = (data.get(3), data.get(4), data.get(5..)) {
                let name_len = u16::from_be_bytes([*hi, *lo]) as usize;
                if let Some(name) = name.get(..name_len) {
                    if let Ok(name) = String::from_utf8(name.to_vec()) {
                        hello.server_name = name;
                    }
                }
            }
            break;
        }
    }

    Some(hello)
}

fn tls_version(v: u16) -> String {
    match v {
        0x0301 => "tls1.0".to_string(),
        0x0302 => "tls1.1".to_string(),
        0x0303 => "tls1.2".to_string(),
        0x0304 => "tls1.3".to_string(),
        other => format!("0x{:04x}", other),
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.bytes.len() < n {
            return None;
        }
        let (head, rest) = self.bytes.split_at(n);
        self.bytes = rest;
        Some(head)
    }

    fn take_u16(&mut self) -> Option<u16> {
        let b = self.take(2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn sniff_bytes(data: &[u8]) -> Option<Protocol> {
        let (client, mut server) = tokio::io::duplex(1024);
        server.write_all(data).await.unwrap();
        drop(server);
        let mut stream = PeekableStream::new(Box::new(client));
        sniff(&mut stream).await.unwrap()
    }

    #[tokio::test]
    async fn test_sniff_http() {
        assert_eq!(
            sniff_bytes(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await,
            Some(Protocol::Http)
        );
        assert_eq!(
            sniff_bytes(b"OPTIONS * HTTP/1.1\r\n").await,
            Some(Protocol::Http)
        );
    }

    #[tokio::test]
    async fn test_sniff_tls() {
        // TLS 1.2 ClientHello record header.
        assert_eq!(
            sniff_bytes(&[0x16, 0x03, 0x03, 0x00, 0x40, 0x01, 0x00, 0x00]).await,
            Some(Protocol::Tls)
        );
        // TLS 1.0 record version.
        assert_eq!(
            sniff_bytes(&[0x16, 0x03, 0x01, 0x00, 0x40, 0x01, 0x00, 0x00]).await,
            Some(Protocol::Tls)
        );
    }

    #[tokio::test]
    async fn test_sniff_unknown() {
        assert_eq!(sniff_bytes(b"SSH-2.0-OpenSSH_9.6\r\n").await, None);
        assert_eq!(sniff_bytes(&[0x17, 0x03, 0x03, 0x00, 0x10]).await, None);
        assert_eq!(sniff_bytes(b"GETTING-STARTED").await, None);
        assert_eq!(sniff_bytes(b"").await, None);
    }

    #[tokio::test]
    async fn test_sniff_short_stream() {
        // Fewer bytes than the sniff window still classifies.
        assert_eq!(sniff_bytes(&[0x16, 0x03, 0x02]).await, Some(Protocol::Tls));
        assert_eq!(sniff_bytes(b"GE").await, None);
    }

    #[tokio::test]
    async fn test_peek_http_head() {
        let (client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"GET /index.html HTTP/1.1\r\nUser-Agent: curl\r\nHost: example.com:8080\r\n\r\nbody")
            .await
            .unwrap();
        drop(server);

        let mut stream = PeekableStream::new(Box::new(client));
        let head = peek_http_head(&mut stream).await.unwrap().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.uri, "/index.html");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.host, "example.com:8080");

        // The whole request is still readable.
        use tokio::io::AsyncReadExt;
        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        assert!(all.starts_with(b"GET /index.html"));
        assert!(all.ends_with(b"body"));
    }

    fn client_hello_with_sni(host: &str) -> Vec<u8> {
        let name = host.as_bytes();
        let mut sni = Vec::new();
        sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        sni.push(0); // name type: host
        sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni.extend_from_slice(name);

        let mut ext = Vec::new();
        ext.extend_from_slice(&0u16.to_be_bytes()); // server_name
        ext.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        ext.extend_from_slice(&sni);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // TLS 1.2
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0x13, 0x01]); // cipher suites
        body.extend_from_slice(&[1, 0]); // compression: null
        body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[tokio::test]
    async fn test_peek_client_hello_sni() {
        let (client, mut server) = tokio::io::duplex(4096);
        let raw = client_hello_with_sni("www.example.com");
        server.write_all(&raw).await.unwrap();
        drop(server);

        let mut stream = PeekableStream::new(Box::new(client));
        let hello = peek_client_hello(&mut stream).await.unwrap().unwrap();
        assert_eq!(hello.server_name, "www.example.com");
        assert_eq!(hello.version, "tls1.2");
        assert_eq!(hello.raw, raw);

        // Peeking left the record in place.
        use tokio::io::AsyncReadExt;
        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, raw);
    }

    #[tokio::test]
    async fn test_peek_client_hello_rejects_non_tls() {
        let (client, mut server) = tokio::io::duplex(1024);
        server.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        drop(server);

        let mut stream = PeekableStream::new(Box::new(client));
        assert!(peek_client_hello(&mut stream).await.unwrap().is_none());
    }
}
