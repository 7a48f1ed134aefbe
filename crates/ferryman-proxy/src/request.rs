//! Inbound request head parsing and per-request metadata.
//!
//! The proxy speaks HTTP/1.1 directly on the accepted socket: the head is
//! read through a `BufReader` with a hard size bound, and any bytes the
//! reader pulled past the blank line are handed back to the caller so no
//! body data is lost.

use crate::error::{ProxyError, Result};
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Maximum total size of an HTTP head (64 KiB). Prevents OOM from
/// malicious clients sending unbounded header data.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Inbound header naming the client role. Consumed by the built-in role
/// extractor and stripped before forwarding.
pub const ROLE_HEADER: &str = "X-Smokescreen-Role";
/// Inbound header carrying a caller-supplied trace id. Recorded on the
/// decision log line and stripped before forwarding.
pub const TRACE_HEADER: &str = "X-Smokescreen-Trace-ID";
/// Response header carrying the rejection message. Deleted from upstream
/// responses so an origin cannot forge one.
pub const ERROR_HEADER: &str = "X-Smokescreen-Error";

/// Which proxying mode a request arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Http,
    Connect,
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyMode::Http => f.write_str("http"),
            ProxyMode::Connect => f.write_str("connect"),
        }
    }
}

/// Client identity taken from the first peer certificate, when the
/// listener layer terminated TLS and supplied one.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub common_name: String,
    pub organizational_unit: String,
}

/// A parsed request head.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub peer: SocketAddr,
    pub peer_identity: Option<PeerIdentity>,
}

impl RequestHead {
    /// First value of `name`, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Remove every value of `name`, returning the first.
    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        let first = self.header(name).map(str::to_string);
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        first
    }

    /// HTTP version as (major, minor); assumes 1.1 when unparseable.
    #[must_use]
    pub fn proto(&self) -> (u8, u8) {
        match self.version.strip_prefix("HTTP/").and_then(|v| v.split_once('.')) {
            Some((maj, min)) => (
                maj.parse().unwrap_or(1),
                min.parse().unwrap_or(1),
            ),
            None => (1, 1),
        }
    }
}

/// Read one HTTP head from `reader`.
///
/// Returns the request line, parsed headers, and any bytes buffered past
/// the blank line. `Ok(None)` means the peer closed before sending a
/// request line. A head larger than [`MAX_HEAD_SIZE`] fails with an
/// `HttpParse` error; the caller answers `431`.
pub async fn read_head<S: AsyncRead + Unpin>(
    reader: &mut BufReader<S>,
) -> Result<Option<(String, Vec<(String, String)>, Vec<u8>)>> {
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(None);
    }
    let request_line = request_line.trim_end().to_string();
    if request_line.is_empty() {
        return Ok(None);
    }

    let mut headers = Vec::new();
    let mut total = request_line.len();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
        total += n;
        if total > MAX_HEAD_SIZE {
            return Err(ProxyError::HttpParse("request head too large".to_string()));
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let buffered = reader.buffer().to_vec();
    Ok(Some((request_line, headers, buffered)))
}

/// Parse a request line into (method, target, version).
pub fn parse_request_line(line: &str) -> Result<(String, String, String)> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => Ok((m.to_string(), t.to_string(), v.to_string())),
        _ => Err(ProxyError::HttpParse(format!(
            "malformed request line: {line}"
        ))),
    }
}

/// Join a host and port, bracketing IPv6 literals.
#[must_use]
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Build a dialable `host:port` from a client-supplied host that may or
/// may not carry a port, defaulting the port from the URL scheme
/// (`http` ⇒ 80, `https` ⇒ 443, anything else ⇒ 0).
#[must_use]
pub fn synthesize_outbound_host(host: &str, scheme: &str) -> String {
    let colon = host.rfind(':').map_or(-1, |i| i as i64);
    let bracket = host.rfind(']').map_or(-1, |i| i as i64);
    if colon <= bracket {
        let port = match scheme {
            "http" => 80,
            "https" => 443,
            _ => 0,
        };
        join_host_port(host, port)
    } else {
        host.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn head(target: &str) -> RequestHead {
        RequestHead {
            method: "GET".to_string(),
            target: target.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: vec![
                ("Host".to_string(), "example.com".to_string()),
                ("X-Smokescreen-Role".to_string(), "foo".to_string()),
            ],
            peer: "127.0.0.1:9999".parse().unwrap(),
            peer_identity: None,
        }
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let h = head("http://example.com/");
        assert_eq!(h.header("x-smokescreen-role"), Some("foo"));
        assert_eq!(h.header("HOST"), Some("example.com"));
        assert_eq!(h.header("Absent"), None);
    }

    #[test]
    fn test_remove_header_strips_all_values() {
        let mut h = head("http://example.com/");
        h.headers
            .push(("x-smokescreen-role".to_string(), "bar".to_string()));
        assert_eq!(h.remove_header(ROLE_HEADER).unwrap(), "foo");
        assert_eq!(h.header(ROLE_HEADER), None);
    }

    #[test]
    fn test_proto_parsing() {
        let mut h = head("/");
        assert_eq!(h.proto(), (1, 1));
        h.version = "HTTP/1.0".to_string();
        assert_eq!(h.proto(), (1, 0));
        h.version = "garbage".to_string();
        assert_eq!(h.proto(), (1, 1));
    }

    #[test]
    fn test_parse_request_line() {
        let (m, t, v) = parse_request_line("CONNECT example.com:443 HTTP/1.1").unwrap();
        assert_eq!(m, "CONNECT");
        assert_eq!(t, "example.com:443");
        assert_eq!(v, "HTTP/1.1");
        assert!(parse_request_line("GET /").is_err());
        assert!(parse_request_line("").is_err());
    }

    #[test]
    fn test_synthesize_outbound_host() {
        assert_eq!(synthesize_outbound_host("example.com", "http"), "example.com:80");
        assert_eq!(
            synthesize_outbound_host("example.com", "https"),
            "example.com:443"
        );
        assert_eq!(synthesize_outbound_host("example.com", "ftp"), "example.com:0");
        assert_eq!(
            synthesize_outbound_host("example.com:8080", "http"),
            "example.com:8080"
        );
    }

    #[test]
    fn test_synthesize_outbound_host_ipv6() {
        assert_eq!(synthesize_outbound_host("[::1]", "http"), "[::1]:80");
        assert_eq!(synthesize_outbound_host("[::1]:8080", "https"), "[::1]:8080");
    }

    #[tokio::test]
    async fn test_read_head_captures_buffered_body() {
        let raw = b"POST http://example.com/ HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\nbody";
        let mut reader = BufReader::new(&raw[..]);
        let (line, headers, buffered) = read_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(line, "POST http://example.com/ HTTP/1.1");
        assert_eq!(headers.len(), 2);
        assert_eq!(buffered, b"body");
    }

    #[tokio::test]
    async fn test_read_head_empty_input() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_head(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_head_rejects_oversized() {
        let mut raw = b"GET http://example.com/ HTTP/1.1\r\n".to_vec();
        let filler = format!("X-Filler: {}\r\n", "a".repeat(8192));
        for _ in 0..10 {
            raw.extend_from_slice(filler.as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_head(&mut reader).await.is_err());
    }
}
