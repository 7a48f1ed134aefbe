//! Classic HTTP proxy front-end.
//!
//! Absolute-URI requests are admitted, then replayed against the origin
//! over a fresh idle-timed connection (no pooling: ferryman speaks
//! `Connection: close` on both sides, so byte attribution stays
//! per-request). The canonical decision line is emitted after the
//! response phase, once the response content length is known.

use crate::admission::{admit, Decision};
use crate::config::Config;
use crate::dial::dial_http;
use crate::error::{ProxyError, Result};
use crate::log::{log_decision, unix_now, DecisionRecord};
use crate::reject::write_rejection;
use crate::request::{
    read_head, synthesize_outbound_host, ProxyMode, RequestHead, ERROR_HEADER, ROLE_HEADER,
    TRACE_HEADER,
};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// The pieces of a classic proxy target.
#[derive(Debug, PartialEq, Eq)]
struct ParsedTarget {
    scheme: String,
    /// Authority as the client named it, possibly without a port.
    authority: String,
    /// Origin-form path (plus query) to replay upstream.
    path: String,
}

fn parse_target(head: &RequestHead) -> Result<ParsedTarget> {
    if head.target.contains("://") {
        let url = url::Url::parse(&head.target)
            .map_err(|err| ProxyError::HttpParse(format!("invalid proxy target: {err}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::HttpParse("proxy target has no host".to_string()))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path = format!("{path}?{query}");
        }
        Ok(ParsedTarget {
            scheme: url.scheme().to_string(),
            authority,
            path,
        })
    } else {
        // Origin-form request; the Host header names the destination.
        let host = head
            .header("Host")
            .ok_or_else(|| ProxyError::HttpParse("no Host header on origin-form request".to_string()))?
            .to_string();
        Ok(ParsedTarget {
            scheme: "http".to_string(),
            authority: host,
            path: head.target.clone(),
        })
    }
}

/// Connection-level headers that must not be replayed upstream. The
/// proxy's own role and trace headers are stripped separately, before
/// forwarding.
fn is_hop_by_hop(name: &str) -> bool {
    const HOP_BY_HOP: &[&str] = &[
        "connection",
        "proxy-connection",
        "proxy-authorization",
        "proxy-authenticate",
        "keep-alive",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn header_i64(headers: &[(String, String)], name: &str) -> Option<i64> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| v.parse().ok())
}

/// Handle a classic (non-CONNECT) proxy request on an accepted socket.
///
/// `buffered` holds any body bytes read past the request head.
pub async fn handle_http(
    config: &Arc<Config>,
    mut head: RequestHead,
    mut stream: TcpStream,
    buffered: Vec<u8>,
) -> Result<()> {
    let start_unix = unix_now();
    debug!(
        source_ip = %head.peer,
        requested_host = %head.target,
        trace_id = head.header(TRACE_HEADER).unwrap_or(""),
        "received HTTP proxy request"
    );

    let parsed = match parse_target(&head) {
        Ok(parsed) => parsed,
        Err(err) => {
            let requested_host = head.target.clone();
            let trace_id = head.remove_header(TRACE_HEADER).unwrap_or_default();
            let decision = Decision::unevaluated(&requested_host);
            let content_length =
                write_rejection(&mut stream, config, &head, &requested_host, &err).await?;
            log_decision(&DecisionRecord {
                mode: ProxyMode::Http,
                head: &head,
                decision: &decision,
                requested_host: &requested_host,
                trace_id: &trace_id,
                start_unix,
                content_length,
                error: Some(&err),
            });
            return Ok(());
        }
    };
    let requested_host = parsed.authority.clone();
    let outbound_host = synthesize_outbound_host(&parsed.authority, &parsed.scheme);

    let (mut decision, admit_err) = admit(config, &head, &outbound_host).await;

    // Inputs to the proxy, not to the origin.
    let trace_id = head.remove_header(TRACE_HEADER).unwrap_or_default();
    head.remove_header(ROLE_HEADER);

    if let Some(err) = admit_err {
        let content_length =
            write_rejection(&mut stream, config, &head, &requested_host, &err).await?;
        log_decision(&DecisionRecord {
            mode: ProxyMode::Http,
            head: &head,
            decision: &decision,
            requested_host: &requested_host,
            trace_id: &trace_id,
            start_unix,
            content_length,
            error: Some(&err),
        });
        return Ok(());
    }
    if !decision.allow {
        let err = ProxyError::PolicyDenied(decision.reason.clone());
        let content_length =
            write_rejection(&mut stream, config, &head, &requested_host, &err).await?;
        log_decision(&DecisionRecord {
            mode: ProxyMode::Http,
            head: &head,
            decision: &decision,
            requested_host: &requested_host,
            trace_id: &trace_id,
            start_unix,
            content_length,
            error: None,
        });
        return Ok(());
    }

    let mut upstream = match dial_http(config, &mut decision, &outbound_host).await {
        Ok(conn) => conn,
        Err(err) => {
            let content_length =
                write_rejection(&mut stream, config, &head, &requested_host, &err).await?;
            log_decision(&DecisionRecord {
                mode: ProxyMode::Http,
                head: &head,
                decision: &decision,
                requested_host: &requested_host,
                trace_id: &trace_id,
                start_unix,
                content_length,
                error: Some(&err),
            });
            return Ok(());
        }
    };

    // Replay the request in origin form.
    let mut out = format!("{} {} HTTP/1.1\r\n", head.method, parsed.path);
    let mut has_host = false;
    for (name, value) in &head.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if name.eq_ignore_ascii_case("host") {
            has_host = true;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    if !has_host {
        out.push_str("Host: ");
        out.push_str(&parsed.authority);
        out.push_str("\r\n");
    }
    out.push_str("Connection: close\r\n\r\n");
    upstream.write_all(out.as_bytes()).await?;

    // Forward the body when the client declared its length. Bytes the
    // head parser read ahead come first.
    if let Some(len) = header_i64(&head.headers, "Content-Length").and_then(|v| u64::try_from(v).ok())
    {
        let pre = buffered.len().min(len as usize);
        upstream.write_all(&buffered[..pre]).await?;
        let remaining = len - pre as u64;
        if remaining > 0 {
            let mut limited = (&mut stream).take(remaining);
            tokio::io::copy(&mut limited, &mut upstream).await?;
        }
    }
    upstream.flush().await?;

    // Read the response head so its length is known and its headers can
    // be scrubbed before anything reaches the client.
    let mut upstream_reader = BufReader::new(upstream);
    let Some((status_line, mut resp_headers, resp_buffered)) =
        read_head(&mut upstream_reader).await?
    else {
        let err = ProxyError::HttpParse("upstream closed without a response".to_string());
        let content_length =
            write_rejection(&mut stream, config, &head, &requested_host, &err).await?;
        log_decision(&DecisionRecord {
            mode: ProxyMode::Http,
            head: &head,
            decision: &decision,
            requested_host: &requested_host,
            trace_id: &trace_id,
            start_unix,
            content_length,
            error: Some(&err),
        });
        return Ok(());
    };

    // An origin cannot forge the proxy's own rejection marker.
    resp_headers.retain(|(name, _)| !name.eq_ignore_ascii_case(ERROR_HEADER));
    let content_length = header_i64(&resp_headers, "Content-Length").unwrap_or(-1);

    let mut resp = format!("{status_line}\r\n");
    for (name, value) in &resp_headers {
        resp.push_str(name);
        resp.push_str(": ");
        resp.push_str(value);
        resp.push_str("\r\n");
    }
    resp.push_str("\r\n");
    stream.write_all(resp.as_bytes()).await?;
    stream.write_all(&resp_buffered).await?;

    let mut upstream = upstream_reader.into_inner();
    tokio::io::copy(&mut upstream, &mut stream).await?;
    stream.flush().await?;

    log_decision(&DecisionRecord {
        mode: ProxyMode::Http,
        head: &head,
        decision: &decision,
        requested_host: &requested_host,
        trace_id: &trace_id,
        start_unix,
        content_length,
        error: None,
    });
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn head_for(target: &str) -> RequestHead {
        RequestHead {
            method: "GET".to_string(),
            target: target.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: Vec::new(),
            peer: "127.0.0.1:7000".parse().unwrap(),
            peer_identity: None,
        }
    }

    #[test]
    fn test_parse_absolute_target() {
        let parsed = parse_target(&head_for("http://example.com/a/b?x=1")).unwrap();
        assert_eq!(parsed.scheme, "http");
        assert_eq!(parsed.authority, "example.com");
        assert_eq!(parsed.path, "/a/b?x=1");
    }

    #[test]
    fn test_parse_absolute_target_with_port() {
        let parsed = parse_target(&head_for("https://example.com:8443/")).unwrap();
        assert_eq!(parsed.authority, "example.com:8443");
        assert_eq!(parsed.path, "/");
    }

    #[test]
    fn test_parse_ipv6_target() {
        let parsed = parse_target(&head_for("http://[::1]:8080/x")).unwrap();
        assert_eq!(parsed.authority, "[::1]:8080");
        assert_eq!(
            synthesize_outbound_host(&parsed.authority, &parsed.scheme),
            "[::1]:8080"
        );
    }

    #[test]
    fn test_origin_form_falls_back_to_host_header() {
        let mut head = head_for("/path");
        head.headers
            .push(("Host".to_string(), "example.com".to_string()));
        let parsed = parse_target(&head).unwrap();
        assert_eq!(parsed.scheme, "http");
        assert_eq!(parsed.authority, "example.com");
        assert_eq!(parsed.path, "/path");
    }

    #[test]
    fn test_origin_form_without_host_is_rejected() {
        assert!(parse_target(&head_for("/path")).is_err());
    }

    #[test]
    fn test_scheme_port_synthesis() {
        for (target, expected) in [
            ("http://example.com/", "example.com:80"),
            ("https://example.com/", "example.com:443"),
            ("ftp://example.com/", "example.com:0"),
            ("http://example.com:8080/", "example.com:8080"),
        ] {
            let parsed = parse_target(&head_for(target)).unwrap();
            assert_eq!(
                synthesize_outbound_host(&parsed.authority, &parsed.scheme),
                expected,
                "{target}"
            );
        }
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("proxy-connection"));
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(!is_hop_by_hop("Content-Length"));
        assert!(!is_hop_by_hop("Accept"));
    }
}
