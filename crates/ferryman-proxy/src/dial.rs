//! Outbound dialing for both proxy modes.
//!
//! The dialer takes the request's decision record explicitly. A tunnel
//! may only be opened when the decision allows and carries a resolved
//! address; if the stored resolution does not match what is being dialed
//! (different host, missing address, different network), resolution runs
//! again and the decision is updated, so no stale address is ever used.

use crate::admission::Decision;
use crate::config::Config;
use crate::conntrack::{ConnTracker, InstrumentedConn};
use crate::error::{ProxyError, Result};
use crate::request::ProxyMode;
use crate::resolve::safe_resolve;
use crate::timeout::TimeoutConn;
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::error;

/// Connect to the decision's resolved address with the connect timeout.
///
/// Emits `cn.atpt.total` before the attempt and exactly one of
/// `cn.atpt.success.total` / `cn.atpt.fail.total` after it.
pub async fn dial_decided(
    config: &Config,
    decision: &mut Decision,
    network: &str,
    addr: &str,
) -> Result<TcpStream> {
    if decision.resolved_addr.is_none() || decision.outbound_host != addr || network != "tcp" {
        match safe_resolve(config, network, addr).await {
            Ok((resolved, reason)) => {
                decision.resolved_addr = Some(resolved);
                decision.reason = reason;
            }
            Err(err) => {
                if err.is_denial() {
                    // The front-end should have resolved and classified
                    // already; reaching a denial here means it did not.
                    error!(address = addr, error = %err, "unexpected illegal address in dialer");
                }
                return Err(err);
            }
        }
    }

    let target = match decision.resolved_addr {
        Some(target) => target,
        None => return Err(ProxyError::NoAddresses),
    };

    config.stats.incr("cn.atpt.total", &[]);
    match timeout(config.connect_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => {
            config.stats.incr("cn.atpt.success.total", &[]);
            Ok(stream)
        }
        Ok(Err(err)) => {
            config.stats.incr("cn.atpt.fail.total", &[]);
            Err(err.into())
        }
        Err(_) => {
            config.stats.incr("cn.atpt.fail.total", &[]);
            Err(ProxyError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {target} timed out"),
            )))
        }
    }
}

/// Dial for the classic HTTP path: a plain idle-timed connection.
///
/// Not tracked; see [`crate::conntrack`] for why.
pub async fn dial_http(
    config: &Config,
    decision: &mut Decision,
    addr: &str,
) -> Result<TimeoutConn<TcpStream>> {
    let stream = dial_decided(config, decision, "tcp", addr).await?;
    Ok(TimeoutConn::new(stream, config.idle_timeout))
}

/// Dial for a CONNECT tunnel: an instrumented, tracked connection.
pub async fn dial_tunnel(
    config: &Config,
    tracker: &Arc<ConnTracker>,
    decision: &mut Decision,
    trace_id: &str,
    addr: &str,
) -> Result<InstrumentedConn<TcpStream>> {
    let stream = dial_decided(config, decision, "tcp", addr).await?;
    Ok(tracker.instrument(
        stream,
        trace_id,
        &decision.role,
        &decision.outbound_host,
        ProxyMode::Connect,
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::resolve::tests::{test_config, StubResolver};
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn allowed_decision(outbound_host: &str, resolved: Option<SocketAddr>) -> Decision {
        Decision {
            role: "foo".to_string(),
            project: String::new(),
            outbound_host: outbound_host.to_string(),
            resolved_addr: resolved,
            reason: "Allow: Default".to_string(),
            allow: true,
            enforce_would_deny: false,
        }
    }

    #[tokio::test]
    async fn test_dial_uses_the_resolved_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let (config, stats) = test_config(StubResolver::default());

        let mut decision = allowed_decision("example.com:443", Some(local));
        let stream = dial_decided(&config, &mut decision, "tcp", "example.com:443")
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), local);
        assert_eq!(
            stats.names(),
            vec!["cn.atpt.total", "cn.atpt.success.total"]
        );
    }

    #[tokio::test]
    async fn test_dial_reruns_resolution_when_host_changed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();

        // The stub maps the new host to the listener; loopback must be
        // explicitly allowed for classification to pass.
        let (mut config, stats) = test_config(StubResolver::with(
            "other.test",
            &[&local.ip().to_string()],
        ));
        config.allow_ranges = vec!["127.0.0.0/8".parse().unwrap()];

        let stale: SocketAddr = "192.0.2.1:443".parse().unwrap();
        let mut decision = allowed_decision("example.com:443", Some(stale));
        let stream = dial_decided(
            &config,
            &mut decision,
            "tcp",
            &format!("other.test:{}", local.port()),
        )
        .await
        .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), local);
        assert_eq!(decision.resolved_addr.unwrap(), local);
        assert_eq!(decision.reason, "Allow: User Configured");
        assert!(stats.contains("resolver.attempts_total"));
    }

    #[tokio::test]
    async fn test_dial_denial_on_rerun_is_propagated() {
        let (config, stats) = test_config(StubResolver::with("rebound.test", &["10.0.0.5"]));
        let mut decision = allowed_decision("example.com:443", None);
        let err = dial_decided(&config, &mut decision, "tcp", "rebound.test:443")
            .await
            .unwrap_err();
        assert!(err.is_denial());
        // No connection attempt was made.
        assert!(!stats.contains("cn.atpt.total"));
    }

    #[tokio::test]
    async fn test_dial_failure_counts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        drop(listener);

        let (config, stats) = test_config(StubResolver::default());
        let mut decision = allowed_decision("example.com:443", Some(local));
        let err = dial_decided(&config, &mut decision, "tcp", "example.com:443").await;
        assert!(err.is_err());
        assert_eq!(stats.names(), vec!["cn.atpt.total", "cn.atpt.fail.total"]);
    }

    #[tokio::test]
    async fn test_dial_tunnel_registers_with_tracker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let (config, stats) = test_config(StubResolver::default());
        let tracker = ConnTracker::new(
            config.idle_timeout,
            stats.clone(),
            config.shutting_down.clone(),
        );

        let mut decision = allowed_decision("example.com:443", Some(local));
        let conn = dial_tunnel(&config, &tracker, &mut decision, "t-9", "example.com:443")
            .await
            .unwrap();
        assert_eq!(tracker.live_count(), 1);

        let (mut accepted, _) = listener.accept().await.unwrap();
        drop(conn);
        assert_eq!(tracker.live_count(), 0);
        let mut buf = [0u8; 1];
        assert_eq!(accepted.read(&mut buf).await.unwrap(), 0);
    }
}
