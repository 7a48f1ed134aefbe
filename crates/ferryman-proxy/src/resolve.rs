//! Safe destination resolution.
//!
//! `safe_resolve` is the only path from a requested `host:port` to a
//! dialable address: it resolves through the injected [`Resolver`],
//! classifies the first returned IP, and hands back either the address or
//! a typed denial. Callers must dial the returned address, never the
//! hostname, so the address that was classified is the address that gets
//! dialed.

use crate::config::Config;
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use ferryman::classify::classify_addr;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::net::lookup_host;

/// Reason string carried alongside a classification denial.
pub(crate) const DENIED_BY_RULE_REASON: &str =
    "destination address was denied by rule, see error";

/// Host and port resolution, injectable for tests.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve a port number or service name for the given network.
    async fn lookup_port(&self, network: &str, service: &str) -> io::Result<u16>;

    /// Resolve a hostname to its addresses.
    async fn lookup_ips(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the host's stub resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_port(&self, _network: &str, service: &str) -> io::Result<u16> {
        if let Ok(port) = service.parse::<u16>() {
            return Ok(port);
        }
        match service {
            "http" => Ok(80),
            "https" => Ok(443),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown service {service:?}"),
            )),
        }
    }

    async fn lookup_ips(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        // lookup_host needs a port; it is discarded from the results.
        let addrs = lookup_host((host, 0)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Split `host:port`, honoring IPv6 brackets.
pub fn split_host_port(addr: &str) -> Result<(String, String)> {
    let invalid = || ProxyError::InvalidHostPort(addr.to_string());
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        let port = after.strip_prefix(':').ok_or_else(invalid)?;
        if host.is_empty() || port.is_empty() {
            return Err(invalid());
        }
        Ok((host.to_string(), port.to_string()))
    } else {
        let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || port.is_empty() || host.contains(':') {
            return Err(invalid());
        }
        Ok((host.to_string(), port.to_string()))
    }
}

async fn resolve_addr(config: &Config, network: &str, addr: &str) -> Result<SocketAddr> {
    if network != "tcp" {
        return Err(ProxyError::UnknownNetwork(network.to_string()));
    }
    let (host, port) = split_host_port(addr)?;

    let port = config.resolver.lookup_port(network, &port).await?;
    let ips = config.resolver.lookup_ips(&host).await?;
    // The first address is used, deliberately: deterministic and testable.
    match ips.first() {
        Some(ip) => Ok(SocketAddr::new(*ip, port)),
        None => Err(ProxyError::NoAddresses),
    }
}

/// Resolve and classify a destination.
///
/// On success returns the resolved address and the classification's human
/// name. A denied classification returns [`ProxyError::Denied`]; all other
/// failures (unknown network, bad host:port, DNS errors) return their own
/// variants and additionally bump `resolver.errors_total`.
pub async fn safe_resolve(
    config: &Config,
    network: &str,
    addr: &str,
) -> Result<(SocketAddr, String)> {
    config.stats.incr("resolver.attempts_total", &[]);
    let resolved = match resolve_addr(config, network, addr).await {
        Ok(resolved) => resolved,
        Err(err) => {
            config.stats.incr("resolver.errors_total", &[]);
            return Err(err);
        }
    };

    let class = classify_addr(&config.allow_ranges, &config.deny_ranges, &resolved);
    config.stats.incr(class.metric(), &[]);

    if class.is_allowed() {
        Ok((resolved, class.to_string()))
    } else {
        Err(ProxyError::Denied {
            ip: resolved.ip(),
            class,
        })
    }
}
