//! The egress ACL contract.
//!
//! The proxy consults an [`EgressAcl`] with the client's role and the
//! destination hostname (no port, no brackets, lowercased). Rule loading
//! and the on-disk policy format live outside this crate; implementations
//! only have to answer [`EgressAcl::decide`].

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Outcome of a policy evaluation for a (role, destination) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclAction {
    /// Permit the request.
    Allow,
    /// Permit the request, but flag that stricter enforcement would deny
    /// it. Used to drive policy rollout without breaking traffic.
    AllowAndReport,
    /// Deny the request.
    Deny,
}

/// The evaluator's answer, consumed by the proxy's admission pipeline.
#[derive(Debug, Clone)]
pub struct AclJudgment {
    pub action: AclAction,
    /// Human-readable explanation, surfaced verbatim in rejections.
    pub reason: String,
    /// Project tag attached to decision telemetry.
    pub project: String,
    /// Whether the decision came from the policy's default rule.
    pub default_rule: bool,
}

/// Internal evaluator failure. The proxy treats this as a hard deny whose
/// reason is the error's own message.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct AclError(pub String);

/// Policy evaluator for egress requests.
pub trait EgressAcl: Send + Sync {
    fn decide(&self, role: &str, destination: &str) -> Result<AclJudgment, AclError>;
}

/// Matches a requested host with an optional `:port` suffix; group 1 is a
/// bracketed IPv6 literal, group 2 a bare hostname or IPv4 literal.
fn host_extract_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:\[([^\]]+)\]|([^:\[\]]+))(?::\d+)?$").expect("static pattern")
    })
}

/// Extract the ACL destination from a requested `host:port`.
///
/// Strips the port and IPv6 brackets and lowercases the host. Returns
/// `None` when the input is not a plausible host, in which case the
/// request cannot be evaluated and must be denied.
#[must_use]
pub fn extract_destination(outbound_host: &str) -> Option<String> {
    let caps = host_extract_re().captures(outbound_host)?;
    let host = caps.get(1).or_else(|| caps.get(2))?.as_str();
    if host.is_empty() {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bare_hostname() {
        assert_eq!(
            extract_destination("example.com").unwrap(),
            "example.com"
        );
    }

    #[test]
    fn test_extract_strips_port() {
        assert_eq!(
            extract_destination("example.com:443").unwrap(),
            "example.com"
        );
    }

    #[test]
    fn test_extract_lowercases() {
        assert_eq!(
            extract_destination("API.Example.COM:80").unwrap(),
            "api.example.com"
        );
    }

    #[test]
    fn test_extract_ipv4_literal() {
        assert_eq!(
            extract_destination("93.184.216.34:443").unwrap(),
            "93.184.216.34"
        );
    }

    #[test]
    fn test_extract_bracketed_ipv6() {
        assert_eq!(extract_destination("[::1]:443").unwrap(), "::1");
        assert_eq!(
            extract_destination("[2001:DB8::1]").unwrap(),
            "2001:db8::1"
        );
    }

    #[test]
    fn test_extract_rejects_garbage() {
        assert!(extract_destination("").is_none());
        assert!(extract_destination(":443").is_none());
        assert!(extract_destination("[unclosed:443").is_none());
        assert!(extract_destination("a:b:c").is_none());
    }

    #[test]
    fn test_acl_error_display() {
        let err = AclError("policy file corrupted".to_string());
        assert_eq!(err.to_string(), "policy file corrupted");
    }
}
