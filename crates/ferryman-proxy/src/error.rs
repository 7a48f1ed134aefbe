//! Error types for the ferryman proxy.
//!
//! The taxonomy matters for response synthesis: denial errors produce the
//! policy rejection template, everything else produces the generic
//! "unexpected" body. See [`crate::reject`].

use ferryman::classify::IpClass;
use std::net::IpAddr;
use thiserror::Error;

/// Errors that can occur while admitting or forwarding a request.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// A resolved address failed IP classification.
    #[error("The destination address ({ip}) was denied by rule '{class}'")]
    Denied { ip: IpAddr, class: IpClass },

    /// The admission pipeline denied the request for a policy reason.
    #[error("{0}")]
    PolicyDenied(String),

    /// The role extractor could not find a role on the request.
    #[error("{0}")]
    MissingRole(String),

    #[error("unknown network type {0:?}")]
    UnknownNetwork(String),

    #[error("no IPs resolved")]
    NoAddresses,

    #[error("invalid host:port {0:?}")]
    InvalidHostPort(String),

    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Whether this error is a policy denial (as opposed to a failure).
    #[must_use]
    pub fn is_denial(&self) -> bool {
        matches!(self, ProxyError::Denied { .. } | ProxyError::PolicyDenied(_))
    }

    /// Whether this is the missing-role sentinel.
    #[must_use]
    pub fn is_missing_role(&self) -> bool {
        matches!(self, ProxyError::MissingRole(_))
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_denied_message_names_address_and_rule() {
        let err = ProxyError::Denied {
            ip: "10.0.0.5".parse().unwrap(),
            class: IpClass::DenyPrivateRange,
        };
        assert_eq!(
            err.to_string(),
            "The destination address (10.0.0.5) was denied by rule 'Deny: Private Range'"
        );
        assert!(err.is_denial());
    }

    #[test]
    fn test_taxonomy_predicates() {
        assert!(ProxyError::PolicyDenied("no".to_string()).is_denial());
        assert!(!ProxyError::NoAddresses.is_denial());
        assert!(ProxyError::MissingRole("unset".to_string()).is_missing_role());
        assert!(!ProxyError::NoAddresses.is_missing_role());
    }
}
