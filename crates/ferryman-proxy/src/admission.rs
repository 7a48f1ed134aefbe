//! The request-admission pipeline.
//!
//! Order is load-bearing: role extraction, then the ACL at hostname
//! granularity, then resolution and IP classification of whatever the
//! hostname currently points at. The ACL is never consulted when the role
//! cannot be determined, and nothing is resolved for a request the ACL
//! already denied, so `acl.deny` counts pre-resolution denials only.

use crate::config::Config;
use crate::error::ProxyError;
use crate::request::RequestHead;
use crate::resolve::{safe_resolve, DENIED_BY_RULE_REASON};
use crate::role::get_role;
use ferryman::acl::{extract_destination, AclAction};
use std::net::SocketAddr;
use tracing::warn;

/// Per-request decision record. Created on request arrival, consumed by
/// the canonical decision log after the response phase.
#[derive(Debug, Clone)]
pub struct Decision {
    pub role: String,
    pub project: String,
    /// host:port as requested by the client.
    pub outbound_host: String,
    /// The address actually dialed, when admission succeeded.
    pub resolved_addr: Option<SocketAddr>,
    pub reason: String,
    pub allow: bool,
    /// True when the ACL reported the request would be denied under
    /// stricter enforcement.
    pub enforce_would_deny: bool,
}

impl Decision {
    /// Record for a request that failed before admission could run.
    pub(crate) fn unevaluated(outbound_host: &str) -> Self {
        Self::new(outbound_host)
    }

    fn new(outbound_host: &str) -> Self {
        Self {
            role: String::new(),
            project: String::new(),
            outbound_host: outbound_host.to_string(),
            resolved_addr: None,
            reason: String::new(),
            allow: false,
            enforce_would_deny: false,
        }
    }
}

/// Evaluate role extraction and the egress ACL for a request.
pub fn check_acls(config: &Config, req: &RequestHead, outbound_host: &str) -> Decision {
    let mut decision = Decision::new(outbound_host);

    let Some(acl) = &config.egress_acl else {
        decision.allow = true;
        decision.reason = "Egress ACL is not configured".to_string();
        return decision;
    };

    let role = match get_role(config, req) {
        Ok(role) => role,
        Err(_) => {
            config.stats.incr("acl.role_not_determined", &[]);
            decision.reason = "Client role cannot be determined".to_string();
            return decision;
        }
    };
    decision.role = role;

    let Some(destination) = extract_destination(outbound_host) else {
        decision.reason = "Invalid destination host".to_string();
        return decision;
    };

    let judgment = match acl.decide(&decision.role, &destination) {
        Ok(judgment) => judgment,
        Err(err) => {
            warn!(error = %err, role = %decision.role, "egress ACL returned an error");
            config.stats.incr("acl.decide_error", &[]);
            decision.reason = err.to_string();
            return decision;
        }
    };

    let tags = vec![
        format!("role:{}", decision.role),
        format!("def_rule:{}", judgment.default_rule),
        format!("project:{}", judgment.project),
    ];

    decision.project = judgment.project;
    decision.reason = judgment.reason;
    match judgment.action {
        AclAction::Deny => {
            decision.enforce_would_deny = true;
            config.stats.incr("acl.deny", &tags);
        }
        AclAction::AllowAndReport => {
            decision.allow = true;
            decision.enforce_would_deny = true;
            config.stats.incr("acl.report", &tags);
        }
        AclAction::Allow => {
            decision.allow = true;
            decision.enforce_would_deny = false;
            config.stats.incr("acl.allow", &tags);
        }
    }

    decision
}

/// Run the full admission pipeline for a request.
///
/// The second element carries a non-denial failure (DNS error, bad input)
/// that the front-end must surface as a generic rejection; the decision is
/// still returned so the canonical log line has its fields. A resolution
/// *denial* instead downgrades the decision in place.
pub async fn admit(
    config: &Config,
    req: &RequestHead,
    outbound_host: &str,
) -> (Decision, Option<ProxyError>) {
    let mut decision = check_acls(config, req, outbound_host);

    if decision.allow {
        match safe_resolve(config, "tcp", outbound_host).await {
            Ok((resolved, _reason)) => decision.resolved_addr = Some(resolved),
            Err(err) if err.is_denial() => {
                decision.reason = format!("{err}. {DENIED_BY_RULE_REASON}");
                decision.allow = false;
                decision.enforce_would_deny = true;
            }
            Err(err) => return (decision, Some(err)),
        }
    }

    (decision, None)
}
