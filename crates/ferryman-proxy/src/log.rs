//! The canonical decision log line.
//!
//! One `CANONICAL-PROXY-DECISION` entry per request ties together role,
//! destination, resolved address, decision, and outcome. Level follows
//! the outcome: `error` for non-denial failures, `info` for allowed
//! requests, `warn` for everything denied.

use crate::admission::Decision;
use crate::error::ProxyError;
use crate::request::{ProxyMode, RequestHead};

/// Everything the canonical line needs, gathered by the front-ends.
pub struct DecisionRecord<'a> {
    pub mode: ProxyMode,
    pub head: &'a RequestHead,
    pub decision: &'a Decision,
    /// The host exactly as the client requested it, before any port
    /// synthesis. The decision's `outbound_host` is the dial target and
    /// is not substituted here.
    pub requested_host: &'a str,
    pub trace_id: &'a str,
    /// Request arrival, unix seconds.
    pub start_unix: u64,
    /// Response content length; zero for tunnels, -1 when unknown.
    pub content_length: i64,
    pub error: Option<&'a ProxyError>,
}

macro_rules! decision_event {
    ($level:ident, $r:expr, $dest_ip:expr, $dest_port:expr, $cn:expr, $ou:expr, $err:expr) => {
        tracing::$level!(
            target: "ferryman_proxy::audit",
            proxy_type = %$r.mode,
            src_host = %$r.head.peer.ip(),
            src_port = $r.head.peer.port(),
            requested_host = %$r.requested_host,
            dest_ip = $dest_ip,
            dest_port = $dest_port,
            start_time = $r.start_unix,
            content_length = $r.content_length,
            trace_id = %$r.trace_id,
            role = %$r.decision.role,
            project = %$r.decision.project,
            decision_reason = %$r.decision.reason,
            enforce_would_deny = $r.decision.enforce_would_deny,
            allow = $r.decision.allow,
            src_host_common_name = $cn,
            src_host_organization_unit = $ou,
            error = $err,
            "CANONICAL-PROXY-DECISION"
        )
    };
}

/// Emit the canonical decision line for a finished (or rejected) request.
pub fn log_decision(record: &DecisionRecord<'_>) {
    let (common_name, organizational_unit) = match &record.head.peer_identity {
        Some(identity) => (
            identity.common_name.as_str(),
            identity.organizational_unit.as_str(),
        ),
        None => ("unknown", "unknown"),
    };

    let dest_ip = record
        .decision
        .resolved_addr
        .map(|addr| addr.ip().to_string());
    let dest_ip = dest_ip.as_deref();
    let dest_port = record.decision.resolved_addr.map(|addr| addr.port());
    let err_msg = record.error.map(ProxyError::to_string);
    let err_msg = err_msg.as_deref();

    let hard_error = record.error.map(|e| !e.is_denial()).unwrap_or(false);
    if hard_error {
        decision_event!(
            error,
            record,
            dest_ip,
            dest_port,
            common_name,
            organizational_unit,
            err_msg
        );
    } else if record.decision.allow {
        decision_event!(
            info,
            record,
            dest_ip,
            dest_port,
            common_name,
            organizational_unit,
            err_msg
        );
    } else {
        decision_event!(
            warn,
            record,
            dest_ip,
            dest_port,
            common_name,
            organizational_unit,
            err_msg
        );
    }
}

/// Current time as unix seconds, captured at request arrival.
#[must_use]
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
