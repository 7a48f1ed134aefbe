//! Runtime proxy configuration.
//!
//! Constructed once before start and never mutated. Collaborators that
//! need to observe shutdown receive the `shutting_down` flag at
//! construction; there is no process-wide global.

use crate::error::Result;
use crate::request::RequestHead;
use crate::resolve::{Resolver, SystemResolver};
use ferryman::acl::EgressAcl;
use ferryman::classify::RuleRange;
use ferryman::stats::{NoopStats, StatsClient};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Strategy deriving the client role from an inbound request.
///
/// Returning [`crate::ProxyError::MissingRole`] marks the role as absent
/// rather than failed; see [`crate::role::get_role`] for how
/// `allow_missing_role` treats that case.
pub type RoleFromRequest = Arc<dyn Fn(&RequestHead) -> Result<String> + Send + Sync>;

/// Configuration for the proxy. Read-only after start.
#[derive(Clone)]
pub struct Config {
    /// Rule ranges that are always allowed to be dialed.
    pub allow_ranges: Vec<RuleRange>,
    /// Rule ranges that are denied before the built-in private table.
    pub deny_ranges: Vec<RuleRange>,

    pub connect_timeout: Duration,
    /// Idle threshold for tunnels and forwarded connections.
    pub idle_timeout: Duration,
    /// Budget for graceful shutdown.
    pub exit_timeout: Duration,

    /// Treat an absent role as the empty role instead of rejecting.
    pub allow_missing_role: bool,
    /// Free text appended to rejection bodies.
    pub additional_error_message_on_deny: String,

    /// Policy evaluator. `None` allows every destination.
    pub egress_acl: Option<Arc<dyn EgressAcl>>,
    /// Role extraction strategy. `None` behaves as a missing role.
    pub role_from_request: Option<RoleFromRequest>,
    /// Host and port resolution; injectable for tests.
    pub resolver: Arc<dyn Resolver>,
    /// Counter sink for decision telemetry.
    pub stats: Arc<dyn StatsClient>,

    /// Flipped once by the shutdown supervisor; read by collaborators.
    pub shutting_down: Arc<AtomicBool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allow_ranges: Vec::new(),
            deny_ranges: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
            exit_timeout: Duration::from_secs(60),
            allow_missing_role: false,
            additional_error_message_on_deny: String::new(),
            egress_acl: None,
            role_from_request: None,
            resolver: Arc::new(SystemResolver),
            stats: Arc::new(NoopStats),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("allow_ranges", &self.allow_ranges)
            .field("deny_ranges", &self.deny_ranges)
            .field("connect_timeout", &self.connect_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("exit_timeout", &self.exit_timeout)
            .field("allow_missing_role", &self.allow_missing_role)
            .field("egress_acl", &self.egress_acl.is_some())
            .field("role_from_request", &self.role_from_request.is_some())
            .finish_non_exhaustive()
    }
}
