//! Egress policy core for the ferryman proxy.
//!
//! This crate holds the pure, I/O-free half of ferryman's admission logic:
//!
//! 1. **IP classification** ([`classify`]) - Map a resolved TCP address to
//!    an allow/deny verdict based on user rule ranges and the built-in
//!    private-range table.
//!
//! 2. **ACL contract** ([`acl`]) - The evaluator interface the proxy
//!    consults with a (role, destination) pair, plus the destination
//!    extraction applied to a requested `host:port`.
//!
//! 3. **Stats contract** ([`stats`]) - The statsd-style counter sink the
//!    proxy emits decision telemetry through.
//!
//! The async proxy in `ferryman-proxy` composes these with DNS resolution
//! and the connection lifecycle. Keeping this crate free of sockets keeps
//! every policy decision unit-testable with plain values.

pub mod acl;
pub mod classify;
pub mod stats;

pub use acl::{AclAction, AclError, AclJudgment, EgressAcl};
pub use classify::{classify_addr, IpClass, RuleRange};
pub use stats::{NoopStats, StatsClient};
