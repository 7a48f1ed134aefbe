//! HTTP egress filtering proxy.
//!
//! ferryman-proxy sits between an internal fleet and the Internet and
//! decides, per request, whether a (client role, destination) pair may
//! talk. Two front-ends share one admission pipeline:
//!
//! 1. **Classic HTTP proxy** (`http`) - absolute-URI requests are admitted,
//!    then forwarded to the origin over a fresh idle-timed connection.
//!
//! 2. **CONNECT tunnel** (`connect`) - the target is admitted before the
//!    tunnel is established; allowed tunnels become tracked, instrumented
//!    connections whose idleness drives graceful shutdown.
//!
//! Admission runs role extraction, the egress ACL, and safe DNS resolution
//! in that order: the ACL judges the hostname, and the resolved IP is then
//! re-checked so a permitted hostname pointing at a forbidden address
//! (DNS rebinding, unintended internal target) is still blocked. Every
//! request produces exactly one `CANONICAL-PROXY-DECISION` audit line.

pub mod admission;
pub mod config;
pub mod connect;
pub mod conntrack;
pub mod dial;
pub mod error;
pub mod http;
pub mod log;
pub mod reject;
pub mod request;
pub mod resolve;
pub mod role;
pub mod server;
pub mod timeout;

pub use config::{Config, RoleFromRequest};
pub use error::{ProxyError, Result};
pub use server::{serve, Proxy};
