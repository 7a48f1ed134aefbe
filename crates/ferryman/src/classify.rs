//! IP classification for resolved egress addresses.
//!
//! Every address the proxy is about to dial is classified exactly once, on
//! the resolution that produced it. The classification is a pure function
//! of (address, rule ranges): repeated calls return the same verdict.
//!
//! # Check Order
//!
//! 1. Non-global-unicast or loopback addresses are denied unless a user
//!    allow range matches them. This lets operators whitelist a specific
//!    internal target (a health service on loopback, a known internal
//!    CIDR) without opening the whole private-IP space.
//! 2. User allow ranges.
//! 3. User deny ranges. These take precedence over the built-in private
//!    table so operators can keep the defaults and layer narrower denies.
//! 4. The built-in private-range table (RFC1918, link-local, CGNAT,
//!    multicast, broadcast, documentation ranges, IPv6 ULA/link-local,
//!    and the IPv4-mapped forms).
//! 5. Everything else is allowed.

use ipnet::IpNet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::OnceLock;

/// A user-configured rule range: a CIDR plus an optional port.
///
/// A port of zero matches any port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRange {
    pub net: IpNet,
    pub port: u16,
}

impl RuleRange {
    #[must_use]
    pub fn new(net: IpNet, port: u16) -> Self {
        Self { net, port }
    }

    /// Whether this rule matches the given address.
    #[must_use]
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        if self.port != 0 && self.port != addr.port() {
            return false;
        }
        self.net.contains(&addr.ip()) || self.net.contains(&addr.ip().to_canonical())
    }
}

impl FromStr for RuleRange {
    type Err = ipnet::AddrParseError;

    /// Parses a bare CIDR into an any-port rule.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s.parse()?, 0))
    }
}

/// Verdict for a resolved address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpClass {
    /// Globally routable and not covered by any rule
    AllowDefault,
    /// Matched a user allow range
    AllowUserConfigured,
    /// Not a global unicast address (loopback, multicast, link-local, ...)
    DenyNotGlobalUnicast,
    /// Matched the built-in private-range table
    DenyPrivateRange,
    /// Matched a user deny range
    DenyUserConfigured,
}

impl IpClass {
    /// Whether the verdict permits dialing the address.
    #[must_use]
    pub fn is_allowed(self) -> bool {
        matches!(self, IpClass::AllowDefault | IpClass::AllowUserConfigured)
    }

    /// Counter name emitted once per classification.
    #[must_use]
    pub fn metric(self) -> &'static str {
        match self {
            IpClass::AllowDefault => "resolver.allow.default",
            IpClass::AllowUserConfigured => "resolver.allow.user_configured",
            IpClass::DenyNotGlobalUnicast => "resolver.deny.not_global_unicast",
            IpClass::DenyPrivateRange => "resolver.deny.private_range",
            IpClass::DenyUserConfigured => "resolver.deny.user_configured",
        }
    }
}

impl fmt::Display for IpClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IpClass::AllowDefault => "Allow: Default",
            IpClass::AllowUserConfigured => "Allow: User Configured",
            IpClass::DenyNotGlobalUnicast => "Deny: Not Global Unicast",
            IpClass::DenyPrivateRange => "Deny: Private Range",
            IpClass::DenyUserConfigured => "Deny: User Configured",
        };
        f.write_str(s)
    }
}

/// Ranges that are denied by default even though they are global unicast.
/// User deny ranges are consulted first, so narrower operator rules can
/// shadow entries here without editing the table.
fn private_ranges() -> &'static [IpNet] {
    static RANGES: OnceLock<Vec<IpNet>> = OnceLock::new();
    RANGES.get_or_init(|| {
        // Well-known CIDR literals; a parse failure would be a programming error.
        [
            "10.0.0.0/8",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "100.64.0.0/10",
            "169.254.0.0/16",
            "224.0.0.0/4",
            "255.255.255.255/32",
            "192.0.2.0/24",
            "198.51.100.0/24",
            "203.0.113.0/24",
            "fc00::/7",
            "fe80::/10",
            "::ffff:10.0.0.0/104",
            "::ffff:172.16.0.0/108",
            "::ffff:192.168.0.0/112",
            "::ffff:100.64.0.0/106",
            "::ffff:169.254.0.0/112",
            "::ffff:224.0.0.0/100",
        ]
        .iter()
        .filter_map(|s| s.parse::<IpNet>().ok())
        .collect()
    })
}

fn in_rule_ranges(ranges: &[RuleRange], addr: &SocketAddr) -> bool {
    ranges.iter().any(|r| r.matches(addr))
}

fn in_private_ranges(addr: &SocketAddr) -> bool {
    let ip = addr.ip();
    let canonical = ip.to_canonical();
    private_ranges()
        .iter()
        .any(|net| net.contains(&ip) || net.contains(&canonical))
}

/// Whether the address is a global unicast address.
///
/// False for unspecified, loopback, multicast, link-local, and the IPv4
/// broadcast address. RFC1918 addresses are global unicast; they are caught
/// by the private-range table instead.
fn is_global_unicast(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_link_local())
        }
        IpAddr::V6(v6) => {
            !(v6.is_unspecified()
                || v6.is_loopback()
                || v6.is_multicast()
                || (v6.segments()[0] & 0xffc0) == 0xfe80)
        }
    }
}

/// Classify a resolved address against the user rules.
///
/// The order of checks matters; see the module docs.
#[must_use]
pub fn classify_addr(
    allow_ranges: &[RuleRange],
    deny_ranges: &[RuleRange],
    addr: &SocketAddr,
) -> IpClass {
    let ip = addr.ip().to_canonical();

    if !is_global_unicast(ip) || ip.is_loopback() {
        if in_rule_ranges(allow_ranges, addr) {
            return IpClass::AllowUserConfigured;
        }
        return IpClass::DenyNotGlobalUnicast;
    }

    if in_rule_ranges(allow_ranges, addr) {
        IpClass::AllowUserConfigured
    } else if in_rule_ranges(deny_ranges, addr) {
        IpClass::DenyUserConfigured
    } else if in_private_ranges(addr) {
        IpClass::DenyPrivateRange
    } else {
        IpClass::AllowDefault
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn rule(cidr: &str, port: u16) -> RuleRange {
        RuleRange::new(cidr.parse().unwrap(), port)
    }

    #[test]
    fn test_public_address_allowed_by_default() {
        let class = classify_addr(&[], &[], &addr("93.184.216.34:443"));
        assert_eq!(class, IpClass::AllowDefault);
        assert!(class.is_allowed());
    }

    #[test]
    fn test_rfc1918_denied_as_private() {
        for a in ["10.0.0.5:80", "172.16.3.4:443", "192.168.1.10:22"] {
            let class = classify_addr(&[], &[], &addr(a));
            assert_eq!(class, IpClass::DenyPrivateRange, "{}", a);
        }
    }

    #[test]
    fn test_cgnat_and_documentation_denied_as_private() {
        assert_eq!(
            classify_addr(&[], &[], &addr("100.64.0.1:443")),
            IpClass::DenyPrivateRange
        );
        assert_eq!(
            classify_addr(&[], &[], &addr("192.0.2.7:443")),
            IpClass::DenyPrivateRange
        );
    }

    #[test]
    fn test_ipv6_ula_denied_as_private() {
        assert_eq!(
            classify_addr(&[], &[], &addr("[fd00::1]:443")),
            IpClass::DenyPrivateRange
        );
    }

    #[test]
    fn test_loopback_denied_as_not_global_unicast() {
        assert_eq!(
            classify_addr(&[], &[], &addr("127.0.0.1:8080")),
            IpClass::DenyNotGlobalUnicast
        );
        assert_eq!(
            classify_addr(&[], &[], &addr("[::1]:8080")),
            IpClass::DenyNotGlobalUnicast
        );
    }

    #[test]
    fn test_multicast_and_broadcast_not_global_unicast() {
        assert_eq!(
            classify_addr(&[], &[], &addr("224.0.0.1:0")),
            IpClass::DenyNotGlobalUnicast
        );
        assert_eq!(
            classify_addr(&[], &[], &addr("255.255.255.255:9")),
            IpClass::DenyNotGlobalUnicast
        );
    }

    #[test]
    fn test_allow_range_overrides_loopback_deny() {
        let allow = vec![rule("127.0.0.1/32", 0)];
        assert_eq!(
            classify_addr(&allow, &[], &addr("127.0.0.1:8080")),
            IpClass::AllowUserConfigured
        );
        // A different loopback address stays denied.
        assert_eq!(
            classify_addr(&allow, &[], &addr("127.0.0.2:8080")),
            IpClass::DenyNotGlobalUnicast
        );
    }

    #[test]
    fn test_allow_range_overrides_private_deny() {
        let allow = vec![rule("10.1.0.0/16", 0)];
        assert_eq!(
            classify_addr(&allow, &[], &addr("10.1.2.3:443")),
            IpClass::AllowUserConfigured
        );
        assert_eq!(
            classify_addr(&allow, &[], &addr("10.2.2.3:443")),
            IpClass::DenyPrivateRange
        );
    }

    #[test]
    fn test_deny_range_overrides_default_allow() {
        let deny = vec![rule("1.1.1.0/24", 0)];
        assert_eq!(
            classify_addr(&[], &deny, &addr("1.1.1.1:53")),
            IpClass::DenyUserConfigured
        );
    }

    #[test]
    fn test_allow_range_wins_over_deny_range() {
        let allow = vec![rule("1.1.1.1/32", 0)];
        let deny = vec![rule("1.1.1.0/24", 0)];
        assert_eq!(
            classify_addr(&allow, &deny, &addr("1.1.1.1:53")),
            IpClass::AllowUserConfigured
        );
    }

    #[test]
    fn test_rule_port_zero_matches_any_port() {
        let r = rule("10.0.0.0/8", 0);
        assert!(r.matches(&addr("10.0.0.1:80")));
        assert!(r.matches(&addr("10.0.0.1:65000")));
    }

    #[test]
    fn test_rule_port_must_match_when_nonzero() {
        let r = rule("10.0.0.0/8", 443);
        assert!(r.matches(&addr("10.0.0.1:443")));
        assert!(!r.matches(&addr("10.0.0.1:80")));
    }

    #[test]
    fn test_ipv4_mapped_addresses_classified_as_ipv4() {
        assert_eq!(
            classify_addr(&[], &[], &addr("[::ffff:10.0.0.5]:80")),
            IpClass::DenyPrivateRange
        );
        assert_eq!(
            classify_addr(&[], &[], &addr("[::ffff:127.0.0.1]:80")),
            IpClass::DenyNotGlobalUnicast
        );
        assert_eq!(
            classify_addr(&[], &[], &addr("[::ffff:93.184.216.34]:80")),
            IpClass::AllowDefault
        );
    }

    #[test]
    fn test_classification_is_deterministic() {
        let allow = vec![rule("10.1.0.0/16", 0)];
        let deny = vec![rule("1.1.1.0/24", 443)];
        for a in ["10.1.2.3:443", "1.1.1.1:443", "8.8.8.8:53", "[::1]:1"] {
            let first = classify_addr(&allow, &deny, &addr(a));
            for _ in 0..3 {
                assert_eq!(first, classify_addr(&allow, &deny, &addr(a)));
            }
        }
    }

    #[test]
    fn test_display_and_metric_names() {
        assert_eq!(IpClass::DenyPrivateRange.to_string(), "Deny: Private Range");
        assert_eq!(
            IpClass::AllowUserConfigured.to_string(),
            "Allow: User Configured"
        );
        assert_eq!(IpClass::AllowDefault.metric(), "resolver.allow.default");
        assert_eq!(
            IpClass::DenyNotGlobalUnicast.metric(),
            "resolver.deny.not_global_unicast"
        );
    }

    #[test]
    fn test_rule_range_from_str() {
        let r: RuleRange = "192.168.0.0/16".parse().unwrap();
        assert_eq!(r.port, 0);
        assert!(r.matches(&addr("192.168.1.1:9999")));
        assert!("not-a-cidr".parse::<RuleRange>().is_err());
    }
}
