//! Address classification and admission policies for accepted connections.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid prefix length /{0}")]
    InvalidPrefix(u8),
    #[error("Invalid policy rule: {0}")]
    InvalidRule(String),
}

/// Returns `true` for addresses that never leave the host or the local network: loopback,
/// private ranges, link-local, shared address space and the unspecified address.
pub fn is_internal(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => is_internal_v6(v6),
    }
}

fn is_internal_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback() ||
        ip.is_private() ||
        ip.is_link_local() ||
        ip.is_unspecified() ||
        // 100.64.0.0/10, carrier-grade NAT
        (a == 100 && (b & 0xc0) == 64)
}

fn is_internal_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback() ||
        ip.is_unspecified() ||
        // unique local fc00::/7
        (first & 0xfe00) == 0xfc00 ||
        // link local fe80::/10 and the deprecated site local fec0::/10
        (first & 0xffc0) == 0xfe80 ||
        (first & 0xffc0) == 0xfec0
}

/// An address prefix, like `10.0.0.0/8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, PolicyError> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(PolicyError::InvalidPrefix(prefix));
        }
        Ok(Self { addr, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => prefix_matches(
                u128::from(u32::from(net)) << 96,
                u128::from(u32::from(ip)) << 96,
                self.prefix,
            ),
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                prefix_matches(u128::from(net), u128::from(ip), self.prefix)
            }
            _ => false,
        }
    }
}

fn prefix_matches(net: u128, ip: u128, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = u128::MAX << (128 - u32::from(prefix));
    net & mask == ip & mask
}

impl FromStr for IpNet {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let prefix =
                    prefix.parse::<u8>().map_err(|_| PolicyError::InvalidAddress(s.to_string()))?;
                (addr, Some(prefix))
            }
            None => (s, None),
        };

        let addr = addr
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map_err(|_| PolicyError::InvalidAddress(s.to_string()))?;
        let prefix = prefix.unwrap_or(if addr.is_ipv4() { 32 } else { 128 });
        Self::new(addr, prefix)
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyAction {
    Accept,
    Reject,
}

/// One `accept`/`reject` rule. A rule without a network matches every address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PolicyRule {
    pub action: PolicyAction,
    pub net: Option<IpNet>,
}

impl PolicyRule {
    pub fn accept(net: IpNet) -> Self {
        Self { action: PolicyAction::Accept, net: Some(net) }
    }

    pub fn reject(net: IpNet) -> Self {
        Self { action: PolicyAction::Reject, net: Some(net) }
    }

    fn matches(&self, ip: IpAddr) -> bool {
        self.net.map_or(true, |net| net.contains(ip))
    }
}

impl FromStr for PolicyRule {
    type Err = PolicyError;

    /// Parses rules like `accept 10.0.0.0/8` and `reject *`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let action = match parts.next() {
            Some("accept") => PolicyAction::Accept,
            Some("reject") => PolicyAction::Reject,
            _ => return Err(PolicyError::InvalidRule(s.to_string())),
        };
        let net = match parts.next() {
            Some("*") => None,
            Some(net) => Some(net.parse()?),
            None => return Err(PolicyError::InvalidRule(s.to_string())),
        };
        if parts.next().is_some() {
            return Err(PolicyError::InvalidRule(s.to_string()));
        }
        Ok(Self { action, net })
    }
}

/// An ordered list of rules; the first match decides. Addresses no rule matches are accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressPolicy {
    rules: Vec<PolicyRule>,
}

impl AddressPolicy {
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Accepts only loopback and private addresses.
    pub fn internal_only() -> Self {
        let mut policy = Self::default();
        for net in [
            "127.0.0.0/8",
            "10.0.0.0/8",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "::1",
            "fc00::/7",
        ] {
            if let Ok(net) = net.parse() {
                policy.push(PolicyRule::accept(net));
            }
        }
        policy.push(PolicyRule { action: PolicyAction::Reject, net: None });
        policy
    }

    pub fn push(&mut self, rule: PolicyRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        self.rules
            .iter()
            .find(|rule| rule.matches(ip))
            .map_or(true, |rule| rule.action == PolicyAction::Accept)
    }
}

impl FromStr for AddressPolicy {
    type Err = PolicyError;

    /// Parses a comma separated list of rules.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rules = s
            .split(',')
            .map(str::trim)
            .filter(|rule| !rule.is_empty())
            .map(str::parse)
            .collect::<Result<_, _>>()?;
        Ok(Self { rules })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn internal_addresses() {
        for addr in ["127.0.0.1", "10.1.2.3", "192.168.1.1", "172.31.0.1", "100.100.0.1", "0.0.0.0"]
        {
            assert!(is_internal(ip(addr)), "{addr}");
        }
        for addr in ["::1", "fd00::1", "fe80::1", "::ffff:10.0.0.1"] {
            assert!(is_internal(ip(addr)), "{addr}");
        }
        for addr in ["8.8.8.8", "100.128.0.1", "172.32.0.1", "2001:db8::1", "::ffff:1.1.1.1"] {
            assert!(!is_internal(ip(addr)), "{addr}");
        }
    }

    #[test]
    fn net_containment() {
        let net: IpNet = "10.0.0.0/8".parse().unwrap();
        assert!(net.contains(ip("10.255.0.1")));
        assert!(net.contains(ip("::ffff:10.0.0.1")));
        assert!(!net.contains(ip("11.0.0.1")));
        assert!(!net.contains(ip("::1")));

        let host: IpNet = "[2001:db8::1]".parse().unwrap();
        assert_eq!(host.to_string(), "2001:db8::1/128");
        assert!(host.contains(ip("2001:db8::1")));
        assert!(!host.contains(ip("2001:db8::2")));

        assert!("0.0.0.0/0".parse::<IpNet>().unwrap().contains(ip("1.2.3.4")));
        assert_eq!("1.2.3.4/33".parse::<IpNet>(), Err(PolicyError::InvalidPrefix(33)));
    }

    #[test]
    fn first_matching_rule_wins() {
        let policy: AddressPolicy =
            "accept 10.1.0.0/16, reject 10.0.0.0/8, accept *".parse().unwrap();
        assert!(policy.allows(ip("10.1.2.3")));
        assert!(!policy.allows(ip("10.2.0.1")));
        assert!(policy.allows(ip("8.8.8.8")));
        assert_eq!(policy.rules().len(), 3);

        assert!(AddressPolicy::accept_all().allows(ip("1.1.1.1")));
        assert!("allow 1.2.3.4".parse::<AddressPolicy>().is_err());
        assert!("reject".parse::<AddressPolicy>().is_err());
    }

    #[test]
    fn internal_only_policy() {
        let policy = AddressPolicy::internal_only();
        assert!(policy.allows(ip("127.0.0.1")));
        assert!(policy.allows(ip("192.168.0.10")));
        assert!(!policy.allows(ip("203.0.113.5")));
    }
}
