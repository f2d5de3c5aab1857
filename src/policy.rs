//! Admission, bypass and authentication policies
//!
//! Narrow collaborator contracts the handlers consult. The engine
//! only calls these traits; the set-based implementations here cover
//! the configuration file, anything richer plugs in from outside.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;

use crate::common::{split_host, Network};

/// Credential check. Returns the client id on success.
#[async_trait]
pub trait Auther: Send + Sync {
    async fn authenticate(&self, user: &str, pass: &str) -> Option<String>;
}

/// Client admission check, consulted before a connection is handled.
#[async_trait]
pub trait Admission: Send + Sync {
    async fn admit(&self, addr: &str) -> bool;
}

/// Target bypass check: `true` means the target must not be relayed.
#[async_trait]
pub trait Bypass: Send + Sync {
    async fn contains(&self, network: Network, addr: &str) -> bool;
}

/// Fixed user/password table; the user name doubles as client id.
#[derive(Default)]
pub struct StaticAuther {
    users: HashMap<String, String>,
}

impl StaticAuther {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl Auther for StaticAuther {
    async fn authenticate(&self, user: &str, pass: &str) -> Option<String> {
        match self.users.get(user) {
            Some(expected) if expected == pass => Some(user.to_string()),
            _ => None,
        }
    }
}

/// A single address pattern: an exact host, a `*.` host wildcard, an
/// IP, or a CIDR block.
#[derive(Debug, Clone)]
pub enum Pattern {
    Host(String),
    Cidr { net: IpAddr, prefix: u8 },
}

impl Pattern {
    /// Parse `10.0.0.0/8`, `192.0.2.1`, `example.com` or
    /// `*.example.com`.
    pub fn parse(s: &str) -> Self {
        if let Some((addr, prefix)) = s.split_once('/') {
            if let (Ok(net), Ok(prefix)) = (addr.parse::<IpAddr>(), prefix.parse::<u8>()) {
                return Pattern::Cidr { net, prefix };
            }
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            let prefix = if ip.is_ipv4() { 32 } else { 128 };
            return Pattern::Cidr { net: ip, prefix };
        }
        Pattern::Host(s.to_string())
    }

    pub fn matches(&self, host: &str) -> bool {
        match self {
            Pattern::Host(pattern) => match pattern.strip_prefix("*.") {
                Some(suffix) => {
                    host.ends_with(suffix)
                        && host.len() > suffix.len()
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
                }
                None => pattern == host,
            },
            Pattern::Cidr { net, prefix } => match host.parse::<IpAddr>() {
                Ok(ip) => cidr_contains(net, *prefix, &ip),
                Err(_) => false,
            },
        }
    }
}

fn cidr_contains(net: &IpAddr, prefix: u8, ip: &IpAddr) -> bool {
    match (net, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let bits = u32::from(prefix.min(32));
            if bits == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - bits);
            u32::from(*net) & mask == u32::from(*ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let bits = u32::from(prefix.min(128));
            if bits == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - bits);
            u128::from(*net) & mask == u128::from(*ip) & mask
        }
        _ => false,
    }
}

/// Bypass built from a pattern list. In whitelist mode the meaning
/// inverts: only matching targets are relayed, everything else is
/// bypassed.
pub struct StaticBypass {
    patterns: Vec<Pattern>,
    whitelist: bool,
}

impl StaticBypass {
    pub fn new(patterns: Vec<Pattern>, whitelist: bool) -> Self {
        Self {
            patterns,
            whitelist,
        }
    }
}

#[async_trait]
impl Bypass for StaticBypass {
    async fn contains(&self, _network: Network, addr: &str) -> bool {
        let host = split_host(addr);
        let matched = self.patterns.iter().any(|p| p.matches(host));
        if self.whitelist {
            !matched
        } else {
            matched
        }
    }
}

/// Admission filter on client addresses. Same whitelist semantics as
/// [`StaticBypass`]: in whitelist mode only matching clients get in.
pub struct StaticAdmission {
    patterns: Vec<Pattern>,
    whitelist: bool,
}

impl StaticAdmission {
    pub fn new(patterns: Vec<Pattern>, whitelist: bool) -> Self {
        Self {
            patterns,
            whitelist,
        }
    }
}

#[async_trait]
impl Admission for StaticAdmission {
    async fn admit(&self, addr: &str) -> bool {
        let host = split_host(addr);
        let matched = self.patterns.iter().any(|p| p.matches(host));
        if self.whitelist {
            matched
        } else {
            !matched
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_auther() {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "secret".to_string());
        let auther = StaticAuther::new(users);

        assert_eq!(
            auther.authenticate("alice", "secret").await,
            Some("alice".to_string())
        );
        assert_eq!(auther.authenticate("alice", "wrong").await, None);
        assert_eq!(auther.authenticate("bob", "secret").await, None);
    }

    #[test]
    fn test_cidr_pattern() {
        let pattern = Pattern::parse("10.0.0.0/8");
        assert!(pattern.matches("10.1.2.3"));
        assert!(!pattern.matches("11.0.0.1"));
        assert!(!pattern.matches("example.com"));
    }

    #[test]
    fn test_host_patterns() {
        assert!(Pattern::parse("example.com").matches("example.com"));
        assert!(Pattern::parse("*.example.com").matches("www.example.com"));
        assert!(!Pattern::parse("*.example.com").matches("example.com"));
    }

    #[tokio::test]
    async fn test_bypass_blacklist() {
        let bypass =
            StaticBypass::new(vec![Pattern::parse("10.0.0.0/8")], false);
        assert!(bypass.contains(Network::Tcp, "10.0.0.1:22").await);
        assert!(!bypass.contains(Network::Tcp, "192.0.2.1:22").await);
    }

    #[tokio::test]
    async fn test_bypass_whitelist() {
        let bypass =
            StaticBypass::new(vec![Pattern::parse("*.internal.example.com")], true);
        assert!(!bypass
            .contains(Network::Tcp, "db.internal.example.com:5432")
            .await);
        assert!(bypass.contains(Network::Tcp, "example.org:80").await);
    }

    #[tokio::test]
    async fn test_admission() {
        let admission = StaticAdmission::new(vec![Pattern::parse("192.0.2.0/24")], true);
        assert!(admission.admit("192.0.2.7:40000").await);
        assert!(!admission.admit("198.51.100.1:40000").await);
    }
}
