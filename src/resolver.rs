//! Name resolution with static host overrides
//!
//! Resolution order: host mapper entry, configured resolver, OS
//! resolver. The first address matching the requested family wins.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::common::Address;
use crate::error::{Error, Result};

/// Address family filter for resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Family {
    /// Any IP family, first answer wins.
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

impl Family {
    fn matches(&self, ip: &IpAddr) -> bool {
        match self {
            Family::Any => true,
            Family::Ipv4 => ip.is_ipv4(),
            Family::Ipv6 => ip.is_ipv6(),
        }
    }
}

/// Hostname resolver.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Static host override table, consulted before any resolver.
#[async_trait]
pub trait HostMapper: Send + Sync {
    async fn lookup(&self, host: &str) -> Vec<IpAddr>;
}

/// Resolver backed by the OS resolver.
#[derive(Default)]
pub struct SystemResolver;

impl SystemResolver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|_| Error::UnresolvableHost(host.to_string()))?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Fixed name → IP table.
pub struct StaticHostMapper {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticHostMapper {
    pub fn new(hosts: HashMap<String, Vec<IpAddr>>) -> Self {
        Self { hosts }
    }
}

#[async_trait]
impl HostMapper for StaticHostMapper {
    async fn lookup(&self, host: &str) -> Vec<IpAddr> {
        self.hosts.get(host).cloned().unwrap_or_default()
    }
}

/// Translate a dial address into an IP address of the requested
/// family. Socket addresses pass through unchanged; domain addresses
/// go through the mapper, then the resolver, then the OS resolver.
pub async fn resolve(
    address: &Address,
    family: Family,
    resolver: Option<&Arc<dyn Resolver>>,
    host_mapper: Option<&Arc<dyn HostMapper>>,
) -> Result<Address> {
    let (host, port) = match address {
        Address::Socket(_) => return Ok(address.clone()),
        Address::Domain(host, port) => (host.as_str(), *port),
    };

    if let Some(mapper) = host_mapper {
        let ips = mapper.lookup(host).await;
        if let Some(ip) = ips.iter().find(|ip| family.matches(ip)) {
            trace!(host, %ip, "host mapper hit");
            return Ok(Address::Socket((*ip, port).into()));
        }
    }

    let ips = match resolver {
        Some(r) => r.resolve(host).await?,
        None => SystemResolver.resolve(host).await?,
    };

    ips.iter()
        .find(|ip| family.matches(ip))
        .map(|ip| Address::Socket((*ip, port).into()))
        .ok_or_else(|| Error::UnresolvableHost(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedResolver(Vec<IpAddr>);

    #[async_trait]
    impl Resolver for FixedResolver {
        async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_socket_address_passes_through() {
        let addr: Address = "192.0.2.7:80".parse().unwrap();
        let out = resolve(&addr, Family::Any, None, None).await.unwrap();
        assert_eq!(out, addr);
    }

    #[tokio::test]
    async fn test_host_mapper_wins() {
        let mut hosts = HashMap::new();
        hosts.insert("example.com".to_string(), vec!["10.0.0.1".parse().unwrap()]);
        let mapper: Arc<dyn HostMapper> = Arc::new(StaticHostMapper::new(hosts));

        let resolver: Arc<dyn Resolver> =
            Arc::new(FixedResolver(vec!["192.0.2.1".parse().unwrap()]));

        let addr: Address = "example.com:443".parse().unwrap();
        let out = resolve(&addr, Family::Any, Some(&resolver), Some(&mapper))
            .await
            .unwrap();
        assert_eq!(out.to_string(), "10.0.0.1:443");
    }

    #[tokio::test]
    async fn test_family_filter() {
        let resolver: Arc<dyn Resolver> = Arc::new(FixedResolver(vec![
            "2001:db8::1".parse().unwrap(),
            "192.0.2.1".parse().unwrap(),
        ]));

        let addr: Address = "example.com:80".parse().unwrap();
        let out = resolve(&addr, Family::Ipv4, Some(&resolver), None)
            .await
            .unwrap();
        assert_eq!(out.to_string(), "192.0.2.1:80");
    }

    #[tokio::test]
    async fn test_no_family_match_fails() {
        let resolver: Arc<dyn Resolver> =
            Arc::new(FixedResolver(vec!["2001:db8::1".parse().unwrap()]));

        let addr: Address = "example.com:80".parse().unwrap();
        let err = resolve(&addr, Family::Ipv4, Some(&resolver), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvableHost(_)));
    }
}
