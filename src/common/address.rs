//! Dial and listen addresses

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use crate::error::Error;

/// A dial or listen target: either a concrete socket address or a
/// name that still needs resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// The host part: the IP text of a socket address, or the name of
    /// a domain address.
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(host, _) => host.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => addr.fmt(f),
            Address::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Parse `host:port`, `ip:port` or `:port`. A missing host maps
    /// to the unspecified IPv4 address; a bare host (or unix socket
    /// path) carries no port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Socket(addr));
        }

        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid port in address: {}", s)))?;
                (host, port)
            }
            None => (s, 0),
        };

        if host.is_empty() {
            return Ok(Address::Socket(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port,
            )));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Address::Socket(SocketAddr::new(ip, port)));
        }
        Ok(Address::Domain(host.to_string(), port))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

/// Split a `host:port` string into its host part, falling back to the
/// whole string when there is no port separator.
pub fn split_host(addr: &str) -> &str {
    match addr.rsplit_once(':') {
        Some((host, _)) => host,
        None => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_socket() {
        let addr: Address = "127.0.0.1:8080".parse().unwrap();
        assert!(matches!(addr, Address::Socket(_)));
        assert_eq!(addr.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn test_parse_domain() {
        let addr: Address = "example.com:443".parse().unwrap();
        assert_eq!(addr, Address::Domain("example.com".to_string(), 443));
        assert_eq!(addr.host(), "example.com");
        assert_eq!(addr.to_string(), "example.com:443");
    }

    #[test]
    fn test_parse_unspecified() {
        let addr: Address = ":9000".parse().unwrap();
        assert_eq!(addr.to_string(), "0.0.0.0:9000");
    }

    #[test]
    fn test_parse_portless() {
        // Unix socket paths and bare names ride through with port 0.
        let addr: Address = "/run/app.sock".parse().unwrap();
        assert_eq!(addr.host(), "/run/app.sock");
    }

    #[test]
    fn test_bad_port_is_error() {
        assert!("example.com:notaport".parse::<Address>().is_err());
    }

    #[test]
    fn test_split_host() {
        assert_eq!(split_host("example.com:80"), "example.com");
        assert_eq!(split_host("example.com"), "example.com");
    }
}
