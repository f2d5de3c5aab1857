//! Configuration module for Corridor
//!
//! JSON configuration: named building blocks (resolvers, hosts,
//! bypasses, limiters, recorders, hops, chains) wired into service
//! listeners. Names are referenced by the services; duplicates are a
//! startup error.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::chain::Strategy;
use crate::common::Network;
use crate::error::{Error, Result};
use crate::sniff::Protocol;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Named resolvers
    #[serde(default)]
    pub resolvers: Vec<ResolverConfig>,

    /// Named static host tables
    #[serde(default)]
    pub hosts: Vec<HostsConfig>,

    /// Named credential tables
    #[serde(default)]
    pub authers: Vec<AutherConfig>,

    /// Named bypass filters
    #[serde(default)]
    pub bypasses: Vec<BypassConfig>,

    /// Named admission filters
    #[serde(default)]
    pub admissions: Vec<AdmissionConfig>,

    /// Named request-rate limiters
    #[serde(default)]
    pub rlimiters: Vec<RateLimiterConfig>,

    /// Named traffic limiters
    #[serde(default)]
    pub limiters: Vec<TrafficLimiterConfig>,

    /// Named record sinks
    #[serde(default)]
    pub recorders: Vec<RecorderConfig>,

    /// Named node transports
    #[serde(default)]
    pub transports: Vec<TransportConfig>,

    /// Named hops (node groups)
    #[serde(default)]
    pub hops: Vec<HopConfig>,

    /// Named chains of hops
    #[serde(default)]
    pub chains: Vec<ChainConfig>,

    /// Service listeners
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// A small working example: one forward service over a two-node
    /// hop.
    pub fn example() -> Self {
        Config {
            log: LogConfig::default(),
            hops: vec![HopConfig {
                name: "upstreams".to_string(),
                strategy: Strategy::RoundRobin,
                nodes: vec![
                    NodeConfig {
                        name: "web-1".to_string(),
                        addr: "10.0.0.1:8080".to_string(),
                        ..Default::default()
                    },
                    NodeConfig {
                        name: "web-2".to_string(),
                        addr: "10.0.0.2:8080".to_string(),
                        ..Default::default()
                    },
                ],
            }],
            services: vec![ServiceConfig {
                name: "tcp-forward".to_string(),
                addr: ":8000".to_string(),
                network: Network::Tcp,
                handler: HandlerConfig {
                    kind: HandlerKind::Forward,
                    hop: Some("upstreams".to_string()),
                    metadata: MetadataConfig {
                        sniffing: true,
                        ..Default::default()
                    },
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub name: String,
    /// Only the OS resolver ships; richer resolvers plug in through
    /// the environment.
    #[serde(default = "default_resolver_kind")]
    pub kind: String,
}

fn default_resolver_kind() -> String {
    "system".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostsConfig {
    pub name: String,
    /// host -> IP list
    #[serde(default)]
    pub entries: HashMap<String, Vec<IpAddr>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutherConfig {
    pub name: String,
    /// user -> password
    #[serde(default)]
    pub users: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassConfig {
    pub name: String,
    /// Invert the match: only matching targets are relayed.
    #[serde(default)]
    pub whitelist: bool,
    /// Host names, wildcards, IPs or CIDR blocks.
    #[serde(default)]
    pub matchers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub name: String,
    #[serde(default)]
    pub whitelist: bool,
    #[serde(default)]
    pub matchers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub name: String,
    /// Connections per second per key.
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficLimiterConfig {
    pub name: String,
    /// Bytes per second per key.
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    pub name: String,
    /// File sink path, one JSON document per line.
    pub file: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    pub name: String,
    /// Source interface for dialing: an IP or a device name.
    #[serde(default)]
    pub interface: Option<String>,
    /// SO_MARK value (Linux).
    #[serde(default)]
    pub mark: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopConfig {
    pub name: String,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub addr: String,
    /// Network override for the node target, e.g. `unix`.
    #[serde(default)]
    pub network: Option<Network>,
    /// Named transport used to reach through this node.
    #[serde(default)]
    pub transport: Option<String>,
    /// Serve only matching hosts (exact or `*.` wildcard).
    #[serde(default)]
    pub host: Option<String>,
    /// Serve only connections sniffed as this protocol.
    #[serde(default)]
    pub protocol: Option<Protocol>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    /// Hop names, in forwarding order.
    #[serde(default)]
    pub hops: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Listen address, `host:port` or `:port`.
    pub addr: String,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub admission: Option<String>,
    pub handler: HandlerConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    #[default]
    Forward,
    Relay,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerConfig {
    #[serde(default)]
    pub kind: HandlerKind,

    /// Upstream hop (forward handler).
    #[serde(default)]
    pub hop: Option<String>,

    /// Chain the router dials through.
    #[serde(default)]
    pub chain: Option<String>,

    #[serde(default)]
    pub resolver: Option<String>,

    #[serde(default)]
    pub hosts: Option<String>,

    #[serde(default)]
    pub auther: Option<String>,

    #[serde(default)]
    pub bypass: Option<String>,

    /// Request-rate limiter name.
    #[serde(default)]
    pub rlimiter: Option<String>,

    /// Traffic limiter name.
    #[serde(default)]
    pub limiter: Option<String>,

    /// Recorder bindings: sink name plus the record tag it consumes.
    #[serde(default)]
    pub recorders: Vec<RecorderBindingConfig>,

    /// Router dial timeout in seconds; zero means the default.
    #[serde(default)]
    pub timeout: u64,

    /// Router retries per dial.
    #[serde(default)]
    pub retries: i32,

    #[serde(default)]
    pub metadata: MetadataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderBindingConfig {
    pub name: String,
    /// Record tag, e.g. `recorder.service.handler`.
    pub record: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default)]
    pub sniffing: bool,

    /// Sniffing read deadline in seconds; zero disables the deadline.
    #[serde(default = "default_sniffing_timeout")]
    pub sniffing_timeout: u64,

    /// Session request read deadline in seconds (relay handler).
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,

    /// Write the relay response eagerly instead of buffering it into
    /// the first payload write.
    #[serde(default)]
    pub no_delay: bool,

    /// PROXY protocol version for upstreams, 0 for none.
    #[serde(default)]
    pub proxy_protocol: u8,
}

fn default_sniffing_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    15
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            sniffing: false,
            sniffing_timeout: default_sniffing_timeout(),
            read_timeout: default_read_timeout(),
            no_delay: false,
            proxy_protocol: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_round_trips() {
        let config = Config::example();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.services.len(), 1);
        assert_eq!(parsed.hops[0].nodes.len(), 2);
        assert!(parsed.services[0].handler.metadata.sniffing);
    }

    #[test]
    fn test_minimal_service() {
        let config = Config::from_json(
            r#"{
                "services": [{
                    "name": "relay-in",
                    "addr": ":8421",
                    "handler": { "kind": "relay" }
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(config.services[0].handler.kind, HandlerKind::Relay);
        assert_eq!(config.services[0].network, Network::Tcp);
        assert_eq!(config.services[0].handler.metadata.read_timeout, 15);
    }

    #[test]
    fn test_bad_config_is_error() {
        assert!(Config::from_json("{ nope }").is_err());
    }
}
