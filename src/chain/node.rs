//! Forwarding nodes and their liveness markers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::common::{Address, Network};
use crate::sniff::Protocol;
use crate::transport::DialOptions;

use super::connector::Connector;

/// Failures before a node is considered dead.
const FAIL_THRESHOLD: u32 = 3;

/// How long a dead node stays out of selection before it is probed
/// again.
const FAIL_COOLDOWN: Duration = Duration::from_secs(30);

/// An identified forwarding endpoint.
///
/// Nodes are immutable once published; only the attached [`Marker`]
/// carries mutable liveness state. The transport is referenced by
/// name and resolved through the [`TransportRegistry`] during route
/// construction, which keeps the node graph acyclic.
pub struct Node {
    name: String,
    addr: Address,
    network: Option<Network>,
    transport: Option<String>,
    filter: NodeFilter,
    marker: Marker,
}

impl Node {
    pub fn new(name: impl Into<String>, addr: Address) -> Self {
        Self {
            name: name.into(),
            addr,
            network: None,
            transport: None,
            filter: NodeFilter::default(),
            marker: Marker::new(),
        }
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = Some(transport.into());
        self
    }

    pub fn with_filter(mut self, filter: NodeFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &Address {
        &self.addr
    }

    /// Network override for dialing this node's target, e.g. `unix`.
    pub fn network(&self) -> Option<Network> {
        self.network
    }

    pub fn transport_name(&self) -> Option<&str> {
        self.transport.as_deref()
    }

    pub fn filter(&self) -> &NodeFilter {
        &self.filter
    }

    pub fn marker(&self) -> &Marker {
        &self.marker
    }
}

/// Selection filters attached to a node.
///
/// A node with a host filter only serves matching hosts; a leading
/// `*.` matches any subdomain. A protocol filter restricts the node
/// to sniffed connections of that protocol.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub host: Option<String>,
    pub protocol: Option<Protocol>,
}

impl NodeFilter {
    pub fn matches_host(&self, host: &str) -> bool {
        match &self.host {
            None => true,
            Some(pattern) => match pattern.strip_prefix("*.") {
                Some(suffix) => {
                    host.ends_with(suffix)
                        && host.len() > suffix.len()
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
                }
                None => pattern == host,
            },
        }
    }

    pub fn matches_protocol(&self, protocol: Option<Protocol>) -> bool {
        match self.protocol {
            None => true,
            Some(p) => protocol == Some(p),
        }
    }
}

/// Liveness counter attached to a node.
///
/// `mark` records a failure, `reset` a success. A node is dead once
/// the counter reaches the failure threshold, and stays dead for the
/// cooldown window after its last mark.
pub struct Marker {
    failures: AtomicU32,
    marked_at: AtomicU64,
}

impl Marker {
    pub fn new() -> Self {
        Self {
            failures: AtomicU32::new(0),
            marked_at: AtomicU64::new(0),
        }
    }

    /// Observe a failure.
    pub fn mark(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.marked_at.store(unix_secs(), Ordering::Relaxed);
    }

    /// Observe a success.
    pub fn reset(&self) {
        self.failures.store(0, Ordering::Relaxed);
        self.marked_at.store(0, Ordering::Relaxed);
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn is_dead(&self) -> bool {
        if self.failures.load(Ordering::Relaxed) < FAIL_THRESHOLD {
            return false;
        }
        let marked = self.marked_at.load(Ordering::Relaxed);
        unix_secs().saturating_sub(marked) < FAIL_COOLDOWN.as_secs()
    }
}

impl Default for Marker {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// How to reach a node and splice onward through it.
///
/// The nested route describes how to reach the node itself, enabling
/// recursive chains; it may be empty for a directly reachable node.
pub struct NodeTransport {
    pub dial_opts: DialOptions,
    pub connector: Arc<dyn Connector>,
    pub route: Vec<Arc<Node>>,
}

/// Named transports, resolved on demand during route construction.
#[derive(Default)]
pub struct TransportRegistry {
    map: HashMap<String, Arc<NodeTransport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, transport: NodeTransport) {
        self.map.insert(name.into(), Arc::new(transport));
    }

    pub fn get(&self, name: &str) -> Option<Arc<NodeTransport>> {
        self.map.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_threshold() {
        let marker = Marker::new();
        assert!(!marker.is_dead());

        marker.mark();
        marker.mark();
        assert!(!marker.is_dead());

        marker.mark();
        assert!(marker.is_dead());
        assert_eq!(marker.failures(), 3);

        marker.reset();
        assert!(!marker.is_dead());
        assert_eq!(marker.failures(), 0);
    }

    #[test]
    fn test_host_filter_wildcard() {
        let filter = NodeFilter {
            host: Some("*.example.com".to_string()),
            protocol: None,
        };
        assert!(filter.matches_host("www.example.com"));
        assert!(filter.matches_host("a.b.example.com"));
        assert!(!filter.matches_host("example.com"));
        assert!(!filter.matches_host("badexample.com"));
    }

    #[test]
    fn test_host_filter_exact() {
        let filter = NodeFilter {
            host: Some("example.com".to_string()),
            protocol: None,
        };
        assert!(filter.matches_host("example.com"));
        assert!(!filter.matches_host("www.example.com"));
    }
}
