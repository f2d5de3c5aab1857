//! Chains of forwarding hops
//!
//! A chain is a policy object producing a [`Route`] per call: the
//! router asks it for a path to the target, and each hop of the chain
//! picks one node. Returning no route at all means "no opinion";
//! returning an empty route means "no path is currently eligible".

pub mod connector;
pub mod hop;
pub mod node;
pub mod route;
pub mod router;

pub use connector::{Connector, ForwardConnector};
pub use hop::{Hop, NodeGroup, SelectHints, Strategy};
pub use node::{Marker, Node, NodeFilter, NodeTransport, TransportRegistry};
pub use route::Route;
pub use router::{Router, RouteTrace, TraceHop};

use std::sync::Arc;

use async_trait::async_trait;

use crate::common::{Address, Network};

/// Per-call options a router hands to the chain.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    /// The original target host, preserved across resolution so
    /// host-bound policies (and sticky hashing) see the name the
    /// client asked for.
    pub host: Option<String>,
}

impl RouteOptions {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

/// Policy object mapping a dial target to a route.
#[async_trait]
pub trait Chain: Send + Sync {
    /// Produce a route towards `addr`, or `None` to let the caller
    /// fall back to the default route.
    async fn route(&self, network: Network, addr: &Address, opts: &RouteOptions) -> Option<Route>;
}

/// A chain built from an ordered list of hops: every produced route
/// selects one node per hop.
pub struct NodeChain {
    hops: Vec<Arc<dyn Hop>>,
    transports: Arc<TransportRegistry>,
}

impl NodeChain {
    pub fn new(transports: Arc<TransportRegistry>) -> Self {
        Self {
            hops: Vec::new(),
            transports,
        }
    }

    pub fn with_hop(mut self, hop: Arc<dyn Hop>) -> Self {
        self.hops.push(hop);
        self
    }
}

#[async_trait]
impl Chain for NodeChain {
    async fn route(&self, _network: Network, addr: &Address, opts: &RouteOptions) -> Option<Route> {
        if self.hops.is_empty() {
            return None;
        }

        let host = opts.host.clone().unwrap_or_else(|| addr.host());
        let hints = SelectHints::default().with_host(host);

        let mut nodes = Vec::with_capacity(self.hops.len());
        for hop in &self.hops {
            match hop.select(&hints).await {
                Some(node) => nodes.push(node),
                // One hop without an eligible node breaks the whole
                // path.
                None => return Some(Route::empty(self.transports.clone())),
            }
        }
        Some(Route::new(nodes, self.transports.clone()))
    }
}
