//! Routes: ordered node lists that know how to dial and bind

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::trace;

use crate::common::{Address, Conn, Network, Result};
use crate::error::Error;
use crate::transport::{DialOptions, Listener, TcpTransport, Transport, UdpTransport};

use super::connector::ForwardConnector;
use super::node::{Node, NodeTransport, TransportRegistry};

/// An ordered, possibly empty list of nodes plus the dial/bind pair.
///
/// A route with zero nodes is the default route: operations run
/// directly against the OS. A non-empty route reaches the first node
/// (possibly through that node's own nested route), then asks each
/// node's connector to splice onward.
pub struct Route {
    nodes: Vec<Arc<Node>>,
    transports: Arc<TransportRegistry>,
}

impl Route {
    pub fn new(nodes: Vec<Arc<Node>>, transports: Arc<TransportRegistry>) -> Self {
        Self { nodes, transports }
    }

    /// The default route: direct I/O, no intermediate nodes.
    pub fn direct() -> Self {
        Self {
            nodes: Vec::new(),
            transports: Arc::new(TransportRegistry::new()),
        }
    }

    /// An empty route over an existing registry. Signals "no path is
    /// currently eligible" when returned by a chain.
    pub fn empty(transports: Arc<TransportRegistry>) -> Self {
        Self {
            nodes: Vec::new(),
            transports,
        }
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Pre-order enumeration of the route for tracing: for each node,
    /// the nodes of its transport's nested route come first, then the
    /// node itself.
    pub fn path(&self) -> Vec<Arc<Node>> {
        fn walk(nodes: &[Arc<Node>], transports: &TransportRegistry, out: &mut Vec<Arc<Node>>) {
            for node in nodes {
                if let Some(name) = node.transport_name() {
                    if let Some(tr) = transports.get(name) {
                        walk(&tr.route, transports, out);
                    }
                }
                out.push(node.clone());
            }
        }
        let mut out = Vec::new();
        walk(&self.nodes, &self.transports, &mut out);
        out
    }

    /// Open a stream (TCP) or message socket (UDP) ultimately
    /// targeted at `addr`.
    pub fn dial<'a>(
        &'a self,
        network: Network,
        addr: &'a Address,
        opts: &'a DialOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Conn>> + Send + 'a>> {
        Box::pin(async move {
            if self.nodes.is_empty() {
                return direct_dial(network, addr, opts).await;
            }

            let conn = self.establish(opts).await?;
            let last = self.nodes.last().expect("non-empty route");
            self.transport_of(last)
                .connector
                .connect(conn, network, addr)
                .await
        })
    }

    /// Open a listener on `addr` through the route. The empty route
    /// binds directly on the OS.
    pub async fn bind(&self, network: Network, addr: &Address) -> Result<Box<dyn Listener>> {
        if self.nodes.is_empty() {
            return direct_bind(network, addr).await;
        }

        let conn = self.establish(&DialOptions::default()).await?;
        let last = self.nodes.last().expect("non-empty route");
        self.transport_of(last).connector.bind(conn, network, addr).await
    }

    /// Connect up to the last node of the route, feeding each node's
    /// marker with the outcome of its own hop.
    async fn establish(&self, opts: &DialOptions) -> Result<Conn> {
        let first = &self.nodes[0];
        let mut conn = self.dial_node(first, opts).await?;

        for pair in self.nodes.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            trace!(node = next.name(), addr = %next.addr(), "extending route");
            match self
                .transport_of(prev)
                .connector
                .connect(conn, Network::Tcp, next.addr())
                .await
            {
                Ok(c) => {
                    next.marker().reset();
                    conn = c;
                }
                Err(e) => {
                    next.marker().mark();
                    return Err(e);
                }
            }
        }

        Ok(conn)
    }

    async fn dial_node(&self, node: &Arc<Node>, opts: &DialOptions) -> Result<Conn> {
        let tr = self.transport_of(node);

        let result = if tr.route.is_empty() {
            let opts = if tr.dial_opts.is_default() {
                opts
            } else {
                &tr.dial_opts
            };
            direct_dial(Network::Tcp, node.addr(), opts).await
        } else {
            let nested = Route::new(tr.route.clone(), Arc::clone(&self.transports));
            // dial() is already boxed to allow route recursion through nested transports.
            nested.dial(Network::Tcp, node.addr(), &tr.dial_opts).await
        };

        match result {
            Ok(conn) => {
                node.marker().reset();
                Ok(conn)
            }
            Err(e) => {
                node.marker().mark();
                Err(e)
            }
        }
    }

    fn transport_of(&self, node: &Node) -> Arc<NodeTransport> {
        node.transport_name()
            .and_then(|name| self.transports.get(name))
            .unwrap_or_else(|| {
                Arc::new(NodeTransport {
                    dial_opts: DialOptions::default(),
                    connector: Arc::new(ForwardConnector),
                    route: Vec::new(),
                })
            })
    }
}

async fn direct_dial(network: Network, addr: &Address, opts: &DialOptions) -> Result<Conn> {
    match network {
        Network::Tcp => TcpTransport::new().connect(addr, opts).await,
        Network::Udp => UdpTransport::new().connect(addr, opts).await,
        Network::Unix => {
            let stream = tokio::net::UnixStream::connect(addr.host()).await?;
            Ok(Conn::new(Box::new(stream), None, None))
        }
        Network::Serial => Err(Error::Config("serial targets bypass routes".into())),
    }
}

async fn direct_bind(network: Network, addr: &Address) -> Result<Box<dyn Listener>> {
    match network {
        Network::Tcp => TcpTransport::new().bind(addr).await,
        Network::Udp => UdpTransport::new().bind(addr).await,
        _ => Err(Error::Config(format!("cannot bind on network {}", network))),
    }
}
