//! Router: the user-facing dialer/binder
//!
//! Resolves the target, consults the chain for a route, retries, and
//! reports the route it actually took. Dial telemetry goes to the
//! recorder bindings under the router tags.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::app::metrics;
use crate::chain::{Chain, Route, RouteOptions};
use crate::common::{Address, Conn, Network, Result};
use crate::error::Error;
use crate::recorder::{
    RecorderBinding, RECORDER_SERVICE_ROUTER_DIAL_ADDRESS,
    RECORDER_SERVICE_ROUTER_DIAL_ADDRESS_ERROR,
};
use crate::resolver::{self, Family, HostMapper, Resolver};
use crate::transport::{DialOptions, Listener};

/// Dial/bind deadline applied when none is configured.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// The route a dial actually took, rendered as
/// `name@addr > name@addr > … > target`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTrace {
    hops: Vec<TraceHop>,
    target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceHop {
    pub name: String,
    pub addr: String,
}

impl RouteTrace {
    pub fn of(route: &Route, target: &Address) -> Self {
        Self {
            hops: route
                .path()
                .iter()
                .map(|node| TraceHop {
                    name: node.name().to_string(),
                    addr: node.addr().to_string(),
                })
                .collect(),
            target: target.to_string(),
        }
    }

    pub fn hops(&self) -> &[TraceHop] {
        &self.hops
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Parse a rendered trace back into hops and target.
    pub fn parse(s: &str) -> Self {
        let mut hops = Vec::new();
        let mut target = String::new();
        for part in s.split(" > ") {
            match part.split_once('@') {
                Some((name, addr)) => hops.push(TraceHop {
                    name: name.to_string(),
                    addr: addr.to_string(),
                }),
                None => target = part.to_string(),
            }
        }
        Self { hops, target }
    }
}

impl std::fmt::Display for RouteTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for hop in &self.hops {
            write!(f, "{}@{} > ", hop.name, hop.addr)?;
        }
        f.write_str(&self.target)
    }
}

/// Resolving, retrying, tracing dialer.
pub struct Router {
    chain: Option<Arc<dyn Chain>>,
    resolver: Option<Arc<dyn Resolver>>,
    host_mapper: Option<Arc<dyn HostMapper>>,
    timeout: Duration,
    retries: i32,
    dial_opts: DialOptions,
    recorders: Vec<RecorderBinding>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            chain: None,
            resolver: None,
            host_mapper: None,
            timeout: DEFAULT_TIMEOUT,
            retries: 0,
            dial_opts: DialOptions::default(),
            recorders: Vec::new(),
        }
    }

    pub fn with_chain(mut self, chain: Arc<dyn Chain>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_host_mapper(mut self, host_mapper: Arc<dyn HostMapper>) -> Self {
        self.host_mapper = Some(host_mapper);
        self
    }

    /// Zero means the default of 15 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        self
    }

    /// Negative values normalize to a single attempt.
    pub fn with_retries(mut self, retries: i32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_dial_opts(mut self, opts: DialOptions) -> Self {
        self.dial_opts = opts;
        self
    }

    pub fn with_recorders(mut self, recorders: Vec<RecorderBinding>) -> Self {
        self.recorders = recorders;
        self
    }

    /// Dial `addr` over `network`, returning the connection and the
    /// route it took.
    pub async fn dial(&self, network: Network, addr: &Address) -> Result<(Conn, RouteTrace)> {
        let host = addr.host();
        self.record(RECORDER_SERVICE_ROUTER_DIAL_ADDRESS, host.as_bytes())
            .await;
        metrics::ROUTER_DIALS_TOTAL.inc();

        let attempt = tokio::time::timeout(self.timeout, self.dial_with_retries(network, addr));
        let result = match attempt.await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };

        match result {
            Ok((conn, trace)) => {
                // Chains may hand back a plain byte stream for UDP
                // targets; present packet semantics either way.
                let conn = if network.is_udp() && !conn.is_datagram() {
                    conn.datagram()
                } else {
                    conn
                };
                Ok((conn, trace))
            }
            Err(e) => {
                self.record(RECORDER_SERVICE_ROUTER_DIAL_ADDRESS_ERROR, host.as_bytes())
                    .await;
                metrics::ROUTER_DIAL_ERRORS_TOTAL.inc();
                Err(e)
            }
        }
    }

    async fn dial_with_retries(
        &self,
        network: Network,
        addr: &Address,
    ) -> Result<(Conn, RouteTrace)> {
        let count = (self.retries + 1).max(1) as usize;
        debug!(%addr, %network, "dial");

        let mut last_err = None;
        for retry in 0..count {
            // Resolution failures are terminal for this dial.
            let ip_addr = match resolver::resolve(
                addr,
                Family::Any,
                self.resolver.as_ref(),
                self.host_mapper.as_ref(),
            )
            .await
            {
                Ok(a) => a,
                Err(e) => {
                    error!(%addr, %e, "resolve");
                    last_err = Some(e);
                    break;
                }
            };

            // The chain sees the original host so host-bound policies
            // survive resolution.
            let opts = RouteOptions::default().with_host(addr.host());
            let route = match &self.chain {
                Some(chain) => chain.route(network, &ip_addr, &opts).await,
                None => None,
            };
            let route = route.unwrap_or_else(Route::direct);

            let trace = RouteTrace::of(&route, &ip_addr);
            debug!(retry, route = %trace, "route");

            match route.dial(network, &ip_addr, &self.dial_opts).await {
                Ok(conn) => return Ok((conn, trace)),
                Err(e) => {
                    error!(retry, %e, "route dial");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::Dial(addr.to_string(), "no dial attempt".to_string())))
    }

    /// Open a listener on `addr` through the configured chain. Unlike
    /// dialing, binding requires an explicit forwarding path: a chain
    /// producing an empty route is an immediate error.
    pub async fn bind(&self, network: Network, addr: &Address) -> Result<Box<dyn Listener>> {
        let attempt = tokio::time::timeout(self.timeout, self.bind_with_retries(network, addr));
        match attempt.await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn bind_with_retries(
        &self,
        network: Network,
        addr: &Address,
    ) -> Result<Box<dyn Listener>> {
        let count = (self.retries + 1).max(1) as usize;
        debug!(%addr, %network, "bind");

        let mut last_err = None;
        for retry in 0..count {
            // No resolution on the bind path: the address is verbatim.
            let route = match &self.chain {
                Some(chain) => {
                    let route = chain
                        .route(network, addr, &RouteOptions::default())
                        .await;
                    match route {
                        Some(route) if route.is_empty() => return Err(Error::EmptyRoute),
                        other => other,
                    }
                }
                None => None,
            };
            let route = route.unwrap_or_else(Route::direct);

            let trace = RouteTrace::of(&route, addr);
            debug!(retry, route = %trace, "route");

            match route.bind(network, addr).await {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    error!(retry, %e, "route bind");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::Dial(addr.to_string(), "no bind attempt".to_string())))
    }

    /// Emit dial telemetry to the first binding matching `tag`.
    /// Recorder failures are logged, never surfaced.
    async fn record(&self, tag: &str, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        for binding in &self.recorders {
            if binding.tag == tag {
                if let Err(e) = binding.recorder.record(data).await {
                    error!(tag, %e, "record");
                }
                return;
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{NodeChain, TransportRegistry};
    use crate::recorder::testing::MemoryRecorder;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Chain returning a fixed kind of route and counting calls.
    struct FixedChain {
        kind: RouteKind,
        calls: AtomicUsize,
    }

    enum RouteKind {
        None,
        Empty,
    }

    #[async_trait]
    impl Chain for FixedChain {
        async fn route(
            &self,
            _network: Network,
            _addr: &Address,
            _opts: &RouteOptions,
        ) -> Option<Route> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.kind {
                RouteKind::None => None,
                RouteKind::Empty => {
                    Some(Route::empty(Arc::new(TransportRegistry::new())))
                }
            }
        }
    }

    #[test]
    fn test_trace_round_trip() {
        let trace = RouteTrace {
            hops: vec![
                TraceHop {
                    name: "a".to_string(),
                    addr: "10.0.0.1:1080".to_string(),
                },
                TraceHop {
                    name: "b".to_string(),
                    addr: "10.0.0.2:1080".to_string(),
                },
            ],
            target: "192.0.2.1:80".to_string(),
        };

        let rendered = trace.to_string();
        assert_eq!(rendered, "a@10.0.0.1:1080 > b@10.0.0.2:1080 > 192.0.2.1:80");
        assert_eq!(RouteTrace::parse(&rendered), trace);
    }

    #[tokio::test]
    async fn test_bind_empty_route_fails_without_retry() {
        let chain = Arc::new(FixedChain {
            kind: RouteKind::Empty,
            calls: AtomicUsize::new(0),
        });
        let router = Router::new().with_chain(chain.clone()).with_retries(3);

        let addr: Address = ":0".parse().unwrap();
        let err = router.bind(Network::Tcp, &addr).await.unwrap_err();
        assert!(matches!(err, Error::EmptyRoute));
        assert_eq!(chain.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bind_without_chain_uses_default_route() {
        let router = Router::new();
        let addr: Address = "127.0.0.1:0".parse().unwrap();
        let listener = router.bind(Network::Tcp, &addr).await.unwrap();
        assert!(listener.local_addr().is_ok());
    }

    #[tokio::test]
    async fn test_dial_records_host() {
        let sink = Arc::new(MemoryRecorder::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: Address = listener.local_addr().unwrap().into();

        let router = Router::new().with_recorders(vec![RecorderBinding::new(
            RECORDER_SERVICE_ROUTER_DIAL_ADDRESS,
            sink.clone() as Arc<dyn crate::recorder::Recorder>,
        )]);

        let (_conn, trace) = router.dial(Network::Tcp, &addr).await.unwrap();
        assert!(trace.hops().is_empty());

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0], addr.host().as_bytes());
    }

    #[tokio::test]
    async fn test_dial_chain_none_falls_back_to_direct() {
        let chain = Arc::new(FixedChain {
            kind: RouteKind::None,
            calls: AtomicUsize::new(0),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: Address = listener.local_addr().unwrap().into();

        let router = Router::new().with_chain(chain);
        let (conn, _trace) = router.dial(Network::Tcp, &addr).await.unwrap();
        assert!(conn.peer_addr().is_some());
    }

    #[tokio::test]
    async fn test_dial_failure_records_error_tag() {
        let sink = Arc::new(MemoryRecorder::default());
        let router = Router::new()
            .with_timeout(Duration::from_secs(2))
            .with_recorders(vec![RecorderBinding::new(
                RECORDER_SERVICE_ROUTER_DIAL_ADDRESS_ERROR,
                sink.clone() as Arc<dyn crate::recorder::Recorder>,
            )]);

        // Nothing listens here.
        let addr: Address = "127.0.0.1:1".parse().unwrap();
        let err = router.dial(Network::Tcp, &addr).await;
        assert!(err.is_err());
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_udp_dial_presents_packet_semantics() {
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr: Address = server.local_addr().unwrap().into();

        let router = Router::new();
        let (conn, _trace) = router.dial(Network::Udp, &addr).await.unwrap();
        assert!(conn.is_datagram());

        let peer = conn.peer_addr().unwrap();
        let mut pc = conn.into_packet_conn();
        pc.send_to(b"ping", peer).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        server.send_to(b"pong", from).await.unwrap();

        let (n, reported) = pc.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(reported, peer);
    }

    /// Connector handing out a prepared stream, standing in for a
    /// tunnel that relays datagrams over a byte stream.
    struct FixedStreamConnector {
        conn: std::sync::Mutex<Option<Conn>>,
    }

    #[async_trait]
    impl crate::chain::Connector for FixedStreamConnector {
        async fn connect(
            &self,
            _conn: Conn,
            _network: Network,
            _addr: &Address,
        ) -> Result<Conn> {
            Ok(self.conn.lock().unwrap().take().expect("one connect"))
        }
    }

    #[tokio::test]
    async fn test_udp_dial_over_stream_chain_gets_wrapped() {
        // The chain tunnels through a TCP node and hands back a byte
        // stream even though the dial asked for UDP.
        let node_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let node_addr: Address = node_listener.local_addr().unwrap().into();

        let peer: std::net::SocketAddr = "198.51.100.7:53".parse().unwrap();
        let (tunnel, mut far) = tokio::io::duplex(1024);
        let tunnel_conn = Conn::new(Box::new(tunnel), None, Some(peer));

        let mut registry = TransportRegistry::new();
        registry.insert(
            "tunnel",
            crate::chain::NodeTransport {
                dial_opts: Default::default(),
                connector: Arc::new(FixedStreamConnector {
                    conn: std::sync::Mutex::new(Some(tunnel_conn)),
                }),
                route: Vec::new(),
            },
        );
        let registry = Arc::new(registry);

        struct TunnelChain {
            registry: Arc<TransportRegistry>,
            node: Arc<crate::chain::Node>,
        }

        #[async_trait]
        impl Chain for TunnelChain {
            async fn route(
                &self,
                _network: Network,
                _addr: &Address,
                _opts: &RouteOptions,
            ) -> Option<Route> {
                Some(Route::new(vec![self.node.clone()], self.registry.clone()))
            }
        }

        let node =
            Arc::new(crate::chain::Node::new("tun", node_addr).with_transport("tunnel"));
        let chain = Arc::new(TunnelChain {
            registry: registry.clone(),
            node,
        });

        let router = Router::new().with_chain(chain);
        let target: Address = "198.51.100.7:53".parse().unwrap();
        let (conn, _trace) = router.dial(Network::Udp, &target).await.unwrap();

        // The stream conn was wrapped: packet semantics report the
        // tunnel's peer address.
        assert!(conn.is_datagram());
        let mut pc = conn.into_packet_conn();

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        far.write_all(b"answer").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = pc.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"answer");
        assert_eq!(from, peer);

        pc.send_to(b"query", from).await.unwrap();
        let mut out = [0u8; 5];
        far.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"query");
    }

    struct FailingChain {
        transports: Arc<TransportRegistry>,
        fail_node: Arc<crate::chain::Node>,
        ok_node: Arc<crate::chain::Node>,
        fail_times: AtomicUsize,
    }

    #[async_trait]
    impl Chain for FailingChain {
        async fn route(
            &self,
            _network: Network,
            _addr: &Address,
            _opts: &RouteOptions,
        ) -> Option<Route> {
            let node = if self.fail_times.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok()
            {
                self.fail_node.clone()
            } else {
                self.ok_node.clone()
            };
            Some(Route::new(vec![node], self.transports.clone()))
        }
    }

    #[tokio::test]
    async fn test_dial_retries_through_chain() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let good: Address = listener.local_addr().unwrap().into();

        let fail_node = Arc::new(crate::chain::Node::new("bad", "127.0.0.1:1".parse().unwrap()));
        let ok_node = Arc::new(crate::chain::Node::new("good", good));

        let chain = Arc::new(FailingChain {
            transports: Arc::new(TransportRegistry::new()),
            fail_node: fail_node.clone(),
            ok_node: ok_node.clone(),
            fail_times: AtomicUsize::new(2),
        });

        let router = Router::new().with_chain(chain).with_retries(2);
        let addr: Address = "127.0.0.1:1".parse().unwrap();
        let (_conn, trace) = router.dial(Network::Tcp, &addr).await.unwrap();

        // Two failing attempts marked the bad node; the winning route
        // reset the good one and shows up in the trace.
        assert_eq!(fail_node.marker().failures(), 2);
        assert_eq!(ok_node.marker().failures(), 0);
        assert_eq!(trace.hops().len(), 1);
        assert_eq!(trace.hops()[0].name, "good");
    }

    #[tokio::test]
    async fn test_negative_retries_single_attempt() {
        let chain = Arc::new(FixedChain {
            kind: RouteKind::None,
            calls: AtomicUsize::new(0),
        });
        let router = Router::new()
            .with_chain(chain.clone())
            .with_retries(-5)
            .with_timeout(Duration::from_secs(2));

        let addr: Address = "127.0.0.1:1".parse().unwrap();
        let _ = router.dial(Network::Tcp, &addr).await;
        assert_eq!(chain.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_host_not_retried() {
        struct NoResolver;
        #[async_trait]
        impl crate::resolver::Resolver for NoResolver {
            async fn resolve(&self, host: &str) -> Result<Vec<std::net::IpAddr>> {
                Err(Error::UnresolvableHost(host.to_string()))
            }
        }

        let chain = Arc::new(FixedChain {
            kind: RouteKind::None,
            calls: AtomicUsize::new(0),
        });
        let router = Router::new()
            .with_chain(chain.clone())
            .with_resolver(Arc::new(NoResolver))
            .with_retries(3);

        let addr: Address = "nowhere.invalid:80".parse().unwrap();
        let err = router.dial(Network::Tcp, &addr).await.unwrap_err();
        assert!(matches!(err, Error::UnresolvableHost(_)));
        // The loop broke before consulting the chain.
        assert_eq!(chain.calls.load(Ordering::SeqCst), 0);
    }
}
