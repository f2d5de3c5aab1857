//! Runtime - configuration-driven service construction
//!
//! The runtime builds an [`Environment`] of named collaborators from
//! the configuration, wires services on top of it, and manages their
//! lifecycle. The environment is plain data: tests build their own
//! instead of touching process-wide state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{
    Chain, ForwardConnector, Hop, Node, NodeChain, NodeFilter, NodeGroup, NodeTransport, Router,
    TransportRegistry,
};
use crate::common::{Address, Network};
use crate::config::{Config, HandlerKind, ServiceConfig};
use crate::error::{Error, Result};
use crate::handler::{ConnContext, ForwardHandler, Handler, HandlerMeta, HandlerOptions, RelayHandler};
use crate::limiter::{KeyedRateLimiter, KeyedTrafficLimiter, RateLimiter, TrafficLimiter};
use crate::policy::{Admission, Auther, Bypass, Pattern, StaticAdmission, StaticAuther, StaticBypass};
use crate::recorder::{FileRecorder, Recorder, RecorderBinding};
use crate::resolver::{HostMapper, Resolver, StaticHostMapper, SystemResolver};
use crate::transport::{DialOptions, TcpTransport, Transport, UdpTransport};

use super::metrics;

/// Named collaborators built once at boot and threaded into the
/// services that reference them.
#[derive(Default)]
pub struct Environment {
    resolvers: HashMap<String, Arc<dyn Resolver>>,
    host_mappers: HashMap<String, Arc<dyn HostMapper>>,
    authers: HashMap<String, Arc<dyn Auther>>,
    bypasses: HashMap<String, Arc<dyn Bypass>>,
    admissions: HashMap<String, Arc<dyn Admission>>,
    rate_limiters: HashMap<String, Arc<dyn RateLimiter>>,
    traffic_limiters: HashMap<String, Arc<dyn TrafficLimiter>>,
    recorders: HashMap<String, Arc<dyn Recorder>>,
    hops: HashMap<String, Arc<dyn Hop>>,
    chains: HashMap<String, Arc<dyn Chain>>,
    transports: Arc<TransportRegistry>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("resolvers", &self.resolvers.keys().collect::<Vec<_>>())
            .field("host_mappers", &self.host_mappers.keys().collect::<Vec<_>>())
            .field("authers", &self.authers.keys().collect::<Vec<_>>())
            .field("bypasses", &self.bypasses.keys().collect::<Vec<_>>())
            .field("admissions", &self.admissions.keys().collect::<Vec<_>>())
            .field("rate_limiters", &self.rate_limiters.keys().collect::<Vec<_>>())
            .field("traffic_limiters", &self.traffic_limiters.keys().collect::<Vec<_>>())
            .field("recorders", &self.recorders.keys().collect::<Vec<_>>())
            .field("hops", &self.hops.keys().collect::<Vec<_>>())
            .field("chains", &self.chains.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn insert_unique<T>(map: &mut HashMap<String, T>, kind: &str, name: &str, value: T) -> Result<()> {
    if map.contains_key(name) {
        return Err(Error::Config(format!("duplicate {} name: {}", kind, name)));
    }
    map.insert(name.to_string(), value);
    Ok(())
}

impl Environment {
    /// Build every named component. Any duplicate name is fatal.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let mut env = Environment::default();

        for cfg in &config.resolvers {
            let resolver: Arc<dyn Resolver> = match cfg.kind.as_str() {
                "system" => Arc::new(SystemResolver::new()),
                other => {
                    return Err(Error::Config(format!("unknown resolver kind: {}", other)))
                }
            };
            insert_unique(&mut env.resolvers, "resolver", &cfg.name, resolver)?;
        }

        for cfg in &config.hosts {
            let mapper: Arc<dyn HostMapper> =
                Arc::new(StaticHostMapper::new(cfg.entries.clone()));
            insert_unique(&mut env.host_mappers, "hosts", &cfg.name, mapper)?;
        }

        for cfg in &config.authers {
            let auther: Arc<dyn Auther> = Arc::new(StaticAuther::new(cfg.users.clone()));
            insert_unique(&mut env.authers, "auther", &cfg.name, auther)?;
        }

        for cfg in &config.bypasses {
            let patterns = cfg.matchers.iter().map(|m| Pattern::parse(m)).collect();
            let bypass: Arc<dyn Bypass> = Arc::new(StaticBypass::new(patterns, cfg.whitelist));
            insert_unique(&mut env.bypasses, "bypass", &cfg.name, bypass)?;
        }

        for cfg in &config.admissions {
            let patterns = cfg.matchers.iter().map(|m| Pattern::parse(m)).collect();
            let admission: Arc<dyn Admission> =
                Arc::new(StaticAdmission::new(patterns, cfg.whitelist));
            insert_unique(&mut env.admissions, "admission", &cfg.name, admission)?;
        }

        for cfg in &config.rlimiters {
            let limiter: Arc<dyn RateLimiter> = Arc::new(KeyedRateLimiter::new(cfg.rate));
            insert_unique(&mut env.rate_limiters, "rlimiter", &cfg.name, limiter)?;
        }

        for cfg in &config.limiters {
            let limiter: Arc<dyn TrafficLimiter> = Arc::new(KeyedTrafficLimiter::new(cfg.rate));
            insert_unique(&mut env.traffic_limiters, "limiter", &cfg.name, limiter)?;
        }

        for cfg in &config.recorders {
            let recorder: Arc<dyn Recorder> = Arc::new(FileRecorder::open(&cfg.file).await?);
            insert_unique(&mut env.recorders, "recorder", &cfg.name, recorder)?;
        }

        let mut transports = TransportRegistry::new();
        let mut transport_names = HashMap::new();
        for cfg in &config.transports {
            insert_unique(&mut transport_names, "transport", &cfg.name, ())?;
            transports.insert(
                &cfg.name,
                NodeTransport {
                    dial_opts: DialOptions {
                        interface: cfg.interface.clone(),
                        netns: None,
                        mark: cfg.mark,
                    },
                    connector: Arc::new(ForwardConnector),
                    route: Vec::new(),
                },
            );
        }
        env.transports = Arc::new(transports);

        for cfg in &config.hops {
            let mut nodes = Vec::with_capacity(cfg.nodes.len());
            for node_cfg in &cfg.nodes {
                let addr: Address = node_cfg.addr.parse()?;
                let mut node = Node::new(&node_cfg.name, addr).with_filter(NodeFilter {
                    host: node_cfg.host.clone(),
                    protocol: node_cfg.protocol,
                });
                if let Some(network) = node_cfg.network {
                    node = node.with_network(network);
                }
                if let Some(transport) = &node_cfg.transport {
                    if !transport_names.contains_key(transport) {
                        return Err(Error::Config(format!(
                            "node {}: unknown transport: {}",
                            node_cfg.name, transport
                        )));
                    }
                    node = node.with_transport(transport);
                }
                nodes.push(Arc::new(node));
            }
            let hop: Arc<dyn Hop> = Arc::new(NodeGroup::new(nodes, cfg.strategy));
            insert_unique(&mut env.hops, "hop", &cfg.name, hop)?;
        }

        for cfg in &config.chains {
            let mut chain = NodeChain::new(env.transports.clone());
            for hop_name in &cfg.hops {
                let hop = env
                    .hops
                    .get(hop_name)
                    .ok_or_else(|| {
                        Error::Config(format!("chain {}: unknown hop: {}", cfg.name, hop_name))
                    })?
                    .clone();
                chain = chain.with_hop(hop);
            }
            let chain: Arc<dyn Chain> = Arc::new(chain);
            insert_unique(&mut env.chains, "chain", &cfg.name, chain)?;
        }

        Ok(env)
    }

    pub fn hop(&self, name: &str) -> Option<Arc<dyn Hop>> {
        self.hops.get(name).cloned()
    }

    pub fn chain(&self, name: &str) -> Option<Arc<dyn Chain>> {
        self.chains.get(name).cloned()
    }

    pub fn recorder(&self, name: &str) -> Option<Arc<dyn Recorder>> {
        self.recorders.get(name).cloned()
    }

    /// Build the service listeners declared by the configuration.
    pub fn build_services(&self, config: &Config) -> Result<Vec<Service>> {
        let mut names = HashMap::new();
        let mut services = Vec::with_capacity(config.services.len());
        for cfg in &config.services {
            insert_unique(&mut names, "service", &cfg.name, ())?;
            services.push(self.build_service(cfg)?);
        }
        Ok(services)
    }

    fn build_service(&self, cfg: &ServiceConfig) -> Result<Service> {
        let hc = &cfg.handler;

        let mut recorders = Vec::new();
        for binding in &hc.recorders {
            let recorder = self.recorders.get(&binding.name).ok_or_else(|| {
                Error::Config(format!(
                    "service {}: unknown recorder: {}",
                    cfg.name, binding.name
                ))
            })?;
            recorders.push(RecorderBinding::new(&binding.record, recorder.clone()));
        }

        let mut router = Router::new()
            .with_timeout(Duration::from_secs(hc.timeout))
            .with_retries(hc.retries)
            .with_recorders(recorders.clone());
        if let Some(name) = &hc.chain {
            let chain = self.chains.get(name).ok_or_else(|| {
                Error::Config(format!("service {}: unknown chain: {}", cfg.name, name))
            })?;
            router = router.with_chain(chain.clone());
        }
        if let Some(name) = &hc.resolver {
            let resolver = self.resolvers.get(name).ok_or_else(|| {
                Error::Config(format!("service {}: unknown resolver: {}", cfg.name, name))
            })?;
            router = router.with_resolver(resolver.clone());
        }
        if let Some(name) = &hc.hosts {
            let mapper = self.host_mappers.get(name).ok_or_else(|| {
                Error::Config(format!("service {}: unknown hosts: {}", cfg.name, name))
            })?;
            router = router.with_host_mapper(mapper.clone());
        }

        let mut options = HandlerOptions::new(&cfg.name, Arc::new(router))
            .with_recorders(recorders);
        if let Some(name) = &hc.auther {
            let auther = self.authers.get(name).ok_or_else(|| {
                Error::Config(format!("service {}: unknown auther: {}", cfg.name, name))
            })?;
            options = options.with_auther(auther.clone());
        }
        if let Some(name) = &hc.bypass {
            let bypass = self.bypasses.get(name).ok_or_else(|| {
                Error::Config(format!("service {}: unknown bypass: {}", cfg.name, name))
            })?;
            options = options.with_bypass(bypass.clone());
        }
        if let Some(name) = &hc.rlimiter {
            let limiter = self.rate_limiters.get(name).ok_or_else(|| {
                Error::Config(format!("service {}: unknown rlimiter: {}", cfg.name, name))
            })?;
            options = options.with_rate_limiter(limiter.clone());
        }
        if let Some(name) = &hc.limiter {
            let limiter = self.traffic_limiters.get(name).ok_or_else(|| {
                Error::Config(format!("service {}: unknown limiter: {}", cfg.name, name))
            })?;
            options = options.with_traffic_limiter(limiter.clone());
        }

        let md = HandlerMeta {
            sniffing: hc.metadata.sniffing,
            sniffing_timeout: Duration::from_secs(hc.metadata.sniffing_timeout),
            read_timeout: Duration::from_secs(hc.metadata.read_timeout),
            no_delay: hc.metadata.no_delay,
            proxy_protocol: hc.metadata.proxy_protocol,
        };

        let handler: Arc<dyn Handler> = match hc.kind {
            HandlerKind::Forward => {
                let hop_name = hc.hop.as_ref().ok_or_else(|| {
                    Error::Config(format!("service {}: forward handler needs a hop", cfg.name))
                })?;
                let hop = self.hops.get(hop_name).ok_or_else(|| {
                    Error::Config(format!("service {}: unknown hop: {}", cfg.name, hop_name))
                })?;
                Arc::new(ForwardHandler::new(hop.clone(), options).with_meta(md))
            }
            HandlerKind::Relay => Arc::new(RelayHandler::new(options).with_meta(md)),
        };

        let admission = match &cfg.admission {
            Some(name) => Some(
                self.admissions
                    .get(name)
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "service {}: unknown admission: {}",
                            cfg.name, name
                        ))
                    })?
                    .clone(),
            ),
            None => None,
        };

        Ok(Service {
            name: cfg.name.clone(),
            addr: cfg.addr.parse()?,
            network: cfg.network,
            admission,
            handler,
        })
    }
}

/// One configured listener with its handler.
pub struct Service {
    pub name: String,
    pub addr: Address,
    pub network: Network,
    admission: Option<Arc<dyn Admission>>,
    handler: Arc<dyn Handler>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("network", &self.network)
            .field("admission", &self.admission.is_some())
            .finish()
    }
}

impl Service {
    /// Accept connections until the token cancels. Each connection
    /// runs on its own task with a child token.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let transport: Box<dyn Transport> = match self.network {
            Network::Tcp => Box::new(TcpTransport::new()),
            Network::Udp => Box::new(UdpTransport::new()),
            other => {
                return Err(Error::Config(format!(
                    "service {}: cannot listen on network {}",
                    self.name, other
                )))
            }
        };
        let listener = transport.bind(&self.addr).await?;
        info!(
            "[{}] listening on {}/{}",
            self.name,
            listener.local_addr()?,
            self.network
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[{}] shutting down", self.name);
                    break;
                }
                accepted = listener.accept() => {
                    let conn = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("[{}] accept: {}", self.name, e);
                            continue;
                        }
                    };

                    if let Some(admission) = &self.admission {
                        let peer = conn
                            .peer_addr()
                            .map(|a| a.to_string())
                            .unwrap_or_default();
                        if !admission.admit(&peer).await {
                            debug!("[{}] not admitted: {}", self.name, peer);
                            continue;
                        }
                    }

                    let service = self.clone();
                    let ctx = ConnContext::new(cancel.child_token());
                    tokio::spawn(async move {
                        metrics::SERVICE_CONNECTIONS_ACTIVE.inc();
                        if let Err(e) = service.handler.handle(&ctx, conn).await {
                            warn!("[{}] {}: {}", service.name, ctx.sid, e);
                        }
                        metrics::SERVICE_CONNECTIONS_ACTIVE.dec();
                    });
                }
            }
        }

        Ok(())
    }
}

/// Runtime: all configured services plus the shutdown token.
pub struct Runtime {
    services: Vec<Arc<Service>>,
    cancel: CancellationToken,
}

impl Runtime {
    pub async fn from_config(config: &Config) -> Result<Self> {
        metrics::init_metrics();
        let env = Environment::from_config(config).await?;
        let services = env
            .build_services(config)?
            .into_iter()
            .map(Arc::new)
            .collect();
        Ok(Self {
            services,
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every service until ctrl-c or cancellation.
    pub async fn run(&self) -> Result<()> {
        let mut handles = Vec::new();
        for service in &self.services {
            let service = service.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = service.run(cancel).await {
                    error!("service: {}", e);
                }
            }));
        }

        info!("runtime started with {} services", self.services.len());

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down...");
                self.cancel.cancel();
            }
            _ = self.cancel.cancelled() => {}
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}
