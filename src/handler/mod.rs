//! Connection handlers
//!
//! A handler owns the per-connection state machine: admission,
//! optional sniffing, upstream selection, dialing through the router,
//! and the splice. Two handlers ship with the engine: the transparent
//! port forwarder and the framed relay.

pub mod forward;
pub mod relay;

pub use forward::ForwardHandler;
pub use relay::{RelayHandler, RelayRequest, RelayResponse};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::chain::Router;
use crate::common::{Conn, Result};
use crate::limiter::{RateLimiter, TrafficLimiter};
use crate::policy::{Auther, Bypass};
use crate::recorder::{Recorder, RecorderBinding, RECORDER_SERVICE_HANDLER};
use crate::stats::Observer;

/// Per-connection context threaded through a handler.
#[derive(Clone)]
pub struct ConnContext {
    /// Session id, unique per accepted connection.
    pub sid: String,
    /// Client identity established by authentication, if any.
    pub client_id: Option<String>,
    /// Cancelled when the service shuts down; aborts dials and cuts
    /// the splice.
    pub cancel: CancellationToken,
}

impl ConnContext {
    pub fn new(cancel: CancellationToken) -> Self {
        let mut sid = [0u8; 8];
        rand::thread_rng().fill(&mut sid);
        Self {
            sid: hex(&sid),
            client_id: None,
            cancel,
        }
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}

/// Per-handler tunables from the service metadata.
#[derive(Debug, Clone)]
pub struct HandlerMeta {
    pub sniffing: bool,
    pub sniffing_timeout: Duration,
    pub read_timeout: Duration,
    pub no_delay: bool,
    /// PROXY protocol version for the upstream, 0 for none.
    pub proxy_protocol: u8,
}

impl Default for HandlerMeta {
    fn default() -> Self {
        Self {
            sniffing: false,
            sniffing_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(15),
            no_delay: false,
            proxy_protocol: 0,
        }
    }
}

/// Shared handler wiring.
pub struct HandlerOptions {
    pub service: String,
    pub router: Arc<Router>,
    pub auther: Option<Arc<dyn Auther>>,
    pub bypass: Option<Arc<dyn Bypass>>,
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub traffic_limiter: Option<Arc<dyn TrafficLimiter>>,
    pub observer: Option<Arc<dyn Observer>>,
    pub recorders: Vec<RecorderBinding>,
}

impl HandlerOptions {
    pub fn new(service: impl Into<String>, router: Arc<Router>) -> Self {
        Self {
            service: service.into(),
            router,
            auther: None,
            bypass: None,
            rate_limiter: None,
            traffic_limiter: None,
            observer: None,
            recorders: Vec::new(),
        }
    }

    pub fn with_auther(mut self, auther: Arc<dyn Auther>) -> Self {
        self.auther = Some(auther);
        self
    }

    pub fn with_bypass(mut self, bypass: Arc<dyn Bypass>) -> Self {
        self.bypass = Some(bypass);
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn with_traffic_limiter(mut self, traffic_limiter: Arc<dyn TrafficLimiter>) -> Self {
        self.traffic_limiter = Some(traffic_limiter);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_recorders(mut self, recorders: Vec<RecorderBinding>) -> Self {
        self.recorders = recorders;
        self
    }

    /// The sink bound to the per-connection handler tag, if any.
    pub fn handler_recorder(&self) -> Option<Arc<dyn Recorder>> {
        self.recorders
            .iter()
            .find(|binding| binding.tag == RECORDER_SERVICE_HANDLER)
            .map(|binding| binding.recorder.clone())
    }

    /// Consult the rate limiter for the client host. Unknown keys and
    /// absent limiters allow.
    pub fn check_rate_limit(&self, host: &str) -> bool {
        match &self.rate_limiter {
            Some(rate_limiter) => match rate_limiter.limiter(host) {
                Some(limiter) => limiter.allow(1),
                None => true,
            },
            None => true,
        }
    }
}

/// A per-connection protocol handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &ConnContext, conn: Conn) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sid_is_unique_hex() {
        let a = ConnContext::new(CancellationToken::new());
        let b = ConnContext::new(CancellationToken::new());
        assert_eq!(a.sid.len(), 16);
        assert_ne!(a.sid, b.sid);
        assert!(a.sid.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
