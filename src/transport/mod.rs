//! Transport Layer
//!
//! Responsibilities:
//! - Establish lowest-level connections (TCP, UDP)
//! - NO protocol parsing, NO content inspection
//!
//! This layer ONLY deals with raw byte transport. Dial options cover
//! the socket-level knobs the router threads through (source
//! interface, fwmark).

mod tcp;
mod udp;

pub use tcp::TcpTransport;
pub use udp::{UdpStream, UdpTransport};

use async_trait::async_trait;

use crate::common::{Address, Conn, Result};

/// Socket-level options applied when dialing directly.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Source interface: an IP address to bind, or a device name.
    pub interface: Option<String>,
    /// Network namespace. Carried for configuration compatibility;
    /// switching namespaces is rejected at dial time.
    pub netns: Option<String>,
    /// SO_MARK value (Linux).
    pub mark: Option<u32>,
}

impl DialOptions {
    pub fn is_default(&self) -> bool {
        self.interface.is_none() && self.netns.is_none() && self.mark.is_none()
    }
}

/// Transport trait for establishing raw connections
///
/// Implementations should ONLY handle connection establishment,
/// not protocol handling.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a remote address
    async fn connect(&self, addr: &Address, opts: &DialOptions) -> Result<Conn>;

    /// Create a listener bound to an address
    async fn bind(&self, addr: &Address) -> Result<Box<dyn Listener>>;
}

/// Listener trait for accepting incoming connections
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept a new connection
    async fn accept(&self) -> Result<Conn>;

    /// Get the local bound address
    fn local_addr(&self) -> Result<Address>;
}

impl std::fmt::Debug for dyn Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr())
            .finish()
    }
}
