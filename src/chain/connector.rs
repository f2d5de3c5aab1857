//! Connector seam for intermediate hops
//!
//! A connector speaks whatever wire protocol an intermediate node
//! understands to open an onward stream through it. The engine only
//! depends on this trait; concrete proxy codecs plug in from outside.

use async_trait::async_trait;

use crate::common::{Address, Conn, Network, Result};
use crate::error::Error;
use crate::transport::Listener;

#[async_trait]
pub trait Connector: Send + Sync {
    /// Ask the node at the far end of `conn` to open a stream to
    /// `addr` and splice it onto this connection.
    async fn connect(&self, conn: Conn, network: Network, addr: &Address) -> Result<Conn>;

    /// Ask the node at the far end of `conn` to listen on `addr` on
    /// our behalf. Most connectors cannot.
    async fn bind(&self, _conn: Conn, _network: Network, _addr: &Address) -> Result<Box<dyn Listener>> {
        Err(Error::Config("transport does not support bind".into()))
    }
}

/// Connector for transparent forwarding nodes.
///
/// The node forwards autonomously to its own configured target, so
/// connecting through it is the connection itself.
pub struct ForwardConnector;

#[async_trait]
impl Connector for ForwardConnector {
    async fn connect(&self, conn: Conn, _network: Network, _addr: &Address) -> Result<Conn> {
        Ok(conn)
    }
}
