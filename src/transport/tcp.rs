//! TCP Transport implementation

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::common::{Address, Conn, Result};
use crate::error::Error;

use super::{DialOptions, Listener, Transport};

/// TCP transport - raw TCP connections
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &Address, opts: &DialOptions) -> Result<Conn> {
        let stream = match addr {
            Address::Socket(socket_addr) => dial_socket(*socket_addr, opts).await?,
            Address::Domain(domain, port) => {
                if !opts.is_default() {
                    // Options need a concrete socket; the router hands
                    // us resolved addresses on that path.
                    return Err(Error::Config(
                        "dial options require a resolved address".into(),
                    ));
                }
                TcpStream::connect(format!("{}:{}", domain, port)).await?
            }
        };

        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true)?;

        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        Ok(Conn::new(Box::new(stream), local, peer))
    }

    async fn bind(&self, addr: &Address) -> Result<Box<dyn Listener>> {
        let socket_addr = match addr {
            Address::Socket(s) => *s,
            Address::Domain(_, _) => {
                return Err(Error::Config("Cannot bind to domain address".into()));
            }
        };

        let listener = TcpListener::bind(socket_addr).await?;
        Ok(Box::new(TcpListenerWrapper { listener }))
    }
}

async fn dial_socket(addr: SocketAddr, opts: &DialOptions) -> Result<TcpStream> {
    if let Some(netns) = &opts.netns {
        return Err(Error::Config(format!(
            "network namespace {} is not supported",
            netns
        )));
    }

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    apply_options(&socket, opts)?;

    Ok(socket.connect(addr).await?)
}

fn apply_options(socket: &TcpSocket, opts: &DialOptions) -> Result<()> {
    if let Some(iface) = &opts.interface {
        match iface.parse::<IpAddr>() {
            Ok(ip) => socket.bind(SocketAddr::new(ip, 0))?,
            Err(_) => {
                #[cfg(target_os = "linux")]
                socket2::SockRef::from(socket).bind_device(Some(iface.as_bytes()))?;
                #[cfg(not(target_os = "linux"))]
                return Err(Error::Config(format!(
                    "interface {} requires an IP address on this platform",
                    iface
                )));
            }
        }
    }

    if let Some(mark) = opts.mark {
        #[cfg(target_os = "linux")]
        socket2::SockRef::from(socket).set_mark(mark)?;
        #[cfg(not(target_os = "linux"))]
        {
            let _ = mark;
        }
    }

    Ok(())
}

/// Wrapper for TcpListener to implement Listener trait
struct TcpListenerWrapper {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpListenerWrapper {
    async fn accept(&self) -> Result<Conn> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr().ok();
        Ok(Conn::new(Box::new(stream), local, Some(peer)))
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(Address::Socket(self.listener.local_addr()?))
    }
}
