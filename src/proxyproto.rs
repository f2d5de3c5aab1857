//! PROXY protocol client-side header encoding
//!
//! Upstream connections can be prefixed with a v1 (text) or v2
//! (binary) header carrying the original client addresses, for
//! upstreams that want the real source behind the gateway.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use tokio::io::AsyncWriteExt;

use crate::common::{Conn, Network, Result};
use crate::error::Error;

const V2_SIGNATURE: [u8; 12] = [
    0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
];

/// Map a missing or zero-valued local address onto the IPv4
/// unspecified address, keeping the port.
pub fn normalize(addr: Option<SocketAddr>) -> SocketAddr {
    match addr {
        Some(addr) => {
            if addr.ip().is_unspecified() && addr.is_ipv6() {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port())
            } else {
                addr
            }
        }
        None => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
    }
}

/// Encode a v1 header line: `PROXY TCP4 src dst sport dport\r\n`.
pub fn encode_v1(network: Network, src: SocketAddr, dst: SocketAddr) -> BytesMut {
    let family = match (network, src.is_ipv4()) {
        (Network::Udp, _) => "UNKNOWN",
        (_, true) => "TCP4",
        (_, false) => "TCP6",
    };

    let mut buf = BytesMut::new();
    if family == "UNKNOWN" {
        buf.put_slice(b"PROXY UNKNOWN\r\n");
        return buf;
    }
    buf.put_slice(
        format!(
            "PROXY {} {} {} {} {}\r\n",
            family,
            src.ip(),
            dst.ip(),
            src.port(),
            dst.port()
        )
        .as_bytes(),
    );
    buf
}

/// Encode a v2 binary header.
pub fn encode_v2(network: Network, src: SocketAddr, dst: SocketAddr) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_slice(&V2_SIGNATURE);
    // Version 2, PROXY command.
    buf.put_u8(0x21);

    let proto = match network {
        Network::Udp => 0x02,
        _ => 0x01,
    };

    match (src, dst) {
        (SocketAddr::V4(s), SocketAddr::V4(d)) => {
            buf.put_u8(0x10 | proto);
            buf.put_u16(12);
            buf.put_slice(&s.ip().octets());
            buf.put_slice(&d.ip().octets());
            buf.put_u16(s.port());
            buf.put_u16(d.port());
        }
        (SocketAddr::V6(s), SocketAddr::V6(d)) => {
            buf.put_u8(0x20 | proto);
            buf.put_u16(36);
            buf.put_slice(&s.ip().octets());
            buf.put_slice(&d.ip().octets());
            buf.put_u16(s.port());
            buf.put_u16(d.port());
        }
        _ => {
            // Mixed families: declare the connection unspecified.
            buf.put_u8(0x00);
            buf.put_u16(0);
        }
    }
    buf
}

/// Write the configured header version to the upstream connection.
/// Version 0 writes nothing.
pub async fn write_header(
    conn: &mut Conn,
    version: u8,
    network: Network,
    src: SocketAddr,
    dst: SocketAddr,
) -> Result<()> {
    let header = match version {
        0 => return Ok(()),
        1 => encode_v1(network, src, dst),
        2 => encode_v2(network, src, dst),
        v => {
            return Err(Error::Config(format!(
                "unsupported PROXY protocol version: {}",
                v
            )))
        }
    };
    conn.write_all(&header).await?;
    Ok(())
}
