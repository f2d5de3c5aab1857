//! Common types and abstractions
//!
//! This module defines the core types used throughout the application:
//! - Stream: unified async I/O abstraction
//! - Conn: established connection with endpoint addresses
//! - Address: network address representation
//! - Network: connection/dial network kind
//! - splice: bidirectional byte relay

mod address;
mod network;
mod splice;
mod stream;

pub use address::{split_host, Address};
pub use network::Network;
pub use splice::splice;
pub use stream::{
    AsyncReadWrite, BufferedWriteStream, Conn, IntoStream, PeekableStream, Stream,
    StreamPacketConn,
};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
