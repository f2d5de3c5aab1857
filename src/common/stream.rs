//! Stream abstraction
//!
//! Unified stream type for all layers to operate on.
//! All layers ONLY operate on Stream, never on raw TCP/UDP.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// The core stream type used throughout the application.
/// All layers operate on this unified abstraction.
pub type Stream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Trait for types that can be converted into a Stream
pub trait IntoStream {
    fn into_stream(self) -> Stream;
}

impl<T> IntoStream for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn into_stream(self) -> Stream {
        Box::new(self)
    }
}

/// An established connection: a stream plus its endpoint addresses.
///
/// `datagram` marks connections with message semantics (accepted or
/// dialed over UDP), which the handlers use for network inference.
pub struct Conn {
    stream: Stream,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    datagram: bool,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("datagram", &self.datagram)
            .finish()
    }
}

impl Conn {
    pub fn new(stream: Stream, local: Option<SocketAddr>, peer: Option<SocketAddr>) -> Self {
        Self {
            stream,
            local,
            peer,
            datagram: false,
        }
    }

    pub fn datagram(mut self) -> Self {
        self.datagram = true;
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_datagram(&self) -> bool {
        self.datagram
    }

    pub fn into_stream(self) -> Stream {
        self.stream
    }

    /// Message-oriented view of this connection. Reads report the
    /// connection's peer address; write targets are ignored.
    pub fn into_packet_conn(self) -> StreamPacketConn {
        StreamPacketConn::new(self)
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Packet adapter over a byte-stream connection.
///
/// Used for UDP dials that tunneled through a stream-oriented chain:
/// the far end of the tunnel relays datagrams, so plain reads and
/// writes already carry whole messages.
pub struct StreamPacketConn {
    conn: Conn,
}

impl StreamPacketConn {
    pub fn new(conn: Conn) -> Self {
        Self { conn }
    }

    /// Receive one message. The reported address is always the
    /// connection's peer address.
    pub async fn recv_from(&mut self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        let n = self.conn.read(buf).await?;
        let addr = self.conn.peer_addr().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "no peer address")
        })?;
        Ok((n, addr))
    }

    /// Send one message. Delegates to a plain write; the target
    /// address is ignored because the stream is already connected.
    pub async fn send_to(&mut self, buf: &[u8], _addr: SocketAddr) -> std::io::Result<usize> {
        use tokio::io::AsyncWriteExt;
        self.conn.write(buf).await
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }
}

/// A stream wrapper that buffers initial bytes so protocol detection
/// can look at them without consuming.
///
/// Reads drain the peeked bytes first; writes pass through.
pub struct PeekableStream {
    inner: Stream,
    buf: BytesMut,
}

impl PeekableStream {
    pub fn new(inner: Stream) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
        }
    }

    /// A stream with bytes already read from it: reads see `initial`
    /// first.
    pub fn with_initial(inner: Stream, initial: &[u8]) -> Self {
        Self {
            inner,
            buf: BytesMut::from(initial),
        }
    }

    /// Fill the internal buffer until it holds at least `n` bytes or
    /// the stream reaches EOF, and return what is buffered.
    pub async fn peek(&mut self, n: usize) -> std::io::Result<&[u8]> {
        let mut chunk = [0u8; 4096];
        while self.buf.len() < n {
            let m = self.inner.read(&mut chunk).await?;
            if m == 0 {
                break;
            }
            self.buf.extend_from_slice(&chunk[..m]);
        }
        Ok(&self.buf)
    }
}

impl AsyncRead for PeekableStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.buf.is_empty() {
            let n = self.buf.len().min(buf.remaining());
            buf.put_slice(&self.buf[..n]);
            self.buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PeekableStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// A stream wrapper holding a pending header that is flushed ahead of
/// the first payload write.
///
/// Used by the relay handler when `no_delay` is off: the response
/// frame rides along with the first upstream bytes instead of going
/// out in its own segment.
pub struct BufferedWriteStream {
    inner: Stream,
    header: BytesMut,
}

impl BufferedWriteStream {
    pub fn new(inner: Stream, header: BytesMut) -> Self {
        Self { inner, header }
    }

    fn poll_drain_header(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        while !self.header.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.header) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()))
                }
                Poll::Ready(Ok(n)) => {
                    self.header.advance(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for BufferedWriteStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for BufferedWriteStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.poll_drain_header(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.poll_drain_header(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.poll_drain_header(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_peek_preserves_bytes() {
        let (client, mut server) = tokio::io::duplex(1024);
        server.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let mut stream = PeekableStream::new(Box::new(client));
        let peeked = stream.peek(4).await.unwrap();
        assert_eq!(&peeked[..4], b"GET ");

        // Subsequent reads still see the peeked bytes.
        let mut buf = [0u8; 16];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_packet_conn_reports_peer() {
        let (client, mut server) = tokio::io::duplex(1024);
        server.write_all(b"hello").await.unwrap();

        let peer: SocketAddr = "10.0.0.1:53".parse().unwrap();
        let conn = Conn::new(Box::new(client), None, Some(peer));
        let mut pc = conn.into_packet_conn();

        let mut buf = [0u8; 16];
        let (n, addr) = pc.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(addr, peer);

        let sent = pc
            .send_to(b"world", "192.0.2.1:9".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(sent, 5);
        let mut out = [0u8; 5];
        server.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"world");
    }

    #[tokio::test]
    async fn test_buffered_header_rides_first_write() {
        let (client, mut server) = tokio::io::duplex(1024);

        let mut header = BytesMut::new();
        header.extend_from_slice(b"HDR");
        let mut stream = BufferedWriteStream::new(Box::new(client), header);

        stream.write_all(b"payload").await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = [0u8; 10];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HDRpayload");
    }

    #[tokio::test]
    async fn test_buffered_header_flushes_without_write() {
        let (client, mut server) = tokio::io::duplex(1024);

        let mut header = BytesMut::new();
        header.extend_from_slice(b"ONLY");
        let mut stream = BufferedWriteStream::new(Box::new(client), header);
        stream.flush().await.unwrap();

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ONLY");
    }
}
