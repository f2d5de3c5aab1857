//! Per-client connection and traffic counters
//!
//! Shared atomics updated from splice wrappers, snapshotted towards
//! an observer. The engine never holds a lock while counting.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Counter kinds tracked per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    TotalConns,
    CurrentConns,
    InputBytes,
    OutputBytes,
    TotalErrs,
}

/// Shared counter set for one client id.
#[derive(Default)]
pub struct Stats {
    total_conns: AtomicU64,
    current_conns: AtomicI64,
    input_bytes: AtomicU64,
    output_bytes: AtomicU64,
    total_errs: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: Kind, n: i64) {
        match kind {
            Kind::TotalConns => {
                self.total_conns.fetch_add(n.max(0) as u64, Ordering::Relaxed);
            }
            Kind::CurrentConns => {
                self.current_conns.fetch_add(n, Ordering::Relaxed);
            }
            Kind::InputBytes => {
                self.input_bytes.fetch_add(n.max(0) as u64, Ordering::Relaxed);
            }
            Kind::OutputBytes => {
                self.output_bytes.fetch_add(n.max(0) as u64, Ordering::Relaxed);
            }
            Kind::TotalErrs => {
                self.total_errs.fetch_add(n.max(0) as u64, Ordering::Relaxed);
            }
        }
    }

    pub fn get(&self, kind: Kind) -> i64 {
        match kind {
            Kind::TotalConns => self.total_conns.load(Ordering::Relaxed) as i64,
            Kind::CurrentConns => self.current_conns.load(Ordering::Relaxed),
            Kind::InputBytes => self.input_bytes.load(Ordering::Relaxed) as i64,
            Kind::OutputBytes => self.output_bytes.load(Ordering::Relaxed) as i64,
            Kind::TotalErrs => self.total_errs.load(Ordering::Relaxed) as i64,
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_conns: self.get(Kind::TotalConns) as u64,
            current_conns: self.get(Kind::CurrentConns),
            input_bytes: self.get(Kind::InputBytes) as u64,
            output_bytes: self.get(Kind::OutputBytes) as u64,
            total_errs: self.get(Kind::TotalErrs) as u64,
        }
    }
}

/// Point-in-time view of a client's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_conns: u64,
    pub current_conns: i64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub total_errs: u64,
}

/// Event pushed to an observer when a connection closes.
#[derive(Debug, Clone)]
pub struct StatsEvent {
    pub service: String,
    pub client: String,
    pub stats: StatsSnapshot,
}

/// External stats consumer.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn observe(&self, event: StatsEvent);
}

/// Per-client stats registry for one handler.
#[derive(Default)]
pub struct ClientStats {
    clients: Mutex<HashMap<String, Arc<Stats>>>,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self, client: &str) -> Arc<Stats> {
        let mut clients = self.clients.lock().expect("stats poisoned");
        clients
            .entry(client.to_string())
            .or_insert_with(|| Arc::new(Stats::new()))
            .clone()
    }
}

/// Stream wrapper feeding moved bytes into a [`Stats`] set.
pub struct StatsStream<S> {
    inner: S,
    stats: Arc<Stats>,
}

impl<S> StatsStream<S> {
    pub fn new(inner: S, stats: Arc<Stats>) -> Self {
        Self { inner, stats }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for StatsStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            self.stats.add(Kind::InputBytes, n as i64);
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for StatsStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            self.stats.add(Kind::OutputBytes, *n as i64);
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_current_conns_up_down() {
        let stats = Stats::new();
        stats.add(Kind::TotalConns, 1);
        stats.add(Kind::CurrentConns, 1);
        assert_eq!(stats.get(Kind::CurrentConns), 1);
        stats.add(Kind::CurrentConns, -1);
        assert_eq!(stats.get(Kind::CurrentConns), 0);
        assert_eq!(stats.get(Kind::TotalConns), 1);
    }

    #[test]
    fn test_client_stats_shared_per_key() {
        let registry = ClientStats::new();
        let a = registry.stats("alice");
        let b = registry.stats("alice");
        a.add(Kind::InputBytes, 10);
        assert_eq!(b.get(Kind::InputBytes), 10);
    }

    #[tokio::test]
    async fn test_stats_stream_counts_bytes() {
        let (client, mut server) = tokio::io::duplex(1024);
        let stats = Arc::new(Stats::new());
        let mut wrapped = StatsStream::new(client, stats.clone());

        wrapped.write_all(b"hello").await.unwrap();
        server.write_all(b"worlds!").await.unwrap();
        let mut buf = [0u8; 7];
        wrapped.read_exact(&mut buf).await.unwrap();

        assert_eq!(stats.get(Kind::OutputBytes), 5);
        assert_eq!(stats.get(Kind::InputBytes), 7);
    }
}
