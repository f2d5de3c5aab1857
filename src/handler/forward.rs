//! Port forward handler
//!
//! The transparent service: every accepted connection is admitted,
//! optionally sniffed, matched to an upstream node, dialed through
//! the router and spliced. Sniffed HTTP and TLS connections dispatch
//! to sub-handlers that capture protocol details before forwarding.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::app::metrics;
use crate::chain::{Hop, SelectHints};
use crate::common::{splice, Conn, Network, PeekableStream, Stream};
use crate::error::{Error, Result};
use crate::limiter::{LimitOptions, LimitedStream, Scope};
use crate::proxyproto;
use crate::recorder::{EmitState, HandlerRecord, HttpRecord, Recorder, TlsRecord};
use crate::sniff::{self, Protocol};
use crate::stats::{ClientStats, Kind, StatsEvent, StatsStream};

use super::{ConnContext, Handler, HandlerMeta, HandlerOptions};

/// Handler forwarding connections to nodes selected from a hop.
pub struct ForwardHandler {
    hop: Arc<dyn Hop>,
    md: HandlerMeta,
    options: HandlerOptions,
    recorder: Option<Arc<dyn Recorder>>,
    stats: ClientStats,
}

/// Connection facts threaded from acceptance into the forwarding
/// tail.
struct Flow {
    network: Network,
    proto: Option<Protocol>,
    host: Option<String>,
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl ForwardHandler {
    pub fn new(hop: Arc<dyn Hop>, options: HandlerOptions) -> Self {
        let recorder = options.handler_recorder();
        Self {
            hop,
            md: HandlerMeta::default(),
            options,
            recorder,
            stats: ClientStats::new(),
        }
    }

    pub fn with_meta(mut self, md: HandlerMeta) -> Self {
        self.md = md;
        self
    }

    async fn finalize(&self, record: &mut HandlerRecord, start: Instant, result: &Result<()>) {
        if let Err(e) = result {
            record.err = Some(e.label());
            // Handed-over records leave the error accounting to the
            // sub-handler.
            if record.state() == EmitState::Pending {
                metrics::HANDLER_ERRORS_TOTAL
                    .with_label_values(&[&self.options.service])
                    .inc();
            }
        }
        record.duration = start.elapsed();
        if let Err(e) = record.emit(self.recorder.as_ref()).await {
            warn!(service = %self.options.service, %e, "record");
        }
    }

    async fn handle_conn(
        &self,
        ctx: &ConnContext,
        conn: Conn,
        record: &mut HandlerRecord,
        start: Instant,
    ) -> Result<()> {
        if !self.options.check_rate_limit(&record.client_ip) {
            return Err(Error::RateLimited);
        }

        let network = if conn.is_datagram() {
            Network::Udp
        } else {
            Network::Tcp
        };
        record.network = network.to_string();

        let mut flow = Flow {
            network,
            proto: None,
            host: None,
            remote: conn.peer_addr(),
            local: conn.local_addr(),
        };

        if network == Network::Tcp && self.md.sniffing {
            let mut stream = PeekableStream::new(conn.into_stream());

            // The sniff runs under its own read deadline; the stream
            // afterwards carries no deadline at all.
            let sniffed = if self.md.sniffing_timeout.is_zero() {
                sniff::sniff(&mut stream).await?
            } else {
                tokio::time::timeout(self.md.sniffing_timeout, sniff::sniff(&mut stream))
                    .await
                    .map_err(|_| Error::Timeout)??
            };
            flow.proto = sniffed;
            record.proto = sniffed.map(|p| p.to_string());

            match sniffed {
                Some(Protocol::Http) => {
                    let sub = record.hand_over();
                    return self.handle_http(ctx, stream, flow, sub, start).await;
                }
                Some(Protocol::Tls) => {
                    let sub = record.hand_over();
                    return self.handle_tls(ctx, stream, flow, sub, start).await;
                }
                None => {}
            }

            return self.forward(ctx, Box::new(stream), flow, record).await;
        }

        self.forward(ctx, conn.into_stream(), flow, record).await
    }

    /// HTTP sub-handler: capture the request head, then forward with
    /// the virtual host driving node selection.
    async fn handle_http(
        &self,
        ctx: &ConnContext,
        mut stream: PeekableStream,
        mut flow: Flow,
        mut record: HandlerRecord,
        start: Instant,
    ) -> Result<()> {
        let result = match sniff::peek_http_head(&mut stream).await {
            Ok(Some(head)) => {
                record.host = head.host.clone();
                record.http = Some(HttpRecord {
                    host: head.host.clone(),
                    method: head.method.clone(),
                    proto: head.version.clone(),
                    scheme: "http".to_string(),
                    uri: head.uri.clone(),
                    ..Default::default()
                });
                flow.host = Some(crate::common::split_host(&head.host).to_string());
                self.forward(ctx, Box::new(stream), flow, &mut record).await
            }
            Ok(None) => Err(Error::Protocol("malformed HTTP request head".into())),
            Err(e) => Err(e.into()),
        };

        self.finalize(&mut record, start, &result).await;
        result
    }

    /// TLS sub-handler: capture the ClientHello, then forward with
    /// the server name driving node selection.
    async fn handle_tls(
        &self,
        ctx: &ConnContext,
        mut stream: PeekableStream,
        mut flow: Flow,
        mut record: HandlerRecord,
        start: Instant,
    ) -> Result<()> {
        let result = match sniff::peek_client_hello(&mut stream).await {
            Ok(Some(hello)) => {
                record.host = hello.server_name.clone();
                record.tls = Some(TlsRecord {
                    server_name: hello.server_name.clone(),
                    version: hello.version.clone(),
                    client_hello: super::hex(&hello.raw),
                    ..Default::default()
                });
                if !hello.server_name.is_empty() {
                    flow.host = Some(hello.server_name.clone());
                }
                self.forward(ctx, Box::new(stream), flow, &mut record).await
            }
            Ok(None) => Err(Error::Protocol("malformed TLS client hello".into())),
            Err(e) => Err(e.into()),
        };

        self.finalize(&mut record, start, &result).await;
        result
    }

    /// The forwarding tail shared by every path: select, dial,
    /// wrap, splice.
    async fn forward(
        &self,
        ctx: &ConnContext,
        stream: Stream,
        flow: Flow,
        record: &mut HandlerRecord,
    ) -> Result<()> {
        let mut hints = SelectHints::default().with_protocol(flow.proto);
        if let Some(host) = &flow.host {
            hints = hints.with_host(host.clone());
        }
        if let Some(client_id) = &ctx.client_id {
            hints = hints.with_client_id(client_id.clone());
        }

        let target = self.hop.select(&hints).await.ok_or(Error::NodeUnavailable)?;
        let mut network = flow.network;
        if let Some(n) = target.network() {
            network = n;
        }
        record.network = network.to_string();
        if record.host.is_empty() {
            record.host = target.addr().to_string();
        }

        if let Some(bypass) = &self.options.bypass {
            let addr = target.addr().to_string();
            if bypass.contains(network, &addr).await {
                debug!(service = %self.options.service, %addr, "bypass");
                return Err(Error::Bypassed(addr));
            }
        }

        debug!(
            service = %self.options.service,
            node = target.name(),
            dst = %format_args!("{}/{}", target.addr(), network),
            "forwarding"
        );

        let dial = self.options.router.dial(network, target.addr());
        let dialed = tokio::select! {
            _ = ctx.cancel.cancelled() => Err(Error::Canceled),
            result = dial => result,
        };

        let (mut upstream, trace) = match dialed {
            Ok(ok) => ok,
            Err(e) => {
                // The route may have failed on an inner hop rather
                // than the selected node itself; the marker policy
                // stays with the selector.
                target.marker().mark();
                return Err(e);
            }
        };
        target.marker().reset();
        record.route = trace.to_string();

        if self.md.proxy_protocol > 0 {
            let src = proxyproto::normalize(flow.remote);
            let dst = proxyproto::normalize(flow.local);
            proxyproto::write_header(&mut upstream, self.md.proxy_protocol, network, src, dst)
                .await?;
        }

        self.splice_wrapped(ctx, stream, upstream, network, &flow, target.addr().to_string())
            .await
    }

    /// Apply the traffic/stats wrappers and run the splice until one
    /// side closes or the service shuts down.
    async fn splice_wrapped(
        &self,
        ctx: &ConnContext,
        stream: Stream,
        upstream: Conn,
        network: Network,
        flow: &Flow,
        target_addr: String,
    ) -> Result<()> {
        let client_key = ctx
            .client_id
            .clone()
            .unwrap_or_else(|| flow.remote.map(|a| a.ip().to_string()).unwrap_or_default());

        let mut stream = stream;
        if let Some(traffic_limiter) = &self.options.traffic_limiter {
            let opts = LimitOptions {
                service: self.options.service.clone(),
                network: network.to_string(),
                addr: target_addr.clone(),
                client: client_key.clone(),
                src: flow.remote.map(|a| a.to_string()).unwrap_or_default(),
            };
            if let Some(budget) = traffic_limiter.limiter(Scope::Client, &client_key, &opts) {
                stream = Box::new(LimitedStream::new(stream, budget));
            }
        }

        let pstats = self.options.observer.as_ref().map(|_| {
            let pstats = self.stats.stats(&client_key);
            pstats.add(Kind::TotalConns, 1);
            pstats.add(Kind::CurrentConns, 1);
            pstats
        });
        if let Some(pstats) = &pstats {
            stream = Box::new(StatsStream::new(stream, pstats.clone()));
        }

        let started = Instant::now();
        info!(
            service = %self.options.service,
            dst = %target_addr,
            "{} <-> {}",
            flow.remote.map(|a| a.to_string()).unwrap_or_default(),
            target_addr
        );

        let spliced = tokio::select! {
            _ = ctx.cancel.cancelled() => None,
            moved = splice(stream, upstream) => Some(moved),
        };

        if let Some(pstats) = &pstats {
            pstats.add(Kind::CurrentConns, -1);
            if spliced.is_none() {
                pstats.add(Kind::TotalErrs, 1);
            }
        }
        if let (Some(observer), Some(pstats)) = (&self.options.observer, &pstats) {
            observer
                .observe(StatsEvent {
                    service: self.options.service.clone(),
                    client: client_key.clone(),
                    stats: pstats.snapshot(),
                })
                .await;
        }

        match spliced {
            Some((up, down)) => {
                metrics::HANDLER_BYTES_UPLOADED
                    .with_label_values(&[&self.options.service])
                    .inc_by(up);
                metrics::HANDLER_BYTES_DOWNLOADED
                    .with_label_values(&[&self.options.service])
                    .inc_by(down);
                info!(
                    service = %self.options.service,
                    duration = ?started.elapsed(),
                    "{} >-< {} (\u{2191}{} \u{2193}{})",
                    flow.remote.map(|a| a.to_string()).unwrap_or_default(),
                    target_addr,
                    up,
                    down
                );
                Ok(())
            }
            None => Err(Error::Canceled),
        }
    }
}

#[async_trait]
impl Handler for ForwardHandler {
    async fn handle(&self, ctx: &ConnContext, conn: Conn) -> Result<()> {
        let start = Instant::now();
        metrics::HANDLER_CONNECTIONS_TOTAL
            .with_label_values(&[&self.options.service])
            .inc();

        let mut record = HandlerRecord::new(&self.options.service, &ctx.sid);
        record.client_id = ctx.client_id.clone();
        record.remote = conn
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        record.local = conn
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        record.client_ip = conn
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_default();

        info!(
            service = %self.options.service,
            sid = %ctx.sid,
            "{} <> {}",
            record.remote,
            record.local
        );

        let result = self.handle_conn(ctx, conn, &mut record, start).await;
        self.finalize(&mut record, start, &result).await;

        info!(
            service = %self.options.service,
            sid = %ctx.sid,
            duration = ?start.elapsed(),
            "{} >< {}",
            record.remote,
            record.local
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Node, NodeGroup, Router, Strategy};
    use crate::recorder::testing::MemoryRecorder;
    use crate::recorder::{RecorderBinding, RECORDER_SERVICE_HANDLER};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    fn handler_for(addr: std::net::SocketAddr, sink: Arc<MemoryRecorder>) -> ForwardHandler {
        let node = Arc::new(Node::new("upstream", addr.into()));
        let hop = Arc::new(NodeGroup::new(vec![node], Strategy::RoundRobin));
        let options = HandlerOptions::new("test", Arc::new(Router::new())).with_recorders(vec![
            RecorderBinding::new(RECORDER_SERVICE_HANDLER, sink as Arc<dyn Recorder>),
        ]);
        ForwardHandler::new(hop, options)
    }

    fn conn_pair() -> (Conn, tokio::io::DuplexStream) {
        let (client, far) = tokio::io::duplex(4096);
        let conn = Conn::new(
            Box::new(client),
            Some("127.0.0.1:8000".parse().unwrap()),
            Some("192.0.2.9:40000".parse().unwrap()),
        );
        (conn, far)
    }

    #[tokio::test]
    async fn test_forward_and_single_record() {
        let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let (mut sock, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let sink = Arc::new(MemoryRecorder::default());
        let handler = handler_for(upstream_addr, sink.clone());

        let (conn, mut far) = conn_pair();
        let ctx = ConnContext::new(CancellationToken::new());
        let task = tokio::spawn(async move { handler.handle(&ctx, conn).await });

        far.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        drop(far);

        task.await.unwrap().unwrap();
        echo.await.unwrap();

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let value: serde_json::Value = serde_json::from_slice(&records[0]).unwrap();
        assert_eq!(value["service"], "test");
        assert_eq!(value["network"], "tcp");
        assert_eq!(value["clientIP"], "192.0.2.9");
        assert!(value["duration"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_http_sniff_dispatch_emits_once() {
        let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = upstream.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"GET /"));
            sock.write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                .await
                .unwrap();
        });

        let sink = Arc::new(MemoryRecorder::default());
        let handler = handler_for(upstream_addr, sink.clone()).with_meta(HandlerMeta {
            sniffing: true,
            ..Default::default()
        });

        let (conn, mut far) = conn_pair();
        let ctx = ConnContext::new(CancellationToken::new());
        let task = tokio::spawn(async move { handler.handle(&ctx, conn).await });

        far.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        let mut buf = [0u8; 64];
        let n = far.read(&mut buf).await.unwrap();
        response.extend_from_slice(&buf[..n]);
        assert!(response.starts_with(b"HTTP/1.1 204"));
        drop(far);

        task.await.unwrap().unwrap();
        server.await.unwrap();

        // Exactly one record: the sub-handler's. It carries the
        // sniffed protocol and the virtual host.
        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let value: serde_json::Value = serde_json::from_slice(&records[0]).unwrap();
        assert_eq!(value["proto"], "http");
        assert_eq!(value["host"], "x");
        assert_eq!(value["http"]["method"], "GET");
    }

    #[tokio::test]
    async fn test_no_node_fails_with_record() {
        let sink = Arc::new(MemoryRecorder::default());
        let hop = Arc::new(NodeGroup::new(vec![], Strategy::RoundRobin));
        let options = HandlerOptions::new("test", Arc::new(Router::new())).with_recorders(vec![
            RecorderBinding::new(RECORDER_SERVICE_HANDLER, sink.clone() as Arc<dyn Recorder>),
        ]);
        let handler = ForwardHandler::new(hop, options);

        let (conn, _far) = conn_pair();
        let ctx = ConnContext::new(CancellationToken::new());
        let err = handler.handle(&ctx, conn).await.unwrap_err();
        assert!(matches!(err, Error::NodeUnavailable));

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let value: serde_json::Value = serde_json::from_slice(&records[0]).unwrap();
        assert_eq!(value["err"], "node not available");
    }

    #[tokio::test]
    async fn test_dial_failure_marks_node() {
        let sink = Arc::new(MemoryRecorder::default());
        let node = Arc::new(Node::new("dead", "127.0.0.1:1".parse().unwrap()));
        let hop = Arc::new(NodeGroup::new(vec![node.clone()], Strategy::RoundRobin));
        let options = HandlerOptions::new("test", Arc::new(Router::new()));
        let handler = ForwardHandler::new(hop, options);
        drop(sink);

        let (conn, _far) = conn_pair();
        let ctx = ConnContext::new(CancellationToken::new());
        assert!(handler.handle(&ctx, conn).await.is_err());
        assert_eq!(node.marker().failures(), 1);
    }
}
