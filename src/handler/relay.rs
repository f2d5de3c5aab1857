//! Relay handler
//!
//! A framed variant of the forwarder: the client opens the session
//! with a request naming the target, the handler answers with a
//! status frame and splices. Targets may live on TCP/UDP, an AF_UNIX
//! socket, or a serial port; the latter two bypass the router.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::app::metrics;
use crate::common::{
    splice, split_host, Address, BufferedWriteStream, Conn, Network, PeekableStream, Stream,
};
use crate::error::{Error, Result};
use crate::limiter::{LimitOptions, LimitedStream, Scope};
use crate::recorder::{EmitState, HandlerRecord, HttpRecord, Recorder, TlsRecord};
use crate::serial;
use crate::sniff::{self, Protocol};
use crate::stats::{ClientStats, Kind, StatsEvent, StatsStream};

use super::{ConnContext, Handler, HandlerMeta, HandlerOptions};

/// Relay protocol version.
pub const RELAY_VERSION: u8 = 1;

/// Session statuses.
pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_FORBIDDEN: u16 = 403;
pub const STATUS_NETWORK_UNREACHABLE: u16 = 502;

/// Commands.
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;

const FEATURE_ADDR: u8 = 0x01;
const FEATURE_AUTH: u8 = 0x02;

/// Cap on a single feature payload.
const MAX_FEATURE_LEN: usize = 1024;

/// Session request: version, command, and feature list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayRequest {
    pub version: u8,
    pub cmd: u8,
    pub network: Network,
    pub addr: String,
    pub auth: Option<(String, String)>,
}

impl RelayRequest {
    pub fn connect(network: Network, addr: impl Into<String>) -> Self {
        Self {
            version: RELAY_VERSION,
            cmd: CMD_CONNECT,
            network,
            addr: addr.into(),
            auth: None,
        }
    }

    pub fn with_auth(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.auth = Some((user.into(), pass.into()));
        self
    }

    pub fn encode(&self) -> BytesMut {
        let mut features: Vec<(u8, Vec<u8>)> = Vec::new();

        let mut addr = Vec::new();
        addr.push(network_byte(self.network));
        let host = self.addr.as_bytes();
        addr.push(host.len().min(255) as u8);
        addr.extend_from_slice(&host[..host.len().min(255)]);
        features.push((FEATURE_ADDR, addr));

        if let Some((user, pass)) = &self.auth {
            let mut auth = Vec::new();
            auth.push(user.len().min(255) as u8);
            auth.extend_from_slice(&user.as_bytes()[..user.len().min(255)]);
            auth.push(pass.len().min(255) as u8);
            auth.extend_from_slice(&pass.as_bytes()[..pass.len().min(255)]);
            features.push((FEATURE_AUTH, auth));
        }

        let mut buf = BytesMut::new();
        buf.put_u8(self.version);
        buf.put_u8(self.cmd);
        buf.put_u8(features.len() as u8);
        for (typ, data) in features {
            buf.put_u8(typ);
            buf.put_u16(data.len() as u16);
            buf.put_slice(&data);
        }
        buf
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; 3];
        reader.read_exact(&mut head).await?;
        let [version, cmd, nfeatures] = head;
        if version != RELAY_VERSION {
            return Err(Error::Protocol(format!("relay version {}", version)));
        }

        let mut request = RelayRequest {
            version,
            cmd,
            ..Default::default()
        };

        for _ in 0..nfeatures {
            let mut header = [0u8; 3];
            reader.read_exact(&mut header).await?;
            let typ = header[0];
            let len = u16::from_be_bytes([header[1], header[2]]) as usize;
            if len > MAX_FEATURE_LEN {
                return Err(Error::Protocol(format!("feature length {}", len)));
            }
            let mut data = vec![0u8; len];
            reader.read_exact(&mut data).await?;

            match typ {
                FEATURE_ADDR => {
                    if data.len() < 2 {
                        return Err(Error::Protocol("short addr feature".into()));
                    }
                    request.network = parse_network_byte(data[0])?;
                    let host_len = data[1] as usize;
                    let host = data
                        .get(2..2 + host_len)
                        .ok_or_else(|| Error::Protocol("short addr feature".into()))?;
                    request.addr = String::from_utf8(host.to_vec())
                        .map_err(|_| Error::Protocol("addr not utf-8".into()))?;
                }
                FEATURE_AUTH => {
                    let ulen = *data.first().ok_or_else(|| {
                        Error::Protocol("short auth feature".into())
                    })? as usize;
                    let user = data
                        .get(1..1 + ulen)
                        .ok_or_else(|| Error::Protocol("short auth feature".into()))?;
                    let plen = *data
                        .get(1 + ulen)
                        .ok_or_else(|| Error::Protocol("short auth feature".into()))?
                        as usize;
                    let pass = data
                        .get(2 + ulen..2 + ulen + plen)
                        .ok_or_else(|| Error::Protocol("short auth feature".into()))?;
                    request.auth = Some((
                        String::from_utf8_lossy(user).into_owned(),
                        String::from_utf8_lossy(pass).into_owned(),
                    ));
                }
                _ => {} // unknown features are skipped
            }
        }

        Ok(request)
    }
}

/// Session response, written verbatim at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayResponse {
    pub version: u8,
    pub status: u16,
}

impl RelayResponse {
    pub fn new(status: u16) -> Self {
        Self {
            version: RELAY_VERSION,
            status,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u8(self.version);
        buf.put_u16(self.status);
        buf.put_u8(0); // features
        buf
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await?;
        Ok(Self {
            version: buf[0],
            status: u16::from_be_bytes([buf[1], buf[2]]),
        })
    }
}

fn network_byte(network: Network) -> u8 {
    match network {
        Network::Tcp => 0,
        Network::Udp => 1,
        Network::Unix => 2,
        Network::Serial => 3,
    }
}

fn parse_network_byte(b: u8) -> Result<Network> {
    match b {
        0 => Ok(Network::Tcp),
        1 => Ok(Network::Udp),
        2 => Ok(Network::Unix),
        3 => Ok(Network::Serial),
        other => Err(Error::Protocol(format!("network byte {}", other))),
    }
}

/// Handler speaking the framed relay protocol.
pub struct RelayHandler {
    md: HandlerMeta,
    options: HandlerOptions,
    recorder: Option<Arc<dyn Recorder>>,
    stats: ClientStats,
}

impl RelayHandler {
    pub fn new(options: HandlerOptions) -> Self {
        let recorder = options.handler_recorder();
        Self {
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

    async fn handle_session(
        &self,
        ctx: &ConnContext,
        mut conn: Conn,
        record: &mut HandlerRecord,
        start: Instant,
    ) -> Result<()> {
        if !self.options.check_rate_limit(&record.client_ip) {
            return Err(Error::RateLimited);
        }

        let request = if self.md.read_timeout.is_zero() {
            RelayRequest::read_from(&mut conn).await
        } else {
            match tokio::time::timeout(self.md.read_timeout, RelayRequest::read_from(&mut conn))
                .await
            {
                Ok(request) => request,
                Err(_) => return Err(Error::Timeout),
            }
        };
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                let _ = conn
                    .write_all(&RelayResponse::new(STATUS_BAD_REQUEST).encode())
                    .await;
                return Err(e);
            }
        };

        // Authentication is all-or-nothing: a configured auther
        // rejects sessions without valid credentials.
        let mut ctx = ctx.clone();
        if let Some(auther) = &self.options.auther {
            let id = match &request.auth {
                Some((user, pass)) => auther.authenticate(user, pass).await,
                None => None,
            };
            match id {
                Some(id) => ctx.client_id = Some(id),
                None => {
                    let _ = conn
                        .write_all(&RelayResponse::new(STATUS_FORBIDDEN).encode())
                        .await;
                    return Err(Error::NotAdmitted);
                }
            }
        }
        record.client_id = ctx.client_id.clone();

        match request.cmd {
            CMD_CONNECT => {
                self.handle_connect(&ctx, conn, request.network, request.addr, record, start)
                    .await
            }
            cmd => {
                let _ = conn
                    .write_all(&RelayResponse::new(STATUS_BAD_REQUEST).encode())
                    .await;
                Err(Error::Protocol(format!("unsupported command {}", cmd)))
            }
        }
    }

    async fn handle_connect(
        &self,
        ctx: &ConnContext,
        mut conn: Conn,
        network: Network,
        address: String,
        record: &mut HandlerRecord,
        start: Instant,
    ) -> Result<()> {
        // Unix and serial targets carry no port.
        let address = match network {
            Network::Unix | Network::Serial => split_host(&address).to_string(),
            _ => address,
        };

        record.network = network.to_string();
        record.host = address.clone();

        debug!(
            service = %self.options.service,
            dst = %format_args!("{}/{}", address, network),
            cmd = "connect",
            "{} >> {}",
            record.remote,
            address
        );

        if address.is_empty() {
            conn.write_all(&RelayResponse::new(STATUS_BAD_REQUEST).encode())
                .await?;
            return Err(Error::Protocol("target not specified".into()));
        }

        if let Some(bypass) = &self.options.bypass {
            if bypass.contains(network, &address).await {
                debug!(service = %self.options.service, %address, "bypass");
                conn.write_all(&RelayResponse::new(STATUS_FORBIDDEN).encode())
                    .await?;
                return Err(Error::Bypassed(address));
            }
        }

        // Unix sockets and serial ports are local resources: they
        // bypass the router entirely.
        let dialed: Result<Conn> = match network {
            Network::Unix => tokio::net::UnixStream::connect(&address)
                .await
                .map(|s| Conn::new(Box::new(s), None, None))
                .map_err(Error::from),
            Network::Serial => serial::open(&serial::parse_config(&address))
                .map(|s| Conn::new(Box::new(s), None, None)),
            _ => {
                let addr: Address = match address.parse() {
                    Ok(addr) => addr,
                    Err(e) => {
                        conn.write_all(&RelayResponse::new(STATUS_BAD_REQUEST).encode())
                            .await?;
                        return Err(e);
                    }
                };
                let dial = self.options.router.dial(network, &addr);
                let dialed = tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(Error::Canceled),
                    result = dial => result,
                };
                dialed.map(|(cc, trace)| {
                    record.route = trace.to_string();
                    cc
                })
            }
        };

        let upstream = match dialed {
            Ok(upstream) => upstream,
            Err(e) => {
                conn.write_all(&RelayResponse::new(STATUS_NETWORK_UNREACHABLE).encode())
                    .await?;
                return Err(e);
            }
        };

        // The OK frame goes out eagerly with no_delay, otherwise it
        // rides along with the first downstream write.
        let response = RelayResponse::new(STATUS_OK);
        let mut stream: Stream = if self.md.no_delay {
            conn.write_all(&response.encode()).await?;
            conn.into_stream()
        } else {
            Box::new(BufferedWriteStream::new(conn.into_stream(), response.encode()))
        };

        let client_key = ctx
            .client_id
            .clone()
            .unwrap_or_else(|| record.client_ip.clone());
        if let Some(traffic_limiter) = &self.options.traffic_limiter {
            let opts = LimitOptions {
                service: self.options.service.clone(),
                network: network.to_string(),
                addr: address.clone(),
                client: client_key.clone(),
                src: record.remote.clone(),
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

        let result = if self.md.sniffing && network == Network::Tcp {
            let mut stream = PeekableStream::new(stream);
            let sniffed = if self.md.sniffing_timeout.is_zero() {
                sniff::sniff(&mut stream).await.map_err(Error::from)
            } else {
                match tokio::time::timeout(self.md.sniffing_timeout, sniff::sniff(&mut stream))
                    .await
                {
                    Ok(sniffed) => sniffed.map_err(Error::from),
                    Err(_) => Err(Error::Timeout),
                }
            };

            match sniffed {
                Err(e) => Err(e),
                Ok(sniffed) => {
                    record.proto = sniffed.map(|p| p.to_string());
                    match sniffed {
                        Some(proto) => {
                            let mut sub = record.hand_over();
                            let result = self
                                .annotate_and_splice(ctx, stream, upstream, proto, &mut sub)
                                .await;
                            self.finalize(&mut sub, start, &result).await;
                            result
                        }
                        None => {
                            self.splice_session(ctx, Box::new(stream), upstream, &address)
                                .await
                        }
                    }
                }
            }
        } else {
            self.splice_session(ctx, stream, upstream, &address).await
        };

        if let Some(pstats) = &pstats {
            pstats.add(Kind::CurrentConns, -1);
        }
        if let (Some(observer), Some(pstats)) = (&self.options.observer, &pstats) {
            observer
                .observe(StatsEvent {
                    service: self.options.service.clone(),
                    client: client_key,
                    stats: pstats.snapshot(),
                })
                .await;
        }

        result
    }

    /// Capture protocol details from the sniffed stream, then splice.
    async fn annotate_and_splice(
        &self,
        ctx: &ConnContext,
        mut stream: PeekableStream,
        upstream: Conn,
        proto: Protocol,
        record: &mut HandlerRecord,
    ) -> Result<()> {
        let target = record.host.clone();
        match proto {
            Protocol::Http => {
                if let Some(head) = sniff::peek_http_head(&mut stream).await? {
                    record.http = Some(HttpRecord {
                        host: head.host.clone(),
                        method: head.method,
                        proto: head.version,
                        scheme: "http".to_string(),
                        uri: head.uri,
                        ..Default::default()
                    });
                }
            }
            Protocol::Tls => {
                if let Some(hello) = sniff::peek_client_hello(&mut stream).await? {
                    record.tls = Some(TlsRecord {
                        server_name: hello.server_name,
                        version: hello.version,
                        client_hello: super::hex(&hello.raw),
                        ..Default::default()
                    });
                }
            }
        }
        self.splice_session(ctx, Box::new(stream), upstream, &target)
            .await
    }

    async fn splice_session(
        &self,
        ctx: &ConnContext,
        stream: Stream,
        upstream: Conn,
        address: &str,
    ) -> Result<()> {
        let started = Instant::now();
        info!(service = %self.options.service, "{} <-> {}", ctx.sid, address);

        let spliced = tokio::select! {
            _ = ctx.cancel.cancelled() => None,
            moved = splice(stream, upstream) => Some(moved),
        };

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
                    "{} >-< {}",
                    ctx.sid,
                    address
                );
                Ok(())
            }
            None => Err(Error::Canceled),
        }
    }
}

#[async_trait]
impl Handler for RelayHandler {
    async fn handle(&self, ctx: &ConnContext, conn: Conn) -> Result<()> {
        let start = Instant::now();
        metrics::HANDLER_CONNECTIONS_TOTAL
            .with_label_values(&[&self.options.service])
            .inc();

        let mut record = HandlerRecord::new(&self.options.service, &ctx.sid);
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

        let result = self.handle_session(ctx, conn, &mut record, start).await;
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
