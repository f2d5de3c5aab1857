//! Structured per-event records and their sinks
//!
//! Handlers and the router emit opaque JSON documents to recorder
//! sinks, addressed by tag. Emission is best-effort everywhere: sink
//! errors are logged, never propagated to the connection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Record tag namespace. The engine emits with these tags; sinks are
/// bound to the tags they consume.
pub const RECORDER_SERVICE_HANDLER: &str = "recorder.service.handler";
pub const RECORDER_SERVICE_HANDLER_SERIAL: &str = "recorder.service.handler.serial";
pub const RECORDER_SERVICE_HANDLER_TUNNEL: &str = "recorder.service.handler.tunnel";
pub const RECORDER_SERVICE_ROUTER_DIAL_ADDRESS: &str = "recorder.service.router.dial.address";
pub const RECORDER_SERVICE_ROUTER_DIAL_ADDRESS_ERROR: &str =
    "recorder.service.router.dial.address.error";

/// A sink consuming opaque record payloads.
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn record(&self, data: &[u8]) -> Result<()>;
}

/// A recorder bound to the tag it consumes.
#[derive(Clone)]
pub struct RecorderBinding {
    pub tag: String,
    pub recorder: Arc<dyn Recorder>,
}

impl RecorderBinding {
    pub fn new(tag: impl Into<String>, recorder: Arc<dyn Recorder>) -> Self {
        Self {
            tag: tag.into(),
            recorder,
        }
    }
}

/// Whether a record is still owned by its creator.
///
/// Dispatching a connection to a sub-handler hands the record over: a
/// clone goes along as `Pending` and the original flips to `Consumed`,
/// so the deferred emit at the outer layer becomes a no-op and every
/// connection produces at most one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitState {
    Pending,
    Consumed,
}

/// HTTP exchange captured by the HTTP sub-handler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpRecord {
    pub host: String,
    pub method: String,
    pub proto: String,
    pub scheme: String,
    pub uri: String,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub request: HttpBodyRecord,
    pub response: HttpBodyRecord,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpBodyRecord {
    #[serde(rename = "contentLength")]
    pub content_length: i64,
    pub header: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

/// TLS handshake captured by the TLS sub-handler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TlsRecord {
    #[serde(rename = "serverName")]
    pub server_name: String,
    #[serde(rename = "cipherSuite")]
    pub cipher_suite: String,
    #[serde(rename = "compressionMethod")]
    pub compression_method: u8,
    pub proto: String,
    pub version: String,
    #[serde(rename = "clientHello")]
    pub client_hello: String,
    #[serde(rename = "serverHello")]
    pub server_hello: String,
}

/// DNS exchange captured by the DNS sub-handler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DnsRecord {
    pub id: u16,
    pub name: String,
    pub class: String,
    #[serde(rename = "type")]
    pub typ: String,
    pub question: String,
    pub answer: String,
    pub cached: bool,
}

/// Per-connection record emitted when the connection closes.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerRecord {
    pub service: String,
    pub network: String,
    pub remote: String,
    pub local: String,
    pub host: String,
    #[serde(rename = "clientIP")]
    pub client_ip: String,
    #[serde(rename = "clientID", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsRecord>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub route: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(serialize_with = "as_nanos")]
    pub duration: Duration,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub sid: String,

    #[serde(skip)]
    state: EmitState,
}

fn as_nanos<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_i64(d.as_nanos() as i64)
}

impl HandlerRecord {
    pub fn new(service: impl Into<String>, sid: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            network: String::new(),
            remote: String::new(),
            local: String::new(),
            host: String::new(),
            client_ip: String::new(),
            client_id: None,
            proto: None,
            http: None,
            tls: None,
            dns: None,
            route: String::new(),
            err: None,
            duration: Duration::ZERO,
            time: OffsetDateTime::now_utc(),
            sid: sid.into(),
            state: EmitState::Pending,
        }
    }

    pub fn state(&self) -> EmitState {
        self.state
    }

    /// Hand the record over to a sub-handler: the returned clone is
    /// emittable, this record no longer is.
    pub fn hand_over(&mut self) -> HandlerRecord {
        let clone = self.clone();
        self.state = EmitState::Consumed;
        clone
    }

    /// Serialize and emit to the sink. A no-op when no sink is bound
    /// or the record was handed over to a sub-handler.
    pub async fn emit(&self, recorder: Option<&Arc<dyn Recorder>>) -> Result<()> {
        let recorder = match recorder {
            Some(r) if self.state == EmitState::Pending => r,
            _ => return Ok(()),
        };

        let data = serde_json::to_vec(self)
            .map_err(|e| Error::Protocol(format!("encode record: {}", e)))?;
        recorder.record(&data).await
    }
}

/// Sink appending one JSON document per line to a file.
///
/// Writes are serialized internally; callers never hold a lock across
/// an emit.
pub struct FileRecorder {
    file: Mutex<tokio::fs::File>,
    path: PathBuf,
}

impl FileRecorder {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl Recorder for FileRecorder {
    async fn record(&self, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(data).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// In-memory sink collecting payloads for assertions.
    #[derive(Default)]
    pub struct MemoryRecorder {
        pub records: StdMutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Recorder for MemoryRecorder {
        async fn record(&self, data: &[u8]) -> Result<()> {
            self.records.lock().unwrap().push(data.to_vec());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryRecorder;
    use super::*;

    #[tokio::test]
    async fn test_emit_skips_when_consumed() {
        let sink = Arc::new(MemoryRecorder::default());
        let recorder: Arc<dyn Recorder> = sink.clone();

        let mut outer = HandlerRecord::new("svc", "sid-1");
        let inner = outer.hand_over();

        outer.emit(Some(&recorder)).await.unwrap();
        assert!(sink.records.lock().unwrap().is_empty());

        inner.emit(Some(&recorder)).await.unwrap();
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_emit_without_sink_is_noop() {
        let record = HandlerRecord::new("svc", "sid-1");
        record.emit(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_json_shape() {
        let mut record = HandlerRecord::new("svc", "sid-9");
        record.network = "tcp".to_string();
        record.remote = "192.0.2.1:50000".to_string();
        record.local = "127.0.0.1:8000".to_string();
        record.host = "example.com:443".to_string();
        record.client_ip = "192.0.2.1".to_string();
        record.duration = Duration::from_nanos(1_500_000);

        let value: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&record).unwrap()).unwrap();
        assert_eq!(value["service"], "svc");
        assert_eq!(value["clientIP"], "192.0.2.1");
        assert_eq!(value["duration"], 1_500_000);
        assert_eq!(value["sid"], "sid-9");
        // Optional fields are omitted when absent.
        assert!(value.get("proto").is_none());
        assert!(value.get("err").is_none());
        assert!(value.get("clientID").is_none());
        // RFC 3339 timestamp.
        assert!(value["time"].as_str().unwrap().contains('T'));
    }
}
