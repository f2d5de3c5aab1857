//! Prometheus-based metrics module
//!
//! Counters for the handler and router hot paths. Everything
//! registers into a crate-local registry the embedder can expose.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Handler Metrics ===

    /// Total connections per service
    pub static ref HANDLER_CONNECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("corridor_handler_connections_total", "Total connections per service"),
        &["service"]
    ).unwrap();

    /// Handler errors per service
    pub static ref HANDLER_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("corridor_handler_errors_total", "Handler errors per service"),
        &["service"]
    ).unwrap();

    /// Bytes moved client -> upstream per service
    pub static ref HANDLER_BYTES_UPLOADED: IntCounterVec = IntCounterVec::new(
        Opts::new("corridor_handler_bytes_uploaded_total", "Bytes uploaded per service"),
        &["service"]
    ).unwrap();

    /// Bytes moved upstream -> client per service
    pub static ref HANDLER_BYTES_DOWNLOADED: IntCounterVec = IntCounterVec::new(
        Opts::new("corridor_handler_bytes_downloaded_total", "Bytes downloaded per service"),
        &["service"]
    ).unwrap();

    // === Router Metrics ===

    /// Total dial attempts
    pub static ref ROUTER_DIALS_TOTAL: IntCounter = IntCounter::new(
        "corridor_router_dials_total",
        "Total number of router dials"
    ).unwrap();

    /// Dials that failed after all retries
    pub static ref ROUTER_DIAL_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "corridor_router_dial_errors_total",
        "Total number of router dial failures"
    ).unwrap();

    // === Service Metrics ===

    /// Currently active service connections
    pub static ref SERVICE_CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "corridor_service_connections_active",
        "Number of currently active connections"
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(HANDLER_CONNECTIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(HANDLER_ERRORS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(HANDLER_BYTES_UPLOADED.clone())).ok();
    REGISTRY.register(Box::new(HANDLER_BYTES_DOWNLOADED.clone())).ok();
    REGISTRY.register(Box::new(ROUTER_DIALS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(ROUTER_DIAL_ERRORS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(SERVICE_CONNECTIONS_ACTIVE.clone())).ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        init_metrics();
        init_metrics();

        ROUTER_DIALS_TOTAL.inc();
        assert!(ROUTER_DIALS_TOTAL.get() >= 1);
    }
}
