//! Corridor - a programmable L4/L7 tunneling gateway
//!
//! # Architecture
//!
//! ```text
//! Service (accept)
//! → Handler (admission, sniffing, selection)
//! → Router (resolve, chain, retry, trace)
//! → Route (nodes) → Transport (TCP/UDP)
//! → splice
//! ```
//!
//! ## Core Principles
//!
//! - Declarative configuration turns into an Environment of named
//!   collaborators; no process-wide registries
//! - Handlers only see traits: Chain, Hop, Bypass, Recorder, ...
//! - Dead upstreams are marked and skipped on later selections
//! - Every connection emits at most one JSON record
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Conn, Address, splice
//! ├── transport/       # Direct dial/bind: TCP, UDP
//! ├── chain/           # Node, Route, Chain, Hop, Router
//! ├── handler/         # Forward and relay handlers
//! ├── sniff.rs         # Protocol detection on first bytes
//! ├── recorder.rs      # Per-connection records and sinks
//! ├── policy.rs        # Auther, Admission, Bypass
//! ├── limiter.rs       # Rate and traffic limiting
//! ├── stats.rs         # Per-client counters, Observer
//! └── app/             # Environment, Service, Runtime, metrics
//! ```

// Core types
pub mod common;
pub mod error;

// Forwarding engine
pub mod chain;
pub mod handler;
pub mod resolver;
pub mod sniff;
pub mod transport;

// Collaborators
pub mod limiter;
pub mod policy;
pub mod proxyproto;
pub mod recorder;
pub mod serial;
pub mod stats;

// Application
pub mod app;
pub mod config;

// Re-exports for convenience
pub use common::{Address, Conn, Network, Stream};
pub use config::Config;
pub use error::{Error, Result};

// Architecture re-exports
pub use app::{Environment, Runtime, Service};
pub use chain::{Chain, Hop, Node, Route, Router};
pub use handler::Handler;
pub use recorder::Recorder;
