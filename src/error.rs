//! Error types for Corridor

use thiserror::Error;

/// Main error type for Corridor
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("unresolvable host: {0}")]
    UnresolvableHost(String),

    #[error("empty route")]
    EmptyRoute,

    #[error("node not available")]
    NodeUnavailable,

    #[error("bypassed: {0}")]
    Bypassed(String),

    #[error("rate limited")]
    RateLimited,

    #[error("not admitted")]
    NotAdmitted,

    #[error("dial {0}: {1}")]
    Dial(String, String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("canceled")]
    Canceled,

    #[error("timeout")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Short label stored in the `err` field of connection records.
    pub fn label(&self) -> String {
        match self {
            Error::Canceled => "canceled".to_string(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for Corridor
pub type Result<T> = std::result::Result<T, Error>;
