//! Network kind for connections and dial targets

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Network type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Udp,
    /// AF_UNIX socket target, relay handler only.
    Unix,
    /// Serial port target, relay handler only.
    Serial,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
            Network::Unix => "unix",
            Network::Serial => "serial",
        }
    }

    /// True for the UDP family (`udp`, `udp4`, `udp6` in config form).
    pub fn is_udp(&self) -> bool {
        matches!(self, Network::Udp)
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" | "tcp4" | "tcp6" | "" => Ok(Network::Tcp),
            "udp" | "udp4" | "udp6" => Ok(Network::Udp),
            "unix" => Ok(Network::Unix),
            "serial" => Ok(Network::Serial),
            other => Err(Error::Config(format!("unknown network: {}", other))),
        }
    }
}
