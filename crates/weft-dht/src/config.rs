//! Node configuration.
//!
//! All knobs default to the protocol constants; a TOML file (or string)
//! can override any subset of fields. `validate()` runs before a node
//! binds its socket.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use weft_wire::framing::FRAGMENT_HEADER_LEN;

use crate::{
    DhtError, Result, ALPHA, EXPIRE_INTERVAL_SECS, K, MAX_DATAGRAM, REFRESH_INTERVAL_SECS,
    REPUBLISH_INTERVAL_SECS, RPC_TIMEOUT_SECS,
};

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// UDP address to bind; port 0 picks an ephemeral port.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Seed node addresses for joining the overlay.
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,
    /// Bucket capacity.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Lookup parallelism.
    #[serde(default = "default_alpha")]
    pub alpha: usize,
    /// Per-RPC timeout in seconds.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    /// Idle-bucket refresh interval in seconds.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Value republish interval in seconds.
    #[serde(default = "default_republish_interval")]
    pub republish_interval_secs: u64,
    /// Value expiry interval in seconds.
    #[serde(default = "default_expire")]
    pub expire_secs: u64,
    /// Maximum UDP datagram size, fragment header included.
    #[serde(default = "default_max_datagram")]
    pub max_datagram: usize,
}

// Default value functions

fn default_bind_addr() -> String {
    "0.0.0.0:0".to_string()
}

fn default_k() -> usize {
    K
}

fn default_alpha() -> usize {
    ALPHA
}

fn default_rpc_timeout() -> u64 {
    RPC_TIMEOUT_SECS
}

fn default_refresh_interval() -> u64 {
    REFRESH_INTERVAL_SECS
}

fn default_republish_interval() -> u64 {
    REPUBLISH_INTERVAL_SECS
}

fn default_expire() -> u64 {
    EXPIRE_INTERVAL_SECS
}

fn default_max_datagram() -> usize {
    MAX_DATAGRAM
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bootstrap_nodes: Vec::new(),
            k: default_k(),
            alpha: default_alpha(),
            rpc_timeout_secs: default_rpc_timeout(),
            refresh_interval_secs: default_refresh_interval(),
            republish_interval_secs: default_republish_interval(),
            expire_secs: default_expire(),
            max_datagram: default_max_datagram(),
        }
    }
}

impl NodeConfig {
    /// Parse a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::Config`] for unparseable TOML.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| DhtError::Config(e.to_string()))
    }

    /// Load a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::Io`] when the file cannot be read and
    /// [`DhtError::Config`] when it cannot be parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(DhtError::Config("k must be at least 1".into()));
        }
        if self.alpha == 0 {
            return Err(DhtError::Config("alpha must be at least 1".into()));
        }
        if self.rpc_timeout_secs == 0 {
            return Err(DhtError::Config("rpc_timeout_secs must be at least 1".into()));
        }
        if self.max_datagram <= FRAGMENT_HEADER_LEN {
            return Err(DhtError::Config(format!(
                "max_datagram must exceed the {FRAGMENT_HEADER_LEN}-byte fragment header",
            )));
        }
        self.bind_addr()?;
        self.bootstrap_addrs()?;
        Ok(())
    }

    /// The parsed bind address.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::Config`] when the address does not parse.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind_addr
            .parse()
            .map_err(|_| DhtError::Config(format!("bad bind_addr {}", self.bind_addr)))
    }

    /// The parsed bootstrap addresses.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::Config`] naming the first bad address.
    pub fn bootstrap_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.bootstrap_nodes
            .iter()
            .map(|raw| {
                raw.parse()
                    .map_err(|_| DhtError::Config(format!("bad bootstrap node {raw}")))
            })
            .collect()
    }

    /// The RPC timeout as a duration.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    /// The bucket refresh interval as a duration.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// The republish interval as a duration.
    pub fn republish_interval(&self) -> Duration {
        Duration::from_secs(self.republish_interval_secs)
    }
}
