//! Remote peer descriptors.
//!
//! A [`Contact`] is a pure description of a peer: identifier, socket
//! address, and when we last heard from it. There is no connection to own
//! (the transport is connectionless); lookups copy contacts freely and the
//! routing table stores them by value.
//!
//! Identity is the node id alone: the address and freshness of the same
//! peer may change without making it a different contact.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use weft_wire::Value;

use crate::id::NodeId;
use crate::{DhtError, Result};

/// Information about a remote node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    /// The peer's 160-bit identifier.
    pub id: NodeId,
    /// The peer's UDP address.
    #[serde(with = "socket_addr_serde")]
    pub addr: SocketAddr,
    /// Unix timestamp (seconds) of the last datagram from this peer.
    pub last_seen: u64,
}

impl Contact {
    /// Create a contact first seen now.
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: unix_now(),
        }
    }

    /// Record that the peer was just heard from.
    pub fn touch(&mut self) {
        self.last_seen = unix_now();
    }

    /// Encode as the wire triple `(id, host, port)` used in `FIND_NODE`
    /// replies.
    pub fn to_wire(&self) -> Value {
        Value::List(vec![
            Value::bytes(self.id.to_vec()),
            Value::bytes(self.addr.ip().to_string().into_bytes()),
            Value::Int(i64::from(self.addr.port())),
        ])
    }

    /// Decode a wire triple back into a contact.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::InvalidArguments`] when the triple is mis-shaped,
    /// the id has the wrong length, or the host does not parse as an IP
    /// address.
    pub fn from_wire(value: &Value) -> Result<Self> {
        let items = value
            .as_list()
            .ok_or_else(|| DhtError::InvalidArguments("contact is not a triple".into()))?;
        let [id, host, port] = items else {
            return Err(DhtError::InvalidArguments(format!(
                "contact triple has {} elements",
                items.len()
            )));
        };

        let id: NodeId = id
            .as_bytes()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| DhtError::InvalidArguments("contact id malformed".into()))?;
        let host = host
            .as_bytes()
            .and_then(|b| std::str::from_utf8(b).ok())
            .ok_or_else(|| DhtError::InvalidArguments("contact host malformed".into()))?;
        let ip: std::net::IpAddr = host
            .parse()
            .map_err(|_| DhtError::InvalidArguments(format!("bad contact host {host}")))?;
        let port = port
            .as_int()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| DhtError::InvalidArguments("contact port malformed".into()))?;

        Ok(Contact::new(id, SocketAddr::new(ip, port)))
    }
}

/// Contacts are equal when their ids are equal.
impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", hex::encode(&self.id[..4]), self.addr)
    }
}

/// Seconds since the Unix epoch; zero if the clock is before it.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Serde support for `SocketAddr` as a string.
mod socket_addr_serde {
    use std::net::SocketAddr;

    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
