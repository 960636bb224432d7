//! # weft-dht
//!
//! A Kademlia distributed hash table node.
//!
//! This crate implements:
//! - 160-bit node identifiers with the XOR distance metric via [`id`]
//! - A dynamically splitting tree of k-buckets via [`kbucket`] and [`routing`]
//! - A sans-I/O RPC endpoint (pending requests, timeouts, datagram
//!   reassembly) via [`rpc`]
//! - The parallel iterative lookup engine via [`lookup`]
//! - The UDP node actor with join, refresh, republish and expiry via [`node`]
//! - The abstract value store contract via [`store`]
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | k (bucket size) | 8 |
//! | alpha (lookup parallelism) | 3 |
//! | id length | 160 bits |
//! | RPC timeout | 5 seconds |
//! | Bucket refresh interval | 1 hour |
//! | Republish interval | 1 hour |
//! | Value expiry | 24 hours |
//! | Max datagram | 8192 bytes |

pub mod config;
pub mod contact;
pub mod id;
pub mod kbucket;
pub mod lookup;
pub mod node;
pub mod routing;
pub mod rpc;
pub mod store;

use id::NodeId;

/// Bucket capacity: maximum contacts per k-bucket.
pub const K: usize = 8;

/// Lookup parallelism factor.
pub const ALPHA: usize = 3;

/// RPC timeout in seconds.
pub const RPC_TIMEOUT_SECS: u64 = 5;

/// Idle-bucket refresh interval in seconds (1 hour).
pub const REFRESH_INTERVAL_SECS: u64 = 3600;

/// Value republish interval in seconds (1 hour).
pub const REPUBLISH_INTERVAL_SECS: u64 = 3600;

/// Value expiry interval in seconds (24 hours).
pub const EXPIRE_INTERVAL_SECS: u64 = 86_400;

/// Maximum UDP datagram size, fragment header included.
pub const MAX_DATAGRAM: usize = 8192;

/// Error types for DHT operations.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// An RPC expired without a reply; the peer has been evicted.
    #[error("rpc to {} timed out", hex::encode(peer))]
    Timeout {
        /// The unresponsive peer.
        peer: NodeId,
    },

    /// The peer answered with an error reply.
    #[error("remote error {kind}: {message}")]
    Remote {
        /// Error kind reported by the peer, verbatim.
        kind: String,
        /// Human-readable detail from the peer.
        message: String,
    },

    /// A request carried arguments the handler could not interpret.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Joining the overlay failed (no seed reachable).
    #[error("join failed: {0}")]
    JoinFailed(String),

    /// An iterative lookup ran out of candidates before converging.
    #[error("lookup failed: {0}")]
    LookupFailed(String),

    /// Rejected configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The node actor is gone.
    #[error("node shut down")]
    ChannelClosed,

    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire-format failure.
    #[error("wire error: {0}")]
    Wire(#[from] weft_wire::WireError),
}

/// Convenience result type for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;
