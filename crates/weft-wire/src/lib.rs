//! # weft-wire
//!
//! Wire protocol for the weft DHT.
//!
//! This crate is the pure, I/O-free half of the protocol stack:
//!
//! - **Bencode codec** via [`bencode`]: the length-prefixed,
//!   self-describing serialization used for every RPC envelope
//! - **RPC message model** via [`message`]: request / response / error
//!   envelopes and the closed method set
//! - **Datagram framing** via [`framing`]: fragmentation and reassembly
//!   of encodings that exceed a single UDP datagram
//!
//! ## Architecture
//!
//! ```text
//! Node / RPC endpoint (weft-dht)
//!     |
//!     v
//! Message (message.rs)       -- bencode dict with rpc_id, sender_id, body
//!     |
//!     v
//! Value (bencode.rs)         -- i..e / <len>:<bytes> / l..e / d..e
//!     |
//!     v
//! fragments (framing.rs)     -- 26-byte header when the encoding > MTU
//!     |
//!     v
//! UDP socket (weft-dht)
//! ```
//!
//! A whole (unfragmented) message always starts with one of `i`, `l`, `d`
//! or an ASCII digit, so the all-zero bytes 0 and 25 of the fragment header
//! can never collide with a whole message.

pub mod bencode;
pub mod framing;
pub mod message;

pub use bencode::Value;
pub use message::{Message, Method, RpcId};

/// Error types for wire-format operations.
///
/// All variants are decode-side conditions; a datagram that fails to decode
/// is dropped by the caller and never has side effects.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The payload decoded as bencode but is not a valid message envelope.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Input ended before the value being decoded was complete.
    #[error("truncated input at byte {0}")]
    Truncated(usize),

    /// An integer or length literal could not be parsed.
    #[error("invalid integer literal at byte {0}")]
    BadInteger(usize),

    /// Nesting deeper than the decoder allows.
    #[error("nesting exceeds maximum depth")]
    TooDeep,

    /// A datagram claiming to be a fragment has a bad header.
    #[error("invalid fragment header")]
    FragmentHeader,

    /// A fragment disagrees with earlier fragments of the same message.
    #[error("fragment count mismatch: expected {expected}, got {got}")]
    FragmentMismatch { expected: u16, got: u16 },

    /// An encoding too large to fragment (more than 2^16 - 1 pieces).
    #[error("message too large: {size} bytes cannot fit in {max} fragments")]
    Oversize { size: usize, max: usize },
}

/// Result type alias for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WireError::MalformedMessage("missing rpc_id".to_string());
        assert_eq!(err.to_string(), "malformed message: missing rpc_id");

        let err = WireError::FragmentMismatch {
            expected: 4,
            got: 7,
        };
        assert!(err.to_string().contains("expected 4"));
    }
}
