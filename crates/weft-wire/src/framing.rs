//! Datagram fragmentation and reassembly.
//!
//! A message whose encoding fits in one datagram is sent as-is. Larger
//! encodings are split into fragments with a fixed 26-byte header:
//!
//! ```text
//! byte 0      0x00 marker
//! bytes 1-2   total fragment count, big-endian
//! bytes 3-4   sequence number (0-based), big-endian
//! bytes 5-24  20-byte rpc id
//! byte 25     0x00 marker
//! bytes 26..  payload slice
//! ```
//!
//! A datagram whose bytes 0 and 25 are both `0x00` is a fragment; anything
//! else is a whole message. The bencode encoder never emits `0x00` as its
//! first byte, so the discriminator cannot misfire on whole messages.
//!
//! Receivers buffer fragments per rpc id and hand back the ascending-
//! sequence concatenation once every sequence number has arrived, whatever
//! order UDP delivered them in. Buffers that stop making progress are
//! dropped by [`Reassembler::prune`] on the caller's RPC-timeout cadence.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::message::{RpcId, ID_LEN};
use crate::{Result, WireError};

/// Size of the fragment header in bytes.
pub const FRAGMENT_HEADER_LEN: usize = 26;

/// Default maximum datagram size, header included.
pub const DEFAULT_MAX_DATAGRAM: usize = 8192;

/// Usable payload bytes per fragment for a given datagram budget.
pub const fn max_payload(max_datagram: usize) -> usize {
    max_datagram - FRAGMENT_HEADER_LEN
}

/// Whether a received datagram is a fragment rather than a whole message.
pub fn is_fragment(datagram: &[u8]) -> bool {
    datagram.len() >= FRAGMENT_HEADER_LEN && datagram[0] == 0x00 && datagram[25] == 0x00
}

/// Split `data` into datagrams, fragmenting when it exceeds `payload_limit`.
///
/// Produces `ceil(len / payload_limit)` fragments whose payloads concatenate
/// back to `data`; when `data` already fits, the single returned datagram is
/// `data` itself, unframed.
///
/// # Errors
///
/// Returns [`WireError::Oversize`] when more than `u16::MAX` fragments would
/// be required.
pub fn fragment(rpc_id: &RpcId, data: &[u8], payload_limit: usize) -> Result<Vec<Vec<u8>>> {
    if data.len() <= payload_limit {
        return Ok(vec![data.to_vec()]);
    }

    let total = data.len().div_ceil(payload_limit);
    let total: u16 = total
        .try_into()
        .map_err(|_| WireError::Oversize {
            size: data.len(),
            max: usize::from(u16::MAX),
        })?;

    let mut datagrams = Vec::with_capacity(usize::from(total));
    for (seq, chunk) in data.chunks(payload_limit).enumerate() {
        let seq = seq as u16;
        let mut datagram = Vec::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
        datagram.push(0x00);
        datagram.extend_from_slice(&total.to_be_bytes());
        datagram.extend_from_slice(&seq.to_be_bytes());
        datagram.extend_from_slice(rpc_id);
        datagram.push(0x00);
        datagram.extend_from_slice(chunk);
        datagrams.push(datagram);
    }
    Ok(datagrams)
}

/// Parsed fragment header fields.
struct FragmentHeader {
    total: u16,
    seq: u16,
    rpc_id: RpcId,
}

fn parse_header(datagram: &[u8]) -> Result<(FragmentHeader, &[u8])> {
    if !is_fragment(datagram) {
        return Err(WireError::FragmentHeader);
    }
    let total = u16::from_be_bytes([datagram[1], datagram[2]]);
    let seq = u16::from_be_bytes([datagram[3], datagram[4]]);
    let mut rpc_id = [0u8; ID_LEN];
    rpc_id.copy_from_slice(&datagram[5..25]);
    if total == 0 || seq >= total {
        return Err(WireError::FragmentHeader);
    }
    Ok((
        FragmentHeader {
            total,
            seq,
            rpc_id,
        },
        &datagram[FRAGMENT_HEADER_LEN..],
    ))
}

/// One partially received message.
struct Partial {
    total: u16,
    fragments: HashMap<u16, Vec<u8>>,
    first_seen: Instant,
}

/// Per-rpc-id fragment buffers.
#[derive(Default)]
pub struct Reassembler {
    partials: HashMap<RpcId, Partial>,
}

impl Reassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment datagram.
    ///
    /// Returns the reassembled message bytes once all fragments have
    /// arrived; `None` while the message is still incomplete. Duplicate
    /// sequence numbers overwrite the earlier copy.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::FragmentHeader`] for malformed headers and
    /// [`WireError::FragmentMismatch`] when a fragment disagrees with the
    /// buffered total for its rpc id; the buffer is left as it was.
    pub fn insert(&mut self, datagram: &[u8], now: Instant) -> Result<Option<Vec<u8>>> {
        let (header, payload) = parse_header(datagram)?;

        let partial = self
            .partials
            .entry(header.rpc_id)
            .or_insert_with(|| Partial {
                total: header.total,
                fragments: HashMap::new(),
                first_seen: now,
            });
        if partial.total != header.total {
            return Err(WireError::FragmentMismatch {
                expected: partial.total,
                got: header.total,
            });
        }
        partial.fragments.insert(header.seq, payload.to_vec());

        if partial.fragments.len() < usize::from(partial.total) {
            return Ok(None);
        }

        let partial = self
            .partials
            .remove(&header.rpc_id)
            .ok_or(WireError::FragmentHeader)?;
        let mut data =
            Vec::with_capacity(partial.fragments.values().map(Vec::len).sum());
        for seq in 0..partial.total {
            match partial.fragments.get(&seq) {
                Some(chunk) => data.extend_from_slice(chunk),
                None => return Err(WireError::FragmentHeader),
            }
        }
        Ok(Some(data))
    }

    /// Whether fragments are currently buffered for `rpc_id`.
    pub fn has_partial(&self, rpc_id: &RpcId) -> bool {
        self.partials.contains_key(rpc_id)
    }

    /// Drop buffers first seen longer than `max_age` ago.
    ///
    /// Returns how many buffers were discarded.
    pub fn prune(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.partials.len();
        self.partials
            .retain(|_, partial| now.duration_since(partial.first_seen) < max_age);
        before - self.partials.len()
    }

    /// Number of in-progress messages.
    pub fn len(&self) -> usize {
        self.partials.len()
    }

    /// Whether no partial messages are buffered.
    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::Value;
    use crate::message::{Message, Method};

    const PAYLOAD: usize = max_payload(DEFAULT_MAX_DATAGRAM);

    fn rpc_id() -> RpcId {
        [7u8; ID_LEN]
    }

    /// Build a request whose encoded form is exactly `target` bytes long.
    fn message_with_encoded_len(target: usize) -> Message {
        let mut pad = target.saturating_sub(256);
        loop {
            let msg = Message::Request {
                rpc_id: rpc_id(),
                sender_id: [9u8; ID_LEN],
                method: Method::Store.wire_name().to_vec(),
                args: vec![Value::bytes(vec![0x61; pad])],
            };
            let len = msg.encode().len();
            if len == target {
                return msg;
            }
            if len < target {
                pad += target - len;
            } else {
                pad -= len - target;
            }
        }
    }

    #[test]
    fn test_small_message_not_fragmented() {
        let data = b"d6:rpc_id2:..e".to_vec();
        let datagrams = fragment(&rpc_id(), &data, PAYLOAD).expect("fragment");
        assert_eq!(datagrams.len(), 1);
        assert_eq!(datagrams[0], data);
        assert!(!is_fragment(&datagrams[0]));
    }

    #[test]
    fn test_fragment_count_law() {
        // ceil(L / P) fragments whose payloads concatenate to the input.
        for extra in [1usize, 17, PAYLOAD - 1, PAYLOAD] {
            let data = vec![0x42u8; 2 * PAYLOAD + extra];
            let expected = data.len().div_ceil(PAYLOAD);
            let datagrams = fragment(&rpc_id(), &data, PAYLOAD).expect("fragment");
            assert_eq!(datagrams.len(), expected);

            let mut concat = Vec::new();
            for datagram in &datagrams {
                assert!(is_fragment(datagram));
                concat.extend_from_slice(&datagram[FRAGMENT_HEADER_LEN..]);
            }
            assert_eq!(concat, data);
        }
    }

    #[test]
    fn test_exact_multiple_boundary() {
        let data = vec![0x01u8; 2 * PAYLOAD];
        let datagrams = fragment(&rpc_id(), &data, PAYLOAD).expect("fragment");
        assert_eq!(datagrams.len(), 2);
    }

    #[test]
    fn test_header_layout() {
        let data = vec![0x55u8; PAYLOAD + 3];
        let datagrams = fragment(&rpc_id(), &data, PAYLOAD).expect("fragment");
        let second = &datagrams[1];
        assert_eq!(second[0], 0x00);
        assert_eq!(u16::from_be_bytes([second[1], second[2]]), 2);
        assert_eq!(u16::from_be_bytes([second[3], second[4]]), 1);
        assert_eq!(&second[5..25], rpc_id().as_slice());
        assert_eq!(second[25], 0x00);
        assert_eq!(second.len(), FRAGMENT_HEADER_LEN + 3);
    }

    #[test]
    fn test_shuffled_reassembly_roundtrip() {
        // Encoded form exactly 3 * payload + 17 bytes -> 4 fragments, fed
        // out of order.
        let msg = message_with_encoded_len(3 * PAYLOAD + 17);
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 3 * PAYLOAD + 17);

        let datagrams = fragment(&rpc_id(), &encoded, PAYLOAD).expect("fragment");
        assert_eq!(datagrams.len(), 4);

        let now = Instant::now();
        let mut reassembler = Reassembler::new();
        for index in [2usize, 0, 1] {
            let done = reassembler
                .insert(&datagrams[index], now)
                .expect("insert");
            assert!(done.is_none());
            assert!(reassembler.has_partial(&rpc_id()));
        }
        let data = reassembler
            .insert(&datagrams[3], now)
            .expect("insert")
            .expect("complete");
        assert_eq!(data, encoded);
        assert_eq!(Message::decode(&data).expect("decode"), msg);
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_duplicate_fragment_tolerated() {
        let data = vec![0x10u8; PAYLOAD * 2 + 5];
        let datagrams = fragment(&rpc_id(), &data, PAYLOAD).expect("fragment");
        let now = Instant::now();
        let mut reassembler = Reassembler::new();
        assert!(reassembler.insert(&datagrams[0], now).expect("insert").is_none());
        assert!(reassembler.insert(&datagrams[0], now).expect("insert").is_none());
        assert!(reassembler.insert(&datagrams[1], now).expect("insert").is_none());
        let out = reassembler
            .insert(&datagrams[2], now)
            .expect("insert")
            .expect("complete");
        assert_eq!(out, data);
    }

    #[test]
    fn test_total_mismatch_rejected() {
        let data = vec![0x10u8; PAYLOAD * 2 + 5];
        let datagrams = fragment(&rpc_id(), &data, PAYLOAD).expect("fragment");
        let now = Instant::now();
        let mut reassembler = Reassembler::new();
        reassembler
            .insert(&datagrams[0], now)
            .expect("insert");

        // Same rpc id, different claimed total.
        let mut forged = datagrams[1].clone();
        forged[1] = 0;
        forged[2] = 9;
        assert!(matches!(
            reassembler.insert(&forged, now),
            Err(WireError::FragmentMismatch { expected: 3, got: 9 })
        ));
    }

    #[test]
    fn test_bad_headers_rejected() {
        let now = Instant::now();
        let mut reassembler = Reassembler::new();

        // Not a fragment at all.
        assert!(matches!(
            reassembler.insert(b"i42e", now),
            Err(WireError::FragmentHeader)
        ));

        // Zero total.
        let mut datagram = vec![0u8; FRAGMENT_HEADER_LEN + 1];
        assert!(matches!(
            reassembler.insert(&datagram, now),
            Err(WireError::FragmentHeader)
        ));

        // Sequence >= total.
        datagram[2] = 2;
        datagram[4] = 2;
        assert!(matches!(
            reassembler.insert(&datagram, now),
            Err(WireError::FragmentHeader)
        ));
    }

    #[test]
    fn test_prune_discards_stalled_buffers() {
        let data = vec![0x10u8; PAYLOAD * 2 + 5];
        let datagrams = fragment(&rpc_id(), &data, PAYLOAD).expect("fragment");
        let start = Instant::now();
        let mut reassembler = Reassembler::new();
        reassembler.insert(&datagrams[0], start).expect("insert");
        assert_eq!(reassembler.len(), 1);

        // Not old enough yet.
        assert_eq!(reassembler.prune(start + Duration::from_secs(1), Duration::from_secs(5)), 0);
        assert!(reassembler.has_partial(&rpc_id()));

        // Past the deadline.
        assert_eq!(reassembler.prune(start + Duration::from_secs(6), Duration::from_secs(5)), 1);
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_oversize_rejected() {
        let data = vec![0u8; 70_000];
        assert!(matches!(
            fragment(&rpc_id(), &data, 1),
            Err(WireError::Oversize { .. })
        ));
    }
}
