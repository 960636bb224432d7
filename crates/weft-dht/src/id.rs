//! 160-bit node identifiers and the XOR distance metric.
//!
//! Identifiers are SHA-1 digests: 20 opaque bytes. The distance between two
//! identifiers is their bitwise XOR read as a big-endian unsigned integer;
//! since `[u8; 20]` compares lexicographically, the raw XOR array already
//! orders correctly and no big-integer conversion is needed for sorting.
//!
//! Bucket ranges over `[0, 2^160)` do need real arithmetic (midpoint
//! splits, range membership, uniform sampling), which uses a 256-bit
//! unsigned integer.

use rand::RngCore;
use sha1::{Digest, Sha1};
use uint::construct_uint;

/// Length of a node identifier in bytes (160 bits).
pub const ID_BYTES: usize = 20;

/// Number of bits in a node identifier.
pub const ID_BITS: usize = 160;

/// A 160-bit node (or key) identifier.
pub type NodeId = [u8; ID_BYTES];

/// An XOR distance between two identifiers. Lexicographic comparison of
/// the array equals numeric comparison of the big-endian integer.
pub type Distance = [u8; ID_BYTES];

construct_uint! {
    /// 256-bit unsigned integer used for id-range arithmetic.
    pub struct U256(4);
}

/// Exclusive upper bound of the identifier space: `2^160`.
pub fn id_space_end() -> U256 {
    U256::one() << ID_BITS
}

/// Generate a fresh random identifier.
///
/// Hashes 20 bytes from the thread RNG, matching the digest-of-entropy
/// derivation used for operator-assigned ids.
pub fn generate() -> NodeId {
    let mut seed = [0u8; ID_BYTES];
    rand::thread_rng().fill_bytes(&mut seed);
    from_name(&seed)
}

/// Derive the identifier for a byte string: its SHA-1 digest.
pub fn from_name(name: &[u8]) -> NodeId {
    let digest = Sha1::digest(name);
    digest.into()
}

/// The XOR distance between two identifiers.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> Distance {
    let mut out = [0u8; ID_BYTES];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// Length of the common bit prefix of two identifiers; 160 when equal.
pub fn common_prefix_len(a: &NodeId, b: &NodeId) -> usize {
    let distance = xor_distance(a, b);
    for (i, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            return i * 8 + byte.leading_zeros() as usize;
        }
    }
    ID_BITS
}

/// Total order on contacts relative to a lookup target: ascending XOR
/// distance, ties broken by ascending id. The tiebreak makes lookup
/// traversal order reproducible.
pub fn cmp_distance(a: &NodeId, b: &NodeId, target: &NodeId) -> std::cmp::Ordering {
    (xor_distance(a, target), a).cmp(&(xor_distance(b, target), b))
}

/// Read an identifier as a range integer.
pub fn to_uint(id: &NodeId) -> U256 {
    U256::from_big_endian(id)
}

/// Write a range integer back as an identifier.
///
/// The value must lie below `2^160`; range arithmetic in this crate never
/// produces anything larger.
pub fn from_uint(n: &U256) -> NodeId {
    debug_assert!(*n < id_space_end());
    let mut wide = [0u8; 32];
    n.to_big_endian(&mut wide);
    let mut id = [0u8; ID_BYTES];
    id.copy_from_slice(&wide[32 - ID_BYTES..]);
    id
}

/// Sample an identifier uniformly from `[min, max)`.
///
/// The span must be non-empty.
pub fn random_id_in_range(min: &U256, max: &U256) -> NodeId {
    debug_assert!(min < max);
    let span = *max - *min;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let sample = U256::from_big_endian(&bytes) % span;
    from_uint(&(*min + sample))
}
