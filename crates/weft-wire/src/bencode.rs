//! Bencode codec for RPC envelopes.
//!
//! The weft wire format is the bencode dialect originating with BitTorrent:
//!
//! - integer: `i<decimal>e` (e.g. `i42e`)
//! - byte string: `<len>:<bytes>` (len in ASCII decimal)
//! - list: `l<items>e`
//! - mapping: `d<key><value>...e`, keys are byte strings
//!
//! Mappings are held in a [`BTreeMap`] so keys always encode in ascending
//! byte order; encoding the same [`Value`] twice yields identical bytes.
//! Decoding a canonical encoding and re-encoding it is byte-identical
//! (round-trip law).
//!
//! The first byte of any encoding is one of `i`, `l`, `d` or an ASCII
//! digit, never `0x00`. The datagram fragment header in
//! [`framing`](crate::framing) relies on this.

use std::collections::BTreeMap;

use crate::{Result, WireError};

/// Maximum nesting depth accepted by the decoder. Deeper input is rejected
/// rather than recursed into (allocation/stack guard, same role as the
/// payload size cap on the transport).
const MAX_DEPTH: usize = 32;

/// A decoded bencode value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// `i...e` integer.
    Int(i64),
    /// `<len>:<bytes>` byte string.
    Bytes(Vec<u8>),
    /// `l...e` ordered sequence.
    List(Vec<Value>),
    /// `d...e` mapping with byte-string keys in ascending order.
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Build a byte-string value from anything byte-like.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(data.into())
    }

    /// The integer payload, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// The byte-string payload, if this is a `Bytes`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The item list, if this is a `List`.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// The mapping, if this is a `Dict`.
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(map) => Some(map),
            _ => None,
        }
    }
}

/// Encode a value to its canonical byte representation.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(bytes) => {
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            for (key, val) in map {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}

/// Decode a single value from `data`.
///
/// The entire input must be consumed; trailing bytes after the top-level
/// value are rejected.
///
/// # Errors
///
/// Returns [`WireError::Truncated`], [`WireError::BadInteger`],
/// [`WireError::TooDeep`] or [`WireError::MalformedMessage`] describing the
/// first offending byte.
pub fn decode(data: &[u8]) -> Result<Value> {
    let (value, consumed) = decode_at(data, 0, 0)?;
    if consumed != data.len() {
        return Err(WireError::MalformedMessage(format!(
            "{} trailing bytes after value",
            data.len() - consumed
        )));
    }
    Ok(value)
}

fn decode_at(data: &[u8], pos: usize, depth: usize) -> Result<(Value, usize)> {
    if depth > MAX_DEPTH {
        return Err(WireError::TooDeep);
    }
    match data.get(pos) {
        None => Err(WireError::Truncated(pos)),
        Some(b'i') => decode_int(data, pos),
        Some(b'l') => {
            let mut items = Vec::new();
            let mut cursor = pos + 1;
            loop {
                match data.get(cursor) {
                    None => return Err(WireError::Truncated(cursor)),
                    Some(b'e') => return Ok((Value::List(items), cursor + 1)),
                    Some(_) => {
                        let (item, next) = decode_at(data, cursor, depth + 1)?;
                        items.push(item);
                        cursor = next;
                    }
                }
            }
        }
        Some(b'd') => {
            let mut map = BTreeMap::new();
            let mut cursor = pos + 1;
            loop {
                match data.get(cursor) {
                    None => return Err(WireError::Truncated(cursor)),
                    Some(b'e') => return Ok((Value::Dict(map), cursor + 1)),
                    Some(_) => {
                        let (key, after_key) = decode_at(data, cursor, depth + 1)?;
                        let Value::Bytes(key) = key else {
                            return Err(WireError::MalformedMessage(format!(
                                "non-bytestring dict key at byte {cursor}"
                            )));
                        };
                        let (val, next) = decode_at(data, after_key, depth + 1)?;
                        map.insert(key, val);
                        cursor = next;
                    }
                }
            }
        }
        Some(c) if c.is_ascii_digit() => decode_bytes(data, pos),
        Some(c) => Err(WireError::MalformedMessage(format!(
            "invalid type marker 0x{c:02x} at byte {pos}"
        ))),
    }
}

fn decode_int(data: &[u8], pos: usize) -> Result<(Value, usize)> {
    let body_start = pos + 1;
    let end = data[body_start..]
        .iter()
        .position(|&b| b == b'e')
        .map(|off| body_start + off)
        .ok_or(WireError::Truncated(data.len()))?;
    let literal =
        std::str::from_utf8(&data[body_start..end]).map_err(|_| WireError::BadInteger(pos))?;
    let n: i64 = literal.parse().map_err(|_| WireError::BadInteger(pos))?;
    Ok((Value::Int(n), end + 1))
}

fn decode_bytes(data: &[u8], pos: usize) -> Result<(Value, usize)> {
    let colon = data[pos..]
        .iter()
        .position(|&b| b == b':')
        .map(|off| pos + off)
        .ok_or(WireError::Truncated(data.len()))?;
    let literal =
        std::str::from_utf8(&data[pos..colon]).map_err(|_| WireError::BadInteger(pos))?;
    let len: usize = literal.parse().map_err(|_| WireError::BadInteger(pos))?;
    let start = colon + 1;
    let end = start.checked_add(len).ok_or(WireError::BadInteger(pos))?;
    if end > data.len() {
        return Err(WireError::Truncated(data.len()));
    }
    Ok((Value::Bytes(data[start..end].to_vec()), end))
}
