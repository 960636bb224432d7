//! RPC message envelopes.
//!
//! Every datagram (after reassembly) is one of three envelopes, encoded as
//! a bencode dict:
//!
//! | kind | keys |
//! |---|---|
//! | request | `rpc_id`, `sender_id`, `method`, `args` |
//! | response | `rpc_id`, `sender_id`, `result` |
//! | error | `rpc_id`, `sender_id`, `exception_type`, `exception_message` |
//!
//! The method set is closed ([`Method`]), but the `method` field is carried
//! as raw bytes: an unknown name must reach the dispatcher so it can be
//! answered with an `InvalidMethod` error reply rather than being dropped
//! as undecodable. Error kinds are likewise uninterpreted byte strings:
//! a peer's `exception_type` is reported verbatim, never evaluated.

use rand::RngCore;

use crate::bencode::{self, Value};
use crate::{Result, WireError};

/// Length in bytes of RPC and node identifiers (160 bits).
pub const ID_LEN: usize = 20;

/// Unique identifier of one RPC exchange.
pub type RpcId = [u8; ID_LEN];

/// Generate a random RPC identifier.
pub fn new_rpc_id() -> RpcId {
    let mut id = [0u8; ID_LEN];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// The closed set of remote methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    /// Liveness probe.
    Ping,
    /// Write a key/value pair to the remote node's store.
    Store,
    /// Ask for the k closest contacts to a target id.
    FindNode,
    /// Ask for a stored value, falling back to closest contacts.
    FindValue,
}

impl Method {
    /// The exact wire name of this method.
    pub const fn wire_name(self) -> &'static [u8] {
        match self {
            Method::Ping => b"PING",
            Method::Store => b"STORE",
            Method::FindNode => b"FIND_NODE",
            Method::FindValue => b"FIND_VALUE",
        }
    }

    /// Resolve a wire name, if it names a known method.
    pub fn from_wire(name: &[u8]) -> Option<Method> {
        match name {
            b"PING" => Some(Method::Ping),
            b"STORE" => Some(Method::Store),
            b"FIND_NODE" => Some(Method::FindNode),
            b"FIND_VALUE" => Some(Method::FindValue),
            _ => None,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Method::Ping => "PING",
            Method::Store => "STORE",
            Method::FindNode => "FIND_NODE",
            Method::FindValue => "FIND_VALUE",
        })
    }
}

/// A decoded RPC envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// A method invocation.
    Request {
        /// Identifier matching the eventual reply.
        rpc_id: RpcId,
        /// The sender's node id.
        sender_id: [u8; ID_LEN],
        /// Raw method name; resolved against [`Method`] at dispatch.
        method: Vec<u8>,
        /// Positional arguments.
        args: Vec<Value>,
    },
    /// A successful reply.
    Response {
        /// Identifier of the request being answered.
        rpc_id: RpcId,
        /// The responder's node id.
        sender_id: [u8; ID_LEN],
        /// The method's result.
        result: Value,
    },
    /// A failure reply.
    Error {
        /// Identifier of the request being answered.
        rpc_id: RpcId,
        /// The responder's node id.
        sender_id: [u8; ID_LEN],
        /// Error kind, carried verbatim.
        kind: Vec<u8>,
        /// Human-readable detail.
        message: Vec<u8>,
    },
}

impl Message {
    /// The rpc id of any envelope kind.
    pub fn rpc_id(&self) -> &RpcId {
        match self {
            Message::Request { rpc_id, .. }
            | Message::Response { rpc_id, .. }
            | Message::Error { rpc_id, .. } => rpc_id,
        }
    }

    /// The sender's node id of any envelope kind.
    pub fn sender_id(&self) -> &[u8; ID_LEN] {
        match self {
            Message::Request { sender_id, .. }
            | Message::Response { sender_id, .. }
            | Message::Error { sender_id, .. } => sender_id,
        }
    }

    /// Convert to the bencode envelope dict.
    pub fn to_value(&self) -> Value {
        let mut map = std::collections::BTreeMap::new();
        map.insert(b"rpc_id".to_vec(), Value::bytes(self.rpc_id().to_vec()));
        map.insert(
            b"sender_id".to_vec(),
            Value::bytes(self.sender_id().to_vec()),
        );
        match self {
            Message::Request { method, args, .. } => {
                map.insert(b"method".to_vec(), Value::bytes(method.clone()));
                map.insert(b"args".to_vec(), Value::List(args.clone()));
            }
            Message::Response { result, .. } => {
                map.insert(b"result".to_vec(), result.clone());
            }
            Message::Error { kind, message, .. } => {
                map.insert(b"exception_type".to_vec(), Value::bytes(kind.clone()));
                map.insert(
                    b"exception_message".to_vec(),
                    Value::bytes(message.clone()),
                );
            }
        }
        Value::Dict(map)
    }

    /// Interpret a bencode value as an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::MalformedMessage`] when the value is not a dict,
    /// a required key is missing or mistyped, or an id has the wrong length.
    pub fn from_value(value: &Value) -> Result<Message> {
        let map = value
            .as_dict()
            .ok_or_else(|| WireError::MalformedMessage("envelope is not a dict".into()))?;

        let rpc_id = id_field(map, b"rpc_id")?;
        let sender_id = id_field(map, b"sender_id")?;

        if let Some(method) = map.get(b"method".as_slice()) {
            let method = method
                .as_bytes()
                .ok_or_else(|| WireError::MalformedMessage("method is not bytes".into()))?
                .to_vec();
            let args = map
                .get(b"args".as_slice())
                .and_then(Value::as_list)
                .ok_or_else(|| WireError::MalformedMessage("request without args list".into()))?
                .to_vec();
            return Ok(Message::Request {
                rpc_id,
                sender_id,
                method,
                args,
            });
        }

        if let Some(kind) = map.get(b"exception_type".as_slice()) {
            let kind = kind
                .as_bytes()
                .ok_or_else(|| {
                    WireError::MalformedMessage("exception_type is not bytes".into())
                })?
                .to_vec();
            let message = map
                .get(b"exception_message".as_slice())
                .and_then(Value::as_bytes)
                .ok_or_else(|| {
                    WireError::MalformedMessage("error without exception_message".into())
                })?
                .to_vec();
            return Ok(Message::Error {
                rpc_id,
                sender_id,
                kind,
                message,
            });
        }

        if let Some(result) = map.get(b"result".as_slice()) {
            return Ok(Message::Response {
                rpc_id,
                sender_id,
                result: result.clone(),
            });
        }

        Err(WireError::MalformedMessage(
            "envelope carries neither method, result nor exception_type".into(),
        ))
    }

    /// Encode this envelope to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        bencode::encode(&self.to_value())
    }

    /// Decode an envelope from wire bytes.
    ///
    /// # Errors
    ///
    /// Propagates bencode decode errors and envelope shape errors.
    pub fn decode(data: &[u8]) -> Result<Message> {
        Message::from_value(&bencode::decode(data)?)
    }
}

fn id_field(
    map: &std::collections::BTreeMap<Vec<u8>, Value>,
    key: &[u8],
) -> Result<[u8; ID_LEN]> {
    let bytes = map
        .get(key)
        .and_then(Value::as_bytes)
        .ok_or_else(|| {
            WireError::MalformedMessage(format!(
                "missing or mistyped {}",
                String::from_utf8_lossy(key)
            ))
        })?;
    <[u8; ID_LEN]>::try_from(bytes).map_err(|_| {
        WireError::MalformedMessage(format!(
            "{} has length {}, expected {ID_LEN}",
            String::from_utf8_lossy(key),
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (RpcId, [u8; ID_LEN]) {
        ([0x11; ID_LEN], [0x22; ID_LEN])
    }

    #[test]
    fn test_method_wire_names() {
        assert_eq!(Method::Ping.wire_name(), b"PING");
        assert_eq!(Method::Store.wire_name(), b"STORE");
        assert_eq!(Method::FindNode.wire_name(), b"FIND_NODE");
        assert_eq!(Method::FindValue.wire_name(), b"FIND_VALUE");
        for method in [Method::Ping, Method::Store, Method::FindNode, Method::FindValue] {
            assert_eq!(Method::from_wire(method.wire_name()), Some(method));
        }
        assert_eq!(Method::from_wire(b"EXPLODE"), None);
    }

    #[test]
    fn test_request_roundtrip() {
        let (rpc_id, sender_id) = ids();
        let msg = Message::Request {
            rpc_id,
            sender_id,
            method: Method::FindNode.wire_name().to_vec(),
            args: vec![Value::bytes(vec![0xAB; ID_LEN])],
        };
        let decoded = Message::decode(&msg.encode()).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_response_roundtrip() {
        let (rpc_id, sender_id) = ids();
        let msg = Message::Response {
            rpc_id,
            sender_id,
            result: Value::bytes(&b"pong"[..]),
        };
        let decoded = Message::decode(&msg.encode()).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_error_roundtrip() {
        let (rpc_id, sender_id) = ids();
        let msg = Message::Error {
            rpc_id,
            sender_id,
            kind: b"InvalidMethod".to_vec(),
            message: b"no such method: EXPLODE".to_vec(),
        };
        let decoded = Message::decode(&msg.encode()).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_unknown_method_still_decodes() {
        let (rpc_id, sender_id) = ids();
        let msg = Message::Request {
            rpc_id,
            sender_id,
            method: b"EXPLODE".to_vec(),
            args: Vec::new(),
        };
        let decoded = Message::decode(&msg.encode()).expect("decode");
        assert!(matches!(
            decoded,
            Message::Request { ref method, .. } if method == b"EXPLODE"
        ));
    }

    #[test]
    fn test_short_id_rejected() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(b"rpc_id".to_vec(), Value::bytes(vec![1u8; 4]));
        map.insert(b"sender_id".to_vec(), Value::bytes(vec![2u8; ID_LEN]));
        map.insert(b"result".to_vec(), Value::Int(1));
        let data = bencode::encode(&Value::Dict(map));
        assert!(matches!(
            Message::decode(&data),
            Err(WireError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_bodyless_envelope_rejected() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(b"rpc_id".to_vec(), Value::bytes(vec![1u8; ID_LEN]));
        map.insert(b"sender_id".to_vec(), Value::bytes(vec![2u8; ID_LEN]));
        let data = bencode::encode(&Value::Dict(map));
        assert!(matches!(
            Message::decode(&data),
            Err(WireError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_rpc_ids_random() {
        assert_ne!(new_rpc_id(), new_rpc_id());
    }

    #[test]
    fn test_encoding_never_starts_with_zero() {
        let (rpc_id, sender_id) = ids();
        let msg = Message::Response {
            rpc_id,
            sender_id,
            result: Value::Int(0),
        };
        assert_ne!(msg.encode()[0], 0x00);
    }
}
