//! The RPC request/response state machine.
//!
//! [`RpcEndpoint`] owns the pending-request table and the fragment
//! reassembly buffers. It does no I/O itself: callers feed it received
//! datagrams and write out the datagrams it produces, passing an explicit
//! `now` so timeout behavior is deterministic under test. The node actor
//! is its only driver.
//!
//! Lifecycle of a request: registered on send with a oneshot resolver and
//! a deadline; resolved by the matching response or error reply; failed by
//! the deadline sweep, which also evicts the silent peer from the routing
//! table (the caller gets the peer id back for that purpose). An entry is
//! removed by exactly one of the two paths. A response with no pending
//! entry (it already timed out) is dropped silently.
//!
//! If fragments of a reply are still arriving when the deadline hits, the
//! deadline is extended one time; a transfer that stalls for a whole
//! further timeout is then failed for good.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use weft_wire::framing::{self, Reassembler};
use weft_wire::message::{new_rpc_id, Message, Method, RpcId};
use weft_wire::Value;

use crate::contact::Contact;
use crate::id::NodeId;
use crate::{DhtError, Result};

/// A successfully resolved RPC.
#[derive(Debug)]
pub enum RpcReply {
    /// The `result` value of a response (normal mode).
    Value(Value),
    /// The whole envelope (raw mode), error replies included.
    Raw(Message),
}

/// What a pending request resolves to.
pub type RpcOutcome = std::result::Result<RpcReply, DhtError>;

/// Datagrams to write, with their destination.
pub struct Outbound {
    /// The rpc id the datagrams belong to.
    pub rpc_id: RpcId,
    /// One datagram when the encoding fits, several fragments otherwise.
    pub datagrams: Vec<Vec<u8>>,
    /// Where to send them.
    pub dest: SocketAddr,
}

/// A decoded inbound message, ready for the node to act on.
pub struct Inbound {
    /// The sending peer, derived from the envelope id and source address.
    /// The node refreshes its routing table with this before anything else.
    pub sender: Contact,
    /// What arrived.
    pub kind: InboundKind,
}

/// The kinds of inbound traffic the node distinguishes.
pub enum InboundKind {
    /// A method invocation to dispatch and answer.
    Request {
        /// Id to echo in the reply.
        rpc_id: RpcId,
        /// Raw method name, resolved against [`Method`] at dispatch.
        method: Vec<u8>,
        /// Positional arguments.
        args: Vec<Value>,
    },
    /// A reply that resolved a pending request.
    Reply,
    /// A reply with no pending request; already timed out. Dropped.
    Stale,
}

struct PendingRpc {
    peer_id: NodeId,
    deadline: Instant,
    extended: bool,
    raw: bool,
    tx: oneshot::Sender<RpcOutcome>,
}

/// Sans-I/O RPC endpoint: pending table plus reassembly buffers.
pub struct RpcEndpoint {
    local_id: NodeId,
    rpc_timeout: Duration,
    payload_limit: usize,
    pending: HashMap<RpcId, PendingRpc>,
    reassembler: Reassembler,
}

impl RpcEndpoint {
    /// Create an endpoint for `local_id` with the given timeout and
    /// datagram budget.
    pub fn new(local_id: NodeId, rpc_timeout: Duration, max_datagram: usize) -> Self {
        Self {
            local_id,
            rpc_timeout,
            payload_limit: framing::max_payload(max_datagram),
            pending: HashMap::new(),
            reassembler: Reassembler::new(),
        }
    }

    /// Build and register a request to `contact`.
    ///
    /// `tx` resolves with the reply, a [`DhtError::Remote`] for an error
    /// reply, or [`DhtError::Timeout`] when the deadline sweep fires. With
    /// `raw` set, error replies are delivered as [`RpcReply::Raw`] instead
    /// of being converted.
    ///
    /// # Errors
    ///
    /// Returns a wire error when the encoding cannot be fragmented.
    pub fn send_request(
        &mut self,
        contact: &Contact,
        method: Method,
        args: Vec<Value>,
        raw: bool,
        tx: oneshot::Sender<RpcOutcome>,
        now: Instant,
    ) -> Result<Outbound> {
        let rpc_id = new_rpc_id();
        let message = Message::Request {
            rpc_id,
            sender_id: self.local_id,
            method: method.wire_name().to_vec(),
            args,
        };
        let datagrams = framing::fragment(&rpc_id, &message.encode(), self.payload_limit)?;
        trace!(
            peer = %contact,
            %method,
            datagrams = datagrams.len(),
            "Sending rpc"
        );
        self.pending.insert(
            rpc_id,
            PendingRpc {
                peer_id: contact.id,
                deadline: now + self.rpc_timeout,
                extended: false,
                raw,
                tx,
            },
        );
        Ok(Outbound {
            rpc_id,
            datagrams,
            dest: contact.addr,
        })
    }

    /// Build a response to a received request.
    ///
    /// # Errors
    ///
    /// Returns a wire error when the encoding cannot be fragmented.
    pub fn response(&self, dest: SocketAddr, rpc_id: RpcId, result: Value) -> Result<Outbound> {
        let message = Message::Response {
            rpc_id,
            sender_id: self.local_id,
            result,
        };
        let datagrams = framing::fragment(&rpc_id, &message.encode(), self.payload_limit)?;
        Ok(Outbound {
            rpc_id,
            datagrams,
            dest,
        })
    }

    /// Build an error reply to a received request.
    ///
    /// # Errors
    ///
    /// Returns a wire error when the encoding cannot be fragmented.
    pub fn error_reply(
        &self,
        dest: SocketAddr,
        rpc_id: RpcId,
        kind: &[u8],
        detail: &str,
    ) -> Result<Outbound> {
        let message = Message::Error {
            rpc_id,
            sender_id: self.local_id,
            kind: kind.to_vec(),
            message: detail.as_bytes().to_vec(),
        };
        let datagrams = framing::fragment(&rpc_id, &message.encode(), self.payload_limit)?;
        Ok(Outbound {
            rpc_id,
            datagrams,
            dest,
        })
    }

    /// Feed one received datagram.
    ///
    /// Returns `None` while a fragmented message is still incomplete.
    /// Responses and error replies resolve their pending request here;
    /// requests are returned for the node to dispatch.
    ///
    /// # Errors
    ///
    /// Wire errors (bad fragment headers, undecodable payloads, malformed
    /// envelopes). The caller logs and drops; nothing else happens.
    pub fn handle_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<Option<Inbound>> {
        let data;
        let whole: &[u8] = if framing::is_fragment(datagram) {
            match self.reassembler.insert(datagram, now)? {
                Some(complete) => {
                    data = complete;
                    &data
                }
                None => return Ok(None),
            }
        } else {
            datagram
        };

        let message = Message::decode(whole)?;
        let sender = Contact::new(*message.sender_id(), from);

        let kind = match message {
            Message::Request {
                rpc_id,
                method,
                args,
                ..
            } => InboundKind::Request {
                rpc_id,
                method,
                args,
            },
            Message::Response { .. } | Message::Error { .. } => {
                self.resolve(message)
            }
        };
        Ok(Some(Inbound { sender, kind }))
    }

    fn resolve(&mut self, message: Message) -> InboundKind {
        let Some(pending) = self.pending.remove(message.rpc_id()) else {
            debug!(
                rpc_id = %hex::encode(&message.rpc_id()[..4]),
                "Reply for unknown rpc, dropping"
            );
            return InboundKind::Stale;
        };

        let outcome = if pending.raw {
            Ok(RpcReply::Raw(message))
        } else {
            match message {
                Message::Error {
                    kind, message, ..
                } => Err(DhtError::Remote {
                    kind: String::from_utf8_lossy(&kind).into_owned(),
                    message: String::from_utf8_lossy(&message).into_owned(),
                }),
                Message::Response { result, .. } => Ok(RpcReply::Value(result)),
                Message::Request { .. } => Err(DhtError::InvalidArguments(
                    "request cannot resolve an rpc".into(),
                )),
            }
        };
        // The caller may have abandoned its future; the entry is gone
        // either way.
        let _ = pending.tx.send(outcome);
        InboundKind::Reply
    }

    /// Fire timeouts due at `now` and drop stalled reassembly buffers.
    ///
    /// Returns the ids of peers whose requests expired, for eviction from
    /// the routing table. A request whose reply is mid-reassembly gets its
    /// deadline extended once instead.
    pub fn expire(&mut self, now: Instant) -> Vec<NodeId> {
        let due: Vec<RpcId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut evicted = Vec::new();
        for rpc_id in due {
            let still_arriving = self.reassembler.has_partial(&rpc_id);
            let Some(pending) = self.pending.get_mut(&rpc_id) else {
                continue;
            };
            if still_arriving && !pending.extended {
                pending.deadline = now + self.rpc_timeout;
                pending.extended = true;
                continue;
            }
            if let Some(pending) = self.pending.remove(&rpc_id) {
                debug!(
                    peer = %hex::encode(&pending.peer_id[..4]),
                    "Rpc timed out"
                );
                evicted.push(pending.peer_id);
                let _ = pending.tx.send(Err(DhtError::Timeout {
                    peer: pending.peer_id,
                }));
            }
        }

        self.reassembler.prune(now, self.rpc_timeout);
        evicted
    }

    /// Number of requests awaiting replies.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MAX_DATAGRAM, RPC_TIMEOUT_SECS};

    fn endpoint(id_byte: u8) -> RpcEndpoint {
        RpcEndpoint::new(
            [id_byte; 20],
            Duration::from_secs(RPC_TIMEOUT_SECS),
            MAX_DATAGRAM,
        )
    }

    fn contact_for(endpoint_byte: u8, port: u16) -> Contact {
        Contact::new(
            [endpoint_byte; 20],
            SocketAddr::from(([127, 0, 0, 1], port)),
        )
    }

    fn feed(
        endpoint: &mut RpcEndpoint,
        outbound: &Outbound,
        from: SocketAddr,
        now: Instant,
    ) -> Option<Inbound> {
        let mut last = None;
        for datagram in &outbound.datagrams {
            last = endpoint.handle_datagram(datagram, from, now).expect("handle");
        }
        last
    }

    #[test]
    fn test_request_reply_roundtrip() {
        let mut alice = endpoint(0xAA);
        let mut bob = endpoint(0xBB);
        let alice_addr: SocketAddr = ([127, 0, 0, 1], 9001).into();
        let now = Instant::now();

        let (tx, mut rx) = oneshot::channel();
        let request = alice
            .send_request(
                &contact_for(0xBB, 9002),
                Method::Ping,
                Vec::new(),
                false,
                tx,
                now,
            )
            .expect("send");
        assert_eq!(alice.pending_len(), 1);

        // Bob receives the request.
        let inbound = feed(&mut bob, &request, alice_addr, now).expect("inbound");
        assert_eq!(inbound.sender.id, [0xAA; 20]);
        let InboundKind::Request { rpc_id, method, .. } = inbound.kind else {
            return assert!(false);
        };
        assert_eq!(method, Method::Ping.wire_name());

        // Bob answers; Alice's future resolves.
        let reply = bob
            .response(alice_addr, rpc_id, Value::bytes(&b"pong"[..]))
            .expect("response");
        let inbound = feed(&mut alice, &reply, ([127, 0, 0, 1], 9002).into(), now)
            .expect("inbound");
        assert!(matches!(inbound.kind, InboundKind::Reply));
        assert_eq!(inbound.sender.id, [0xBB; 20]);
        assert_eq!(alice.pending_len(), 0);

        let outcome = rx.try_recv().expect("resolved");
        match outcome {
            Ok(RpcReply::Value(v)) => assert_eq!(v.as_bytes(), Some(&b"pong"[..])),
            other => assert!(other.is_ok()),
        }
    }

    #[test]
    fn test_remote_error_surfaced() {
        let mut alice = endpoint(0xAA);
        let bob = endpoint(0xBB);
        let now = Instant::now();

        let (tx, mut rx) = oneshot::channel();
        let request = alice
            .send_request(
                &contact_for(0xBB, 9002),
                Method::FindNode,
                Vec::new(),
                false,
                tx,
                now,
            )
            .expect("send");

        let reply = bob
            .error_reply(
                ([127, 0, 0, 1], 9001).into(),
                request.rpc_id,
                b"InvalidMethod",
                "no such method",
            )
            .expect("error reply");
        for datagram in &reply.datagrams {
            alice
                .handle_datagram(datagram, ([127, 0, 0, 1], 9002).into(), now)
                .expect("handle");
        }

        let outcome = rx.try_recv().expect("resolved");
        assert!(matches!(
            outcome,
            Err(DhtError::Remote { ref kind, .. }) if kind == "InvalidMethod"
        ));
        assert_eq!(alice.pending_len(), 0);
    }

    #[test]
    fn test_raw_mode_returns_error_envelope() {
        let mut alice = endpoint(0xAA);
        let bob = endpoint(0xBB);
        let now = Instant::now();

        let (tx, mut rx) = oneshot::channel();
        let request = alice
            .send_request(
                &contact_for(0xBB, 9002),
                Method::Ping,
                Vec::new(),
                true,
                tx,
                now,
            )
            .expect("send");

        let reply = bob
            .error_reply(
                ([127, 0, 0, 1], 9001).into(),
                request.rpc_id,
                b"SomeKind",
                "detail",
            )
            .expect("error reply");
        for datagram in &reply.datagrams {
            alice
                .handle_datagram(datagram, ([127, 0, 0, 1], 9002).into(), now)
                .expect("handle");
        }

        let outcome = rx.try_recv().expect("resolved");
        assert!(matches!(outcome, Ok(RpcReply::Raw(Message::Error { .. }))));
    }

    #[test]
    fn test_timeout_evicts_and_fails_future() {
        let mut alice = endpoint(0xAA);
        let now = Instant::now();

        let (tx, mut rx) = oneshot::channel();
        alice
            .send_request(
                &contact_for(0xBB, 9002),
                Method::Ping,
                Vec::new(),
                false,
                tx,
                now,
            )
            .expect("send");

        // Before the deadline: nothing fires.
        assert!(alice.expire(now + Duration::from_secs(1)).is_empty());
        assert_eq!(alice.pending_len(), 1);

        // After the deadline: the peer is reported for eviction, the
        // future fails, and the entry is gone.
        let evicted = alice.expire(now + Duration::from_secs(RPC_TIMEOUT_SECS + 1));
        assert_eq!(evicted, vec![[0xBB; 20]]);
        assert_eq!(alice.pending_len(), 0);
        assert!(matches!(
            rx.try_recv().expect("resolved"),
            Err(DhtError::Timeout { peer }) if peer == [0xBB; 20]
        ));

        // Firing again is a no-op: removed on response or timer, never both.
        assert!(alice
            .expire(now + Duration::from_secs(RPC_TIMEOUT_SECS + 2))
            .is_empty());
    }

    #[test]
    fn test_reply_after_timeout_dropped_silently() {
        let mut alice = endpoint(0xAA);
        let bob = endpoint(0xBB);
        let now = Instant::now();

        let (tx, _rx) = oneshot::channel();
        let request = alice
            .send_request(
                &contact_for(0xBB, 9002),
                Method::Ping,
                Vec::new(),
                false,
                tx,
                now,
            )
            .expect("send");
        alice.expire(now + Duration::from_secs(RPC_TIMEOUT_SECS + 1));

        let reply = bob
            .response(([127, 0, 0, 1], 9001).into(), request.rpc_id, Value::Int(1))
            .expect("response");
        let inbound = feed(
            &mut alice,
            &reply,
            ([127, 0, 0, 1], 9002).into(),
            now + Duration::from_secs(RPC_TIMEOUT_SECS + 2),
        )
        .expect("inbound");
        // Still refreshes the sender, but resolves nothing.
        assert!(matches!(inbound.kind, InboundKind::Stale));
        assert_eq!(inbound.sender.id, [0xBB; 20]);
    }

    #[test]
    fn test_fragmented_reply_extends_deadline_once() {
        let mut alice = endpoint(0xAA);
        let bob = endpoint(0xBB);
        let now = Instant::now();

        let (tx, mut rx) = oneshot::channel();
        let request = alice
            .send_request(
                &contact_for(0xBB, 9002),
                Method::FindValue,
                Vec::new(),
                false,
                tx,
                now,
            )
            .expect("send");

        // A reply big enough to fragment; deliver only the first piece.
        let reply = bob
            .response(
                ([127, 0, 0, 1], 9001).into(),
                request.rpc_id,
                Value::bytes(vec![0x61; framing::max_payload(MAX_DATAGRAM) * 2]),
            )
            .expect("response");
        assert!(reply.datagrams.len() > 1);
        assert!(alice
            .handle_datagram(&reply.datagrams[0], ([127, 0, 0, 1], 9002).into(), now)
            .expect("handle")
            .is_none());

        // First deadline: progress observed, extended instead of firing.
        let first_deadline = now + Duration::from_secs(RPC_TIMEOUT_SECS);
        assert!(alice.expire(first_deadline).is_empty());
        assert_eq!(alice.pending_len(), 1);

        // Still stalled a full timeout later: fails for good, and the
        // half-received buffer is pruned.
        let evicted = alice.expire(first_deadline + Duration::from_secs(RPC_TIMEOUT_SECS));
        assert_eq!(evicted, vec![[0xBB; 20]]);
        assert!(matches!(
            rx.try_recv().expect("resolved"),
            Err(DhtError::Timeout { .. })
        ));
    }

    #[test]
    fn test_fragmented_request_reassembled() {
        let mut alice = endpoint(0xAA);
        let mut bob = endpoint(0xBB);
        let now = Instant::now();

        let (tx, _rx) = oneshot::channel();
        let request = alice
            .send_request(
                &contact_for(0xBB, 9002),
                Method::Store,
                vec![Value::bytes(vec![0x42; framing::max_payload(MAX_DATAGRAM) * 3])],
                false,
                tx,
                now,
            )
            .expect("send");
        assert!(request.datagrams.len() >= 4);

        // Deliver out of order; only the last arrival completes.
        let alice_addr: SocketAddr = ([127, 0, 0, 1], 9001).into();
        let count = request.datagrams.len();
        for index in (1..count).rev() {
            assert!(bob
                .handle_datagram(&request.datagrams[index], alice_addr, now)
                .expect("handle")
                .is_none());
        }
        let inbound = bob
            .handle_datagram(&request.datagrams[0], alice_addr, now)
            .expect("handle")
            .expect("complete");
        assert!(matches!(inbound.kind, InboundKind::Request { .. }));
    }

    #[test]
    fn test_garbage_datagram_rejected() {
        let mut alice = endpoint(0xAA);
        let now = Instant::now();
        assert!(alice
            .handle_datagram(b"zzzz not bencode", ([127, 0, 0, 1], 9002).into(), now)
            .is_err());
        assert!(alice
            .handle_datagram(b"", ([127, 0, 0, 1], 9002).into(), now)
            .is_err());
    }

    #[test]
    fn test_dropped_caller_leaks_nothing() {
        let mut alice = endpoint(0xAA);
        let now = Instant::now();

        let (tx, rx) = oneshot::channel();
        drop(rx);
        alice
            .send_request(
                &contact_for(0xBB, 9002),
                Method::Ping,
                Vec::new(),
                false,
                tx,
                now,
            )
            .expect("send");
        assert_eq!(alice.pending_len(), 1);

        // The timer still clears the entry even with no one listening.
        alice.expire(now + Duration::from_secs(RPC_TIMEOUT_SECS + 1));
        assert_eq!(alice.pending_len(), 0);
    }
}
