//! The DHT node: UDP actor, RPC service, and lifecycle loops.
//!
//! All mutable state (routing table, value store, pending-RPC and
//! reassembly tables) lives inside a single actor task driven by a
//! `select!` loop over the socket, a command channel, and a maintenance
//! tick. One writer, no locks, and a total order on state transitions.
//!
//! [`NodeHandle`] is the public face: a cheap clone holding the command
//! sender. Iterative operations run in the caller's task (or in tasks the
//! maintenance loop spawns) and reach the actor through commands; they
//! hold copies of contacts and never mutate the routing table themselves.
//! Table mutations happen on exactly two paths: inbound datagrams
//! refreshing their sender, and timeout eviction.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use weft_wire::message::{Method, RpcId};
use weft_wire::Value;

use crate::config::NodeConfig;
use crate::contact::{unix_now, Contact};
use crate::id::{self, NodeId};
use crate::lookup::{self, LookupResult, LookupRpc, LookupState, QueryReply};
use crate::routing::{AddContact, RoutingTable};
use crate::rpc::{InboundKind, Outbound, RpcEndpoint, RpcOutcome, RpcReply};
use crate::store::{DataStore, StoredValue};
use crate::{DhtError, Result};

/// How often the actor sweeps RPC deadlines and bucket refresh state.
const MAINTENANCE_TICK: Duration = Duration::from_millis(500);

/// How often the store is swept for republish and expiry.
const STORE_SWEEP_EVERY: Duration = Duration::from_secs(60);

/// Result of a `iterative_find_value`.
#[derive(Clone, Debug)]
pub enum FindValueResult {
    /// The value was found.
    Found {
        /// The value bytes.
        value: Vec<u8>,
        /// The peer that returned it; `None` when it was stored locally.
        from: Option<Contact>,
    },
    /// No peer holds the value; these are the closest contacts seen.
    Closest(Vec<Contact>),
}

/// Summary of a completed join.
#[derive(Clone, Debug)]
pub struct JoinReport {
    /// How many seed nodes answered the initial ping.
    pub responsive_seeds: usize,
    /// Contacts returned by the self-lookup.
    pub peers_discovered: usize,
}

/// A point-in-time view of the node's tables, for diagnostics and tests.
#[derive(Clone, Copy, Debug)]
pub struct NodeStatus {
    /// Number of routing-table buckets.
    pub bucket_count: usize,
    /// Total contacts across all buckets.
    pub contact_count: usize,
    /// Values held in the local store.
    pub stored_values: usize,
    /// RPCs awaiting replies.
    pub pending_rpcs: usize,
}

enum Command {
    SendRpc {
        contact: Contact,
        method: Method,
        args: Vec<Value>,
        tx: oneshot::Sender<RpcOutcome>,
    },
    ClosestContacts {
        target: NodeId,
        n: usize,
        tx: oneshot::Sender<Vec<Contact>>,
    },
    ForeignTargets {
        tx: oneshot::Sender<Vec<NodeId>>,
    },
    GetLocal {
        key: NodeId,
        tx: oneshot::Sender<Option<StoredValue>>,
    },
    PutLocal {
        key: NodeId,
        value: StoredValue,
    },
    Status {
        tx: oneshot::Sender<NodeStatus>,
    },
    Shutdown,
}

/// Namespace for starting nodes.
pub struct Node;

impl Node {
    /// Bind the socket, start the actor, and hand back the node's handle.
    ///
    /// The node id is freshly generated; use [`Node::spawn_with_id`] to
    /// supply one.
    ///
    /// # Errors
    ///
    /// Configuration and socket-bind failures.
    pub async fn spawn(config: NodeConfig, store: Box<dyn DataStore>) -> Result<NodeHandle> {
        Self::spawn_with_id(config, store, id::generate()).await
    }

    /// Start a node with a caller-chosen id.
    ///
    /// # Errors
    ///
    /// Configuration and socket-bind failures.
    pub async fn spawn_with_id(
        config: NodeConfig,
        store: Box<dyn DataStore>,
        local_id: NodeId,
    ) -> Result<NodeHandle> {
        config.validate()?;
        let socket = UdpSocket::bind(config.bind_addr()?).await?;
        let local_addr = socket.local_addr()?;

        let (tx, rx) = mpsc::channel(128);
        let handle = NodeHandle {
            inner: Arc::new(HandleInner {
                local_id,
                local_addr,
                k: config.k,
                alpha: config.alpha,
                expire_secs: config.expire_secs,
            }),
            tx,
        };

        let actor = NodeActor {
            local_id,
            local_addr,
            k: config.k,
            alpha: config.alpha,
            refresh_interval: config.refresh_interval(),
            republish_interval: config.republish_interval(),
            expire_secs: config.expire_secs,
            socket,
            routing: RoutingTable::new(local_id, config.k),
            store,
            endpoint: RpcEndpoint::new(local_id, config.rpc_timeout(), config.max_datagram),
            head_probes: HashMap::new(),
            commands: rx,
            self_handle: handle.tx.downgrade(),
            last_store_sweep: Instant::now(),
        };
        tokio::spawn(actor.run());

        info!(
            id = %hex::encode(&local_id[..4]),
            %local_addr,
            "Node started"
        );
        Ok(handle)
    }
}

struct HandleInner {
    local_id: NodeId,
    local_addr: SocketAddr,
    k: usize,
    alpha: usize,
    expire_secs: u64,
}

/// Cloneable handle to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<HandleInner>,
    tx: mpsc::Sender<Command>,
}

impl NodeHandle {
    /// The node's id.
    pub fn local_id(&self) -> &NodeId {
        &self.inner.local_id
    }

    /// The bound UDP address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| DhtError::ChannelClosed)
    }

    /// Send one RPC and await its result value.
    ///
    /// # Errors
    ///
    /// [`DhtError::Timeout`], [`DhtError::Remote`], or channel errors when
    /// the node has shut down.
    pub async fn send_rpc(
        &self,
        contact: &Contact,
        method: Method,
        args: Vec<Value>,
    ) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::SendRpc {
            contact: contact.clone(),
            method,
            args,
            tx,
        })
        .await?;
        match rx.await.map_err(|_| DhtError::ChannelClosed)? {
            Ok(RpcReply::Value(value)) => Ok(value),
            Ok(RpcReply::Raw(_)) => Err(DhtError::InvalidArguments(
                "unexpected raw reply".into(),
            )),
            Err(err) => Err(err),
        }
    }

    /// Liveness-probe a contact.
    ///
    /// # Errors
    ///
    /// Propagates the RPC failure.
    pub async fn ping(&self, contact: &Contact) -> Result<()> {
        self.send_rpc(contact, Method::Ping, Vec::new()).await?;
        Ok(())
    }

    /// Ask one peer to store a value.
    ///
    /// # Errors
    ///
    /// Propagates the RPC failure.
    pub async fn store_at(
        &self,
        contact: &Contact,
        key: &NodeId,
        value: &[u8],
        originator: &NodeId,
        age: u64,
    ) -> Result<()> {
        let age = i64::try_from(age).unwrap_or(i64::MAX);
        self.send_rpc(
            contact,
            Method::Store,
            vec![
                Value::bytes(key.to_vec()),
                Value::bytes(value.to_vec()),
                Value::bytes(originator.to_vec()),
                Value::Int(age),
            ],
        )
        .await?;
        Ok(())
    }

    /// The `n` closest contacts the routing table currently knows.
    ///
    /// # Errors
    ///
    /// Channel errors when the node has shut down.
    pub async fn closest_contacts(&self, target: &NodeId, n: usize) -> Result<Vec<Contact>> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::ClosestContacts {
            target: *target,
            n,
            tx,
        })
        .await?;
        rx.await.map_err(|_| DhtError::ChannelClosed)
    }

    /// Find the k closest contacts to `target` across the overlay.
    ///
    /// # Errors
    ///
    /// [`DhtError::LookupFailed`] when every candidate failed.
    pub async fn iterative_find_node(&self, target: &NodeId) -> Result<Vec<Contact>> {
        let seeds = self.closest_contacts(target, self.inner.k).await?;
        let mut state = LookupState::new(
            *target,
            self.inner.local_id,
            seeds,
            self.inner.k,
            self.inner.alpha,
            false,
        );
        match lookup::iterate(self.clone(), &mut state).await? {
            LookupResult::Nodes(nodes) => Ok(nodes),
            LookupResult::Value { .. } => Ok(Vec::new()),
        }
    }

    /// Fetch a value from the overlay, checking the local store first.
    ///
    /// A value found remotely is cached at the closest responding peer
    /// that did not hold it, so the popular path shortens over time.
    ///
    /// # Errors
    ///
    /// [`DhtError::LookupFailed`] when every candidate failed.
    pub async fn iterative_find_value(&self, key: &NodeId) -> Result<FindValueResult> {
        if let Some(stored) = self.get_local(key).await? {
            return Ok(FindValueResult::Found {
                value: stored.value,
                from: None,
            });
        }

        let seeds = self.closest_contacts(key, self.inner.k).await?;
        let mut state = LookupState::new(
            *key,
            self.inner.local_id,
            seeds,
            self.inner.k,
            self.inner.alpha,
            true,
        );
        match lookup::iterate(self.clone(), &mut state).await? {
            LookupResult::Value {
                value,
                from,
                cache_at,
            } => {
                if let Some(cache) = cache_at {
                    trace!(peer = %cache, "Caching found value");
                    let _ = self
                        .store_at(&cache, key, &value, &from.id, 0)
                        .await;
                }
                Ok(FindValueResult::Found {
                    value,
                    from: Some(from),
                })
            }
            LookupResult::Nodes(nodes) => Ok(FindValueResult::Closest(nodes)),
        }
    }

    /// Publish a value: store it at the k closest peers (and locally when
    /// this node is among them). Returns how many peers accepted.
    ///
    /// # Errors
    ///
    /// Lookup and channel failures; individual store rejections are only
    /// reflected in the returned count.
    pub async fn iterative_store(&self, key: &NodeId, value: &[u8]) -> Result<usize> {
        let local_id = self.inner.local_id;
        self.spread(key, value, &local_id, 0, true).await
    }

    /// Store `value` at the current k closest peers for `key`.
    ///
    /// With `allow_local`, the value is also written to the local store
    /// when this node is within the k closest (always true for a node
    /// with a sparse table).
    async fn spread(
        &self,
        key: &NodeId,
        value: &[u8],
        originator: &NodeId,
        age: u64,
        allow_local: bool,
    ) -> Result<usize> {
        let closest = match self.iterative_find_node(key).await {
            Ok(contacts) => contacts,
            Err(DhtError::LookupFailed(_)) => Vec::new(),
            Err(err) => return Err(err),
        };

        if allow_local {
            let local_is_close = closest.len() < self.inner.k
                || closest.last().is_some_and(|kth| {
                    id::xor_distance(&self.inner.local_id, key)
                        < id::xor_distance(&kth.id, key)
                });
            if local_is_close {
                self.put_local(
                    *key,
                    StoredValue::received(
                        value.to_vec(),
                        *originator,
                        age,
                        self.inner.expire_secs,
                    ),
                )
                .await?;
            }
        }

        let mut writes = JoinSet::new();
        for contact in closest {
            let handle = self.clone();
            let key = *key;
            let value = value.to_vec();
            let originator = *originator;
            writes.spawn(async move {
                handle
                    .store_at(&contact, &key, &value, &originator, age)
                    .await
            });
        }
        let mut accepted = 0;
        while let Some(outcome) = writes.join_next().await {
            if matches!(outcome, Ok(Ok(()))) {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Join the overlay through the given seed addresses.
    ///
    /// Pings every seed, runs a self-lookup, then refreshes every bucket
    /// whose range does not contain the local id.
    ///
    /// # Errors
    ///
    /// [`DhtError::JoinFailed`] when no seed responds (or none was given).
    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<JoinReport> {
        if seeds.is_empty() {
            return Err(DhtError::JoinFailed("no seed addresses".into()));
        }

        info!(seed_count = seeds.len(), "Joining overlay");
        let mut responsive = 0usize;
        for addr in seeds {
            // The seed's id is unknown until it answers; probe with a
            // placeholder contact and let the reply refresh the table
            // with the real identity.
            let probe = Contact::new(id::generate(), *addr);
            match self.ping(&probe).await {
                Ok(()) => {
                    responsive += 1;
                    debug!(%addr, "Seed responded");
                }
                Err(err) => {
                    warn!(%addr, error = %err, "Seed unreachable");
                }
            }
        }
        if responsive == 0 {
            return Err(DhtError::JoinFailed("no seed responded".into()));
        }

        let local_id = self.inner.local_id;
        let peers_discovered = match self.iterative_find_node(&local_id).await {
            Ok(found) => found.len(),
            Err(DhtError::LookupFailed(_)) => 0,
            Err(err) => return Err(err),
        };

        let (tx, rx) = oneshot::channel();
        self.command(Command::ForeignTargets { tx }).await?;
        let targets = rx.await.map_err(|_| DhtError::ChannelClosed)?;
        for target in targets {
            let _ = self.iterative_find_node(&target).await;
        }

        let report = JoinReport {
            responsive_seeds: responsive,
            peers_discovered,
        };
        info!(
            responsive_seeds = report.responsive_seeds,
            peers_discovered = report.peers_discovered,
            "Join complete"
        );
        Ok(report)
    }

    /// Read a value from the local store only.
    ///
    /// # Errors
    ///
    /// Channel errors when the node has shut down.
    pub async fn get_local(&self, key: &NodeId) -> Result<Option<StoredValue>> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::GetLocal { key: *key, tx }).await?;
        rx.await.map_err(|_| DhtError::ChannelClosed)
    }

    async fn put_local(&self, key: NodeId, value: StoredValue) -> Result<()> {
        self.command(Command::PutLocal { key, value }).await
    }

    /// A snapshot of table sizes.
    ///
    /// # Errors
    ///
    /// Channel errors when the node has shut down.
    pub async fn status(&self) -> Result<NodeStatus> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Status { tx }).await?;
        rx.await.map_err(|_| DhtError::ChannelClosed)
    }

    /// Stop the node actor.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

impl LookupRpc for NodeHandle {
    async fn query(
        &self,
        contact: Contact,
        target: NodeId,
        value_mode: bool,
    ) -> Result<QueryReply> {
        let method = if value_mode {
            Method::FindValue
        } else {
            Method::FindNode
        };
        let reply = self
            .send_rpc(&contact, method, vec![Value::bytes(target.to_vec())])
            .await?;

        match reply {
            Value::Dict(map) if value_mode => {
                let value = map
                    .get(target.as_slice())
                    .and_then(Value::as_bytes)
                    .ok_or_else(|| {
                        DhtError::InvalidArguments("value reply without the key".into())
                    })?;
                Ok(QueryReply {
                    contacts: Vec::new(),
                    value: Some(value.to_vec()),
                })
            }
            Value::List(items) => {
                let mut contacts = Vec::with_capacity(items.len());
                for item in &items {
                    match Contact::from_wire(item) {
                        Ok(contact) => contacts.push(contact),
                        Err(err) => {
                            debug!(error = %err, "Skipping malformed contact triple");
                        }
                    }
                }
                Ok(QueryReply {
                    contacts,
                    value: None,
                })
            }
            _ => Err(DhtError::InvalidArguments(
                "unexpected lookup reply shape".into(),
            )),
        }
    }
}

struct NodeActor {
    local_id: NodeId,
    local_addr: SocketAddr,
    k: usize,
    alpha: usize,
    refresh_interval: Duration,
    republish_interval: Duration,
    expire_secs: u64,
    socket: UdpSocket,
    routing: RoutingTable,
    store: Box<dyn DataStore>,
    endpoint: RpcEndpoint,
    /// Bucket heads being liveness-probed, each with the parked candidate
    /// waiting for its slot.
    head_probes: HashMap<NodeId, Contact>,
    commands: mpsc::Receiver<Command>,
    self_handle: mpsc::WeakSender<Command>,
    last_store_sweep: Instant,
}

impl NodeActor {
    async fn run(mut self) {
        let mut buf = vec![0u8; 65536];
        let mut tick = tokio::time::interval(MAINTENANCE_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.on_datagram(&buf[..len], from).await,
                    Err(err) => warn!(error = %err, "udp receive failed"),
                },
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.on_command(command).await,
                },
                _ = tick.tick() => self.on_maintenance().await,
            }
        }
        debug!(id = %hex::encode(&self.local_id[..4]), "Node actor stopped");
    }

    async fn on_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let now = Instant::now();
        match self.endpoint.handle_datagram(datagram, from, now) {
            Err(err) => {
                // Malformed traffic is dropped without touching any table.
                debug!(%from, error = %err, "Dropping datagram");
            }
            Ok(None) => {}
            Ok(Some(inbound)) => {
                let sender = inbound.sender;
                // Any message from a probed head proves it alive; its
                // parked challenger loses.
                if self.head_probes.remove(&sender.id).is_some() {
                    trace!(peer = %sender, "Bucket head answered, keeping it");
                }
                // Refresh before dispatch, so handlers observe the sender.
                self.consider(sender.clone()).await;

                if let InboundKind::Request {
                    rpc_id,
                    method,
                    args,
                } = inbound.kind
                {
                    self.dispatch(sender, rpc_id, method, args).await;
                }
            }
        }
    }

    /// Routing-table admission, including the full-bucket head probe.
    async fn consider(&mut self, contact: Contact) {
        self.routing.touch_bucket(&contact.id, Instant::now());
        if let AddContact::Full { head } = self.routing.add_contact(contact.clone()) {
            // Newest candidate wins the parking slot; the probe itself is
            // only sent once per head.
            let already_probing = self.head_probes.insert(head.id, contact).is_some();
            if !already_probing {
                debug!(head = %head, "Bucket full, probing head");
                let (tx, _rx) = oneshot::channel();
                let outbound = self.endpoint.send_request(
                    &head,
                    Method::Ping,
                    Vec::new(),
                    false,
                    tx,
                    Instant::now(),
                );
                match outbound {
                    Ok(outbound) => self.write(outbound).await,
                    Err(err) => warn!(error = %err, "Failed to encode head probe"),
                }
            }
        }
    }

    async fn dispatch(
        &mut self,
        sender: Contact,
        rpc_id: RpcId,
        method: Vec<u8>,
        args: Vec<Value>,
    ) {
        let outbound = match Method::from_wire(&method) {
            None => {
                let name = String::from_utf8_lossy(&method).into_owned();
                debug!(peer = %sender, method = %name, "Unknown method");
                self.endpoint.error_reply(
                    sender.addr,
                    rpc_id,
                    b"InvalidMethod",
                    &format!("invalid method: {name}"),
                )
            }
            Some(method) => match self.serve(method, &sender, &args) {
                Ok(result) => self.endpoint.response(sender.addr, rpc_id, result),
                Err(err) => self.endpoint.error_reply(
                    sender.addr,
                    rpc_id,
                    b"InvalidArguments",
                    &err.to_string(),
                ),
            },
        };
        match outbound {
            Ok(outbound) => self.write(outbound).await,
            Err(err) => warn!(error = %err, "Failed to encode reply"),
        }
    }

    /// The four service methods.
    fn serve(&mut self, method: Method, sender: &Contact, args: &[Value]) -> Result<Value> {
        match method {
            Method::Ping => Ok(Value::bytes(&b"pong"[..])),
            Method::Store => {
                let (key, value, originator, age) = parse_store_args(args)?;
                trace!(peer = %sender, key = %hex::encode(&key[..4]), "Storing value");
                self.store.put(
                    key,
                    StoredValue::received(value, originator, age, self.expire_secs),
                );
                Ok(Value::bytes(&b"stored"[..]))
            }
            Method::FindNode => {
                let target = parse_id_arg(args.first())?;
                let contacts =
                    self.routing
                        .find_close_nodes(&target, self.k, Some(&sender.id));
                Ok(Value::List(
                    contacts.iter().map(Contact::to_wire).collect(),
                ))
            }
            Method::FindValue => {
                let key = parse_id_arg(args.first())?;
                match self.store.get(&key) {
                    Some(stored) => {
                        let mut map = std::collections::BTreeMap::new();
                        map.insert(key.to_vec(), Value::Bytes(stored.value));
                        Ok(Value::Dict(map))
                    }
                    None => {
                        let contacts =
                            self.routing
                                .find_close_nodes(&key, self.k, Some(&sender.id));
                        Ok(Value::List(
                            contacts.iter().map(Contact::to_wire).collect(),
                        ))
                    }
                }
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SendRpc {
                contact,
                method,
                args,
                tx,
            } => {
                let outbound =
                    self.endpoint
                        .send_request(&contact, method, args, false, tx, Instant::now());
                match outbound {
                    Ok(outbound) => self.write(outbound).await,
                    Err(err) => warn!(error = %err, "Failed to encode rpc"),
                }
            }
            Command::ClosestContacts { target, n, tx } => {
                let _ = tx.send(self.routing.find_close_nodes(&target, n, None));
            }
            Command::ForeignTargets { tx } => {
                let _ = tx.send(self.routing.foreign_bucket_targets());
            }
            Command::GetLocal { key, tx } => {
                let _ = tx.send(self.store.get(&key));
            }
            Command::PutLocal { key, value } => {
                self.store.put(key, value);
            }
            Command::Status { tx } => {
                let _ = tx.send(NodeStatus {
                    bucket_count: self.routing.bucket_count(),
                    contact_count: self.routing.contact_count(),
                    stored_values: self.store.keys().len(),
                    pending_rpcs: self.endpoint.pending_len(),
                });
            }
            Command::Shutdown => {}
        }
    }

    async fn on_maintenance(&mut self) {
        let now = Instant::now();

        // Timed-out RPCs: evict the silent peer, and settle any head
        // probe it was the subject of.
        for peer in self.endpoint.expire(now) {
            if self.routing.remove_contact(&peer).is_some() {
                debug!(peer = %hex::encode(&peer[..4]), "Evicted unresponsive contact");
            }
            if let Some(candidate) = self.head_probes.remove(&peer) {
                debug!(candidate = %candidate, "Head evicted, admitting candidate");
                self.consider(candidate).await;
            }
        }

        // Idle buckets get a lookup for a random id in their range.
        for target in self.routing.refresh_targets(self.refresh_interval, now) {
            if let Some(handle) = self.handle() {
                debug!(target = %hex::encode(&target[..4]), "Refreshing idle bucket");
                tokio::spawn(async move {
                    let _ = handle.iterative_find_node(&target).await;
                });
            }
        }

        if now.duration_since(self.last_store_sweep) >= STORE_SWEEP_EVERY {
            self.last_store_sweep = now;
            self.sweep_store();
        }
    }

    /// Expire stale values and republish due ones.
    fn sweep_store(&mut self) {
        let now_secs = unix_now();
        for key in self.store.keys() {
            let Some(stored) = self.store.get(&key) else {
                continue;
            };
            if stored.expired(now_secs) {
                debug!(key = %hex::encode(&key[..4]), "Expiring value");
                self.store.remove(&key);
                continue;
            }
            if now_secs.saturating_sub(stored.last_republished) < self.republish_interval.as_secs()
            {
                continue;
            }

            // Originated values are always republished; replicas only
            // while this node still sits within the k closest it knows.
            let ours = stored.originator == self.local_id;
            if ours || self.routing.local_among_k_closest(&key) {
                if let Some(handle) = self.handle() {
                    let value = stored.value.clone();
                    let originator = stored.originator;
                    let age = now_secs.saturating_sub(stored.published_at);
                    debug!(key = %hex::encode(&key[..4]), ours, "Republishing value");
                    tokio::spawn(async move {
                        let _ = handle.spread(&key, &value, &originator, age, false).await;
                    });
                }
            }

            let mut refreshed = stored;
            refreshed.last_republished = now_secs;
            self.store.put(key, refreshed);
        }
    }

    fn handle(&self) -> Option<NodeHandle> {
        Some(NodeHandle {
            inner: Arc::new(HandleInner {
                local_id: self.local_id,
                local_addr: self.local_addr,
                k: self.k,
                alpha: self.alpha,
                expire_secs: self.expire_secs,
            }),
            tx: self.self_handle.upgrade()?,
        })
    }

    async fn write(&self, outbound: Outbound) {
        for datagram in &outbound.datagrams {
            if let Err(err) = self.socket.send_to(datagram, outbound.dest).await {
                warn!(dest = %outbound.dest, error = %err, "udp send failed");
                break;
            }
        }
    }
}

fn parse_id_arg(value: Option<&Value>) -> Result<NodeId> {
    value
        .and_then(Value::as_bytes)
        .and_then(|b| NodeId::try_from(b).ok())
        .ok_or_else(|| DhtError::InvalidArguments("expected a 20-byte id".into()))
}

fn parse_store_args(args: &[Value]) -> Result<(NodeId, Vec<u8>, NodeId, u64)> {
    let [key, value, originator, age] = args else {
        return Err(DhtError::InvalidArguments(format!(
            "STORE takes 4 arguments, got {}",
            args.len()
        )));
    };
    let key = parse_id_arg(Some(key))?;
    let value = value
        .as_bytes()
        .ok_or_else(|| DhtError::InvalidArguments("value must be bytes".into()))?
        .to_vec();
    let originator = parse_id_arg(Some(originator))?;
    let age = age
        .as_int()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| DhtError::InvalidArguments("age must be a non-negative int".into()))?;
    Ok((key, value, originator, age))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_store_args() {
        let args = vec![
            Value::bytes(vec![1u8; 20]),
            Value::bytes(&b"hello"[..]),
            Value::bytes(vec![2u8; 20]),
            Value::Int(30),
        ];
        let (key, value, originator, age) = parse_store_args(&args).expect("parse");
        assert_eq!(key, [1u8; 20]);
        assert_eq!(value, b"hello");
        assert_eq!(originator, [2u8; 20]);
        assert_eq!(age, 30);
    }

    #[test]
    fn test_parse_store_args_rejects_bad_shapes() {
        assert!(parse_store_args(&[]).is_err());
        assert!(parse_store_args(&[
            Value::bytes(vec![1u8; 4]),
            Value::bytes(&b"v"[..]),
            Value::bytes(vec![2u8; 20]),
            Value::Int(0),
        ])
        .is_err());
        assert!(parse_store_args(&[
            Value::bytes(vec![1u8; 20]),
            Value::bytes(&b"v"[..]),
            Value::bytes(vec![2u8; 20]),
            Value::Int(-5),
        ])
        .is_err());
    }

    #[test]
    fn test_parse_id_arg() {
        assert!(parse_id_arg(None).is_err());
        assert!(parse_id_arg(Some(&Value::Int(3))).is_err());
        assert!(parse_id_arg(Some(&Value::bytes(vec![0u8; 19]))).is_err());
        assert_eq!(
            parse_id_arg(Some(&Value::bytes(vec![7u8; 20]))).expect("id"),
            [7u8; 20]
        );
    }
}
