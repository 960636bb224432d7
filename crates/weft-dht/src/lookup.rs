//! The iterative lookup engine.
//!
//! A lookup walks the overlay toward a target id by querying the closest
//! known contacts in parallel batches of `alpha`, merging every reply's
//! contacts into a distance-sorted shortlist. While each batch strictly
//! improves the closest known distance, querying continues in `alpha`
//! batches; the first batch that stalls triggers a final round probing
//! every unqueried member of the current top-k. A `FIND_VALUE` lookup
//! short-circuits as soon as any peer returns the value.
//!
//! [`LookupState`] is a pure state machine; [`iterate`] drives it over the
//! [`LookupRpc`] seam, so tests wire a synthetic network and the node
//! wires real RPCs. Per-peer failures are swallowed; a lookup fails only
//! when every candidate it ever saw failed. Lookups clone contacts and
//! never touch the routing table; eviction of dead peers happens in the
//! RPC timeout path.

use std::future::Future;

use tracing::debug;

use crate::contact::Contact;
use crate::id::{self, Distance, NodeId};
use crate::{DhtError, Result};

/// One peer's answer to a lookup probe.
#[derive(Clone, Debug, Default)]
pub struct QueryReply {
    /// Contacts the peer considers closest to the target.
    pub contacts: Vec<Contact>,
    /// The value, when the peer holds it and the probe asked for one.
    pub value: Option<Vec<u8>>,
}

/// Transport seam for lookup probes.
///
/// The node implements this over real `FIND_NODE` / `FIND_VALUE` RPCs;
/// tests implement it over a scripted in-memory network.
pub trait LookupRpc: Clone + Send + 'static {
    /// Issue one probe to `contact` for `target`.
    fn query(
        &self,
        contact: Contact,
        target: NodeId,
        value_mode: bool,
    ) -> impl Future<Output = Result<QueryReply>> + Send;
}

/// Outcome of a finished lookup.
#[derive(Clone, Debug)]
pub enum LookupResult {
    /// The k closest responding contacts, ascending by distance.
    Nodes(Vec<Contact>),
    /// A value, found in value mode.
    Value {
        /// The value bytes.
        value: Vec<u8>,
        /// The peer that returned it.
        from: Contact,
        /// The closest responding peer that did *not* return the value;
        /// caching the value there makes the next lookup shorter.
        cache_at: Option<Contact>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CandidateState {
    Fresh,
    InFlight,
    Responded,
    Failed,
}

#[derive(Clone, Debug)]
struct Candidate {
    contact: Contact,
    distance: Distance,
    state: CandidateState,
}

/// Shortlist state for one lookup.
pub struct LookupState {
    target: NodeId,
    local_id: NodeId,
    k: usize,
    alpha: usize,
    value_mode: bool,
    /// Sorted ascending by `(distance, id)`.
    candidates: Vec<Candidate>,
    in_flight: usize,
    /// Closest non-failed distance when the current batch was dispatched.
    batch_baseline: Option<Distance>,
    final_round: bool,
    dispatched_any: bool,
    value_found: bool,
    value_holder: Option<NodeId>,
}

impl LookupState {
    /// Start a lookup for `target`, seeded with the closest contacts the
    /// caller knows (routing table or bootstrap set).
    pub fn new(
        target: NodeId,
        local_id: NodeId,
        seeds: Vec<Contact>,
        k: usize,
        alpha: usize,
        value_mode: bool,
    ) -> Self {
        let mut state = Self {
            target,
            local_id,
            k,
            alpha,
            value_mode,
            candidates: Vec::new(),
            in_flight: 0,
            batch_baseline: None,
            final_round: false,
            dispatched_any: false,
            value_found: false,
            value_holder: None,
        };
        state.merge(seeds);
        state
    }

    /// The lookup target.
    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// Whether this is a `FIND_VALUE` lookup.
    pub fn value_mode(&self) -> bool {
        self.value_mode
    }

    fn merge(&mut self, contacts: Vec<Contact>) {
        for contact in contacts {
            if contact.id == self.local_id {
                continue;
            }
            if self.candidates.iter().any(|c| c.contact.id == contact.id) {
                continue;
            }
            let distance = id::xor_distance(&contact.id, &self.target);
            self.candidates.push(Candidate {
                contact,
                distance,
                state: CandidateState::Fresh,
            });
        }
        self.candidates
            .sort_by(|a, b| (a.distance, a.contact.id).cmp(&(b.distance, b.contact.id)));
    }

    /// The closest non-failed distance currently known.
    fn best_distance(&self) -> Option<Distance> {
        self.candidates
            .iter()
            .find(|c| c.state != CandidateState::Failed)
            .map(|c| c.distance)
    }

    /// The top-k live (non-failed) window of the shortlist.
    fn top_k_live(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates
            .iter()
            .filter(|c| c.state != CandidateState::Failed)
            .take(self.k)
    }

    /// Contacts to query next, or empty when nothing can be dispatched.
    ///
    /// Dispatches only at batch boundaries (no queries in flight). While
    /// the closest known distance keeps strictly improving, batches are
    /// `alpha`-sized; a stalled batch switches to the final round, which
    /// probes every unqueried member of the top-k at once.
    pub fn next_batch(&mut self) -> Vec<Contact> {
        if self.in_flight > 0 || self.value_found {
            return Vec::new();
        }

        if self.dispatched_any {
            let improved = match (self.best_distance(), self.batch_baseline) {
                (Some(best), Some(baseline)) => best < baseline,
                (Some(_), None) => true,
                _ => false,
            };
            self.final_round = !improved;
        }

        let limit = if self.final_round { self.k } else { self.alpha };
        let picks: Vec<NodeId> = self
            .top_k_live()
            .filter(|c| c.state == CandidateState::Fresh)
            .take(limit)
            .map(|c| c.contact.id)
            .collect();
        if picks.is_empty() {
            return Vec::new();
        }

        self.batch_baseline = self.best_distance();
        self.dispatched_any = true;
        self.in_flight = picks.len();

        let mut batch = Vec::with_capacity(picks.len());
        for id in &picks {
            if let Some(candidate) = self
                .candidates
                .iter_mut()
                .find(|c| c.contact.id == *id)
            {
                candidate.state = CandidateState::InFlight;
                batch.push(candidate.contact.clone());
            }
        }
        batch
    }

    fn settle(&mut self, peer: &NodeId, state: CandidateState) {
        if let Some(candidate) = self
            .candidates
            .iter_mut()
            .find(|c| c.contact.id == *peer)
        {
            if candidate.state == CandidateState::InFlight {
                self.in_flight -= 1;
            }
            candidate.state = state;
        }
    }

    /// Record a successful probe and merge the contacts it returned.
    pub fn on_response(&mut self, peer: &NodeId, contacts: Vec<Contact>) {
        self.settle(peer, CandidateState::Responded);
        self.merge(contacts);
    }

    /// Record a probe that returned the value (value mode only).
    pub fn on_value(&mut self, peer: &NodeId) {
        self.settle(peer, CandidateState::Responded);
        self.value_found = true;
        self.value_holder = Some(*peer);
    }

    /// Record a failed or timed-out probe.
    pub fn on_failure(&mut self, peer: &NodeId) {
        self.settle(peer, CandidateState::Failed);
    }

    /// Whether the lookup can make no further progress.
    pub fn is_complete(&self) -> bool {
        self.in_flight == 0
            && (self.value_found
                || !self
                    .top_k_live()
                    .any(|c| c.state == CandidateState::Fresh))
    }

    /// Whether the lookup ever had any candidate to try.
    pub fn saw_candidates(&self) -> bool {
        !self.candidates.is_empty()
    }

    /// The k closest contacts that responded, ascending by distance.
    pub fn results(&self) -> Vec<Contact> {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .take(self.k)
            .map(|c| c.contact.clone())
            .collect()
    }

    /// Where to cache a found value: the closest responding contact that
    /// did not return it.
    pub fn cache_target(&self) -> Option<Contact> {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .find(|c| Some(c.contact.id) != self.value_holder)
            .map(|c| c.contact.clone())
    }
}

/// Drive a lookup to completion over `rpc`.
///
/// # Errors
///
/// Returns [`DhtError::LookupFailed`] when candidates existed but every
/// one of them failed. An empty seed set resolves to an empty contact
/// list instead.
pub async fn iterate<T: LookupRpc>(rpc: T, state: &mut LookupState) -> Result<LookupResult> {
    let target = *state.target();
    let value_mode = state.value_mode();

    loop {
        let batch = state.next_batch();
        if batch.is_empty() {
            break;
        }

        let mut probes = tokio::task::JoinSet::new();
        for contact in batch {
            let rpc = rpc.clone();
            probes.spawn(async move {
                let outcome = rpc.query(contact.clone(), target, value_mode).await;
                (contact, outcome)
            });
        }

        let mut found: Option<(Vec<u8>, Contact)> = None;
        while let Some(joined) = probes.join_next().await {
            let Ok((contact, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok(reply) => {
                    if value_mode && reply.value.is_some() {
                        if let Some(value) = reply.value {
                            state.on_value(&contact.id);
                            found = Some((value, contact));
                            break;
                        }
                    } else {
                        state.on_response(&contact.id, reply.contacts);
                    }
                }
                Err(err) => {
                    debug!(peer = %contact, error = %err, "Lookup probe failed");
                    state.on_failure(&contact.id);
                }
            }
        }

        if let Some((value, from)) = found {
            // Outstanding probes are abandoned; their pending entries are
            // released by reply or timer regardless.
            probes.abort_all();
            let cache_at = state.cache_target();
            debug!(from = %from, "Lookup short-circuited on value");
            return Ok(LookupResult::Value {
                value,
                from,
                cache_at,
            });
        }
    }

    let nodes = state.results();
    if nodes.is_empty() && state.saw_candidates() {
        return Err(DhtError::LookupFailed(
            "every candidate failed before convergence".into(),
        ));
    }
    Ok(LookupResult::Nodes(nodes))
}
