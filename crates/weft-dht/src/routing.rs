//! The routing table: an ordered, dynamically splitting list of k-buckets.
//!
//! Bucket ranges partition `[0, 2^160)` with no gaps or overlap, starting
//! from a single bucket over the whole space. When a bucket fills, one of
//! two rules applies:
//!
//! - **Split**: the bucket whose range contains the local id is replaced by
//!   its two halves and the insertion retried.
//! - **Probe the head**: any other full bucket keeps its members; the
//!   caller is handed the least-recently-seen contact to ping. Only if the
//!   ping times out (evicting the head through the ordinary timeout path)
//!   does the new contact get its slot.
//!
//! The local node's own id is never stored.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::contact::Contact;
use crate::id::{self, NodeId, U256};
use crate::kbucket::{BucketAdd, KBucket};

/// Result of attempting to add a contact to the routing table.
#[derive(Clone, Debug)]
pub enum AddContact {
    /// The contact is the local node (or otherwise unusable) and was ignored.
    Ignored,
    /// The contact was newly inserted.
    Inserted,
    /// The contact was already known; its position and address were updated.
    Refreshed,
    /// The target bucket is full and may not split. The caller should ping
    /// `head` and re-add the candidate if the head gets evicted.
    Full {
        /// The least-recently-seen contact of the full bucket.
        head: Contact,
    },
}

/// A splitting tree of k-buckets keyed by XOR distance from the local id.
pub struct RoutingTable {
    local_id: NodeId,
    local_int: U256,
    k: usize,
    /// Ascending by range; ranges partition the id space.
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create a table with a single bucket covering the whole id space.
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            local_int: id::to_uint(&local_id),
            k,
            buckets: vec![KBucket::new(U256::zero(), id::id_space_end(), k)],
        }
    }

    /// The local node's id.
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Index of the bucket covering an id. Ranges partition the space, so
    /// exactly one bucket matches.
    fn bucket_index(&self, id_int: &U256) -> usize {
        self.buckets
            .iter()
            .position(|b| b.covers(id_int))
            .unwrap_or(self.buckets.len() - 1)
    }

    /// Add or refresh a contact.
    ///
    /// Never blocks: the full-bucket ping decision is returned to the
    /// caller as [`AddContact::Full`].
    pub fn add_contact(&mut self, contact: Contact) -> AddContact {
        if contact.id == self.local_id {
            return AddContact::Ignored;
        }
        let id_int = id::to_uint(&contact.id);
        loop {
            let index = self.bucket_index(&id_int);
            match self.buckets[index].add(contact.clone()) {
                BucketAdd::Inserted => return AddContact::Inserted,
                BucketAdd::Refreshed => return AddContact::Refreshed,
                BucketAdd::Full => {
                    if self.buckets[index].covers(&self.local_int) {
                        self.split_bucket(index);
                        continue;
                    }
                    match self.buckets[index].head() {
                        Some(head) => {
                            return AddContact::Full {
                                head: head.clone(),
                            }
                        }
                        None => return AddContact::Ignored,
                    }
                }
            }
        }
    }

    fn split_bucket(&mut self, index: usize) {
        let bucket = self.buckets.remove(index);
        let (min, max) = bucket.range();
        debug!(
            range_min = %min,
            range_max = %max,
            "Splitting bucket"
        );
        let (lower, upper) = bucket.split();
        self.buckets.insert(index, upper);
        self.buckets.insert(index, lower);
    }

    /// The `n` contacts closest to `target` by XOR distance, ascending,
    /// optionally excluding one id.
    ///
    /// Gathers from the bucket covering `target`, then expands alternately
    /// to neighboring buckets until enough contacts are collected or the
    /// table is exhausted; the gathered set is then distance-sorted and
    /// truncated. Every visited bucket is marked accessed.
    pub fn find_close_nodes(
        &mut self,
        target: &NodeId,
        n: usize,
        exclude: Option<&NodeId>,
    ) -> Vec<Contact> {
        let now = Instant::now();
        let center = self.bucket_index(&id::to_uint(target));
        let mut gathered: Vec<Contact> = Vec::new();

        let mut below = center;
        let mut above = center + 1;
        let mut take_below = true;
        loop {
            let index = if take_below {
                if below == usize::MAX {
                    if above >= self.buckets.len() {
                        break;
                    }
                    take_below = false;
                    continue;
                }
                let i = below;
                below = below.checked_sub(1).unwrap_or(usize::MAX);
                i
            } else {
                if above >= self.buckets.len() {
                    if below == usize::MAX {
                        break;
                    }
                    take_below = true;
                    continue;
                }
                let i = above;
                above += 1;
                i
            };
            take_below = !take_below;

            let bucket = &mut self.buckets[index];
            bucket.touch(now);
            gathered.extend(bucket.contacts(self.k, exclude));
            if gathered.len() >= n {
                break;
            }
        }

        gathered.sort_by(|a, b| id::cmp_distance(&a.id, &b.id, target));
        gathered.truncate(n);
        gathered
    }

    /// Remove a contact by id. Absent ids are a no-op.
    pub fn remove_contact(&mut self, id: &NodeId) -> Option<Contact> {
        let index = self.bucket_index(&id::to_uint(id));
        self.buckets[index].remove(id)
    }

    /// Look up a known contact by id.
    pub fn get_contact(&self, id: &NodeId) -> Option<&Contact> {
        let index = self.bucket_index(&id::to_uint(id));
        self.buckets[index].get(id)
    }

    /// Mark the bucket covering `id` as accessed now.
    pub fn touch_bucket(&mut self, id: &NodeId, now: Instant) {
        let index = self.bucket_index(&id::to_uint(id));
        self.buckets[index].touch(now);
    }

    /// Random lookup targets for every bucket idle for at least `interval`.
    ///
    /// Scheduling counts as access, so a bucket is handed out once per
    /// idle period.
    pub fn refresh_targets(&mut self, interval: Duration, now: Instant) -> Vec<NodeId> {
        let mut targets = Vec::new();
        for bucket in &mut self.buckets {
            if now.duration_since(bucket.last_accessed()) >= interval {
                targets.push(bucket.random_id_in_range());
                bucket.touch(now);
            }
        }
        targets
    }

    /// Targets for every bucket whose range does not contain the local id
    /// (the post-join refresh sweep).
    pub fn foreign_bucket_targets(&self) -> Vec<NodeId> {
        self.buckets
            .iter()
            .filter(|b| !b.covers(&self.local_int))
            .map(KBucket::random_id_in_range)
            .collect()
    }

    /// Whether the local node is currently among the `k` closest ids it
    /// knows for `key`. Used to decide replica republishing.
    pub fn local_among_k_closest(&self, key: &NodeId) -> bool {
        let local_distance = id::xor_distance(&self.local_id, key);
        let closer = self
            .buckets
            .iter()
            .flat_map(KBucket::iter)
            .filter(|c| id::xor_distance(&c.id, key) < local_distance)
            .count();
        closer < self.k
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Total number of contacts across all buckets.
    pub fn contact_count(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    /// Bucket ranges in ascending order, for diagnostics and tests.
    pub fn bucket_ranges(&self) -> Vec<(U256, U256)> {
        self.buckets.iter().map(KBucket::range).collect()
    }

    #[cfg(test)]
    pub(crate) fn bucket_lens(&self) -> Vec<usize> {
        self.buckets.iter().map(KBucket::len).collect()
    }
}
