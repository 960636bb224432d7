//! A single k-bucket: up to `k` contacts for one slice of the id space.
//!
//! Contacts are kept least-recently-seen first (front) to
//! most-recently-seen last (back). Re-adding a known contact moves it to
//! the back; adding to a full bucket is not an error but a signal: the
//! routing table decides whether to split the bucket or probe its head.

use std::collections::VecDeque;
use std::time::Instant;

use crate::contact::Contact;
use crate::id::{self, NodeId, U256};

/// Outcome of a bucket insertion attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BucketAdd {
    /// The contact was appended at the most-recently-seen position.
    Inserted,
    /// The contact was already present and moved to the back.
    Refreshed,
    /// The bucket is at capacity and does not hold this contact.
    Full,
}

/// An ordered list of at most `capacity` contacts covering
/// `[range_min, range_max)`.
#[derive(Clone, Debug)]
pub struct KBucket {
    range_min: U256,
    range_max: U256,
    capacity: usize,
    /// Front = least recently seen, back = most recently seen.
    contacts: VecDeque<Contact>,
    last_accessed: Instant,
}

impl KBucket {
    /// Create an empty bucket for the given range.
    pub fn new(range_min: U256, range_max: U256, capacity: usize) -> Self {
        Self {
            range_min,
            range_max,
            capacity,
            contacts: VecDeque::with_capacity(capacity),
            last_accessed: Instant::now(),
        }
    }

    /// The bucket's id range as `(min, max)`, max exclusive.
    pub fn range(&self) -> (U256, U256) {
        (self.range_min, self.range_max)
    }

    /// Whether an id (as a range integer) falls inside this bucket.
    pub fn covers(&self, id_int: &U256) -> bool {
        *id_int >= self.range_min && *id_int < self.range_max
    }

    /// Attempt to add a contact.
    ///
    /// Known contacts are refreshed (moved to the back, `last_seen`
    /// updated); unknown contacts are appended while there is room.
    /// A full bucket returns [`BucketAdd::Full`] and is left unchanged.
    pub fn add(&mut self, contact: Contact) -> BucketAdd {
        debug_assert!(self.covers(&id::to_uint(&contact.id)));
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            if let Some(mut existing) = self.contacts.remove(pos) {
                existing.addr = contact.addr;
                existing.touch();
                self.contacts.push_back(existing);
            }
            return BucketAdd::Refreshed;
        }
        if self.contacts.len() < self.capacity {
            self.contacts.push_back(contact);
            return BucketAdd::Inserted;
        }
        BucketAdd::Full
    }

    /// Remove a contact by id. Absent ids are a no-op returning `None`.
    pub fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let pos = self.contacts.iter().position(|c| c.id == *id)?;
        self.contacts.remove(pos)
    }

    /// Look up a contact by id.
    pub fn get(&self, id: &NodeId) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.id == *id)
    }

    /// The least-recently-seen contact.
    pub fn head(&self) -> Option<&Contact> {
        self.contacts.front()
    }

    /// Up to `min(n, len)` contacts in current order, optionally excluding
    /// one id.
    pub fn contacts(&self, n: usize, exclude: Option<&NodeId>) -> Vec<Contact> {
        self.contacts
            .iter()
            .filter(|c| exclude != Some(&c.id))
            .take(n)
            .cloned()
            .collect()
    }

    /// Iterate all contacts, least recently seen first.
    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    /// Number of contacts held.
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    /// Whether the bucket holds no contacts.
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Split into two buckets at the range midpoint, redistributing
    /// contacts and preserving their recency order.
    pub fn split(self) -> (KBucket, KBucket) {
        let mid = self.range_min + (self.range_max - self.range_min) / 2;
        let mut lower = KBucket::new(self.range_min, mid, self.capacity);
        let mut upper = KBucket::new(mid, self.range_max, self.capacity);
        lower.last_accessed = self.last_accessed;
        upper.last_accessed = self.last_accessed;
        for contact in self.contacts {
            if id::to_uint(&contact.id) < mid {
                lower.contacts.push_back(contact);
            } else {
                upper.contacts.push_back(contact);
            }
        }
        (lower, upper)
    }

    /// Record a read that served a lookup.
    pub fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
    }

    /// When this bucket last served a lookup.
    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    /// A uniformly random id inside this bucket's range.
    pub fn random_id_in_range(&self) -> NodeId {
        id::random_id_in_range(&self.range_min, &self.range_max)
    }
}
