//! DHT routing table
//!
//! Kademlia routing table: 160 k-buckets indexed by the common-prefix
//! length of the XOR distance between the local id and a contact's id.

use std::time::Instant;

use crate::dht::node::{Contact, NodeId};

/// Kademlia k: contacts per bucket
pub const K: usize = 8;

/// Number of buckets (one per possible prefix length)
const BUCKET_COUNT: usize = 160;

/// Result of inserting a contact
#[derive(Debug, Clone)]
pub enum AddOutcome {
    /// Contact inserted into a bucket with room
    Added,
    /// Contact was already present; its last-seen timestamp was refreshed
    Updated,
    /// The bucket is full. The caller should ping the returned
    /// least-recently-seen contact and either `touch` it (it responded,
    /// newcomer is dropped) or `replace` it with the newcomer.
    Full { least_recently_seen: Contact },
}

/// A bucket in the routing table
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Contacts in this bucket
    pub contacts: Vec<Contact>,
    /// When this bucket was last modified
    pub last_changed: Instant,
}

impl KBucket {
    /// Create a new empty bucket
    pub fn new() -> Self {
        Self {
            contacts: Vec::with_capacity(K),
            last_changed: Instant::now(),
        }
    }

    /// Insert or refresh a contact
    pub fn add_contact(&mut self, contact: Contact) -> AddOutcome {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            self.contacts[pos].update_last_seen();
            self.last_changed = Instant::now();
            return AddOutcome::Updated;
        }

        if self.contacts.len() >= K {
            let lrs = self
                .contacts
                .iter()
                .max_by_key(|c| c.time_since_seen())
                .cloned()
                .expect("full bucket has contacts");
            return AddOutcome::Full {
                least_recently_seen: lrs,
            };
        }

        self.contacts.push(contact);
        self.last_changed = Instant::now();
        AddOutcome::Added
    }

    /// Remove a contact from the bucket
    pub fn remove_contact(&mut self, id: &NodeId) {
        self.contacts.retain(|c| c.id != *id);
        self.last_changed = Instant::now();
    }

    /// Find a contact by id
    pub fn find_contact(&self, id: &NodeId) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.id == *id)
    }

    /// Number of contacts in the bucket
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    /// Whether the bucket is empty
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Whether the bucket is full
    pub fn is_full(&self) -> bool {
        self.contacts.len() >= K
    }
}

impl Default for KBucket {
    fn default() -> Self {
        Self::new()
    }
}

/// Kademlia routing table
#[derive(Debug)]
pub struct RoutingTable {
    /// Our node id
    pub our_id: NodeId,
    /// One bucket per common-prefix length.
    ///
    /// Indexing by prefix length gives every prefix its own bucket, which
    /// is the fixed point of the split-on-overflow refinement; overflow is
    /// therefore handled purely by the eviction challenge.
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create a new routing table
    pub fn new(our_id: NodeId) -> Self {
        Self {
            our_id,
            buckets: (0..BUCKET_COUNT).map(|_| KBucket::new()).collect(),
        }
    }

    /// Insert or refresh a contact.
    ///
    /// Contacts claiming our own id are ignored.
    pub fn add_contact(&mut self, contact: Contact) -> AddOutcome {
        if contact.id == self.our_id {
            return AddOutcome::Updated;
        }
        let index = self.bucket_index(&contact.id);
        self.buckets[index].add_contact(contact)
    }

    /// Refresh the last-seen timestamp of a known contact
    pub fn touch(&mut self, id: &NodeId) {
        let index = self.bucket_index(id);
        if let Some(pos) = self.buckets[index].contacts.iter().position(|c| c.id == *id) {
            self.buckets[index].contacts[pos].update_last_seen();
            self.buckets[index].last_changed = Instant::now();
        }
    }

    /// Evict `old` and insert `new` in its place.
    ///
    /// Used to finish the eviction challenge when the least-recently-seen
    /// contact failed to answer a ping.
    pub fn replace(&mut self, old: &NodeId, new: Contact) {
        self.remove_contact(old);
        let index = self.bucket_index(&new.id);
        // Another writer may have filled the slot in the meantime; a full
        // bucket just drops the newcomer.
        let _ = self.buckets[index].add_contact(new);
    }

    /// Remove a contact
    pub fn remove_contact(&mut self, id: &NodeId) {
        let index = self.bucket_index(id);
        self.buckets[index].remove_contact(id);
    }

    /// Find the `count` closest contacts to a target id, ordered by
    /// XOR distance
    pub fn closest_contacts(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut all: Vec<Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.contacts.iter().cloned())
            .collect();
        all.sort_by_key(|c| c.distance_to(target));
        all.truncate(count);
        all
    }

    /// Find a contact by id
    pub fn find_contact(&self, id: &NodeId) -> Option<&Contact> {
        self.buckets[self.bucket_index(id)].find_contact(id)
    }

    /// All contacts in the table
    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|b| b.contacts.iter().cloned())
            .collect()
    }

    /// Total number of contacts
    pub fn contact_count(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    /// Indexes of buckets untouched for longer than `timeout`
    pub fn stale_buckets(&self, timeout: std::time::Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty() && b.last_changed.elapsed() > timeout)
            .map(|(i, _)| i)
            .collect()
    }

    /// The bucket index for an id: the common-prefix length with our id,
    /// capped at the last bucket
    fn bucket_index(&self, id: &NodeId) -> usize {
        self.our_id.common_prefix_len(id).min(BUCKET_COUNT - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn contact(first_byte: u8, port: u16) -> Contact {
        let mut id = [0u8; 20];
        id[0] = first_byte;
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        Contact::new(NodeId::new(id), addr)
    }

    #[test]
    fn test_routing_table_new() {
        let our_id = NodeId::new([1u8; 20]);
        let table = RoutingTable::new(our_id);
        assert_eq!(table.our_id, our_id);
        assert_eq!(table.contact_count(), 0);
    }

    #[test]
    fn test_add_contact() {
        let mut table = RoutingTable::new(NodeId::new([1u8; 20]));
        let outcome = table.add_contact(contact(2, 6881));
        assert!(matches!(outcome, AddOutcome::Added));
        assert_eq!(table.contact_count(), 1);
    }

    #[test]
    fn test_add_duplicate_updates() {
        let mut table = RoutingTable::new(NodeId::new([1u8; 20]));
        table.add_contact(contact(2, 6881));
        let outcome = table.add_contact(contact(2, 6881));
        assert!(matches!(outcome, AddOutcome::Updated));
        assert_eq!(table.contact_count(), 1);
    }

    #[test]
    fn test_own_id_ignored() {
        let our_id = NodeId::new([1u8; 20]);
        let mut table = RoutingTable::new(our_id);
        table.add_contact(Contact::new(our_id, "127.0.0.1:6881".parse().unwrap()));
        assert_eq!(table.contact_count(), 0);
    }

    #[test]
    fn test_full_bucket_surfaces_least_recently_seen() {
        let mut table = RoutingTable::new(NodeId::new([0u8; 20]));

        // All these ids share prefix length 0 with our id, so they land
        // in the same bucket
        let mut first = None;
        for i in 0..K {
            let mut id = [0x80u8; 20];
            id[19] = i as u8;
            let c = Contact::new(NodeId::new(id), format!("127.0.0.1:{}", 7000 + i).parse().unwrap());
            if first.is_none() {
                first = Some(c.id);
            }
            assert!(matches!(table.add_contact(c), AddOutcome::Added));
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let mut id = [0x80u8; 20];
        id[19] = K as u8;
        let newcomer = Contact::new(NodeId::new(id), "127.0.0.1:7100".parse().unwrap());
        match table.add_contact(newcomer.clone()) {
            AddOutcome::Full { least_recently_seen } => {
                assert_eq!(least_recently_seen.id, first.unwrap());

                // Evicting it makes room for the newcomer
                table.replace(&least_recently_seen.id, newcomer.clone());
                assert!(table.find_contact(&newcomer.id).is_some());
                assert!(table.find_contact(&least_recently_seen.id).is_none());
            }
            other => panic!("expected Full, got {:?}", other),
        }
    }

    #[test]
    fn test_touch_refreshes_lrs_order() {
        let mut table = RoutingTable::new(NodeId::new([0u8; 20]));
        let mut ids = Vec::new();
        for i in 0..K {
            let mut id = [0x80u8; 20];
            id[19] = i as u8;
            ids.push(NodeId::new(id));
            table.add_contact(Contact::new(ids[i], format!("127.0.0.1:{}", 7000 + i).parse().unwrap()));
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        // Refresh the oldest; the second-oldest becomes the eviction
        // candidate
        table.touch(&ids[0]);
        let mut id = [0x80u8; 20];
        id[19] = K as u8;
        match table.add_contact(Contact::new(NodeId::new(id), "127.0.0.1:7100".parse().unwrap())) {
            AddOutcome::Full { least_recently_seen } => {
                assert_eq!(least_recently_seen.id, ids[1]);
            }
            other => panic!("expected Full, got {:?}", other),
        }
    }

    #[test]
    fn test_closest_contacts_sorted() {
        let mut table = RoutingTable::new(NodeId::new([0u8; 20]));
        let target = NodeId::new([0xFFu8; 20]);

        table.add_contact(contact(0xF0, 6881));
        table.add_contact(contact(0x0F, 6882));
        let mut exact = [0xFFu8; 20];
        exact[19] = 0xFE;
        table.add_contact(Contact::new(NodeId::new(exact), "127.0.0.1:6883".parse().unwrap()));

        let closest = table.closest_contacts(&target, K);
        assert_eq!(closest.len(), 3);
        assert_eq!(closest[0].id, NodeId::new(exact));
        assert_eq!(closest[1].id.0[0], 0xF0);
    }

    #[test]
    fn test_closest_contacts_truncates() {
        let mut table = RoutingTable::new(NodeId::new([0u8; 20]));
        for i in 0..20u8 {
            let mut id = [0u8; 20];
            id[0] = i + 1;
            id[19] = i;
            table.add_contact(Contact::new(NodeId::new(id), format!("127.0.0.1:{}", 6881 + i as u16).parse().unwrap()));
        }
        assert_eq!(table.closest_contacts(&NodeId::new([0xFFu8; 20]), K).len(), K);
    }

    #[test]
    fn test_remove_contact() {
        let mut table = RoutingTable::new(NodeId::new([1u8; 20]));
        let c = contact(2, 6881);
        let id = c.id;
        table.add_contact(c);
        assert_eq!(table.contact_count(), 1);
        table.remove_contact(&id);
        assert_eq!(table.contact_count(), 0);
    }

    #[test]
    fn test_stale_buckets_only_counts_occupied() {
        let mut table = RoutingTable::new(NodeId::new([1u8; 20]));
        assert!(table.stale_buckets(std::time::Duration::from_secs(0)).is_empty());
        table.add_contact(contact(2, 6881));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(table.stale_buckets(std::time::Duration::from_millis(1)).len(), 1);
    }
}
