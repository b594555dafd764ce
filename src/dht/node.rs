//! DHT identifiers and contacts
//!
//! 160-bit node identifiers and the contacts held in the routing table.

use std::net::SocketAddr;
use std::time::Instant;

/// DHT node identifier (20 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    /// Create a new NodeId from bytes
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Generate a random NodeId
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut id = [0u8; 20];
        rng.fill(&mut id);
        Self(id)
    }

    /// Parse a NodeId from a byte slice, which must be exactly 20 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 20 {
            return None;
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        Some(Self(id))
    }

    /// Get the NodeId as bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Get the NodeId as a hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a NodeId from a hex string
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        hex::decode(hex_str).ok().and_then(|bytes| Self::from_slice(&bytes))
    }

    /// XOR distance to another id
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut distance = [0u8; 20];
        for i in 0..20 {
            distance[i] = self.0[i] ^ other.0[i];
        }
        distance
    }

    /// Common-prefix length of the XOR distance to another id, in bits.
    ///
    /// Identical ids return 160.
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        for (i, byte) in self.distance(other).iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        160
    }
}

/// A contact in the routing table
#[derive(Debug, Clone)]
pub struct Contact {
    /// Contact identifier
    pub id: NodeId,
    /// Contact address
    pub addr: SocketAddr,
    /// When the contact last responded or queried us
    pub last_seen: Instant,
}

impl Contact {
    /// Create a new contact
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
        }
    }

    /// XOR distance from this contact to a target id
    pub fn distance_to(&self, target: &NodeId) -> [u8; 20] {
        self.id.distance(target)
    }

    /// Update the last-seen timestamp
    pub fn update_last_seen(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Get the time since last seen
    pub fn time_since_seen(&self) -> std::time::Duration {
        self.last_seen.elapsed()
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_new() {
        let id_bytes = [1u8; 20];
        let node_id = NodeId::new(id_bytes);
        assert_eq!(node_id.0, id_bytes);
    }

    #[test]
    fn test_node_id_random() {
        let node_id1 = NodeId::random();
        let node_id2 = NodeId::random();
        assert_ne!(node_id1, node_id2);
    }

    #[test]
    fn test_node_id_hex_round_trip() {
        let id_bytes = [0xABu8; 20];
        let node_id = NodeId::new(id_bytes);
        let hex_str = node_id.to_hex();
        assert_eq!(hex_str.len(), 40);
        assert_eq!(NodeId::from_hex(&hex_str), Some(node_id));
    }

    #[test]
    fn test_node_id_from_slice_rejects_wrong_length() {
        assert!(NodeId::from_slice(&[0u8; 19]).is_none());
        assert!(NodeId::from_slice(&[0u8; 21]).is_none());
        assert!(NodeId::from_slice(&[0u8; 20]).is_some());
    }

    #[test]
    fn test_distance() {
        let id1 = NodeId::new([0xFFu8; 20]);
        let id2 = NodeId::new([0x00u8; 20]);
        assert_eq!(id1.distance(&id2), [0xFFu8; 20]);
        assert_eq!(id1.distance(&id1), [0u8; 20]);
    }

    #[test]
    fn test_common_prefix_len() {
        let id1 = NodeId::new([0x80u8; 20]);
        let mut other = [0x80u8; 20];
        other[0] = 0x00; // first bit differs
        assert_eq!(id1.common_prefix_len(&NodeId::new(other)), 0);

        let mut other = [0x80u8; 20];
        other[19] = 0x81; // last bit differs
        assert_eq!(id1.common_prefix_len(&NodeId::new(other)), 159);

        assert_eq!(id1.common_prefix_len(&id1), 160);
    }

    #[test]
    fn test_contact_update_last_seen() {
        let mut contact = Contact::new(NodeId::new([1u8; 20]), "127.0.0.1:6881".parse().unwrap());
        std::thread::sleep(std::time::Duration::from_millis(10));
        contact.update_last_seen();
        assert!(contact.time_since_seen() < std::time::Duration::from_millis(20));
    }

    #[test]
    fn test_contact_equality_by_id() {
        let a = Contact::new(NodeId::new([1u8; 20]), "127.0.0.1:6881".parse().unwrap());
        let b = Contact::new(NodeId::new([1u8; 20]), "10.0.0.1:6881".parse().unwrap());
        assert_eq!(a, b);
    }
}
