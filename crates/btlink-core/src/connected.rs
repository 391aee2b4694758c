//! Peers with a live link.

use btlink_types::PeerAddress;
use parking_lot::Mutex;

/// Ordered set of connected peer addresses.
///
/// One set exists per role. Insertion order is connection order.
#[derive(Debug, Default)]
pub struct ConnectedSet {
    peers: Mutex<Vec<PeerAddress>>,
}

impl ConnectedSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. Returns `true` if it was not present.
    pub fn insert(&self, address: PeerAddress) -> bool {
        let mut peers = self.peers.lock();
        if peers.contains(&address) {
            return false;
        }
        peers.push(address);
        true
    }

    /// Remove a peer. Removing an absent peer is a no-op.
    pub fn remove(&self, address: PeerAddress) -> bool {
        let mut peers = self.peers.lock();
        match peers.iter().position(|p| *p == address) {
            Some(i) => {
                peers.remove(i);
                true
            }
            None => false,
        }
    }

    /// Whether `address` is connected.
    pub fn contains(&self, address: PeerAddress) -> bool {
        self.peers.lock().contains(&address)
    }

    /// Addresses in connection order.
    pub fn snapshot(&self) -> Vec<PeerAddress> {
        self.peers.lock().clone()
    }

    /// Remove every peer, returning them.
    pub fn drain(&self) -> Vec<PeerAddress> {
        std::mem::take(&mut *self.peers.lock())
    }

    /// Number of connected peers.
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// Whether no peer is connected.
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> PeerAddress {
        PeerAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last]).unwrap()
    }

    #[test]
    fn test_insert_is_idempotent() {
        let set = ConnectedSet::new();
        assert!(set.insert(addr(1)));
        assert!(!set.insert(addr(1)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let set = ConnectedSet::new();
        set.insert(addr(1));
        assert!(set.remove(addr(1)));
        assert!(!set.remove(addr(1)));
        assert!(set.is_empty());
    }

    #[test]
    fn test_order_and_drain() {
        let set = ConnectedSet::new();
        set.insert(addr(3));
        set.insert(addr(1));
        assert_eq!(set.snapshot(), vec![addr(3), addr(1)]);
        assert_eq!(set.drain(), vec![addr(3), addr(1)]);
        assert!(set.is_empty());
    }
}
