//! Peers found by scanning that are not connected yet.
//!
//! The list keeps discovery order and holds each address once. Senders
//! block on it with [`DiscoveryList::wait_until`] while scanning runs.

use std::time::{Duration, Instant};

use btlink_types::{DiscoveredPeer, PeerAddress};
use parking_lot::{Condvar, Mutex};

/// Ordered, deduplicated set of discovered peers.
#[derive(Debug, Default)]
pub struct DiscoveryList {
    peers: Mutex<Vec<DiscoveredPeer>>,
    changed: Condvar,
}

impl DiscoveryList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer, or refresh name and signal strength of a known one.
    ///
    /// Returns `true` if the peer was not in the list.
    pub fn insert(&self, peer: DiscoveredPeer) -> bool {
        let inserted = {
            let mut peers = self.peers.lock();
            match peers.iter_mut().find(|p| p.address == peer.address) {
                Some(existing) => {
                    if peer.name.is_some() {
                        existing.name = peer.name;
                    }
                    if peer.rssi.is_some() {
                        existing.rssi = peer.rssi;
                    }
                    existing.transport = peer.transport;
                    false
                }
                None => {
                    peers.push(peer);
                    true
                }
            }
        };
        if inserted {
            self.changed.notify_all();
        }
        inserted
    }

    /// Remove a peer.
    pub fn remove(&self, address: PeerAddress) -> Option<DiscoveredPeer> {
        let mut peers = self.peers.lock();
        let index = peers.iter().position(|p| p.address == address)?;
        Some(peers.remove(index))
    }

    /// Whether `address` is in the list.
    pub fn contains(&self, address: PeerAddress) -> bool {
        self.peers.lock().iter().any(|p| p.address == address)
    }

    /// A copy of the entry for `address`.
    pub fn get(&self, address: PeerAddress) -> Option<DiscoveredPeer> {
        self.peers
            .lock()
            .iter()
            .find(|p| p.address == address)
            .cloned()
    }

    /// Copies of every entry in discovery order.
    pub fn snapshot(&self) -> Vec<DiscoveredPeer> {
        self.peers.lock().clone()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.peers.lock().clear();
        self.changed.notify_all();
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Block until `pred` holds for the list or `timeout` passes.
    ///
    /// Returns the final value of `pred`.
    pub fn wait_until(&self, timeout: Duration, pred: impl Fn(&[DiscoveredPeer]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut peers = self.peers.lock();
        loop {
            if pred(&peers) {
                return true;
            }
            if self.changed.wait_until(&mut peers, deadline).timed_out() {
                return pred(&peers);
            }
        }
    }

    /// Wake every waiter so it can re-check cancellation.
    pub fn wake_all(&self) {
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn peer(last: u8) -> DiscoveredPeer {
        DiscoveredPeer::new(PeerAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last]).unwrap())
    }

    #[test]
    fn test_insert_deduplicates_and_keeps_order() {
        let list = DiscoveryList::new();
        assert!(list.insert(peer(2)));
        assert!(list.insert(peer(1)));
        assert!(!list.insert(peer(2).with_rssi(-40)));

        let snapshot = list.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].address, peer(2).address);
        assert_eq!(snapshot[0].rssi, Some(-40));
        assert_eq!(snapshot[1].address, peer(1).address);
    }

    #[test]
    fn test_refresh_keeps_known_name() {
        let list = DiscoveryList::new();
        list.insert(peer(1).with_name("node"));
        list.insert(peer(1));
        assert_eq!(list.get(peer(1).address).unwrap().name.as_deref(), Some("node"));
    }

    #[test]
    fn test_remove() {
        let list = DiscoveryList::new();
        list.insert(peer(1));
        assert!(list.remove(peer(1).address).is_some());
        assert!(list.remove(peer(1).address).is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn test_wait_until_times_out() {
        let list = DiscoveryList::new();
        let start = Instant::now();
        let target = peer(1).address;
        assert!(!list.wait_until(Duration::from_millis(30), |p| {
            p.iter().any(|d| d.address == target)
        }));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_until_wakes_on_insert() {
        let list = Arc::new(DiscoveryList::new());
        let writer = Arc::clone(&list);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.insert(peer(7));
        });
        let target = peer(7).address;
        assert!(list.wait_until(Duration::from_secs(5), |p| {
            p.iter().any(|d| d.address == target)
        }));
        handle.join().unwrap();
    }
}
