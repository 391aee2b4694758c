//! Per-peer state records.

use std::collections::HashMap;

use btlink_types::{ConnectionStage, DeviceState, PeerAddress, SendOutcome};
use parking_lot::Mutex;

/// Map from peer address to its [`DeviceState`].
///
/// Records are created on first discovery or first inbound connection and
/// survive disconnects. The lock is never held across a platform call.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<PeerAddress, DeviceState>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-or-create the record for `address` and mutate it under the lock.
    pub fn upsert<R>(&self, address: PeerAddress, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        let mut devices = self.devices.lock();
        let state = devices
            .entry(address)
            .or_insert_with(|| DeviceState::new(address));
        f(state)
    }

    /// Mutate an existing record. Returns `None` if there is none.
    pub fn update<R>(
        &self,
        address: PeerAddress,
        f: impl FnOnce(&mut DeviceState) -> R,
    ) -> Option<R> {
        self.devices.lock().get_mut(&address).map(f)
    }

    /// A copy of the record for `address`.
    pub fn get(&self, address: PeerAddress) -> Option<DeviceState> {
        self.devices.lock().get(&address).cloned()
    }

    /// Current stage, [`ConnectionStage::Unknown`] for unknown peers.
    pub fn stage(&self, address: PeerAddress) -> ConnectionStage {
        self.devices
            .lock()
            .get(&address)
            .map_or(ConnectionStage::Unknown, |s| s.stage)
    }

    /// Record a terminal send outcome. Unknown peers are left alone.
    pub fn set_outcome(&self, address: PeerAddress, outcome: SendOutcome) -> bool {
        self.update(address, |s| s.last_send_outcome = outcome)
            .is_some()
    }

    /// Remove the record for `address`.
    pub fn remove(&self, address: PeerAddress) -> Option<DeviceState> {
        self.devices.lock().remove(&address)
    }

    /// Remove every record.
    pub fn remove_all(&self) {
        self.devices.lock().clear();
    }

    /// Copies of every record, ordered by address.
    pub fn snapshot(&self) -> Vec<DeviceState> {
        let mut all: Vec<_> = self.devices.lock().values().cloned().collect();
        all.sort_by_key(|s| s.address);
        all
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }
}
