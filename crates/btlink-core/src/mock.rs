//! Scriptable Bluetooth platform for testing.
//!
//! [`MockPlatform`] implements [`BluetoothPlatform`] without any radio.
//! Peers are placed "in range" with [`MockPlatform::add_peer`] and are
//! reported on every `start_scan`. Every request is recorded, and faults
//! can be injected per peer and per operation.
//!
//! # Features
//!
//! - **Delivery modes**: callbacks run synchronously inside the request
//!   ([`MockPlatform::new`]) or in order on a separate thread
//!   ([`MockPlatform::threaded`]).
//! - **Fault injection**: fail through the callback, reject synchronously,
//!   or never answer.
//! - **Peer-side events**: drop links, change services, revoke bonds,
//!   switch the radio, connect clients to the local server, deliver data.
//! - **Capability cache check**: counts capability discoveries repeated on
//!   a peer without an intervening services change.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use btlink_types::fragment;
use btlink_types::{Capabilities, DiscoveredPeer, PeerAddress, Role, TransportKind};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::{PlatformError, PlatformResult};
use crate::platform::PlatformCapabilities;
use crate::traits::{BluetoothPlatform, LinkEvent, PlatformEvents};

/// A peer the mock reports as in range.
#[derive(Debug, Clone)]
pub struct MockPeer {
    /// What scanning reports.
    pub peer: DiscoveredPeer,
    /// What capability discovery reports.
    pub capabilities: Capabilities,
}

impl MockPeer {
    /// A GATT peer with a notification characteristic.
    pub fn new(address: PeerAddress) -> Self {
        Self {
            peer: DiscoveredPeer::new(address),
            capabilities: Capabilities::gatt(),
        }
    }

    /// An RFCOMM peer.
    #[must_use]
    pub fn rfcomm(mut self) -> Self {
        self.peer.transport = TransportKind::Rfcomm;
        self.capabilities = Capabilities::rfcomm();
        self
    }

    /// Report capabilities without a notification characteristic.
    #[must_use]
    pub fn without_notifications(mut self) -> Self {
        self.capabilities = self.capabilities.without_notifications();
        self
    }

    /// Set the advertised name.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.peer.name = Some(name.to_string());
        self
    }

    /// Set the reported signal strength.
    #[must_use]
    pub fn rssi(mut self, rssi: i16) -> Self {
        self.peer.rssi = Some(rssi);
        self
    }
}

/// A request that can be faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Connect,
    Discover,
    Arm,
    Write,
    Notify,
}

/// How a faulted request misbehaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Accept the request, then report this error through the callback.
    Fail(PlatformError),
    /// Refuse the request synchronously.
    Reject(PlatformError),
    /// Accept the request and never answer.
    Hang,
}

/// A recorded platform request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    StartScan,
    StopScan,
    Connect(PeerAddress, TransportKind),
    Disconnect(PeerAddress),
    Close(PeerAddress),
    Discover(PeerAddress),
    Arm(PeerAddress, Uuid),
    Write(PeerAddress, Uuid, Bytes),
    StartAdvertise(Uuid),
    StopAdvertise,
    AcceptIncoming,
    Notify(PeerAddress, Bytes),
}

type Delivery = Box<dyn FnOnce() + Send>;

/// A Bluetooth platform driven entirely by the test.
///
/// # Example
///
/// ```
/// use btlink_core::{BluetoothPlatform, MockPlatform, PlatformCall};
/// use btlink_types::PeerAddress;
///
/// let peer: PeerAddress = "AA:BB:CC:DD:EE:01".parse().unwrap();
/// let platform = MockPlatform::new();
/// platform.add_peer(peer);
/// platform.start_scan().unwrap();
/// assert!(platform.is_scanning());
/// assert_eq!(platform.calls(), vec![PlatformCall::StartScan]);
/// ```
pub struct MockPlatform {
    capabilities: RwLock<PlatformCapabilities>,
    handler: RwLock<Option<Arc<dyn PlatformEvents>>>,
    dispatcher: Mutex<Option<mpsc::Sender<Delivery>>>,
    latency_ms: AtomicU64,
    peers: Mutex<Vec<MockPeer>>,
    links: Mutex<HashSet<PeerAddress>>,
    server_links: Mutex<HashSet<PeerAddress>>,
    faults: Mutex<HashMap<(PeerAddress, MockOp), Fault>>,
    calls: Mutex<Vec<PlatformCall>>,
    discovered: Mutex<HashSet<PeerAddress>>,
    redundant_discoveries: Mutex<Vec<PeerAddress>>,
    scanning: AtomicBool,
    advertising: AtomicBool,
}

impl std::fmt::Debug for MockPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPlatform")
            .field("peers", &self.peers.lock().len())
            .field("links", &self.links.lock().len())
            .field("scanning", &self.scanning.load(Ordering::Relaxed))
            .field("advertising", &self.advertising.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    /// A mock that answers every request synchronously, from inside the
    /// request call.
    pub fn new() -> Self {
        Self {
            capabilities: RwLock::new(PlatformCapabilities::full()),
            handler: RwLock::new(None),
            dispatcher: Mutex::new(None),
            latency_ms: AtomicU64::new(0),
            peers: Mutex::new(Vec::new()),
            links: Mutex::new(HashSet::new()),
            server_links: Mutex::new(HashSet::new()),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            discovered: Mutex::new(HashSet::new()),
            redundant_discoveries: Mutex::new(Vec::new()),
            scanning: AtomicBool::new(false),
            advertising: AtomicBool::new(false),
        }
    }

    /// A mock that answers requests in order on its own thread.
    ///
    /// Falls back to synchronous answers if the thread cannot be spawned.
    pub fn threaded() -> Self {
        let mock = Self::new();
        let (tx, rx) = mpsc::channel::<Delivery>();
        let spawned = thread::Builder::new()
            .name("mock-platform".to_string())
            .spawn(move || {
                for delivery in rx {
                    delivery();
                }
            });
        match spawned {
            Ok(_) => *mock.dispatcher.lock() = Some(tx),
            Err(e) => debug!("Mock dispatcher thread unavailable: {}", e),
        }
        mock
    }

    /// Report these capabilities instead of full support.
    #[must_use]
    pub fn with_capabilities(self, capabilities: PlatformCapabilities) -> Self {
        *self.capabilities.write() = capabilities;
        self
    }

    /// Delay every threaded callback.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
        self
    }

    // ==================== Scripting ====================

    /// Put a GATT peer with notifications in range.
    pub fn add_peer(&self, address: PeerAddress) {
        self.add_mock_peer(MockPeer::new(address));
    }

    /// Put a configured peer in range.
    pub fn add_mock_peer(&self, peer: MockPeer) {
        let mut peers = self.peers.lock();
        peers.retain(|p| p.peer.address != peer.peer.address);
        peers.push(peer);
    }

    /// Take a peer out of range. Its link, if any, stays up.
    pub fn remove_peer(&self, address: PeerAddress) {
        self.peers.lock().retain(|p| p.peer.address != address);
    }

    /// Make `op` on `address` misbehave until cleared.
    pub fn inject(&self, address: PeerAddress, op: MockOp, fault: Fault) {
        self.faults.lock().insert((address, op), fault);
    }

    /// Remove every fault for `address`.
    pub fn clear_faults(&self, address: PeerAddress) {
        self.faults.lock().retain(|(a, _), _| *a != address);
    }

    /// Drop the link to `address` from the peer side.
    pub fn drop_link(&self, address: PeerAddress) {
        if self.links.lock().remove(&address) {
            self.emit(move |h| h.on_connection_state_changed(address, LinkEvent::Disconnected));
        }
    }

    /// The peer changed its services.
    pub fn change_services(&self, address: PeerAddress) {
        self.discovered.lock().remove(&address);
        self.emit(move |h| h.on_services_changed(address));
    }

    /// The bond with the peer was removed.
    pub fn revoke_bond(&self, address: PeerAddress) {
        self.discovered.lock().remove(&address);
        self.emit(move |h| h.on_bond_revoked(address));
    }

    /// Switch the local radio.
    pub fn set_powered(&self, enabled: bool) {
        if !enabled {
            self.links.lock().clear();
            self.server_links.lock().clear();
            self.scanning.store(false, Ordering::SeqCst);
            self.advertising.store(false, Ordering::SeqCst);
        }
        self.emit(move |h| h.on_adapter_state_changed(enabled));
    }

    /// A remote client connects to the local server.
    pub fn connect_client(&self, address: PeerAddress, transport: TransportKind) {
        self.server_links.lock().insert(address);
        self.emit(move |h| h.on_peer_connected(address, transport));
    }

    /// A remote client disconnects from the local server.
    pub fn disconnect_client(&self, address: PeerAddress) {
        self.server_links.lock().remove(&address);
        self.emit(move |h| h.on_peer_disconnected(address));
    }

    /// Deliver one raw fragment.
    pub fn deliver_fragment(&self, address: PeerAddress, role: Role, data: Bytes) {
        self.emit(move |h| h.on_data_received(address, role, data));
    }

    /// Fragment `payload` to `mtu` and deliver every fragment in order.
    pub fn deliver_datagram(
        &self,
        address: PeerAddress,
        role: Role,
        payload: &[u8],
        mtu: usize,
    ) -> PlatformResult<()> {
        let fragments = fragment::fragment(payload, mtu)
            .map_err(|e| PlatformError::Rejected(e.to_string()))?;
        for data in fragments {
            self.deliver_fragment(address, role, data);
        }
        Ok(())
    }

    // ==================== Inspection ====================

    /// Every request so far, in order.
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls.lock().clone()
    }

    /// Forget recorded requests.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Number of connect requests for `address`.
    pub fn connect_count(&self, address: PeerAddress) -> usize {
        self.count(|c| matches!(c, PlatformCall::Connect(a, _) if *a == address))
    }

    /// Number of capability discoveries for `address`.
    pub fn discover_count(&self, address: PeerAddress) -> usize {
        self.count(|c| matches!(c, PlatformCall::Discover(a) if *a == address))
    }

    /// Number of `start_scan` requests.
    pub fn start_scan_count(&self) -> usize {
        self.count(|c| matches!(c, PlatformCall::StartScan))
    }

    /// Fragments written to `address`, in order.
    pub fn writes_to(&self, address: PeerAddress) -> Vec<Bytes> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                PlatformCall::Write(a, _, data) if *a == address => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Fragments notified to `address`, in order.
    pub fn notifies_to(&self, address: PeerAddress) -> Vec<Bytes> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                PlatformCall::Notify(a, data) if *a == address => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Peers whose capabilities were discovered again although their
    /// services never changed.
    pub fn redundant_discoveries(&self) -> Vec<PeerAddress> {
        self.redundant_discoveries.lock().clone()
    }

    /// Whether the mock is scanning.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Whether the mock is advertising.
    pub fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::SeqCst)
    }

    /// Whether a client-role link to `address` is up.
    pub fn is_linked(&self, address: PeerAddress) -> bool {
        self.links.lock().contains(&address)
    }

    /// Whether an event handler is installed.
    pub fn has_handler(&self) -> bool {
        self.handler.read().is_some()
    }

    // ==================== Internals ====================

    fn count(&self, pred: impl Fn(&PlatformCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: PlatformCall) {
        self.calls.lock().push(call);
    }

    fn fault(&self, address: PeerAddress, op: MockOp) -> Option<Fault> {
        self.faults.lock().get(&(address, op)).cloned()
    }

    fn peer(&self, address: PeerAddress) -> Option<MockPeer> {
        self.peers
            .lock()
            .iter()
            .find(|p| p.peer.address == address)
            .cloned()
    }

    /// Run `f` against the installed handler. No mock lock is held.
    fn emit(&self, f: impl FnOnce(&dyn PlatformEvents) + Send + 'static) {
        let Some(handler) = self.handler.read().clone() else {
            return;
        };
        let dispatcher = self.dispatcher.lock().clone();
        match dispatcher {
            Some(tx) => {
                let latency = Duration::from_millis(self.latency_ms.load(Ordering::Relaxed));
                let delivery: Delivery = Box::new(move || {
                    if !latency.is_zero() {
                        thread::sleep(latency);
                    }
                    f(handler.as_ref());
                });
                if let Err(mpsc::SendError(delivery)) = tx.send(delivery) {
                    delivery();
                }
            }
            None => f(handler.as_ref()),
        }
    }

    /// Apply a fault to a request whose normal answer is `ok`.
    fn answer(
        &self,
        address: PeerAddress,
        op: MockOp,
        fail: impl FnOnce(&dyn PlatformEvents, PlatformError) + Send + 'static,
        ok: impl FnOnce(&dyn PlatformEvents) + Send + 'static,
    ) -> PlatformResult<()> {
        match self.fault(address, op) {
            Some(Fault::Reject(e)) => Err(e),
            Some(Fault::Hang) => Ok(()),
            Some(Fault::Fail(e)) => {
                self.emit(move |h| fail(h, e));
                Ok(())
            }
            None => {
                self.emit(ok);
                Ok(())
            }
        }
    }

    fn require_link(&self, address: PeerAddress) -> PlatformResult<()> {
        if self.links.lock().contains(&address) {
            Ok(())
        } else {
            Err(PlatformError::UnknownPeer(address))
        }
    }
}

impl BluetoothPlatform for MockPlatform {
    fn capabilities(&self) -> PlatformCapabilities {
        *self.capabilities.read()
    }

    fn set_event_handler(&self, handler: Arc<dyn PlatformEvents>) {
        *self.handler.write() = Some(handler);
    }

    fn clear_event_handler(&self) {
        *self.handler.write() = None;
    }

    fn start_scan(&self) -> PlatformResult<()> {
        self.record(PlatformCall::StartScan);
        self.scanning.store(true, Ordering::SeqCst);
        let linked = self.links.lock().clone();
        let in_range: Vec<DiscoveredPeer> = self
            .peers
            .lock()
            .iter()
            .filter(|p| !linked.contains(&p.peer.address))
            .map(|p| p.peer.clone())
            .collect();
        for peer in in_range {
            self.emit(move |h| h.on_peer_discovered(peer));
        }
        Ok(())
    }

    fn stop_scan(&self) -> PlatformResult<()> {
        self.record(PlatformCall::StopScan);
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn connect(
        &self,
        peer: PeerAddress,
        transport: TransportKind,
        _auto_connect: bool,
    ) -> PlatformResult<()> {
        self.record(PlatformCall::Connect(peer, transport));
        if self.peer(peer).is_none() {
            return Err(PlatformError::UnknownPeer(peer));
        }
        match self.fault(peer, MockOp::Connect) {
            Some(Fault::Reject(e)) => Err(e),
            Some(Fault::Hang) => Ok(()),
            Some(Fault::Fail(e)) => {
                self.emit(move |h| h.on_connection_state_changed(peer, LinkEvent::ConnectFailed(e)));
                Ok(())
            }
            None => {
                self.links.lock().insert(peer);
                self.emit(move |h| h.on_connection_state_changed(peer, LinkEvent::Connected));
                Ok(())
            }
        }
    }

    fn disconnect(&self, peer: PeerAddress) -> PlatformResult<()> {
        self.record(PlatformCall::Disconnect(peer));
        if self.links.lock().remove(&peer) {
            self.emit(move |h| h.on_connection_state_changed(peer, LinkEvent::Disconnected));
        }
        Ok(())
    }

    fn close(&self, peer: PeerAddress) -> PlatformResult<()> {
        self.record(PlatformCall::Close(peer));
        Ok(())
    }

    fn discover_capabilities(&self, peer: PeerAddress) -> PlatformResult<()> {
        self.record(PlatformCall::Discover(peer));
        self.require_link(peer)?;
        if !self.discovered.lock().insert(peer) {
            self.redundant_discoveries.lock().push(peer);
        }
        let capabilities = self
            .peer(peer)
            .map_or_else(Capabilities::gatt, |p| p.capabilities);
        self.answer(
            peer,
            MockOp::Discover,
            move |h, e| h.on_capabilities_discovered(peer, Err(e)),
            move |h| h.on_capabilities_discovered(peer, Ok(capabilities)),
        )
    }

    fn arm_notification(&self, peer: PeerAddress, characteristic: Uuid) -> PlatformResult<()> {
        self.record(PlatformCall::Arm(peer, characteristic));
        self.require_link(peer)?;
        self.answer(
            peer,
            MockOp::Arm,
            move |h, e| h.on_notification_armed(peer, Err(e)),
            move |h| h.on_notification_armed(peer, Ok(())),
        )
    }

    fn write(&self, peer: PeerAddress, characteristic: Uuid, payload: Bytes) -> PlatformResult<()> {
        self.record(PlatformCall::Write(peer, characteristic, payload));
        self.require_link(peer)?;
        self.answer(
            peer,
            MockOp::Write,
            move |h, e| h.on_write_result(peer, Err(e)),
            move |h| h.on_write_result(peer, Ok(())),
        )
    }

    fn start_advertise(&self, service: Uuid) -> PlatformResult<()> {
        self.record(PlatformCall::StartAdvertise(service));
        self.advertising.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_advertise(&self) -> PlatformResult<()> {
        self.record(PlatformCall::StopAdvertise);
        self.advertising.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn accept_incoming(&self) -> PlatformResult<()> {
        self.record(PlatformCall::AcceptIncoming);
        if self.capabilities.read().rfcomm {
            Ok(())
        } else {
            Err(PlatformError::Unsupported("accept_incoming"))
        }
    }

    fn notify(&self, peer: PeerAddress, payload: Bytes) -> PlatformResult<()> {
        self.record(PlatformCall::Notify(peer, payload));
        if !self.server_links.lock().contains(&peer) {
            return Err(PlatformError::UnknownPeer(peer));
        }
        self.answer(
            peer,
            MockOp::Notify,
            move |h, e| h.on_notify_sent(peer, Err(e)),
            move |h| h.on_notify_sent(peer, Ok(())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> PeerAddress {
        PeerAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last]).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        discovered: Mutex<Vec<PeerAddress>>,
        links: Mutex<Vec<(PeerAddress, LinkEvent)>>,
        writes: Mutex<Vec<(PeerAddress, PlatformResult<()>)>>,
    }

    impl PlatformEvents for Recorder {
        fn on_peer_discovered(&self, peer: DiscoveredPeer) {
            self.discovered.lock().push(peer.address);
        }
        fn on_connection_state_changed(&self, peer: PeerAddress, event: LinkEvent) {
            self.links.lock().push((peer, event));
        }
        fn on_capabilities_discovered(&self, _: PeerAddress, _: PlatformResult<Capabilities>) {}
        fn on_notification_armed(&self, _: PeerAddress, _: PlatformResult<()>) {}
        fn on_write_result(&self, peer: PeerAddress, result: PlatformResult<()>) {
            self.writes.lock().push((peer, result));
        }
        fn on_notify_sent(&self, _: PeerAddress, _: PlatformResult<()>) {}
        fn on_peer_connected(&self, _: PeerAddress, _: TransportKind) {}
        fn on_peer_disconnected(&self, _: PeerAddress) {}
        fn on_data_received(&self, _: PeerAddress, _: Role, _: Bytes) {}
        fn on_services_changed(&self, _: PeerAddress) {}
        fn on_bond_revoked(&self, _: PeerAddress) {}
        fn on_adapter_state_changed(&self, _: bool) {}
    }

    fn mock_with_recorder() -> (MockPlatform, Arc<Recorder>) {
        let mock = MockPlatform::new();
        let recorder = Arc::new(Recorder::default());
        mock.set_event_handler(recorder.clone());
        (mock, recorder)
    }

    #[test]
    fn test_scan_reports_peers_in_range() {
        let (mock, recorder) = mock_with_recorder();
        mock.add_peer(addr(1));
        mock.add_peer(addr(2));
        mock.start_scan().unwrap();
        assert_eq!(*recorder.discovered.lock(), vec![addr(1), addr(2)]);
        assert!(mock.is_scanning());
    }

    #[test]
    fn test_connect_unknown_peer_is_rejected() {
        let (mock, recorder) = mock_with_recorder();
        let err = mock
            .connect(addr(9), TransportKind::Gatt, false)
            .unwrap_err();
        assert_eq!(err, PlatformError::UnknownPeer(addr(9)));
        assert!(recorder.links.lock().is_empty());
    }

    #[test]
    fn test_connect_and_write() {
        let (mock, recorder) = mock_with_recorder();
        mock.add_peer(addr(1));
        mock.connect(addr(1), TransportKind::Gatt, false).unwrap();
        assert!(mock.is_linked(addr(1)));
        mock.write(addr(1), Uuid::nil(), Bytes::from_static(b"ab"))
            .unwrap();
        assert_eq!(
            *recorder.links.lock(),
            vec![(addr(1), LinkEvent::Connected)]
        );
        assert_eq!(*recorder.writes.lock(), vec![(addr(1), Ok(()))]);
        assert_eq!(mock.writes_to(addr(1)), vec![Bytes::from_static(b"ab")]);
    }

    #[test]
    fn test_faults() {
        let (mock, recorder) = mock_with_recorder();
        mock.add_peer(addr(1));
        mock.inject(
            addr(1),
            MockOp::Connect,
            Fault::Reject(PlatformError::Status(8)),
        );
        assert_eq!(
            mock.connect(addr(1), TransportKind::Gatt, false),
            Err(PlatformError::Status(8))
        );

        mock.inject(
            addr(1),
            MockOp::Connect,
            Fault::Fail(PlatformError::Status(133)),
        );
        mock.connect(addr(1), TransportKind::Gatt, false).unwrap();
        assert_eq!(
            recorder.links.lock().last(),
            Some(&(addr(1), LinkEvent::ConnectFailed(PlatformError::Status(133))))
        );

        mock.clear_faults(addr(1));
        mock.connect(addr(1), TransportKind::Gatt, false).unwrap();
        assert!(mock.is_linked(addr(1)));
        assert_eq!(mock.connect_count(addr(1)), 3);
    }

    #[test]
    fn test_redundant_discovery_tracking() {
        let (mock, _recorder) = mock_with_recorder();
        mock.add_peer(addr(1));
        mock.connect(addr(1), TransportKind::Gatt, false).unwrap();
        mock.discover_capabilities(addr(1)).unwrap();
        assert!(mock.redundant_discoveries().is_empty());
        mock.discover_capabilities(addr(1)).unwrap();
        assert_eq!(mock.redundant_discoveries(), vec![addr(1)]);

        mock.change_services(addr(1));
        mock.discover_capabilities(addr(1)).unwrap();
        assert_eq!(mock.redundant_discoveries().len(), 1);
        assert_eq!(mock.discover_count(addr(1)), 3);
    }

    #[test]
    fn test_threaded_delivery_keeps_order() {
        let mock = MockPlatform::threaded();
        let recorder = Arc::new(Recorder::default());
        mock.set_event_handler(recorder.clone());
        mock.add_peer(addr(1));
        mock.connect(addr(1), TransportKind::Gatt, false).unwrap();
        for _ in 0..10 {
            mock.write(addr(1), Uuid::nil(), Bytes::from_static(b"x"))
                .unwrap();
        }
        mock.drop_link(addr(1));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while recorder.links.lock().len() < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(recorder.writes.lock().len(), 10);
        assert_eq!(
            *recorder.links.lock(),
            vec![
                (addr(1), LinkEvent::Connected),
                (addr(1), LinkEvent::Disconnected)
            ]
        );
    }
}
