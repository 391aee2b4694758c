//! The transport adapter: shared context plus the public facade.
//!
//! [`TransportAdapter`] owns every registry and the connection to the
//! host stack. The platform only holds an [`EventBridge`] with a weak
//! reference back into the context, so dropping the adapter tears
//! everything down.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use btlink_types::fragment::Reassembler;
use btlink_types::{
    Capabilities, ConnectionStage, DeviceState, DiscoveredPeer, PeerAddress, Role, SendOutcome,
    TransportKind,
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AdapterConfig;
use crate::connected::ConnectedSet;
use crate::discovery::DiscoveryList;
use crate::error::{Error, FailureReason, PlatformResult, Result};
use crate::events::{EventDispatcher, EventReceiver, TransportEvent};
use crate::pending::{PendingSend, SendReport};
use crate::pool::TaskPool;
use crate::registry::DeviceRegistry;
use crate::server::NotifyTable;
use crate::session::SessionTable;
use crate::traits::{BluetoothPlatform, LinkEvent, PlatformEvents};

/// A terminal send failure, as passed to the error handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    /// Target peer, `None` when a multicast found nobody.
    pub address: Option<PeerAddress>,
    /// The datagram that was not delivered.
    pub payload: Bytes,
    /// Why it failed.
    pub reason: FailureReason,
}

impl SendFailure {
    /// Length of the undelivered payload.
    pub fn length(&self) -> usize {
        self.payload.len()
    }
}

/// Callback invoked for every terminal send failure.
pub type ErrorHandler = Arc<dyn Fn(&SendFailure) + Send + Sync>;

/// Callback invoked for every reassembled inbound datagram.
pub type ReceiveHandler = Arc<dyn Fn(PeerAddress, Role, Bytes) + Send + Sync>;

const STOPPED: u8 = 0;
const STARTING: u8 = 1;
const STARTED: u8 = 2;
const STOPPING: u8 = 3;

/// State shared by the facade, the send coordinator, the session driver
/// and the platform callbacks.
pub(crate) struct AdapterContext {
    pub(crate) config: AdapterConfig,
    pub(crate) platform: Arc<dyn BluetoothPlatform>,
    pub(crate) registry: DeviceRegistry,
    pub(crate) discovery: DiscoveryList,
    pub(crate) client_peers: ConnectedSet,
    pub(crate) server_peers: ConnectedSet,
    pub(crate) sessions: SessionTable,
    pub(crate) notifies: NotifyTable,
    pub(crate) inbound: Mutex<Reassembler<(PeerAddress, Role)>>,
    pub(crate) events: EventDispatcher,
    pool: Mutex<Option<Arc<TaskPool>>>,
    error_handler: RwLock<Option<ErrorHandler>>,
    pub(crate) receive_handler: RwLock<Option<ReceiveHandler>>,
    in_flight: Mutex<Vec<Arc<PendingSend>>>,
    lifecycle: AtomicU8,
    scanning: AtomicBool,
    advertising: AtomicBool,
}

impl AdapterContext {
    fn new(config: AdapterConfig, platform: Arc<dyn BluetoothPlatform>) -> Self {
        let events = EventDispatcher::new(config.event_capacity);
        Self {
            config,
            platform,
            registry: DeviceRegistry::new(),
            discovery: DiscoveryList::new(),
            client_peers: ConnectedSet::new(),
            server_peers: ConnectedSet::new(),
            sessions: Mutex::new(HashMap::new()),
            notifies: Mutex::new(HashMap::new()),
            inbound: Mutex::new(Reassembler::new()),
            events,
            pool: Mutex::new(None),
            error_handler: RwLock::new(None),
            receive_handler: RwLock::new(None),
            in_flight: Mutex::new(Vec::new()),
            lifecycle: AtomicU8::new(STOPPED),
            scanning: AtomicBool::new(false),
            advertising: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.lifecycle.load(Ordering::SeqCst) == STARTED
    }

    pub(crate) fn ensure_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(Error::NotStarted)
        }
    }

    pub(crate) fn pool(&self) -> Option<Arc<TaskPool>> {
        self.pool.lock().clone()
    }

    // ==================== Scan and advertise control ====================

    /// Ask the platform to scan. Safe to call while already scanning.
    pub(crate) fn resume_scan(&self) {
        if !self.config.client || !self.is_started() {
            return;
        }
        match self.platform.start_scan() {
            Ok(()) => {
                if !self.scanning.swap(true, Ordering::SeqCst) {
                    debug!("Scanning resumed");
                }
            }
            Err(e) => warn!("Could not resume scanning: {}", e),
        }
    }

    pub(crate) fn pause_scan(&self) {
        if self.scanning.swap(false, Ordering::SeqCst) {
            debug!("Scanning paused");
            if let Err(e) = self.platform.stop_scan() {
                debug!("Stop scan refused: {}", e);
            }
        }
    }

    fn start_serving(&self) -> PlatformResult<()> {
        if self.config.uses(TransportKind::Gatt) {
            self.platform
                .start_advertise(btlink_types::uuids::GATT_SERVICE)?;
        }
        if self.config.uses(TransportKind::Rfcomm) {
            self.platform.accept_incoming()?;
        }
        self.advertising.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn restart_advertising(&self) {
        if !self.config.server || !self.is_started() {
            return;
        }
        if let Err(e) = self.start_serving() {
            warn!("Could not restart advertising: {}", e);
        }
    }

    // ==================== Outcome reporting ====================

    /// Resolve one target of `pending`. Only the first call per target
    /// has any effect.
    pub(crate) fn finish_target(
        &self,
        pending: &PendingSend,
        address: PeerAddress,
        result: std::result::Result<(), FailureReason>,
    ) {
        if !pending.claim(address, result.clone()) {
            debug!("Ignoring late result for {}", address);
            return;
        }
        match result {
            Ok(()) => {
                self.registry.set_outcome(address, SendOutcome::Success);
                self.events.send(TransportEvent::SendOutcome {
                    address,
                    outcome: SendOutcome::Success,
                    reason: None,
                });
            }
            Err(reason) => {
                self.registry.set_outcome(address, SendOutcome::Failed);
                warn!("Send to {} failed: {}", address, reason);
                self.events.send(TransportEvent::SendOutcome {
                    address,
                    outcome: SendOutcome::Failed,
                    reason: Some(reason.to_string()),
                });
                self.report_failure(Some(address), pending.payload().clone(), reason);
            }
        }
        pending.complete(address);
    }

    /// Hand a failure to the error handler, if one is installed.
    pub(crate) fn report_failure(
        &self,
        address: Option<PeerAddress>,
        payload: Bytes,
        reason: FailureReason,
    ) {
        let handler = self.error_handler.read().clone();
        if let Some(handler) = handler {
            handler(&SendFailure {
                address,
                payload,
                reason,
            });
        }
    }

    pub(crate) fn track(&self, pending: &Arc<PendingSend>) {
        self.in_flight.lock().push(Arc::clone(pending));
    }

    pub(crate) fn untrack(&self, pending: &Arc<PendingSend>) {
        self.in_flight.lock().retain(|p| !Arc::ptr_eq(p, pending));
    }

    /// Resolve every unresolved target of every blocked send.
    fn fail_in_flight(&self, reason: &FailureReason) {
        let in_flight = self.in_flight.lock().clone();
        for pending in in_flight {
            for address in pending.unresolved() {
                self.finish_target(&pending, address, Err(reason.clone()));
            }
            pending.wake();
        }
    }

    /// Drop every link and list entry after the radio went away.
    fn drop_links(&self) {
        for peer in self.client_peers.drain() {
            self.mark_disconnected(peer, Role::Client);
        }
        for peer in self.server_peers.drain() {
            self.mark_disconnected(peer, Role::Server);
        }
        self.discovery.clear();
        self.inbound.lock().clear();
    }

    fn mark_disconnected(&self, peer: PeerAddress, role: Role) {
        self.registry
            .update(peer, |s| s.stage = ConnectionStage::Disconnected);
        self.events.send(TransportEvent::PeerDisconnected {
            address: peer,
            role,
        });
    }

    // ==================== Lifecycle ====================

    fn start(self: &Arc<Self>) -> Result<()> {
        if self
            .lifecycle
            .compare_exchange(STOPPED, STARTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyStarted);
        }

        if let Err(e) = self.platform.capabilities().check(&self.config) {
            warn!("Platform cannot run this configuration: {}", e);
            self.lifecycle.store(STOPPED, Ordering::SeqCst);
            return Err(Error::Unsupported(e));
        }

        info!(
            "Starting transport adapter (client: {}, server: {})",
            self.config.client, self.config.server
        );
        *self.pool.lock() = Some(Arc::new(TaskPool::new(
            "btlink-worker",
            self.config.task_pool_size,
        )));
        self.platform.set_event_handler(Arc::new(EventBridge {
            ctx: Arc::downgrade(self),
        }));
        self.lifecycle.store(STARTED, Ordering::SeqCst);

        let started = (|| {
            if self.config.server {
                self.start_serving()?;
            }
            if self.config.client {
                self.platform.start_scan()?;
                self.scanning.store(true, Ordering::SeqCst);
            }
            Ok::<(), crate::error::PlatformError>(())
        })();

        if let Err(e) = started {
            warn!("Platform refused to start: {}", e);
            self.shutdown();
            return Err(Error::Platform(e));
        }

        self.events.send(TransportEvent::Started {
            client: self.config.client,
            server: self.config.server,
        });
        Ok(())
    }

    fn stop(self: &Arc<Self>) {
        if self
            .lifecycle
            .compare_exchange(STARTED, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        info!("Stopping transport adapter");
        self.shutdown();
        self.events.send(TransportEvent::Stopped);
    }

    /// Release platform resources and fail outstanding work. Leaves the
    /// adapter stopped.
    fn shutdown(self: &Arc<Self>) {
        self.lifecycle.store(STOPPING, Ordering::SeqCst);

        self.scanning.store(false, Ordering::SeqCst);
        if self.config.client
            && let Err(e) = self.platform.stop_scan()
        {
            debug!("Stop scan refused: {}", e);
        }
        if self.advertising.swap(false, Ordering::SeqCst)
            && let Err(e) = self.platform.stop_advertise()
        {
            debug!("Stop advertise refused: {}", e);
        }

        debug!("Failing {} active sessions", self.active_sessions());
        self.abort_sessions(FailureReason::AdapterStopped);
        self.fail_in_flight(&FailureReason::AdapterStopped);

        for peer in self.client_peers.snapshot() {
            if let Err(e) = self.platform.disconnect(peer) {
                debug!("Disconnect of {} refused: {}", peer, e);
            }
        }
        self.drop_links();
        self.discovery.wake_all();
        self.platform.clear_event_handler();

        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            let discarded = pool.shutdown();
            if discarded > 0 {
                debug!("Discarded {} queued tasks", discarded);
            }
        }
        self.lifecycle.store(STOPPED, Ordering::SeqCst);
    }

    // ==================== Platform callbacks ====================

    fn on_peer_discovered(&self, peer: DiscoveredPeer) {
        if !self.is_started() {
            return;
        }
        let address = peer.address;
        self.registry.upsert(address, |s| {
            if peer.name.is_some() {
                s.name.clone_from(&peer.name);
            }
            if peer.rssi.is_some() {
                s.rssi = peer.rssi;
            }
            s.transport = peer.transport;
            if matches!(
                s.stage,
                ConnectionStage::Unknown | ConnectionStage::Disconnected
            ) {
                s.stage = ConnectionStage::Discovered;
            }
        });
        if self.client_peers.contains(address) || self.sessions.lock().contains_key(&address) {
            return;
        }
        let event = TransportEvent::PeerDiscovered {
            address,
            name: peer.name.clone(),
            rssi: peer.rssi,
            transport: peer.transport,
        };
        if self.discovery.insert(peer) {
            debug!("Discovered {}", address);
            self.events.send(event);
        }
    }

    fn on_services_changed(&self, peer: PeerAddress) {
        info!("Services of {} changed, dropping capability cache", peer);
        self.registry.update(peer, DeviceState::invalidate_capabilities);
    }

    fn on_bond_revoked(self: &Arc<Self>, peer: PeerAddress) {
        info!("Bond with {} revoked, forgetting it", peer);
        self.forget(peer);
    }

    /// Drop the link and every record of `peer`. Returns `true` if a
    /// record existed.
    fn forget(self: &Arc<Self>, peer: PeerAddress) -> bool {
        self.drop_client_link(peer, FailureReason::Disconnected);
        self.discovery.remove(peer);
        self.registry.remove(peer).is_some()
    }

    fn on_adapter_state_changed(self: &Arc<Self>, enabled: bool) {
        info!("Bluetooth adapter {}", if enabled { "enabled" } else { "disabled" });
        self.events
            .send(TransportEvent::AdapterStateChanged { enabled });
        if !self.is_started() {
            return;
        }
        if enabled {
            self.resume_scan();
            self.restart_advertising();
        } else {
            self.scanning.store(false, Ordering::SeqCst);
            self.advertising.store(false, Ordering::SeqCst);
            self.abort_sessions(FailureReason::AdapterDisabled);
            self.fail_in_flight(&FailureReason::AdapterDisabled);
            self.drop_links();
        }
    }
}

/// Receives platform callbacks and forwards them into the adapter.
///
/// Holds a weak reference, so callbacks after the adapter is dropped are
/// ignored.
pub(crate) struct EventBridge {
    ctx: Weak<AdapterContext>,
}

impl EventBridge {
    fn with(&self, f: impl FnOnce(&Arc<AdapterContext>)) {
        if let Some(ctx) = self.ctx.upgrade() {
            f(&ctx);
        }
    }
}

impl PlatformEvents for EventBridge {
    fn on_peer_discovered(&self, peer: DiscoveredPeer) {
        self.with(|ctx| ctx.on_peer_discovered(peer));
    }

    fn on_connection_state_changed(&self, peer: PeerAddress, event: LinkEvent) {
        self.with(|ctx| ctx.on_link_event(peer, event));
    }

    fn on_capabilities_discovered(&self, peer: PeerAddress, result: PlatformResult<Capabilities>) {
        self.with(|ctx| ctx.on_capabilities(peer, result));
    }

    fn on_notification_armed(&self, peer: PeerAddress, result: PlatformResult<()>) {
        self.with(|ctx| ctx.on_armed(peer, result));
    }

    fn on_write_result(&self, peer: PeerAddress, result: PlatformResult<()>) {
        self.with(|ctx| ctx.on_write_result(peer, result));
    }

    fn on_notify_sent(&self, peer: PeerAddress, result: PlatformResult<()>) {
        self.with(|ctx| ctx.on_notify_sent(peer, result));
    }

    fn on_peer_connected(&self, peer: PeerAddress, transport: TransportKind) {
        self.with(|ctx| ctx.on_server_peer_connected(peer, transport));
    }

    fn on_peer_disconnected(&self, peer: PeerAddress) {
        self.with(|ctx| ctx.on_server_peer_disconnected(peer));
    }

    fn on_data_received(&self, peer: PeerAddress, role: Role, data: Bytes) {
        self.with(|ctx| ctx.on_data_received(peer, role, data));
    }

    fn on_services_changed(&self, peer: PeerAddress) {
        self.with(|ctx| ctx.on_services_changed(peer));
    }

    fn on_bond_revoked(&self, peer: PeerAddress) {
        self.with(|ctx| ctx.on_bond_revoked(peer));
    }

    fn on_adapter_state_changed(&self, enabled: bool) {
        self.with(|ctx| ctx.on_adapter_state_changed(enabled));
    }
}

/// Datagram transport between two Bluetooth devices.
///
/// Sends block the calling thread until every target resolved. Callbacks
/// from the platform may arrive on any thread, including synchronously
/// from inside a request.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use btlink_core::{AdapterConfig, MockPlatform, TransportAdapter};
/// use btlink_types::PeerAddress;
///
/// let peer: PeerAddress = "AA:BB:CC:DD:EE:01".parse().unwrap();
/// let platform = Arc::new(MockPlatform::new());
/// platform.add_peer(peer);
///
/// let adapter = TransportAdapter::new(AdapterConfig::for_tests(), platform.clone()).unwrap();
/// adapter.start().unwrap();
/// let report = adapter.send_unicast(peer, "hello").unwrap();
/// assert!(report.is_success());
/// assert!(adapter.is_scanning());
/// adapter.stop();
/// ```
pub struct TransportAdapter {
    inner: Arc<AdapterContext>,
}

impl fmt::Debug for TransportAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportAdapter")
            .field("started", &self.is_started())
            .field("scanning", &self.is_scanning())
            .field("client_peers", &self.inner.client_peers.len())
            .field("server_peers", &self.inner.server_peers.len())
            .finish()
    }
}

impl TransportAdapter {
    /// Create an adapter over `platform`. Nothing happens until [`start`](Self::start).
    pub fn new(config: AdapterConfig, platform: Arc<dyn BluetoothPlatform>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(AdapterContext::new(config, platform)),
        })
    }

    /// Create an adapter with the default configuration.
    pub fn with_defaults(platform: Arc<dyn BluetoothPlatform>) -> Result<Self> {
        Self::new(AdapterConfig::default(), platform)
    }

    /// The configuration in use.
    pub fn config(&self) -> &AdapterConfig {
        &self.inner.config
    }

    /// Start the configured roles.
    ///
    /// Fails with [`Error::Unsupported`] before touching the platform if
    /// it cannot provide a configured role or transport.
    pub fn start(&self) -> Result<()> {
        self.inner.start()
    }

    /// Stop scanning and advertising, drop every link and fail every
    /// outstanding send with [`FailureReason::AdapterStopped`].
    ///
    /// Does nothing if the adapter is not running.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Whether the adapter is running.
    pub fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    /// Whether the client role is scanning.
    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    /// Whether the server role is advertising.
    pub fn is_advertising(&self) -> bool {
        self.inner.advertising.load(Ordering::SeqCst)
    }

    /// Send one datagram to `address` and wait for the outcome.
    pub fn send_unicast(&self, address: PeerAddress, payload: impl Into<Bytes>) -> Result<SendReport> {
        self.inner.send_unicast(address, payload.into(), None)
    }

    /// Like [`send_unicast`](Self::send_unicast), giving up when `cancel` fires.
    pub fn send_unicast_cancellable(
        &self,
        address: PeerAddress,
        payload: impl Into<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<SendReport> {
        self.inner.send_unicast(address, payload.into(), Some(cancel))
    }

    /// Send one datagram to every known peer and wait for all outcomes.
    pub fn send_multicast(&self, payload: impl Into<Bytes>) -> Result<SendReport> {
        self.inner.send_multicast(payload.into(), None)
    }

    /// Like [`send_multicast`](Self::send_multicast), giving up when `cancel` fires.
    pub fn send_multicast_cancellable(
        &self,
        payload: impl Into<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<SendReport> {
        self.inner.send_multicast(payload.into(), Some(cancel))
    }

    /// Notify one datagram to a client connected to the local server.
    pub fn notify_one(&self, address: PeerAddress, payload: impl Into<Bytes>) -> Result<SendReport> {
        self.inner.notify_one(address, payload.into())
    }

    /// Notify one datagram to every connected client.
    pub fn notify_all(&self, payload: impl Into<Bytes>) -> Result<SendReport> {
        self.inner.notify_all(payload.into())
    }

    /// Install the callback for terminal send failures.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&SendFailure) + Send + Sync + 'static,
    {
        *self.inner.error_handler.write() = Some(Arc::new(handler));
    }

    /// Remove the error callback.
    pub fn clear_error_handler(&self) {
        *self.inner.error_handler.write() = None;
    }

    /// Install the callback for inbound datagrams.
    ///
    /// It runs on a task pool worker, never on a platform thread.
    pub fn set_receive_handler<F>(&self, handler: F)
    where
        F: Fn(PeerAddress, Role, Bytes) + Send + Sync + 'static,
    {
        *self.inner.receive_handler.write() = Some(Arc::new(handler));
    }

    /// Remove the receive callback.
    pub fn clear_receive_handler(&self) {
        *self.inner.receive_handler.write() = None;
    }

    /// Subscribe to adapter events.
    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    /// The record for `address`, if the peer was ever seen.
    pub fn device_state(&self, address: PeerAddress) -> Option<DeviceState> {
        self.inner.registry.get(address)
    }

    /// Every known peer record, ordered by address.
    pub fn devices(&self) -> Vec<DeviceState> {
        self.inner.registry.snapshot()
    }

    /// Peers found by scanning that have no link yet, in discovery order.
    pub fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        self.inner.discovery.snapshot()
    }

    /// Peers with a live link in `role`, in connection order.
    pub fn connected_peers(&self, role: Role) -> Vec<PeerAddress> {
        match role {
            Role::Client => self.inner.client_peers.snapshot(),
            Role::Server => self.inner.server_peers.snapshot(),
        }
    }

    /// Disconnect `address` and drop everything known about it. Returns
    /// `true` if a record existed.
    pub fn forget_peer(&self, address: PeerAddress) -> bool {
        self.inner.forget(address)
    }
}

impl Drop for TransportAdapter {
    fn drop(&mut self) {
        self.inner.stop();
    }
}
