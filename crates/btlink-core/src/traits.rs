//! Trait abstractions for the host Bluetooth stack.
//!
//! [`BluetoothPlatform`] is what the core calls. Every request returns
//! immediately: `Err` means the platform refused it synchronously, `Ok`
//! means exactly one matching result callback on [`PlatformEvents`] will
//! follow, unless a disconnect for the same peer supersedes it.
//!
//! Callbacks may arrive on any thread, including synchronously from inside
//! the request that caused them. Callbacks for one peer arrive in the order
//! the platform produced them.

use std::sync::Arc;

use btlink_types::{Capabilities, DiscoveredPeer, PeerAddress, Role, TransportKind};
use bytes::Bytes;
use uuid::Uuid;

use crate::error::{PlatformError, PlatformResult};
use crate::platform::PlatformCapabilities;

/// Requests the core issues to the host Bluetooth stack.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use btlink_core::{AdapterConfig, MockPlatform, TransportAdapter};
///
/// let platform = Arc::new(MockPlatform::new());
/// let adapter = TransportAdapter::new(AdapterConfig::default(), platform)?;
/// adapter.start()?;
/// ```
pub trait BluetoothPlatform: Send + Sync {
    /// What this backend supports.
    fn capabilities(&self) -> PlatformCapabilities;

    /// Install the receiver of all callbacks.
    fn set_event_handler(&self, handler: Arc<dyn PlatformEvents>);

    /// Remove the callback receiver.
    fn clear_event_handler(&self);

    // ==================== Client role ====================

    /// Start reporting nearby peers through [`PlatformEvents::on_peer_discovered`].
    fn start_scan(&self) -> PlatformResult<()>;

    /// Stop scanning.
    fn stop_scan(&self) -> PlatformResult<()>;

    /// Open a link. Completes with [`PlatformEvents::on_connection_state_changed`].
    fn connect(
        &self,
        peer: PeerAddress,
        transport: TransportKind,
        auto_connect: bool,
    ) -> PlatformResult<()>;

    /// Close a link. Completes with [`LinkEvent::Disconnected`].
    fn disconnect(&self, peer: PeerAddress) -> PlatformResult<()>;

    /// Release the native handle held for a peer.
    fn close(&self, peer: PeerAddress) -> PlatformResult<()>;

    /// Enumerate services. Completes with [`PlatformEvents::on_capabilities_discovered`].
    fn discover_capabilities(&self, peer: PeerAddress) -> PlatformResult<()>;

    /// Enable notifications. Completes with [`PlatformEvents::on_notification_armed`].
    fn arm_notification(&self, peer: PeerAddress, characteristic: Uuid) -> PlatformResult<()>;

    /// Write one fragment. Completes with [`PlatformEvents::on_write_result`].
    fn write(&self, peer: PeerAddress, characteristic: Uuid, payload: Bytes)
    -> PlatformResult<()>;

    // ==================== Server role ====================

    /// Start advertising the transport service.
    fn start_advertise(&self, service: Uuid) -> PlatformResult<()>;

    /// Stop advertising.
    fn stop_advertise(&self) -> PlatformResult<()>;

    /// Start accepting incoming stream connections.
    ///
    /// Backends without stream sockets can keep the default.
    fn accept_incoming(&self) -> PlatformResult<()> {
        Err(PlatformError::Unsupported("accept_incoming"))
    }

    /// Notify one fragment to a connected client. Completes with
    /// [`PlatformEvents::on_notify_sent`].
    fn notify(&self, peer: PeerAddress, payload: Bytes) -> PlatformResult<()>;
}

/// Result of a connection request, or a change on an existing link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link is up.
    Connected,
    /// The connection attempt failed.
    ConnectFailed(PlatformError),
    /// The link went down.
    Disconnected,
}

/// Callbacks from the host Bluetooth stack into the core.
pub trait PlatformEvents: Send + Sync {
    /// A scan reported a peer.
    fn on_peer_discovered(&self, peer: DiscoveredPeer);

    /// Client-role link state changed.
    fn on_connection_state_changed(&self, peer: PeerAddress, event: LinkEvent);

    /// Capability discovery finished.
    fn on_capabilities_discovered(&self, peer: PeerAddress, result: PlatformResult<Capabilities>);

    /// Notification arming finished.
    fn on_notification_armed(&self, peer: PeerAddress, result: PlatformResult<()>);

    /// A fragment write finished.
    fn on_write_result(&self, peer: PeerAddress, result: PlatformResult<()>);

    /// A server notification finished.
    fn on_notify_sent(&self, peer: PeerAddress, result: PlatformResult<()>);

    /// A client connected to the local server.
    fn on_peer_connected(&self, peer: PeerAddress, transport: TransportKind);

    /// A client disconnected from the local server.
    fn on_peer_disconnected(&self, peer: PeerAddress);

    /// A fragment arrived, written by a client (`Role::Server`) or
    /// notified by a server (`Role::Client`).
    fn on_data_received(&self, peer: PeerAddress, role: Role, data: Bytes);

    /// The peer changed its service layout.
    fn on_services_changed(&self, peer: PeerAddress);

    /// The bond with the peer was removed.
    fn on_bond_revoked(&self, peer: PeerAddress);

    /// The local radio was switched on or off.
    fn on_adapter_state_changed(&self, enabled: bool);
}
