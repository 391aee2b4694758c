//! Transport event system.
//!
//! Observers subscribe to a broadcast channel of [`TransportEvent`]s
//! covering discovery, link changes, per-peer send outcomes and received
//! datagrams. Sending never blocks, and events are dropped when nobody
//! is subscribed.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use btlink_types::{PeerAddress, Role, SendOutcome, TransportKind};

/// Events emitted by the transport adapter.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum TransportEvent {
    /// The adapter started.
    Started { client: bool, server: bool },
    /// The adapter stopped.
    Stopped,
    /// A peer entered the discovery list.
    PeerDiscovered {
        address: PeerAddress,
        name: Option<String>,
        rssi: Option<i16>,
        transport: TransportKind,
    },
    /// A link came up.
    PeerConnected { address: PeerAddress, role: Role },
    /// A link went down.
    PeerDisconnected { address: PeerAddress, role: Role },
    /// One target of a send or notify resolved.
    SendOutcome {
        address: PeerAddress,
        outcome: SendOutcome,
        reason: Option<String>,
    },
    /// A complete datagram was reassembled.
    DatagramReceived {
        address: PeerAddress,
        role: Role,
        len: usize,
    },
    /// The local radio was switched on or off.
    AdapterStateChanged { enabled: bool },
}

/// Sender for transport events.
pub type EventSender = broadcast::Sender<TransportEvent>;

/// Receiver for transport events.
pub type EventReceiver = broadcast::Receiver<TransportEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: TransportEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}
