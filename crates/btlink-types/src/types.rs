//! Core types describing peers and their connection state.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::PeerAddress;

/// Where a peer is in the connection lifecycle.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new stages
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum ConnectionStage {
    /// Known address, no further information.
    #[default]
    Unknown,
    /// Seen by a discovery scan.
    Discovered,
    /// A connection request is outstanding.
    Connecting,
    /// Link established, no capabilities known for this link yet.
    Connected,
    /// Capability discovery completed.
    CapabilitiesReady,
    /// Notifications armed on the response characteristic.
    NotificationArmed,
    /// Link closed or never established.
    Disconnected,
}

impl ConnectionStage {
    /// Whether a live link exists in this stage.
    #[must_use]
    pub fn is_linked(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::CapabilitiesReady | Self::NotificationArmed
        )
    }

    /// Whether a write can be issued without discovering capabilities first.
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, Self::CapabilitiesReady | Self::NotificationArmed)
    }
}

impl fmt::Display for ConnectionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Discovered => "discovered",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::CapabilitiesReady => "capabilities ready",
            Self::NotificationArmed => "notification armed",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Outcome of the most recent send to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SendOutcome {
    /// No send has completed since the outcome was last reset.
    #[default]
    None,
    /// The platform acknowledged every fragment.
    Success,
    /// The send failed.
    Failed,
}

impl SendOutcome {
    /// Whether this is a terminal outcome.
    #[must_use]
    pub fn is_resolved(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Physical transport used to reach a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TransportKind {
    /// Bluetooth Low Energy, GATT characteristics.
    #[default]
    Gatt,
    /// Bluetooth Classic, RFCOMM stream socket.
    Rfcomm,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gatt => write!(f, "GATT"),
            Self::Rfcomm => write!(f, "RFCOMM"),
        }
    }
}

/// Which side of a link the local adapter plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Role {
    /// Initiating side: scans, connects and writes.
    Client,
    /// Accepting side: advertises and notifies.
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// Service layout reported by capability discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Capabilities {
    /// Service the transport characteristics belong to.
    pub service: Uuid,
    /// Characteristic that accepts writes.
    pub write_characteristic: Uuid,
    /// Characteristic that can notify, if the peer exposes one.
    pub notify_characteristic: Option<Uuid>,
}

impl Capabilities {
    /// The standard GATT layout with a notifiable response characteristic.
    #[must_use]
    pub fn gatt() -> Self {
        Self {
            service: crate::uuid::GATT_SERVICE,
            write_characteristic: crate::uuid::REQUEST_CHARACTERISTIC,
            notify_characteristic: Some(crate::uuid::RESPONSE_CHARACTERISTIC),
        }
    }

    /// The RFCOMM layout. Streams have no notification characteristic.
    #[must_use]
    pub fn rfcomm() -> Self {
        Self {
            service: crate::uuid::RFCOMM_SERVICE,
            write_characteristic: crate::uuid::RFCOMM_SERVICE,
            notify_characteristic: None,
        }
    }

    /// Same layout without a notification characteristic.
    #[must_use]
    pub fn without_notifications(mut self) -> Self {
        self.notify_characteristic = None;
        self
    }
}

/// A peer found by scanning that has not been connected yet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DiscoveredPeer {
    /// Hardware address.
    pub address: PeerAddress,
    /// Advertised name, if any.
    pub name: Option<String>,
    /// Signal strength at discovery time.
    pub rssi: Option<i16>,
    /// Transport the peer was seen on.
    pub transport: TransportKind,
}

impl DiscoveredPeer {
    /// A GATT peer with no name or signal strength.
    pub fn new(address: PeerAddress) -> Self {
        Self {
            address,
            name: None,
            rssi: None,
            transport: TransportKind::Gatt,
        }
    }

    /// Set the advertised name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the signal strength.
    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Set the transport.
    #[must_use]
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }
}

/// Everything the adapter remembers about a peer.
///
/// Records outlive individual links: a disconnect moves the stage to
/// [`ConnectionStage::Disconnected`] but keeps the capability cache.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceState {
    /// Hardware address.
    pub address: PeerAddress,
    /// Current lifecycle stage.
    pub stage: ConnectionStage,
    /// Outcome of the most recent send.
    ///
    /// `Success` is only ever recorded on a linked stage. `Failed` is
    /// recorded whatever the stage, so a send that failed before or while
    /// connecting leaves `Failed` next to `Discovered` or `Disconnected`.
    pub last_send_outcome: SendOutcome,
    /// Transport the peer is reached on.
    pub transport: TransportKind,
    /// Notifications were armed on a previous link.
    pub notification_armed: bool,
    /// Cached service layout from the last capability discovery.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub capabilities: Option<Capabilities>,
    /// Advertised name.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub name: Option<String>,
    /// Last seen signal strength.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub rssi: Option<i16>,
}

impl DeviceState {
    /// A fresh record in [`ConnectionStage::Unknown`].
    pub fn new(address: PeerAddress) -> Self {
        Self {
            address,
            stage: ConnectionStage::Unknown,
            last_send_outcome: SendOutcome::None,
            transport: TransportKind::Gatt,
            notification_armed: false,
            capabilities: None,
            name: None,
            rssi: None,
        }
    }

    /// Drop the cached capability layout so the next link rediscovers it.
    pub fn invalidate_capabilities(&mut self) {
        self.notification_armed = false;
        self.capabilities = None;
        if self.stage.is_writable() {
            self.stage = ConnectionStage::Connected;
        }
    }
}
