//! Platform capability reporting.
//!
//! Every backend describes what it can do with [`PlatformCapabilities`].
//! [`crate::TransportAdapter::start`] compares that against the
//! configuration and refuses to start, without touching the platform,
//! when a configured role or transport is missing.
//!
//! | Backend | Client | Server | GATT | RFCOMM |
//! |---------|--------|--------|------|--------|
//! | `MockPlatform` | yes | yes | yes | yes |
//! | `BtleplugPlatform` | yes | no | yes | no |

use btlink_types::TransportKind;
use serde::{Deserialize, Serialize};

use crate::config::AdapterConfig;

/// What a backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCapabilities {
    /// Scanning, connecting and writing.
    pub client: bool,
    /// Advertising, accepting and notifying.
    pub server: bool,
    /// Low-Energy GATT links.
    pub gatt: bool,
    /// Classic RFCOMM links.
    pub rfcomm: bool,
}

impl PlatformCapabilities {
    /// Everything supported.
    pub const fn full() -> Self {
        Self {
            client: true,
            server: true,
            gatt: true,
            rfcomm: true,
        }
    }

    /// A Low-Energy central with no peripheral role.
    pub const fn central_only() -> Self {
        Self {
            client: true,
            server: false,
            gatt: true,
            rfcomm: false,
        }
    }

    /// Whether the transport is available.
    #[must_use]
    pub fn supports(&self, transport: TransportKind) -> bool {
        match transport {
            TransportKind::Gatt => self.gatt,
            TransportKind::Rfcomm => self.rfcomm,
        }
    }

    /// Check that every role and transport in `config` is available.
    pub fn check(&self, config: &AdapterConfig) -> Result<(), CapabilityError> {
        if config.client && !self.client {
            return Err(CapabilityError::ClientRole);
        }
        if config.server && !self.server {
            return Err(CapabilityError::ServerRole);
        }
        if let Some(t) = config.transports.iter().find(|t| !self.supports(**t)) {
            return Err(CapabilityError::Transport(*t));
        }
        Ok(())
    }
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self::full()
    }
}

/// A configured feature the platform cannot provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CapabilityError {
    /// The initiating role is unavailable.
    ClientRole,
    /// The accepting role is unavailable.
    ServerRole,
    /// The transport is unavailable.
    Transport(TransportKind),
}

impl std::fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientRole => write!(f, "client role not supported by platform"),
            Self::ServerRole => write!(f, "server role not supported by platform"),
            Self::Transport(t) => write!(f, "{} transport not supported by platform", t),
        }
    }
}
