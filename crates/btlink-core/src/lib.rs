//! Bluetooth datagram transport adapter.
//!
//! This crate moves opaque datagrams between devices over GATT or RFCOMM.
//! It owns discovery, connection setup, capability discovery and
//! notification arming, and turns its asynchronous platform callbacks
//! into blocking sends with a per-peer outcome.
//!
//! # Features
//!
//! - **Blocking unicast**: wait for the peer to be discovered, connect,
//!   discover its capabilities and write, then return the outcome
//! - **Multicast**: send to every known peer with bounded fan-out
//! - **Server role**: track connected clients and notify them
//! - **Fragmentation**: datagrams up to 64 KiB over links with a small MTU
//! - **Capability cache**: armed peers skip rediscovery on reconnect
//! - **Cancellation and retries**: `CancellationToken` aware sends with
//!   exponential backoff for transient failures
//! - **Events**: a broadcast channel of [`TransportEvent`]s
//!
//! # Architecture
//!
//! ```text
//! caller ──send──► coordinator ──job──► session driver ──request──► BluetoothPlatform
//!   ▲                  │                      ▲                            │
//!   └──── wake ◄── PendingSend ◄── outcome ───┴──────── callbacks ◄────────┘
//! ```
//!
//! The host stack is abstracted by [`BluetoothPlatform`]. [`MockPlatform`]
//! scripts it for tests, and the `btleplug` feature adds a client-role
//! backend for desktop systems.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use btlink_core::{AdapterConfig, MockPlatform, TransportAdapter};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let peer = "AA:BB:CC:DD:EE:01".parse()?;
//! let platform = Arc::new(MockPlatform::new());
//! platform.add_peer(peer);
//!
//! let adapter = TransportAdapter::new(AdapterConfig::for_tests(), platform)?;
//! adapter.set_error_handler(|failure| {
//!     eprintln!("{} bytes to {:?} failed: {}", failure.length(), failure.address, failure.reason);
//! });
//! adapter.start()?;
//!
//! let report = adapter.send_unicast(peer, "ping")?;
//! assert_eq!(report.succeeded(), 1);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod connected;
pub mod discovery;
pub mod error;
pub mod events;
pub mod mock;
pub mod pending;
pub mod platform;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod traits;

mod coordinator;
mod receive;
mod server;
mod session;

#[cfg(feature = "btleplug")]
pub mod ble;

pub use adapter::{ErrorHandler, ReceiveHandler, SendFailure, TransportAdapter};
pub use config::{AdapterConfig, ConfigError, ValidationError};
pub use error::{Error, FailureReason, PlatformError, PlatformResult, Result};
pub use events::{EventDispatcher, EventReceiver, EventSender, TransportEvent};
pub use mock::{Fault, MockOp, MockPeer, MockPlatform, PlatformCall};
pub use pending::{PendingSend, SendMode, SendReport, TargetReport};
pub use platform::{CapabilityError, PlatformCapabilities};
pub use pool::TaskPool;
pub use retry::RetryConfig;
pub use traits::{BluetoothPlatform, LinkEvent, PlatformEvents};

#[cfg(feature = "btleplug")]
pub use ble::BtleplugPlatform;

// Re-export from btlink-types
pub use btlink_types::uuids;
pub use btlink_types::{
    Capabilities, ConnectionStage, DeviceState, DiscoveredPeer, PeerAddress, Role, SendOutcome,
    TransportKind,
};
pub use tokio_util::sync::CancellationToken;
