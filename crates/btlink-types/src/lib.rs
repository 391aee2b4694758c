//! Platform-agnostic types for the btlink Bluetooth datagram transport.
//!
//! This crate holds the data shared by the transport core and any
//! platform backend: peer addresses, connection stages, service
//! identifiers and the fragmentation codec used to carry datagrams over
//! a small link MTU.
//!
//! # Features
//!
//! - [`PeerAddress`] parsing and formatting
//! - Connection lifecycle and per-peer state records
//! - GATT and RFCOMM service identifiers
//! - Datagram fragmentation and reassembly
//!
//! # Example
//!
//! ```
//! use btlink_types::{PeerAddress, fragment};
//!
//! let peer: PeerAddress = "AA:BB:CC:DD:EE:01".parse().unwrap();
//! let frags = fragment::fragment(b"hello over bluetooth", 20).unwrap();
//! assert_eq!(frags.len(), 2);
//! # let _ = peer;
//! ```

pub mod address;
pub mod error;
pub mod fragment;
pub mod types;
pub mod uuid;

pub use address::PeerAddress;
pub use error::{ParseError, ParseResult};
pub use fragment::Reassembler;
pub use types::{
    Capabilities, ConnectionStage, DeviceState, DiscoveredPeer, Role, SendOutcome, TransportKind,
};
pub use uuid as uuids;
