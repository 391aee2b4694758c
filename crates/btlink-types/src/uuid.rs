//! Service and characteristic identifiers used by the transport.
//!
//! Both the Low-Energy GATT layout and the Classic RFCOMM service record
//! are fixed, so every peer running the transport exposes the same
//! identifiers.

use uuid::{Uuid, uuid};

// --- GATT service ---

/// Primary GATT service carrying transport datagrams.
pub const GATT_SERVICE: Uuid = uuid!("ade3d529-c784-4f63-a987-eb69f70ee816");

/// Characteristic the client writes requests to.
pub const REQUEST_CHARACTERISTIC: Uuid = uuid!("ad7b334f-4637-4b86-90b6-9d787f03d218");

/// Characteristic the server notifies responses on.
pub const RESPONSE_CHARACTERISTIC: Uuid = uuid!("e9241982-4580-42c4-8831-95048216b256");

/// Client Characteristic Configuration Descriptor, written to arm notifications.
pub const CLIENT_CONFIG_DESCRIPTOR: Uuid = uuid!("00002902-0000-1000-8000-00805f9b34fb");

// --- RFCOMM service ---

/// Service record identifier for the Classic RFCOMM transport.
pub const RFCOMM_SERVICE: Uuid = uuid!("12341234-1c25-481f-9dfb-59193d238280");
