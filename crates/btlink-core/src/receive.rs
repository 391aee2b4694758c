//! Inbound fragments and datagram delivery.

use std::sync::Arc;

use btlink_types::{PeerAddress, Role};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::adapter::AdapterContext;
use crate::events::TransportEvent;

impl AdapterContext {
    /// Feed one fragment into the reassembler and deliver a completed
    /// datagram to the receive handler on the task pool.
    pub(crate) fn on_data_received(self: &Arc<Self>, peer: PeerAddress, role: Role, data: Bytes) {
        if !self.is_started() {
            return;
        }
        let pushed = self.inbound.lock().push((peer, role), &data);
        let datagram = match pushed {
            Ok(Some(datagram)) => datagram,
            Ok(None) => return,
            Err(e) => {
                warn!("Dropping malformed fragment from {}: {}", peer, e);
                return;
            }
        };

        debug!("Received {} byte datagram from {}", datagram.len(), peer);
        self.events.send(TransportEvent::DatagramReceived {
            address: peer,
            role,
            len: datagram.len(),
        });

        let Some(handler) = self.receive_handler.read().clone() else {
            return;
        };
        let Some(pool) = self.pool() else {
            return;
        };
        if let Err(e) = pool.submit(move || handler(peer, role, datagram)) {
            warn!("Could not deliver datagram from {}: {}", peer, e);
        }
    }
}
