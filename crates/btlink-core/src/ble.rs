//! Client-role backend on top of btleplug.
//!
//! btleplug is async and central-only, so this backend owns a tokio
//! runtime and answers every request from a task on it. The server role
//! and RFCOMM are reported as unsupported, which makes
//! [`TransportAdapter::start`](crate::TransportAdapter::start) refuse a
//! configuration that needs them.
//!
//! Peers are keyed by their Bluetooth address. On macOS CoreBluetooth
//! hides addresses, so peers are not reported there.

use std::collections::HashMap;
use std::sync::Arc;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use btlink_types::uuids::{GATT_SERVICE, REQUEST_CHARACTERISTIC, RESPONSE_CHARACTERISTIC};
use btlink_types::{Capabilities, DiscoveredPeer, PeerAddress, Role, TransportKind};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, PlatformError, PlatformResult, Result};
use crate::platform::PlatformCapabilities;
use crate::traits::{BluetoothPlatform, LinkEvent, PlatformEvents};

type SharedHandler = Arc<RwLock<Option<Arc<dyn PlatformEvents>>>>;

fn rejected(err: btleplug::Error) -> PlatformError {
    PlatformError::Rejected(err.to_string())
}

/// btleplug-backed [`BluetoothPlatform`] for the client role.
pub struct BtleplugPlatform {
    runtime: Runtime,
    adapter: Adapter,
    handler: SharedHandler,
    peripherals: Arc<Mutex<HashMap<PeerAddress, Peripheral>>>,
    ids: Arc<Mutex<HashMap<PeripheralId, PeerAddress>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    notify_tasks: Mutex<HashMap<PeerAddress, JoinHandle<()>>>,
}

impl std::fmt::Debug for BtleplugPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugPlatform")
            .field("peripherals", &self.peripherals.lock().len())
            .finish()
    }
}

impl BtleplugPlatform {
    /// Open the first Bluetooth adapter of the host.
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("btlink-btleplug")
            .enable_all()
            .build()?;
        let adapter = runtime.block_on(async {
            let manager = Manager::new().await?;
            let adapters = manager.adapters().await?;
            adapters
                .into_iter()
                .next()
                .ok_or_else(|| Error::Bluetooth("no Bluetooth adapter found".into()))
        })?;
        info!("Using Bluetooth adapter");
        Ok(Self {
            runtime,
            adapter,
            handler: Arc::new(RwLock::new(None)),
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            ids: Arc::new(Mutex::new(HashMap::new())),
            event_task: Mutex::new(None),
            notify_tasks: Mutex::new(HashMap::new()),
        })
    }

    fn peripheral(&self, peer: PeerAddress) -> PlatformResult<Peripheral> {
        self.peripherals
            .lock()
            .get(&peer)
            .cloned()
            .ok_or(PlatformError::UnknownPeer(peer))
    }

    /// Run `f` against the current handler from a runtime task.
    fn answer<F>(&self, fut: F)
    where
        F: std::future::Future<Output = Option<Box<dyn FnOnce(&dyn PlatformEvents) + Send>>>
            + Send
            + 'static,
    {
        let handler = Arc::clone(&self.handler);
        self.runtime.spawn(async move {
            if let Some(deliver) = fut.await {
                let current = handler.read().clone();
                if let Some(h) = current {
                    deliver(h.as_ref());
                }
            }
        });
    }

    fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
    }
}

async fn describe(adapter: &Adapter, id: &PeripheralId) -> Option<(Peripheral, DiscoveredPeer)> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    if !properties.services.contains(&GATT_SERVICE) {
        return None;
    }
    let address = match PeerAddress::try_from(properties.address.into_inner()) {
        Ok(address) => address,
        Err(e) => {
            debug!("Skipping peripheral without usable address: {}", e);
            return None;
        }
    };
    let mut peer = DiscoveredPeer::new(address);
    peer.name = properties.local_name;
    peer.rssi = properties.rssi;
    Some((peripheral, peer))
}

impl BluetoothPlatform for BtleplugPlatform {
    fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities::central_only()
    }

    fn set_event_handler(&self, handler: Arc<dyn PlatformEvents>) {
        *self.handler.write() = Some(handler);

        let adapter = self.adapter.clone();
        let shared = Arc::clone(&self.handler);
        let peripherals = Arc::clone(&self.peripherals);
        let ids = Arc::clone(&self.ids);
        let task = self.runtime.spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Could not subscribe to adapter events: {}", e);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        let Some((peripheral, peer)) = describe(&adapter, &id).await else {
                            continue;
                        };
                        peripherals.lock().insert(peer.address, peripheral);
                        ids.lock().insert(id, peer.address);
                        let current = shared.read().clone();
                        if let Some(h) = current {
                            h.on_peer_discovered(peer);
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let address = ids.lock().get(&id).copied();
                        let current = shared.read().clone();
                        if let (Some(address), Some(h)) = (address, current) {
                            h.on_connection_state_changed(address, LinkEvent::Disconnected);
                        }
                    }
                    _ => {}
                }
            }
            debug!("Adapter event stream ended");
        });
        if let Some(old) = self.event_task.lock().replace(task) {
            old.abort();
        }
    }

    fn clear_event_handler(&self) {
        *self.handler.write() = None;
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
        for (_, task) in self.notify_tasks.lock().drain() {
            task.abort();
        }
    }

    fn start_scan(&self) -> PlatformResult<()> {
        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            let filter = ScanFilter {
                services: vec![GATT_SERVICE],
            };
            if let Err(e) = adapter.start_scan(filter).await {
                warn!("Failed to start scan: {}", e);
            }
        });
        Ok(())
    }

    fn stop_scan(&self) -> PlatformResult<()> {
        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!("Failed to stop scan: {}", e);
            }
        });
        Ok(())
    }

    fn connect(
        &self,
        peer: PeerAddress,
        transport: TransportKind,
        _auto_connect: bool,
    ) -> PlatformResult<()> {
        if transport != TransportKind::Gatt {
            return Err(PlatformError::Unsupported("RFCOMM"));
        }
        let peripheral = self.peripheral(peer)?;
        self.answer(async move {
            let event = match peripheral.connect().await {
                Ok(()) => LinkEvent::Connected,
                Err(e) => LinkEvent::ConnectFailed(rejected(e)),
            };
            Some(Box::new(move |h: &dyn PlatformEvents| {
                h.on_connection_state_changed(peer, event)
            }) as Box<dyn FnOnce(&dyn PlatformEvents) + Send>)
        });
        Ok(())
    }

    fn disconnect(&self, peer: PeerAddress) -> PlatformResult<()> {
        let peripheral = self.peripheral(peer)?;
        if let Some(task) = self.notify_tasks.lock().remove(&peer) {
            task.abort();
        }
        self.runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect of {} failed: {}", peer, e);
            }
        });
        Ok(())
    }

    fn close(&self, peer: PeerAddress) -> PlatformResult<()> {
        if let Some(task) = self.notify_tasks.lock().remove(&peer) {
            task.abort();
        }
        Ok(())
    }

    fn discover_capabilities(&self, peer: PeerAddress) -> PlatformResult<()> {
        let peripheral = self.peripheral(peer)?;
        self.answer(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => {
                    let chars = peripheral.characteristics();
                    let write = chars
                        .iter()
                        .find(|c| c.service_uuid == GATT_SERVICE && c.uuid == REQUEST_CHARACTERISTIC);
                    let notify = chars
                        .iter()
                        .find(|c| c.service_uuid == GATT_SERVICE && c.uuid == RESPONSE_CHARACTERISTIC);
                    match write {
                        Some(w) => Ok(Capabilities {
                            service: GATT_SERVICE,
                            write_characteristic: w.uuid,
                            notify_characteristic: notify.map(|n| n.uuid),
                        }),
                        None => Err(PlatformError::Rejected(
                            "transport service not found".into(),
                        )),
                    }
                }
                Err(e) => Err(rejected(e)),
            };
            Some(Box::new(move |h: &dyn PlatformEvents| {
                h.on_capabilities_discovered(peer, result)
            }) as Box<dyn FnOnce(&dyn PlatformEvents) + Send>)
        });
        Ok(())
    }

    fn arm_notification(&self, peer: PeerAddress, characteristic: Uuid) -> PlatformResult<()> {
        let peripheral = self.peripheral(peer)?;
        let Some(target) = Self::characteristic(&peripheral, characteristic) else {
            return Err(PlatformError::Rejected(format!(
                "characteristic {} not found",
                characteristic
            )));
        };

        let handler = Arc::clone(&self.handler);
        let reader = peripheral.clone();
        let stream_task = self.runtime.spawn(async move {
            let mut stream = match reader.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("No notification stream for {}: {}", peer, e);
                    return;
                }
            };
            while let Some(notification) = stream.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                let current = handler.read().clone();
                if let Some(h) = current {
                    h.on_data_received(peer, Role::Client, Bytes::from(notification.value));
                }
            }
        });
        if let Some(old) = self.notify_tasks.lock().insert(peer, stream_task) {
            old.abort();
        }

        self.answer(async move {
            let result = peripheral.subscribe(&target).await.map_err(rejected);
            Some(Box::new(move |h: &dyn PlatformEvents| {
                h.on_notification_armed(peer, result)
            }) as Box<dyn FnOnce(&dyn PlatformEvents) + Send>)
        });
        Ok(())
    }

    fn write(&self, peer: PeerAddress, characteristic: Uuid, payload: Bytes) -> PlatformResult<()> {
        let peripheral = self.peripheral(peer)?;
        let Some(target) = Self::characteristic(&peripheral, characteristic) else {
            return Err(PlatformError::Rejected(format!(
                "characteristic {} not found",
                characteristic
            )));
        };
        self.answer(async move {
            let result = peripheral
                .write(&target, &payload, WriteType::WithResponse)
                .await
                .map_err(rejected);
            Some(Box::new(move |h: &dyn PlatformEvents| h.on_write_result(peer, result))
                as Box<dyn FnOnce(&dyn PlatformEvents) + Send>)
        });
        Ok(())
    }

    fn start_advertise(&self, _service: Uuid) -> PlatformResult<()> {
        Err(PlatformError::Unsupported("advertising"))
    }

    fn stop_advertise(&self) -> PlatformResult<()> {
        Ok(())
    }

    fn notify(&self, _peer: PeerAddress, _payload: Bytes) -> PlatformResult<()> {
        Err(PlatformError::Unsupported("notify"))
    }
}
