//! Shared fixtures for the scripted-platform tests.

#![allow(dead_code)]

use std::sync::Arc;

use btlink_core::{
    AdapterConfig, EventReceiver, MockPlatform, PeerAddress, SendFailure, SendOutcome,
    TransportAdapter, TransportEvent,
};
use parking_lot::Mutex;

pub fn addr(last: u8) -> PeerAddress {
    PeerAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last]).unwrap()
}

/// Adapter over a mock with the test config, not yet started.
pub fn adapter_with(platform: &Arc<MockPlatform>, config: AdapterConfig) -> TransportAdapter {
    TransportAdapter::new(config, Arc::clone(platform) as Arc<dyn btlink_core::BluetoothPlatform>)
        .unwrap()
}

/// Collects every error callback.
#[derive(Clone, Default)]
pub struct Failures(Arc<Mutex<Vec<SendFailure>>>);

impl Failures {
    pub fn install(adapter: &TransportAdapter) -> Self {
        let failures = Self::default();
        let sink = Arc::clone(&failures.0);
        adapter.set_error_handler(move |failure| sink.lock().push(failure.clone()));
        failures
    }

    pub fn all(&self) -> Vec<SendFailure> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// Drain whatever is queued on an event receiver.
pub fn drain(rx: &mut EventReceiver) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Send outcome events, in the order they fired.
pub fn outcomes(events: &[TransportEvent]) -> Vec<(PeerAddress, SendOutcome)> {
    events
        .iter()
        .filter_map(|e| match e {
            TransportEvent::SendOutcome {
                address, outcome, ..
            } => Some((*address, *outcome)),
            _ => None,
        })
        .collect()
}

/// Install a tracing subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
