//! Example: Loopback Against the Scripted Platform
//!
//! This example runs the transport adapter over `MockPlatform`, so it
//! needs no Bluetooth hardware. It sends a unicast, a multicast with one
//! failing peer, and shows the events and error callbacks they produce.
//!
//! Run with: `RUST_LOG=btlink_core=debug cargo run --example loopback`

use std::sync::Arc;

use btlink_core::{
    AdapterConfig, Fault, MockOp, MockPeer, MockPlatform, PeerAddress, PlatformError,
    TransportAdapter, TransportEvent,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let peers: Vec<PeerAddress> = ["AA:BB:CC:DD:EE:01", "AA:BB:CC:DD:EE:02", "AA:BB:CC:DD:EE:03"]
        .iter()
        .map(|s| s.parse())
        .collect::<Result<_, _>>()?;

    let platform = Arc::new(MockPlatform::new());
    for (i, peer) in peers.iter().enumerate() {
        platform.add_mock_peer(MockPeer::new(*peer).name(&format!("node-{}", i + 1)).rssi(-60));
    }
    platform.inject(peers[2], MockOp::Write, Fault::Fail(PlatformError::Status(8)));

    let adapter = TransportAdapter::new(AdapterConfig::fast().mtu(20), platform.clone())?;
    let mut events = adapter.subscribe();
    adapter.set_error_handler(|failure| {
        println!(
            "  ! {} bytes to {} failed: {}",
            failure.length(),
            failure
                .address
                .map_or_else(|| "<nobody>".to_string(), |a| a.to_string()),
            failure.reason
        );
    });

    adapter.start()?;
    println!("Discovered {} peers", adapter.discovered_peers().len());

    println!();
    println!("Unicast to {}:", peers[0]);
    let report = adapter.send_unicast(peers[0], "hello over a scripted link")?;
    println!(
        "  delivered in {} fragments",
        platform.writes_to(peers[0]).len()
    );
    println!("  outcome: {:?}", report.target(peers[0]).map(|t| t.outcome));

    println!();
    println!("Multicast to everyone:");
    match adapter.send_multicast(vec![0x42; 64]) {
        Ok(report) => println!("  all {} peers acknowledged", report.target_count),
        Err(e) => {
            if let Some(report) = e.report() {
                println!(
                    "  {}/{} peers acknowledged ({})",
                    report.succeeded(),
                    report.target_count,
                    e
                );
            }
        }
    }

    println!();
    println!("Device registry:");
    for state in adapter.devices() {
        println!(
            "  {} {:?} last send {:?} (armed: {})",
            state.address, state.stage, state.last_send_outcome, state.notification_armed
        );
    }

    adapter.stop();

    println!();
    println!("Events:");
    while let Ok(event) = events.try_recv() {
        match event {
            TransportEvent::SendOutcome {
                address, outcome, ..
            } => println!("  send to {} -> {:?}", address, outcome),
            other => println!("  {}", serde_json::to_string(&other)?),
        }
    }

    Ok(())
}
