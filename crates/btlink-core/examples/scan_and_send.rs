//! Example: Scan and Send Over a Real Adapter
//!
//! This example drives the host Bluetooth stack through btleplug. It
//! waits for a peer advertising the btlink service and writes one
//! datagram to it.
//!
//! Run with: `cargo run --example scan_and_send --features btleplug -- AA:BB:CC:DD:EE:FF`

use std::sync::Arc;
use std::time::Duration;

use btlink_core::{AdapterConfig, BtleplugPlatform, PeerAddress, TransportAdapter};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let Some(target) = std::env::args().nth(1) else {
        eprintln!("usage: scan_and_send <peer address> [message]");
        std::process::exit(2);
    };
    let target: PeerAddress = target.parse()?;
    let message = std::env::args()
        .nth(2)
        .unwrap_or_else(|| "hello from btlink".to_string());

    let platform = Arc::new(BtleplugPlatform::new()?);
    let config = AdapterConfig::default()
        .discovery_wait(Duration::from_secs(3))
        .mtu(180);
    let adapter = TransportAdapter::new(config, platform)?;
    adapter.set_error_handler(|failure| {
        eprintln!("Send failed: {}", failure.reason);
    });

    println!("Scanning for {}...", target);
    adapter.start()?;

    match adapter.send_unicast(target, message.into_bytes()) {
        Ok(_) => println!("Delivered."),
        Err(e) => {
            println!("Not delivered: {}", e);
            println!();
            println!("Make sure:");
            println!("  - The peer is advertising the btlink service");
            println!("  - Bluetooth is enabled on this computer");
            println!("  - The peer is within range");
        }
    }

    adapter.stop();
    Ok(())
}
