//! Start, stop and radio state handling.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use btlink_core::{
    AdapterConfig, CapabilityError, Error, FailureReason, Fault, MockOp, MockPlatform,
    PlatformCapabilities, Role, SendOutcome, TransportAdapter, TransportEvent, TransportKind,
};
use btlink_types::fragment::fragment_count;

use common::{Failures, adapter_with, addr, drain, init_tracing};

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn test_start_and_stop() {
    init_tracing();
    let platform = Arc::new(MockPlatform::new());
    platform.add_peer(addr(1));
    let adapter = adapter_with(&platform, AdapterConfig::for_tests().server(true));
    let mut rx = adapter.subscribe();

    adapter.start().unwrap();
    assert!(adapter.is_started());
    assert!(adapter.is_scanning());
    assert!(adapter.is_advertising());
    assert!(platform.has_handler());
    assert_eq!(adapter.discovered_peers().len(), 1);

    adapter.stop();
    assert!(!adapter.is_started());
    assert!(!adapter.is_scanning());
    assert!(!adapter.is_advertising());
    assert!(!platform.is_scanning());
    assert!(!platform.is_advertising());
    assert!(!platform.has_handler());
    assert!(adapter.discovered_peers().is_empty());

    let events = drain(&mut rx);
    assert!(events.contains(&TransportEvent::Started {
        client: true,
        server: true,
    }));
    assert_eq!(events.last(), Some(&TransportEvent::Stopped));
}

#[test]
fn test_start_twice() {
    let platform = Arc::new(MockPlatform::new());
    let adapter = adapter_with(&platform, AdapterConfig::for_tests());
    adapter.start().unwrap();
    assert!(matches!(adapter.start(), Err(Error::AlreadyStarted)));
    assert!(adapter.is_started());
}

#[test]
fn test_stop_is_idempotent() {
    let platform = Arc::new(MockPlatform::new());
    let adapter = adapter_with(&platform, AdapterConfig::for_tests());
    adapter.stop();
    adapter.start().unwrap();
    adapter.stop();
    adapter.stop();
    assert!(!adapter.is_started());
}

#[test]
fn test_restart_after_stop() {
    let p1 = addr(1);
    let platform = Arc::new(MockPlatform::new());
    platform.add_peer(p1);
    let adapter = adapter_with(&platform, AdapterConfig::for_tests());

    adapter.start().unwrap();
    adapter.send_unicast(p1, "one").unwrap();
    adapter.stop();
    assert!(!platform.is_linked(p1));
    assert!(adapter.connected_peers(Role::Client).is_empty());

    adapter.start().unwrap();
    adapter.send_unicast(p1, "two").unwrap();
    assert_eq!(platform.connect_count(p1), 2);
}

#[test]
fn test_send_before_start() {
    let platform = Arc::new(MockPlatform::new());
    platform.add_peer(addr(1));
    let adapter = adapter_with(&platform, AdapterConfig::for_tests());

    assert!(matches!(
        adapter.send_unicast(addr(1), "x"),
        Err(Error::NotStarted)
    ));
    assert!(matches!(adapter.send_multicast("x"), Err(Error::NotStarted)));
    assert!(platform.calls().is_empty());
}

#[test]
fn test_unsupported_role_is_refused() {
    let platform = Arc::new(MockPlatform::new().with_capabilities(PlatformCapabilities::central_only()));
    let adapter = adapter_with(&platform, AdapterConfig::for_tests().server(true));

    assert!(matches!(
        adapter.start(),
        Err(Error::Unsupported(CapabilityError::ServerRole))
    ));
    assert!(!adapter.is_started());
    assert!(!platform.has_handler());
    assert!(platform.calls().is_empty());
}

#[test]
fn test_unsupported_transport_is_refused() {
    let platform = Arc::new(MockPlatform::new().with_capabilities(PlatformCapabilities::central_only()));
    let adapter = adapter_with(
        &platform,
        AdapterConfig::for_tests().transports(vec![TransportKind::Rfcomm]),
    );

    assert!(matches!(
        adapter.start(),
        Err(Error::Unsupported(CapabilityError::Transport(
            TransportKind::Rfcomm
        )))
    ));
    assert!(platform.calls().is_empty());
}

#[test]
fn test_invalid_config_is_rejected() {
    let platform = Arc::new(MockPlatform::new());
    let result = TransportAdapter::new(AdapterConfig::for_tests().mtu(2), platform);
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_adapter_from_toml() {
    let config = AdapterConfig::from_toml_str(
        r#"
            client = true
            server = false
            mtu = 64
            discovery_wait_ms = 30
            discovery_retries = 2
            wait_slice_ms = 5
        "#,
    )
    .unwrap();
    assert_eq!(config.mtu, 64);
    assert_eq!(config.discovery_budget(), Duration::from_millis(60));

    let platform = Arc::new(MockPlatform::new());
    platform.add_peer(addr(1));
    let adapter = adapter_with(&platform, config);
    adapter.start().unwrap();
    adapter.send_unicast(addr(1), vec![1u8; 100]).unwrap();
    assert_eq!(platform.writes_to(addr(1)).len(), fragment_count(100, 64));
}

#[test]
fn test_stop_fails_inflight_send() {
    let p1 = addr(1);
    let platform = Arc::new(MockPlatform::threaded());
    platform.add_peer(p1);
    platform.inject(p1, MockOp::Write, Fault::Hang);
    let adapter = Arc::new(adapter_with(
        &platform,
        AdapterConfig::for_tests().operation_timeout(None),
    ));
    adapter.start().unwrap();
    let failures = Failures::install(&adapter);

    let sender = {
        let adapter = Arc::clone(&adapter);
        thread::spawn(move || adapter.send_unicast(p1, "never acknowledged"))
    };
    assert!(wait_for(|| !platform.writes_to(p1).is_empty()));
    adapter.stop();

    let err = sender.join().unwrap().unwrap_err();
    assert_eq!(err.failure_reason(), Some(&FailureReason::AdapterStopped));
    assert_eq!(failures.len(), 1);
    assert!(!adapter.is_started());
    assert!(adapter.connected_peers(Role::Client).is_empty());
}

#[test]
fn test_power_loss_fails_inflight_send() {
    let p1 = addr(1);
    let platform = Arc::new(MockPlatform::threaded());
    platform.add_peer(p1);
    platform.inject(p1, MockOp::Write, Fault::Hang);
    let adapter = Arc::new(adapter_with(
        &platform,
        AdapterConfig::for_tests().operation_timeout(None),
    ));
    adapter.start().unwrap();
    let mut rx = adapter.subscribe();

    let sender = {
        let adapter = Arc::clone(&adapter);
        thread::spawn(move || adapter.send_unicast(p1, "data"))
    };
    assert!(wait_for(|| !platform.writes_to(p1).is_empty()));
    platform.set_powered(false);

    let err = sender.join().unwrap().unwrap_err();
    assert_eq!(err.failure_reason(), Some(&FailureReason::AdapterDisabled));
    assert!(adapter.connected_peers(Role::Client).is_empty());
    assert!(adapter.is_started());

    platform.clear_faults(p1);
    platform.set_powered(true);
    assert!(wait_for(|| adapter.discovered_peers().iter().any(|p| p.address == p1)));
    adapter.send_unicast(p1, "after power on").unwrap();
    assert_eq!(
        adapter.device_state(p1).unwrap().last_send_outcome,
        SendOutcome::Success
    );

    let events = drain(&mut rx);
    assert!(events.contains(&TransportEvent::AdapterStateChanged { enabled: false }));
    assert!(events.contains(&TransportEvent::AdapterStateChanged { enabled: true }));
}

#[test]
fn test_drop_stops_adapter() {
    let platform = Arc::new(MockPlatform::new());
    {
        let adapter = adapter_with(&platform, AdapterConfig::for_tests());
        adapter.start().unwrap();
        assert!(platform.has_handler());
    }
    assert!(!platform.has_handler());
    assert!(!platform.is_scanning());
}

#[test]
fn test_forget_peer() {
    let p1 = addr(1);
    let platform = Arc::new(MockPlatform::new());
    platform.add_peer(p1);
    let adapter = adapter_with(&platform, AdapterConfig::for_tests());
    adapter.start().unwrap();
    adapter.send_unicast(p1, "x").unwrap();

    assert_eq!(adapter.devices().len(), 1);
    assert!(adapter.forget_peer(p1));
    assert!(!adapter.forget_peer(p1));
    assert!(adapter.device_state(p1).is_none());
}
