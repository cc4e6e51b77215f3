//! Connection engine behaviour observed through the mocks
//!
//! Each test drives a real [`ConnectionEngine`] (or a whole [`Service`]) over
//! the in-memory platform doubles and checks what the kill-switch, the tunnel
//! factory and the event stream saw.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use warden_engine::connection::netchange::RoutingChange;
use warden_engine::connection::tunnel::TunnelExit;
use warden_engine::mock::TestBed;
use warden_engine::platform::WifiState;
use warden_engine::{ConnectionEngine, ConnectionInfo, DaemonEvent, Service};
use warden_proto::types::{WiFiActions, WiFiNetwork, WiFiParams};
use warden_proto::{DisconnectReason, VpnState};

const WAIT: Duration = Duration::from_secs(10);

fn start(bed: &TestBed) -> (Arc<ConnectionEngine>, broadcast::Sender<()>) {
    let engine = ConnectionEngine::new(bed.connection_deps());
    let (stop, stop_rx) = broadcast::channel(1);
    engine.start(stop_rx);
    (engine, stop)
}

async fn next_connected(rx: &mut broadcast::Receiver<DaemonEvent>) -> ConnectionInfo {
    timeout(WAIT, async {
        loop {
            match rx.recv().await.unwrap() {
                DaemonEvent::Connected(info) => return info,
                DaemonEvent::Disconnected { description, .. } => panic!("disconnected: {}", description),
                _ => {}
            }
        }
    })
    .await
    .expect("no Connected event")
}

async fn next_disconnected(rx: &mut broadcast::Receiver<DaemonEvent>) -> (bool, DisconnectReason) {
    timeout(WAIT, async {
        loop {
            if let DaemonEvent::Disconnected { failure, reason, .. } = rx.recv().await.unwrap() {
                return (failure, reason);
            }
        }
    })
    .await
    .expect("no Disconnected event")
}

/// Events up to and including the `count`-th `AttemptFinished`
async fn until_attempts_finished(rx: &mut broadcast::Receiver<DaemonEvent>, count: usize) -> Vec<DaemonEvent> {
    timeout(WAIT, async {
        let mut seen = Vec::new();
        let mut finished = 0;
        while finished < count {
            let event = rx.recv().await.unwrap();
            if matches!(event, DaemonEvent::AttemptFinished) {
                finished += 1;
            }
            seen.push(event);
        }
        seen
    })
    .await
    .expect("attempts did not finish")
}

fn disconnected_count(events: &[DaemonEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, DaemonEvent::Disconnected { .. }))
        .count()
}

// ============================================================================
// Kill-switch hooks
// ============================================================================

#[tokio::test]
async fn test_firewall_learns_endpoints_before_connected() {
    let dir = tempfile::tempdir().unwrap();
    let bed = TestBed::new(dir.path()).logged_in();
    bed.firewall.set_enabled(true).await.unwrap();
    let mut rx = bed.events.subscribe();
    let (engine, _stop) = start(&bed);

    engine.connect(bed.connect_params(), false).unwrap();
    let info = next_connected(&mut rx).await;

    let hook = bed.firewall_backend.connected().expect("client_connected not called");
    assert_eq!(hook.client_ip, info.client_ip);
    assert_eq!(hook.server_ip, info.server_ip);
    assert_eq!(hook.server_port, info.server_port);
    assert_eq!(info.client_ip, Some("10.0.0.2".parse().unwrap()));
    assert!(bed.firewall_backend.calls().contains(&"client_connected".to_string()));

    engine.disconnect().await.unwrap();
    assert!(bed.firewall_backend.connected().is_none());
    // enabled by the user before the attempt
    assert!(bed.firewall_backend.is_on());
}

#[tokio::test]
async fn test_failed_attempt_disables_firewall_enabled_for_it() {
    let dir = tempfile::tempdir().unwrap();
    let bed = TestBed::new(dir.path()).logged_in();
    bed.tunnels.exit_at_start(Some(TunnelExit::Error("handshake".into())));
    let mut rx = bed.events.subscribe();
    let (engine, _stop) = start(&bed);

    let mut params = bed.connect_params();
    params.firewall_on = false;
    params.firewall_on_during_connection = true;
    engine.connect(params, false).unwrap();

    let (failure, reason) = next_disconnected(&mut rx).await;
    assert!(failure);
    assert_eq!(reason, DisconnectReason::Unknown);
    assert!(bed.firewall_backend.calls().contains(&"set_enabled:true".to_string()));
    assert!(!bed.firewall_backend.is_on());
}

#[tokio::test]
async fn test_failed_attempt_keeps_firewall_enabled_before_connection() {
    let dir = tempfile::tempdir().unwrap();
    let bed = TestBed::new(dir.path()).logged_in();
    bed.tunnels.exit_at_start(Some(TunnelExit::Error("handshake".into())));
    let mut rx = bed.events.subscribe();
    let (engine, _stop) = start(&bed);

    let mut params = bed.connect_params();
    params.firewall_on = true;
    params.firewall_on_during_connection = true;
    engine.connect(params, false).unwrap();

    let (failure, _) = next_disconnected(&mut rx).await;
    assert!(failure);
    assert!(bed.firewall_backend.is_on());
}

#[tokio::test]
async fn test_failed_attempt_leaves_user_firewall_alone() {
    let dir = tempfile::tempdir().unwrap();
    let bed = TestBed::new(dir.path()).logged_in();
    bed.firewall.set_enabled(true).await.unwrap();
    bed.tunnels.exit_at_start(Some(TunnelExit::Error("handshake".into())));
    let mut rx = bed.events.subscribe();
    let (engine, _stop) = start(&bed);

    let mut params = bed.connect_params();
    params.firewall_on = false;
    params.firewall_on_during_connection = true;
    engine.connect(params, false).unwrap();

    next_disconnected(&mut rx).await;
    assert!(bed.firewall_backend.is_on());
}

#[tokio::test]
async fn test_authentication_failure_reported() {
    let dir = tempfile::tempdir().unwrap();
    let bed = TestBed::new(dir.path()).logged_in();
    bed.tunnels.exit_at_start(Some(TunnelExit::AuthenticationFailure));
    let mut rx = bed.events.subscribe();
    let (engine, _stop) = start(&bed);

    engine.connect(bed.connect_params(), false).unwrap();
    let (failure, reason) = next_disconnected(&mut rx).await;
    assert!(failure);
    assert_eq!(reason, DisconnectReason::AuthenticationError);
}

// ============================================================================
// Request queue
// ============================================================================

#[tokio::test]
async fn test_superseded_attempt_reports_no_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let bed = TestBed::new(dir.path()).logged_in();
    bed.tunnels.set_connect_delay(Duration::from_millis(300));
    let mut rx = bed.events.subscribe();
    let (engine, _stop) = start(&bed);

    engine.connect(bed.connect_params(), false).unwrap();
    // let the first attempt reach the tunnel before replacing it
    timeout(WAIT, async {
        while bed.tunnels.created() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    engine.connect(bed.connect_params(), false).unwrap();
    // fails on any Disconnected from the replaced attempt
    next_connected(&mut rx).await;
    assert_eq!(bed.tunnels.created(), 2);

    engine.disconnect().await.unwrap();
    let events = until_attempts_finished(&mut rx, 1).await;
    assert_eq!(disconnected_count(&events), 1);
    assert!(events.iter().any(|e| matches!(
        e,
        DaemonEvent::Disconnected {
            reason: DisconnectReason::DisconnectRequested,
            failure: false,
            ..
        }
    )));
}

#[tokio::test]
async fn test_one_disconnect_per_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let bed = TestBed::new(dir.path()).logged_in();
    let mut rx = bed.events.subscribe();
    let (engine, _stop) = start(&bed);

    for _ in 0..3 {
        engine.connect(bed.connect_params(), false).unwrap();
        next_connected(&mut rx).await;
        engine.disconnect().await.unwrap();
        let events = until_attempts_finished(&mut rx, 1).await;
        assert_eq!(disconnected_count(&events), 1);
    }
}

#[tokio::test]
async fn test_empty_entry_hosts_rejected_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let bed = TestBed::new(dir.path()).logged_in();
    let (engine, _stop) = start(&bed);

    let mut params = bed.connect_params();
    params.w_tunnel.entry_vpn_server.hosts.clear();
    assert!(engine.connect(params, false).is_err());
    assert!(bed.firewall_backend.calls().is_empty());
    assert_eq!(bed.tunnels.created(), 0);
    assert!(!engine.is_active());
}

#[tokio::test]
async fn test_concurrent_connect_and_disconnect_settle() {
    let dir = tempfile::tempdir().unwrap();
    let bed = TestBed::new(dir.path()).logged_in();
    bed.tunnels.set_connect_delay(Duration::from_millis(20));
    let (engine, _stop) = start(&bed);

    let mut tasks = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        let params = bed.connect_params();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                let _ = engine.connect(params, false);
            } else {
                let _ = engine.disconnect().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let state = timeout(WAIT, async {
        loop {
            let state = engine.status().state;
            let idle = state == VpnState::Disconnected && !engine.is_active();
            if idle || state == VpnState::Connected {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("engine did not settle");
    assert_ne!(state, VpnState::Connecting);

    engine.disconnect().await.unwrap();
    assert_eq!(engine.status().state, VpnState::Disconnected);
}

// ============================================================================
// Reconnects
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_routing_change_reconnects_silently() {
    let dir = tempfile::tempdir().unwrap();
    let bed = TestBed::new(dir.path()).logged_in();
    let mut rx = bed.events.subscribe();
    let (engine, _stop) = start(&bed);

    engine.connect(bed.connect_params(), false).unwrap();
    next_connected(&mut rx).await;
    assert!(bed.routes.is_running());

    assert!(bed.routes.trigger(RoutingChange::Changed).await);

    let mut reconnecting = false;
    let info = timeout(WAIT, async {
        loop {
            match rx.recv().await.unwrap() {
                DaemonEvent::VpnStateChanged {
                    state: VpnState::Reconnecting,
                    ..
                } => reconnecting = true,
                DaemonEvent::Connected(info) => return info,
                DaemonEvent::Disconnected { .. } => panic!("reconnect must not report Disconnected"),
                _ => {}
            }
        }
    })
    .await
    .expect("not reconnected");
    assert!(reconnecting);
    assert!(!info.is_paused());
    assert_eq!(bed.tunnels.created(), 2);

    engine.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_required_skips_delay() {
    let dir = tempfile::tempdir().unwrap();
    let bed = TestBed::new(dir.path()).logged_in();
    let mut rx = bed.events.subscribe();
    let (engine, _stop) = start(&bed);

    engine.connect(bed.connect_params(), false).unwrap();
    next_connected(&mut rx).await;

    let started = tokio::time::Instant::now();
    bed.tunnels.last().unwrap().exit(TunnelExit::ReconnectRequired);
    next_connected(&mut rx).await;
    assert!(started.elapsed() < Duration::from_secs(1));

    engine.disconnect().await.unwrap();
}

// ============================================================================
// Whole service
// ============================================================================

#[tokio::test]
async fn test_daemon_start_on_untrusted_wifi_connects() {
    let dir = tempfile::tempdir().unwrap();
    let bed = TestBed::new(dir.path()).logged_in();
    let params = bed.connect_params();
    bed.prefs
        .update(|p| {
            p.last_connection_params = params.clone();
            p.wifi_control = WiFiParams {
                can_apply_in_background: true,
                trusted_networks_control: true,
                networks: vec![WiFiNetwork {
                    ssid: "OpenCafe".into(),
                    is_trusted: false,
                }],
                actions: WiFiActions {
                    un_trusted_connect_vpn: true,
                    un_trusted_block_lan: true,
                    ..Default::default()
                },
                ..Default::default()
            };
        })
        .unwrap();
    bed.wifi.set(WifiState {
        ssid: "OpenCafe".into(),
        is_insecure: true,
    });

    let service = Service::new(bed.components(dir.path()));
    let mut rx = bed.events.subscribe();
    service.init().await.unwrap();
    let _tasks = service.start().await;

    let info = next_connected(&mut rx).await;
    assert_eq!(info.client_ip, Some("10.0.0.2".parse().unwrap()));
    assert!(bed.firewall_backend.is_on());
    assert!(!bed.prefs.get().is_fw_allow_lan);
    assert!(bed.prefs.get().last_connection_params.firewall_on);

    service.shutdown().await;
    assert!(!service.engine.is_active());
    assert!(!bed.firewall_backend.is_on());
}
