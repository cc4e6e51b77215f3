//! Daemon events and event handlers
//!
//! Components report what happened through an [`EventHandler`]. The control
//! protocol subscribes to a [`ChannelEventHandler`] and turns events into
//! broadcasts; the service subscribes to the same stream for follow-up work
//! such as session checks after a connection attempt.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use warden_proto::{DisconnectReason, DnsSettings, VpnState, VpnType};

/// Details of an established tunnel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionInfo {
    pub vpn_type: VpnType,
    /// Unix seconds when the tunnel came up
    pub connected_since: i64,
    pub client_ip: Option<IpAddr>,
    pub client_ipv6: Option<IpAddr>,
    pub client_port: u16,
    /// Address clients should see, even when a transport proxy is in front
    pub server_ip: Option<IpAddr>,
    pub server_port: u16,
    pub exit_hostname: String,
    pub manual_dns: DnsSettings,
    pub is_tcp: bool,
    pub mtu: u32,
    pub is_can_pause: bool,
    pub paused_till: Option<DateTime<Utc>>,
}

impl ConnectionInfo {
    pub fn is_paused(&self) -> bool {
        self.paused_till.is_some()
    }
}

/// Events emitted by daemon components
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    /// Intermediate tunnel state
    VpnStateChanged { state: VpnState, info: String },

    /// Tunnel is up (also re-sent on pause/resume)
    Connected(ConnectionInfo),

    /// Attempt fully cleaned up
    Disconnected {
        failure: bool,
        reason: DisconnectReason,
        description: String,
    },

    /// A connection attempt finished, successfully or not
    AttemptFinished,

    FirewallChanged,
    SplitTunnelChanged,
    DnsChanged(DnsSettings),

    /// Server catalog was refreshed
    ServersUpdated,

    /// Session, account or tunnel keys changed
    SessionChanged,

    /// Daemon-level preferences changed
    SettingsChanged,

    /// Ping sweep results (host, milliseconds)
    PingResults(Vec<(String, u32)>),

    WifiChanged { ssid: String, is_insecure: bool },

    /// Error worth showing to a user
    Error { message: String, recoverable: bool },
}

/// Event handler trait for receiving daemon events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a daemon event
    async fn on_event(&self, event: DaemonEvent);
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: DaemonEvent) {
        log_event(&event);
    }
}

fn log_event(event: &DaemonEvent) {
    match event {
        DaemonEvent::VpnStateChanged { state, info } => {
            if info.is_empty() {
                log::info!("VPN state: {}", state);
            } else {
                log::info!("VPN state: {} ({})", state, info);
            }
        }
        DaemonEvent::Connected(info) => {
            let client = info
                .client_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default();
            let server = info
                .server_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default();
            if info.is_paused() {
                log::info!("Connected (paused): client={}, server={}", client, server);
            } else {
                log::info!(
                    "Connected: {} client={}, server={}:{}",
                    info.vpn_type,
                    client,
                    server,
                    info.server_port
                );
            }
        }
        DaemonEvent::Disconnected {
            failure,
            reason,
            description,
        } => {
            if *failure {
                log::warn!("Disconnected ({:?}): {}", reason, description);
            } else {
                log::info!("Disconnected ({:?})", reason);
            }
        }
        DaemonEvent::AttemptFinished => log::debug!("Connection attempt finished"),
        DaemonEvent::FirewallChanged => log::debug!("Firewall state changed"),
        DaemonEvent::SplitTunnelChanged => log::debug!("Split tunnel state changed"),
        DaemonEvent::DnsChanged(dns) => log::info!("DNS changed: {}", dns.info_string()),
        DaemonEvent::ServersUpdated => log::debug!("Server catalog updated"),
        DaemonEvent::SessionChanged => log::debug!("Session info changed"),
        DaemonEvent::SettingsChanged => log::debug!("Settings changed"),
        DaemonEvent::PingResults(results) => {
            log::debug!("Ping results: {} hosts", results.len())
        }
        DaemonEvent::WifiChanged { ssid, is_insecure } => {
            log::info!("Wi-Fi changed: '{}' (insecure: {})", ssid, is_insecure);
        }
        DaemonEvent::Error {
            message,
            recoverable,
        } => {
            if *recoverable {
                log::warn!("Recoverable error: {}", message);
            } else {
                log::error!("Error: {}", message);
            }
        }
    }
}

/// Forwards events to a broadcast channel (and logs them)
#[derive(Clone)]
pub struct ChannelEventHandler {
    tx: broadcast::Sender<DaemonEvent>,
}

impl ChannelEventHandler {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.tx.subscribe()
    }
}

#[async_trait::async_trait]
impl EventHandler for ChannelEventHandler {
    async fn on_event(&self, event: DaemonEvent) {
        log_event(&event);
        // no subscribers is fine (e.g. during cleanup runs)
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_handler_preserves_order() {
        let handler = ChannelEventHandler::new(16);
        let mut rx = handler.subscribe();

        handler
            .on_event(DaemonEvent::VpnStateChanged {
                state: VpnState::Connecting,
                info: String::new(),
            })
            .await;
        handler
            .on_event(DaemonEvent::Connected(ConnectionInfo::default()))
            .await;
        handler
            .on_event(DaemonEvent::Disconnected {
                failure: false,
                reason: DisconnectReason::DisconnectRequested,
                description: String::new(),
            })
            .await;

        assert!(matches!(
            rx.recv().await.unwrap(),
            DaemonEvent::VpnStateChanged {
                state: VpnState::Connecting,
                ..
            }
        ));
        assert!(matches!(rx.recv().await.unwrap(), DaemonEvent::Connected(_)));
        assert!(matches!(
            rx.recv().await.unwrap(),
            DaemonEvent::Disconnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_send_without_subscribers() {
        let handler = ChannelEventHandler::new(4);
        handler.on_event(DaemonEvent::FirewallChanged).await;
    }

    #[test]
    fn test_paused_info() {
        let mut info = ConnectionInfo::default();
        assert!(!info.is_paused());
        info.paused_till = Some(Utc::now());
        assert!(info.is_paused());
    }
}
