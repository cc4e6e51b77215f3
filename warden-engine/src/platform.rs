//! Platform adapters
//!
//! Everything the daemon asks of the operating system goes through one of the
//! traits below: packet filter, DNS configurator, split-tunnel backend, Wi-Fi
//! discovery and installed-application enumeration. [`PlatformHelper`]
//! implements all of them by running the configured platform helper as
//! `<helper> <area> <operation>` with a JSON argument on stdin.

use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use warden_proto::response::{AppInfo, DnsAbilities, SplitTunnelApp};
use warden_proto::types::UserPreferences;
use warden_proto::DnsSettings;

use crate::error::Result;
use crate::helper;

/// Tunnel endpoints passed to the packet filter once the tunnel is up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConnectedInfo {
    pub client_ip: Option<IpAddr>,
    pub client_ipv6: Option<IpAddr>,
    pub client_port: u16,
    pub server_ip: Option<IpAddr>,
    pub server_port: u16,
    pub is_tcp: bool,
}

/// Packet-filter backend
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    async fn set_enabled(&self, enable: bool) -> Result<()>;
    async fn is_enabled(&self) -> Result<bool>;
    async fn set_persistent(&self, persistent: bool) -> Result<()>;
    async fn allow_lan(&self, allow_lan: bool, allow_multicast: bool) -> Result<()>;
    async fn set_user_exceptions(&self, exceptions: &[IpNet]) -> Result<()>;
    async fn add_hosts_exception(&self, ips: &[IpAddr], icmp_only: bool, persistent: bool) -> Result<()>;
    async fn remove_hosts_exception(&self, ips: &[IpAddr], icmp_only: bool, persistent: bool) -> Result<()>;
    async fn client_connected(&self, info: &ClientConnectedInfo) -> Result<()>;
    async fn client_disconnected(&self) -> Result<()>;
    async fn client_paused(&self) -> Result<()>;
    async fn client_resumed(&self) -> Result<()>;
    /// DNS server that must stay reachable through the filter
    async fn on_change_dns(&self, dns: Option<IpAddr>) -> Result<()>;
}

/// OS DNS configurator
#[async_trait]
pub trait DnsBackend: Send + Sync {
    /// Point the system at `dns`; `local_ip` is the tunnel-side address
    async fn set_manual(&self, dns: &DnsSettings, local_ip: Option<IpAddr>) -> Result<()>;
    /// Restore the original system configuration
    async fn reset(&self) -> Result<()>;
    async fn pause(&self) -> Result<()>;
    async fn resume(&self, dns: &DnsSettings) -> Result<()>;
    async fn apply_user_settings(&self, prefs: &UserPreferences) -> Result<()>;
    /// True when the system configuration no longer matches `expected`
    async fn is_wrong(&self, expected: &DnsSettings) -> Result<bool>;
    async fn capabilities(&self) -> DnsAbilities;
    async fn predefined_configs(&self) -> Result<Vec<DnsSettings>>;
}

/// Addresses the split tunnel routes between
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitTunnelAddresses {
    pub tunnel_ipv4: Option<IpAddr>,
    pub tunnel_ipv6: Option<IpAddr>,
    pub outbound_ipv4: Option<IpAddr>,
    pub outbound_ipv6: Option<IpAddr>,
}

impl SplitTunnelAddresses {
    /// At least one family has both the tunnel and the outbound address
    pub fn is_complete(&self) -> bool {
        (self.tunnel_ipv4.is_some() && self.outbound_ipv4.is_some())
            || (self.tunnel_ipv6.is_some() && self.outbound_ipv6.is_some())
    }
}

/// Full split-tunnel configuration handed to the backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitTunnelConfig {
    pub enabled: bool,
    pub inversed: bool,
    pub any_dns: bool,
    pub allow_when_no_vpn: bool,
    pub vpn_connected: bool,
    /// Binaries to split; only used by backends that identify apps by path
    pub apps: Vec<String>,
    pub addresses: SplitTunnelAddresses,
}

/// Split-tunnel backend
#[async_trait]
pub trait SplitTunnelBackend: Send + Sync {
    /// Why split tunnelling cannot be used here, if it cannot
    async fn availability_error(&self) -> Option<String>;
    /// Apps are configured as binary paths rather than launched processes
    fn identifies_apps_by_path(&self) -> bool;
    async fn apply_config(&self, config: &SplitTunnelConfig) -> Result<()>;
    /// Best-effort check that the command already runs outside the split tunnel
    async fn is_app_running(&self, exec: &str) -> Result<bool>;
    async fn add_pid(&self, pid: i32, exec: &str) -> Result<()>;
    async fn remove_pid(&self, pid: i32) -> Result<()>;
    async fn running_apps(&self) -> Result<Vec<SplitTunnelApp>>;
}

/// Wi-Fi network the host is attached to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiState {
    pub ssid: String,
    pub is_insecure: bool,
}

/// Wi-Fi discovery
#[async_trait]
pub trait WifiSource: Send + Sync {
    async fn current_network(&self) -> Result<WifiState>;
    async fn available_networks(&self) -> Result<Vec<String>>;
}

/// Installed-application enumeration
#[async_trait]
pub trait AppsProvider: Send + Sync {
    async fn installed_apps(&self, extra_args_json: &str) -> Result<Vec<AppInfo>>;
    /// Base64 PNG icon of a binary
    async fn app_icon(&self, binary_path: &str) -> Result<String>;
}

/// Adapter backed by the platform helper executable
pub struct PlatformHelper {
    program: String,
    apps_by_path: bool,
}

impl PlatformHelper {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            apps_by_path: !cfg!(target_os = "linux"),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, area: &str, op: &str, arg: Value) -> Result<T> {
        let input = if arg.is_null() { None } else { Some(&arg) };
        helper::run_json(&self.program, &[area, op], input).await
    }
}

#[async_trait]
impl FirewallBackend for PlatformHelper {
    async fn set_enabled(&self, enable: bool) -> Result<()> {
        self.call("firewall", "enable", json!({ "enable": enable })).await
    }

    async fn is_enabled(&self) -> Result<bool> {
        self.call("firewall", "status", Value::Null).await
    }

    async fn set_persistent(&self, persistent: bool) -> Result<()> {
        self.call("firewall", "persistent", json!({ "persistent": persistent }))
            .await
    }

    async fn allow_lan(&self, allow_lan: bool, allow_multicast: bool) -> Result<()> {
        self.call(
            "firewall",
            "allow-lan",
            json!({ "allow_lan": allow_lan, "allow_multicast": allow_multicast }),
        )
        .await
    }

    async fn set_user_exceptions(&self, exceptions: &[IpNet]) -> Result<()> {
        let nets: Vec<String> = exceptions.iter().map(|n| n.to_string()).collect();
        self.call("firewall", "user-exceptions", json!({ "exceptions": nets }))
            .await
    }

    async fn add_hosts_exception(&self, ips: &[IpAddr], icmp_only: bool, persistent: bool) -> Result<()> {
        self.call(
            "firewall",
            "add-hosts",
            json!({ "ips": ips, "icmp_only": icmp_only, "persistent": persistent }),
        )
        .await
    }

    async fn remove_hosts_exception(&self, ips: &[IpAddr], icmp_only: bool, persistent: bool) -> Result<()> {
        self.call(
            "firewall",
            "remove-hosts",
            json!({ "ips": ips, "icmp_only": icmp_only, "persistent": persistent }),
        )
        .await
    }

    async fn client_connected(&self, info: &ClientConnectedInfo) -> Result<()> {
        self.call("firewall", "client-connected", serde_json::to_value(info)?)
            .await
    }

    async fn client_disconnected(&self) -> Result<()> {
        self.call("firewall", "client-disconnected", Value::Null).await
    }

    async fn client_paused(&self) -> Result<()> {
        self.call("firewall", "client-paused", Value::Null).await
    }

    async fn client_resumed(&self) -> Result<()> {
        self.call("firewall", "client-resumed", Value::Null).await
    }

    async fn on_change_dns(&self, dns: Option<IpAddr>) -> Result<()> {
        self.call("firewall", "dns", json!({ "dns": dns })).await
    }
}

#[async_trait]
impl DnsBackend for PlatformHelper {
    async fn set_manual(&self, dns: &DnsSettings, local_ip: Option<IpAddr>) -> Result<()> {
        self.call("dns", "set", json!({ "dns": dns, "local_ip": local_ip }))
            .await
    }

    async fn reset(&self) -> Result<()> {
        self.call("dns", "reset", Value::Null).await
    }

    async fn pause(&self) -> Result<()> {
        self.call("dns", "pause", Value::Null).await
    }

    async fn resume(&self, dns: &DnsSettings) -> Result<()> {
        self.call("dns", "resume", json!({ "dns": dns })).await
    }

    async fn apply_user_settings(&self, prefs: &UserPreferences) -> Result<()> {
        self.call("dns", "user-settings", serde_json::to_value(prefs)?)
            .await
    }

    async fn is_wrong(&self, expected: &DnsSettings) -> Result<bool> {
        self.call("dns", "check", json!({ "dns": expected })).await
    }

    async fn capabilities(&self) -> DnsAbilities {
        match self.call::<DnsAbilities>("dns", "capabilities", Value::Null).await {
            Ok(abilities) => abilities,
            Err(e) => {
                log::warn!("Failed to get DNS capabilities: {}", e);
                DnsAbilities::default()
            }
        }
    }

    async fn predefined_configs(&self) -> Result<Vec<DnsSettings>> {
        self.call("dns", "predefined", Value::Null).await
    }
}

#[async_trait]
impl SplitTunnelBackend for PlatformHelper {
    async fn availability_error(&self) -> Option<String> {
        match self.call::<Option<String>>("splittun", "check", Value::Null).await {
            Ok(reason) => reason.filter(|r| !r.is_empty()),
            Err(e) => Some(e.to_string()),
        }
    }

    fn identifies_apps_by_path(&self) -> bool {
        self.apps_by_path
    }

    async fn apply_config(&self, config: &SplitTunnelConfig) -> Result<()> {
        self.call("splittun", "apply", serde_json::to_value(config)?)
            .await
    }

    async fn is_app_running(&self, exec: &str) -> Result<bool> {
        self.call("splittun", "is-running", json!({ "exec": exec })).await
    }

    async fn add_pid(&self, pid: i32, exec: &str) -> Result<()> {
        self.call("splittun", "add-pid", json!({ "pid": pid, "exec": exec }))
            .await
    }

    async fn remove_pid(&self, pid: i32) -> Result<()> {
        self.call("splittun", "remove-pid", json!({ "pid": pid })).await
    }

    async fn running_apps(&self) -> Result<Vec<SplitTunnelApp>> {
        let apps: Option<Vec<SplitTunnelApp>> =
            self.call("splittun", "running", Value::Null).await?;
        Ok(apps.unwrap_or_default())
    }
}

#[async_trait]
impl WifiSource for PlatformHelper {
    async fn current_network(&self) -> Result<WifiState> {
        let state: Option<WifiState> = self.call("wifi", "current", Value::Null).await?;
        Ok(state.unwrap_or_default())
    }

    async fn available_networks(&self) -> Result<Vec<String>> {
        let networks: Option<Vec<String>> = self.call("wifi", "available", Value::Null).await?;
        Ok(networks.unwrap_or_default())
    }
}

#[async_trait]
impl AppsProvider for PlatformHelper {
    async fn installed_apps(&self, extra_args_json: &str) -> Result<Vec<AppInfo>> {
        let extra = if extra_args_json.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(extra_args_json)?
        };
        let apps: Option<Vec<AppInfo>> = self.call("apps", "installed", extra).await?;
        Ok(apps.unwrap_or_default())
    }

    async fn app_icon(&self, binary_path: &str) -> Result<String> {
        let icon: Option<String> = self
            .call("apps", "icon", json!({ "path": binary_path }))
            .await?;
        Ok(icon.unwrap_or_default())
    }
}
