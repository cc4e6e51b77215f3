//! Kill-switch (firewall) controller
//!
//! Wraps a [`FirewallBackend`] with the persisted kill-switch preferences and
//! the rules about when the state may change: a persistent kill-switch can't
//! be disabled, and nothing changes while the connection is paused.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ipnet::IpNet;

use warden_proto::response::KillSwitchStatusResp;

use crate::error::{Error, Result};
use crate::event::{DaemonEvent, EventHandler};
use crate::platform::{ClientConnectedInfo, FirewallBackend};
use crate::preferences::PreferencesStore;

pub struct FirewallController {
    backend: Arc<dyn FirewallBackend>,
    prefs: Arc<PreferencesStore>,
    events: Arc<dyn EventHandler>,

    enabled: AtomicBool,
    vpn_connected: AtomicBool,
    paused: AtomicBool,
    /// Kill-switch was switched off by a pause and must come back on resume
    disabled_by_pause: AtomicBool,
    allow_api_servers: AtomicBool,
    /// Outstanding temporary API allowances (login, logout)
    api_temp_allowed: AtomicUsize,
    /// API IPs currently installed as persistent exceptions
    api_ips: Mutex<Vec<IpAddr>>,
}

impl FirewallController {
    pub fn new(
        backend: Arc<dyn FirewallBackend>,
        prefs: Arc<PreferencesStore>,
        events: Arc<dyn EventHandler>,
    ) -> Self {
        let allow_api = prefs.get().is_fw_allow_api_servers;
        Self {
            backend,
            prefs,
            events,
            enabled: AtomicBool::new(false),
            vpn_connected: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            disabled_by_pause: AtomicBool::new(false),
            allow_api_servers: AtomicBool::new(allow_api),
            api_temp_allowed: AtomicUsize::new(0),
            api_ips: Mutex::new(Vec::new()),
        }
    }

    /// Push the persisted configuration to the backend at start-up
    pub async fn init(&self) -> Result<()> {
        let prefs = self.prefs.get();

        self.backend
            .allow_lan(prefs.is_fw_allow_lan, prefs.is_fw_allow_lan_multicast)
            .await?;

        let exceptions = parse_user_exceptions(&prefs.fw_user_exceptions, false)?;
        self.backend.set_user_exceptions(&exceptions).await?;

        if prefs.is_fw_persistant {
            log::info!("Enabling persistent kill-switch");
            self.backend.set_persistent(true).await?;
        }

        let enabled = self.backend.is_enabled().await?;
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    /// Current state as reported by the backend
    pub async fn is_enabled(&self) -> Result<bool> {
        let enabled = self.backend.is_enabled().await?;
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(enabled)
    }

    pub fn is_persistent(&self) -> bool {
        self.prefs.get().is_fw_persistant
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Reason the daemon's own API traffic is blocked, if it is
    pub fn connectivity_blocked(&self) -> Option<String> {
        let blocked = self.enabled.load(Ordering::SeqCst)
            && !self.vpn_connected.load(Ordering::SeqCst)
            && !self.allow_api_servers.load(Ordering::SeqCst)
            && self.api_temp_allowed.load(Ordering::SeqCst) == 0;
        if blocked {
            Some("the kill-switch is enabled and access to API servers is not allowed".into())
        } else {
            None
        }
    }

    pub async fn set_enabled(&self, enable: bool) -> Result<()> {
        if self.is_paused() {
            return Err(Error::InvalidState(
                "the kill-switch cannot be changed while the connection is paused".into(),
            ));
        }
        if !enable && self.is_persistent() {
            return Err(Error::InvalidState(
                "the kill-switch is persistent and cannot be disabled".into(),
            ));
        }
        self.apply_enabled(enable).await?;
        self.changed().await;
        Ok(())
    }

    /// Enable or disable without the user-facing checks; used by the connection engine
    pub(crate) async fn apply_enabled(&self, enable: bool) -> Result<()> {
        log::info!("Kill-switch {}", if enable { "enabling" } else { "disabling" });
        self.backend.set_enabled(enable).await?;
        self.enabled.store(enable, Ordering::SeqCst);
        Ok(())
    }

    pub async fn set_persistent(&self, persistent: bool) -> Result<()> {
        if self.is_paused() {
            return Err(Error::InvalidState(
                "the kill-switch cannot be changed while the connection is paused".into(),
            ));
        }
        self.prefs.update(|p| p.is_fw_persistant = persistent)?;
        self.backend.set_persistent(persistent).await?;
        if persistent {
            self.enabled.store(true, Ordering::SeqCst);
        }
        self.changed().await;
        Ok(())
    }

    pub async fn set_allow_lan(&self, allow_lan: bool) -> Result<()> {
        let multicast = self.prefs.get().is_fw_allow_lan_multicast;
        self.set_lan(allow_lan, multicast).await
    }

    pub async fn set_allow_lan_multicast(&self, allow_multicast: bool) -> Result<()> {
        let lan = self.prefs.get().is_fw_allow_lan;
        self.set_lan(lan, allow_multicast).await
    }

    /// Change LAN access in the backend only; preferences keep the user's choice
    pub(crate) async fn apply_allow_lan(&self, allow_lan: bool) -> Result<()> {
        let multicast = self.prefs.get().is_fw_allow_lan_multicast;
        self.backend.allow_lan(allow_lan, multicast).await?;
        self.changed().await;
        Ok(())
    }

    async fn set_lan(&self, allow_lan: bool, allow_multicast: bool) -> Result<()> {
        self.prefs.update(|p| {
            p.is_fw_allow_lan = allow_lan;
            p.is_fw_allow_lan_multicast = allow_multicast;
        })?;
        self.backend.allow_lan(allow_lan, allow_multicast).await?;
        self.changed().await;
        Ok(())
    }

    pub async fn set_allow_api_servers(&self, allow: bool) -> Result<()> {
        self.prefs.update(|p| p.is_fw_allow_api_servers = allow)?;
        self.allow_api_servers.store(allow, Ordering::SeqCst);

        let ips = self.api_ips_snapshot();
        if !ips.is_empty() {
            if allow {
                self.backend.add_hosts_exception(&ips, false, true).await?;
            } else {
                self.backend.remove_hosts_exception(&ips, false, true).await?;
            }
        }
        self.changed().await;
        Ok(())
    }

    /// Replace the user exception list (`x.x.x.x[/xx]`, comma separated)
    pub async fn set_user_exceptions(&self, csv: &str, fail_on_parse_error: bool) -> Result<()> {
        let nets = parse_user_exceptions(csv, fail_on_parse_error)?;
        let normalized = nets
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.prefs.update(|p| p.fw_user_exceptions = normalized)?;
        self.backend.set_user_exceptions(&nets).await?;
        self.changed().await;
        Ok(())
    }

    pub async fn add_hosts_exception(&self, ips: &[IpAddr], icmp_only: bool, persistent: bool) -> Result<()> {
        if ips.is_empty() {
            return Ok(());
        }
        self.backend
            .add_hosts_exception(ips, icmp_only, persistent)
            .await
    }

    pub async fn remove_hosts_exception(&self, ips: &[IpAddr], icmp_only: bool, persistent: bool) -> Result<()> {
        if ips.is_empty() {
            return Ok(());
        }
        self.backend
            .remove_hosts_exception(ips, icmp_only, persistent)
            .await
    }

    /// Refresh the persistent exceptions for the API servers
    pub async fn set_api_server_ips(&self, ips: Vec<IpAddr>) -> Result<()> {
        let old = {
            let mut current = self.api_ips.lock().unwrap_or_else(|e| e.into_inner());
            if *current == ips {
                return Ok(());
            }
            std::mem::replace(&mut *current, ips.clone())
        };

        if self.allow_api_servers.load(Ordering::SeqCst) {
            if !old.is_empty() {
                self.backend.remove_hosts_exception(&old, false, true).await?;
            }
            if !ips.is_empty() {
                self.backend.add_hosts_exception(&ips, false, true).await?;
            }
        }
        Ok(())
    }

    /// Let API traffic through until [`Self::restore_api_servers`] is called
    pub async fn allow_api_servers_temporarily(&self) -> Result<()> {
        self.api_temp_allowed.fetch_add(1, Ordering::SeqCst);
        if self.allow_api_servers.load(Ordering::SeqCst) {
            return Ok(());
        }
        let ips = self.api_ips_snapshot();
        if let Err(e) = self.add_hosts_exception(&ips, false, false).await {
            self.api_temp_allowed.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    pub async fn restore_api_servers(&self) {
        let previous = self
            .api_temp_allowed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .unwrap_or(0);
        if previous != 1 || self.allow_api_servers.load(Ordering::SeqCst) {
            return;
        }
        let ips = self.api_ips_snapshot();
        if let Err(e) = self.remove_hosts_exception(&ips, false, false).await {
            log::error!("Failed to restore API servers exception: {}", e);
        }
    }

    fn api_ips_snapshot(&self) -> Vec<IpAddr> {
        self.api_ips
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn client_connected(&self, info: &ClientConnectedInfo) -> Result<()> {
        self.backend.client_connected(info).await?;
        self.vpn_connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn client_disconnected(&self) -> Result<()> {
        self.vpn_connected.store(false, Ordering::SeqCst);
        self.backend.client_disconnected().await
    }

    /// Switch a non-persistent kill-switch off for the pause
    pub async fn client_paused(&self) -> Result<()> {
        self.paused.store(true, Ordering::SeqCst);
        self.backend.client_paused().await?;

        if self.is_enabled().await? && !self.is_persistent() {
            self.apply_enabled(false).await?;
            self.disabled_by_pause.store(true, Ordering::SeqCst);
        }
        self.changed().await;
        Ok(())
    }

    /// Undo [`Self::client_paused`]
    pub async fn client_resumed(&self) -> Result<()> {
        self.paused.store(false, Ordering::SeqCst);
        if self.disabled_by_pause.swap(false, Ordering::SeqCst) {
            self.apply_enabled(true).await?;
        }
        self.backend.client_resumed().await?;
        self.changed().await;
        Ok(())
    }

    pub async fn on_change_dns(&self, dns: Option<IpAddr>) -> Result<()> {
        self.backend.on_change_dns(dns).await
    }

    pub async fn status(&self) -> Result<KillSwitchStatusResp> {
        let enabled = self.is_enabled().await?;
        let prefs = self.prefs.get();
        Ok(KillSwitchStatusResp {
            is_enabled: enabled,
            is_persistent: prefs.is_fw_persistant,
            is_allow_lan: prefs.is_fw_allow_lan,
            is_allow_multicast: prefs.is_fw_allow_lan_multicast,
            is_allow_api_servers: prefs.is_fw_allow_api_servers,
            user_exceptions: prefs.fw_user_exceptions,
        })
    }

    pub async fn changed(&self) {
        self.events.on_event(DaemonEvent::FirewallChanged).await;
    }
}

/// Parse `x.x.x.x[/xx]` items; bad items fail the call or are skipped
pub fn parse_user_exceptions(csv: &str, fail_on_parse_error: bool) -> Result<Vec<IpNet>> {
    let mut nets = Vec::new();
    for item in csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let parsed = item
            .parse::<IpNet>()
            .or_else(|_| item.parse::<IpAddr>().map(IpNet::from));
        match parsed {
            Ok(net) => nets.push(net),
            Err(_) if fail_on_parse_error => {
                return Err(Error::InvalidArgument(format!(
                    "failed to parse firewall exception '{}'",
                    item
                )));
            }
            Err(_) => log::warn!("Skipping unparsable firewall exception '{}'", item),
        }
    }
    Ok(nets)
}
