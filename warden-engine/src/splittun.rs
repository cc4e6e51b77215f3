//! Split-tunnel controller

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use warden_proto::request::SplitTunnelSetConfig;
use warden_proto::response::{SplitTunnelAddAppCmdResp, SplitTunnelStatus};

use crate::error::{Error, Result};
use crate::event::{DaemonEvent, EventHandler};
use crate::platform::{SplitTunnelAddresses, SplitTunnelBackend, SplitTunnelConfig};
use crate::preferences::PreferencesStore;

/// Client command that launches a binary inside the split tunnel
pub const RUN_IN_SPLIT_TUNNEL_COMMAND: &str = "warden splittun -execute";

pub struct SplitTunnelController {
    backend: Arc<dyn SplitTunnelBackend>,
    prefs: Arc<PreferencesStore>,
    events: Arc<dyn EventHandler>,
    addresses: Mutex<SplitTunnelAddresses>,
    vpn_connected: AtomicBool,
}

impl SplitTunnelController {
    pub fn new(
        backend: Arc<dyn SplitTunnelBackend>,
        prefs: Arc<PreferencesStore>,
        events: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            backend,
            prefs,
            events,
            addresses: Mutex::new(SplitTunnelAddresses::default()),
            vpn_connected: AtomicBool::new(false),
        }
    }

    /// Reason split tunnelling cannot be used here
    pub async fn availability_error(&self) -> Option<String> {
        self.backend.availability_error().await
    }

    /// Push the stored configuration to the backend on start
    pub async fn init(&self) -> Result<()> {
        if self.availability_error().await.is_some() {
            return Ok(());
        }
        self.apply().await
    }

    pub async fn set_config(&self, cfg: &SplitTunnelSetConfig) -> Result<()> {
        if cfg.is_enabled && !cfg.reset {
            if let Some(reason) = self.availability_error().await {
                return Err(Error::InvalidState(format!(
                    "split tunnelling is not available: {}",
                    reason
                )));
            }
        }

        self.prefs.update(|p| {
            if cfg.reset {
                p.is_split_tunnel = false;
                p.is_split_tunnel_inversed = false;
                p.is_split_tunnel_any_dns = false;
                p.is_split_tunnel_allow_when_no_vpn = false;
                p.split_tunnel_apps.clear();
            } else {
                p.is_split_tunnel = cfg.is_enabled;
                p.is_split_tunnel_inversed = cfg.is_inversed;
                p.is_split_tunnel_any_dns = cfg.is_any_dns;
                p.is_split_tunnel_allow_when_no_vpn = cfg.is_allow_when_no_vpn;
            }
        })?;

        self.apply().await?;
        self.events.on_event(DaemonEvent::SplitTunnelChanged).await;
        Ok(())
    }

    /// Connection transitions report the tunnel and outbound addresses here
    pub async fn update_addresses(&self, addresses: SplitTunnelAddresses, vpn_connected: bool) -> Result<()> {
        *self.addresses.lock().unwrap_or_else(|e| e.into_inner()) = addresses;
        self.vpn_connected.store(vpn_connected, Ordering::SeqCst);
        if !self.prefs.get().is_split_tunnel {
            return Ok(());
        }
        self.apply().await
    }

    async fn apply(&self) -> Result<()> {
        let prefs = self.prefs.get();
        let addresses = self
            .addresses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let vpn_connected = self.vpn_connected.load(Ordering::SeqCst);

        if prefs.is_split_tunnel && vpn_connected && !addresses.is_complete() {
            log::debug!("Split tunnel addresses not known yet; configuration postponed");
            return Ok(());
        }

        let config = SplitTunnelConfig {
            enabled: prefs.is_split_tunnel,
            inversed: prefs.is_split_tunnel_inversed,
            any_dns: prefs.is_split_tunnel_any_dns,
            allow_when_no_vpn: prefs.is_split_tunnel_allow_when_no_vpn,
            vpn_connected,
            apps: prefs.split_tunnel_apps.clone(),
            addresses,
        };
        self.backend.apply_config(&config).await
    }

    pub async fn add_app(&self, exec: &str) -> Result<SplitTunnelAddAppCmdResp> {
        if !self.prefs.get().is_split_tunnel {
            return Err(Error::InvalidState(
                "unable to run application in split tunnel: split tunnelling is disabled".into(),
            ));
        }

        let exec = exec.trim();
        if exec.is_empty() {
            return Ok(SplitTunnelAddAppCmdResp::default());
        }

        if self.backend.identifies_apps_by_path() {
            self.add_app_path(exec).await?;
            return Ok(SplitTunnelAddAppCmdResp {
                exec: exec.to_string(),
                ..Default::default()
            });
        }

        let mut resp = SplitTunnelAddAppCmdResp {
            exec: exec.to_string(),
            cmd_to_execute: format!("{} {}", RUN_IN_SPLIT_TUNNEL_COMMAND, exec),
            ..Default::default()
        };
        match self.backend.is_app_running(exec).await {
            Ok(true) => {
                resp.is_already_running = true;
                resp.is_already_running_message = "It appears the application is already running.\n\
                    Some applications must be closed before launching them in the split tunnel \
                    or they may not be excluded from the VPN tunnel."
                    .into();
            }
            Ok(false) => {}
            Err(e) => log::warn!("Failed to check if '{}' is running: {}", exec, e),
        }
        Ok(resp)
    }

    async fn add_app_path(&self, exec: &str) -> Result<()> {
        if !Path::new(exec).exists() {
            log::warn!("Split tunnel: skipping missing binary '{}'", exec);
            return Ok(());
        }

        let added = self.prefs.update(|p| {
            if p
                .split_tunnel_apps
                .iter()
                .any(|a| a.eq_ignore_ascii_case(exec))
            {
                return false;
            }
            p.split_tunnel_apps.push(exec.to_string());
            true
        })?;

        if added {
            self.apply().await?;
            self.events.on_event(DaemonEvent::SplitTunnelChanged).await;
        }
        Ok(())
    }

    pub async fn remove_app(&self, pid: i32, exec: &str) -> Result<()> {
        if self.backend.identifies_apps_by_path() {
            let exec = exec.trim();
            let removed = self.prefs.update(|p| {
                let before = p.split_tunnel_apps.len();
                p.split_tunnel_apps.retain(|a| !a.eq_ignore_ascii_case(exec));
                before != p.split_tunnel_apps.len()
            })?;
            if removed {
                self.apply().await?;
            }
        } else {
            self.backend.remove_pid(pid).await?;
        }
        self.events.on_event(DaemonEvent::SplitTunnelChanged).await;
        Ok(())
    }

    /// A client launched `exec` as process `pid` through the split-tunnel command
    pub async fn added_pid_info(&self, pid: i32, exec: &str, cmd_to_execute: &str) -> Result<()> {
        if self.backend.identifies_apps_by_path() {
            return Err(Error::InvalidArgument(
                "process registration is not used on this platform".into(),
            ));
        }
        if !self.prefs.get().is_split_tunnel {
            return Err(Error::InvalidState("split tunnelling is disabled".into()));
        }
        log::info!("Split tunnel: added pid {} ({})", pid, cmd_to_execute);
        self.backend.add_pid(pid, exec).await?;
        self.events.on_event(DaemonEvent::SplitTunnelChanged).await;
        Ok(())
    }

    pub async fn status(&self) -> SplitTunnelStatus {
        let prefs = self.prefs.get();
        let not_available = self.availability_error().await.is_some();
        let by_path = self.backend.identifies_apps_by_path();

        let running_apps = if prefs.is_split_tunnel && !by_path && !not_available {
            self.backend.running_apps().await.unwrap_or_else(|e| {
                log::warn!("Failed to list split tunnel processes: {}", e);
                Vec::new()
            })
        } else {
            Vec::new()
        };

        SplitTunnelStatus {
            is_enabled: prefs.is_split_tunnel,
            is_inversed: prefs.is_split_tunnel_inversed,
            is_any_dns: prefs.is_split_tunnel_any_dns,
            is_allow_when_no_vpn: prefs.is_split_tunnel_allow_when_no_vpn,
            is_functionality_not_available: not_available,
            is_can_get_app_icon_for_binary: by_path,
            split_tunnel_apps: prefs.split_tunnel_apps,
            running_apps,
        }
    }
}
