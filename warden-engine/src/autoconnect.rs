//! Automatic connection policy
//!
//! Decides what to do with the VPN and the kill-switch when the daemon
//! starts, a UI client attaches, a user session logs on or the Wi-Fi network
//! changes. The decision is a pure function of the preferences and the
//! current network ([`decide`]); [`AutoConnect`] applies it, firewall first.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::IndexedRandom;

use warden_proto::servers::{HostInfo, ServerInfo};
use warden_proto::types::{ConnectionParams, ServerSelection, WiFiParams};
use warden_proto::{ServersInfo, VpnType};

use crate::connection::ConnectionEngine;
use crate::error::{Error, Result};
use crate::firewall::FirewallController;
use crate::ping::{fastest_host, PingSweeper, SweepOptions};
use crate::platform::WifiState;
use crate::preferences::{Preferences, PreferencesStore};
use crate::servers::ServersUpdater;
use crate::wifi::WifiWatcher;

/// Time budget of the sweep behind a `Fastest` selection
pub const FASTEST_SWEEP_TIMEOUT: Duration = Duration::from_secs(4);

/// Why the policy is evaluated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    DaemonStarted,
    UiClientConnected,
    UserSessionLogon,
    WifiChanged(WifiState),
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::DaemonStarted => f.write_str("daemon launch"),
            Trigger::UiClientConnected => f.write_str("UI client attached"),
            Trigger::UserSessionLogon => f.write_str("user session logon"),
            Trigger::WifiChanged(_) => f.write_str("Wi-Fi change"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Switch {
    #[default]
    Keep,
    On,
    Off,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Action {
    pub vpn: Switch,
    pub firewall: Switch,
    /// Block LAN traffic together with enabling the kill-switch
    pub block_lan: bool,
}

impl Action {
    pub fn is_empty(&self) -> bool {
        self.vpn == Switch::Keep && self.firewall == Switch::Keep
    }
}

/// What the policy sees besides the preferences
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyInput {
    /// Same network and policy as the previous evaluation
    pub already_processed: bool,
    /// A connection is up or being established
    pub connected: bool,
    /// Wi-Fi actions may run now (a UI client is attached or background use is allowed)
    pub wifi_allowed: bool,
}

/// Trust-based action for the current network
pub fn trusted_network_action(policy: &WiFiParams, wifi: &WifiState) -> Action {
    let mut action = Action::default();
    if !policy.trusted_networks_control || wifi.ssid.is_empty() {
        return action;
    }
    let Some(trusted) = policy.trust_of(&wifi.ssid) else {
        return action;
    };

    let acts = &policy.actions;
    if trusted {
        if acts.trusted_disconnect_vpn {
            action.vpn = Switch::Off;
        }
        if acts.trusted_disable_firewall {
            action.firewall = Switch::Off;
        }
    } else {
        if acts.un_trusted_connect_vpn {
            action.vpn = Switch::On;
        }
        if acts.un_trusted_enable_firewall {
            action.firewall = Switch::On;
        }
        if acts.un_trusted_block_lan {
            action.firewall = Switch::On;
            action.block_lan = true;
        }
    }
    action
}

/// Combine the trust action with the launch and insecure-network overlays
pub fn decide(trigger: &Trigger, prefs: &Preferences, wifi: &WifiState, input: PolicyInput) -> Action {
    let mut action = if input.wifi_allowed {
        trusted_network_action(&prefs.wifi_control, wifi)
    } else {
        Action::default()
    };

    // an already applied network keeps only its "VPN off" meaning
    let mut vpn_off_in_force = action.vpn == Switch::Off;
    if input.already_processed {
        action = Action::default();
    } else {
        vpn_off_in_force = false;
    }

    if prefs.is_autoconnect_on_launch && !vpn_off_in_force && !input.connected {
        let launch = match trigger {
            Trigger::DaemonStarted | Trigger::UserSessionLogon => prefs.is_autoconnect_on_launch_daemon,
            Trigger::UiClientConnected => true,
            Trigger::WifiChanged(_) => false,
        };
        if launch {
            action.vpn = Switch::On;
        }
    }

    if !input.already_processed
        && action.vpn == Switch::Keep
        && prefs.wifi_control.connect_vpn_on_insecure_network
        && wifi.is_insecure
        && input.wifi_allowed
    {
        action.vpn = Switch::On;
    }

    action
}

/// True when the UI has a client attached
pub type ClientProbe = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcessedKey {
    wifi: WifiState,
    policy: WiFiParams,
}

pub struct AutoConnect {
    prefs: Arc<PreferencesStore>,
    firewall: Arc<FirewallController>,
    engine: Arc<ConnectionEngine>,
    servers: Arc<ServersUpdater>,
    sweeper: Arc<PingSweeper>,
    wifi: Arc<WifiWatcher>,
    ui_attached: Mutex<Option<ClientProbe>>,
    last: Mutex<Option<ProcessedKey>>,
    apply_lock: tokio::sync::Mutex<()>,
}

impl AutoConnect {
    pub fn new(
        prefs: Arc<PreferencesStore>,
        firewall: Arc<FirewallController>,
        engine: Arc<ConnectionEngine>,
        servers: Arc<ServersUpdater>,
        sweeper: Arc<PingSweeper>,
        wifi: Arc<WifiWatcher>,
    ) -> Self {
        Self {
            prefs,
            firewall,
            engine,
            servers,
            sweeper,
            wifi,
            ui_attached: Mutex::new(None),
            last: Mutex::new(None),
            apply_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn set_client_probe(&self, probe: ClientProbe) {
        *self.ui_attached.lock().unwrap_or_else(|e| e.into_inner()) = Some(probe);
    }

    fn ui_attached(&self) -> bool {
        self.ui_attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|probe| probe())
    }

    /// Evaluate the policy for `trigger` and apply the outcome
    pub async fn evaluate(&self, trigger: Trigger) -> Result<()> {
        let _guard = self.apply_lock.lock().await;

        let prefs = self.prefs.get();
        if !prefs.session.is_logged_in() {
            return Ok(());
        }

        let wifi = match &trigger {
            Trigger::WifiChanged(state) => state.clone(),
            _ => self.wifi.current().await.unwrap_or_else(|e| {
                log::debug!("Wi-Fi state not available: {}", e);
                WifiState::default()
            }),
        };

        let key = ProcessedKey {
            wifi: wifi.clone(),
            policy: prefs.wifi_control.clone(),
        };
        let already_processed = {
            let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            let same = last.as_ref() == Some(&key);
            *last = Some(key);
            same
        };
        if already_processed && matches!(trigger, Trigger::WifiChanged(_)) {
            log::debug!("Wi-Fi network '{}' already processed", wifi.ssid);
            return Ok(());
        }

        let input = PolicyInput {
            already_processed,
            connected: self.engine.is_active(),
            wifi_allowed: prefs.wifi_control.can_apply_in_background || self.ui_attached(),
        };
        let action = decide(&trigger, &prefs, &wifi, input);
        if action.is_empty() {
            return Ok(());
        }
        log::info!("Automatic connection on {}: {:?}", trigger, action);

        self.apply(action, prefs.last_connection_params).await
    }

    async fn apply(&self, action: Action, mut params: ConnectionParams) -> Result<()> {
        let mut result = Ok(());

        match action.firewall {
            Switch::On => {
                log::info!("Automatic connection: enabling kill-switch");
                if let Err(e) = self.firewall.set_enabled(true).await {
                    log::error!("Automatic connection: kill-switch not enabled: {}", e);
                    result = Err(e);
                }
                if action.block_lan {
                    if let Err(e) = self.firewall.apply_allow_lan(false).await {
                        log::error!("Automatic connection: LAN not blocked: {}", e);
                    }
                }
                params.firewall_on = true;
            }
            Switch::Off => {
                log::info!("Automatic connection: disabling kill-switch");
                if let Err(e) = self.firewall.set_enabled(false).await {
                    log::error!("Automatic connection: kill-switch not disabled: {}", e);
                    result = Err(e);
                }
                params.firewall_on = false;
            }
            Switch::Keep => {}
        }

        match action.vpn {
            Switch::Off if self.engine.is_active() => {
                log::info!("Automatic connection: disconnecting");
                self.engine.disconnect().await?;
            }
            Switch::On if !self.engine.is_active() => {
                if params.entry_hosts().is_empty() {
                    return Err(Error::BackgroundConnectionNoParams);
                }
                let params = match self.resolve_selection(&params).await {
                    Ok(resolved) => resolved,
                    Err(e) => {
                        log::warn!("Automatic connection: server selection not resolved: {}", e);
                        params
                    }
                };
                log::info!("Automatic connection: connecting");
                self.engine.connect(params, true)?;
            }
            _ => {}
        }
        result
    }

    /// Replace `Fastest`/`Random` selections with concrete servers
    pub async fn resolve_selection(&self, params: &ConnectionParams) -> Result<ConnectionParams> {
        let meta = &params.metadata;
        if meta.server_selection_entry == ServerSelection::Default
            && meta.server_selection_exit == ServerSelection::Default
        {
            return Ok(params.clone());
        }

        let servers = self.servers.get().await?;
        let mut params = params.clone();
        let vpn_type = params.vpn_type;
        let list = servers.servers(vpn_type);

        if params.metadata.server_selection_entry != ServerSelection::Default {
            let avoid = if params.is_multihop() && params.metadata.server_selection_exit != ServerSelection::Default {
                country_of(list, params.exit_hosts())
            } else {
                None
            };
            let candidates = without_country(list, avoid.as_deref());
            let hosts = match params.metadata.server_selection_entry {
                ServerSelection::Random => random_server(&candidates)
                    .map(|s| s.hosts.clone())
                    .ok_or_else(|| Error::InvalidState("no servers to choose from".into()))?,
                _ => self.fastest_server(&servers, vpn_type, &candidates, &params).await?,
            };
            *params.entry_hosts_mut() = hosts;
        }

        // fastest does not apply to the exit server
        if params.is_multihop() && params.metadata.server_selection_exit == ServerSelection::Random {
            let avoid = country_of(list, params.entry_hosts());
            let candidates = without_country(list, avoid.as_deref());
            let hosts = random_server(&candidates)
                .map(|s| s.hosts.clone())
                .ok_or_else(|| Error::InvalidState("no exit servers to choose from".into()))?;
            *params.exit_hosts_mut() = hosts;
        }
        Ok(params)
    }

    async fn fastest_server(
        &self,
        servers: &ServersInfo,
        vpn_type: VpnType,
        candidates: &[&ServerInfo],
        params: &ConnectionParams,
    ) -> Result<Vec<HostInfo>> {
        let opts = SweepOptions {
            timeout: FASTEST_SWEEP_TIMEOUT,
            prioritized: Some(vpn_type),
            skip_second_phase: true,
        };
        let mut results = self.sweeper.sweep(servers, opts).await?;
        if results.is_empty() {
            results = self.sweeper.last_results();
        }

        // servers outside the candidates are excluded as gateways
        let mut exclude = params.metadata.fastest_gateways_exclude_list.clone();
        exclude.extend(
            servers
                .servers(vpn_type)
                .iter()
                .filter(|s| !candidates.iter().any(|c| c.gateway == s.gateway))
                .map(|s| s.gateway.clone()),
        );

        let host = fastest_host(servers, vpn_type, &results, &exclude)
            .ok_or_else(|| Error::InvalidState("unable to determine servers latency".into()))?;
        candidates
            .iter()
            .find(|s| s.hosts.iter().any(|h| h.host == host.host))
            .map(|s| s.hosts.clone())
            .ok_or_else(|| Error::InvalidState("unable to determine servers latency".into()))
    }
}

/// Country of the server owning any of `hosts`
fn country_of(servers: &[ServerInfo], hosts: &[HostInfo]) -> Option<String> {
    hosts
        .iter()
        .find_map(|h| servers.iter().find(|s| s.has_host(&h.host)))
        .map(|s| s.country_code.clone())
        .filter(|c| !c.is_empty())
}

fn without_country<'a>(servers: &'a [ServerInfo], country: Option<&str>) -> Vec<&'a ServerInfo> {
    servers
        .iter()
        .filter(|s| country.map_or(true, |c| s.country_code != c))
        .collect()
}

fn random_server<'a>(servers: &[&'a ServerInfo]) -> Option<&'a ServerInfo> {
    servers.choose(&mut rand::rng()).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DaemonEvent;
    use crate::mock::{test_host, TestBed};
    use warden_proto::types::{WiFiActions, WiFiNetwork};

    fn policy(trusted: Option<bool>) -> WiFiParams {
        WiFiParams {
            trusted_networks_control: true,
            networks: vec![
                WiFiNetwork {
                    ssid: "Home".into(),
                    is_trusted: true,
                },
                WiFiNetwork {
                    ssid: "OpenCafe".into(),
                    is_trusted: false,
                },
            ],
            default_trust_status_trusted: trusted,
            actions: WiFiActions::default(),
            ..Default::default()
        }
    }

    fn wifi(ssid: &str, insecure: bool) -> WifiState {
        WifiState {
            ssid: ssid.into(),
            is_insecure: insecure,
        }
    }

    fn allowed() -> PolicyInput {
        PolicyInput {
            wifi_allowed: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_trusted_network_actions() {
        let p = policy(None);
        let trusted = trusted_network_action(&p, &wifi("Home", false));
        assert_eq!(trusted.vpn, Switch::Off);
        assert_eq!(trusted.firewall, Switch::Off);

        let untrusted = trusted_network_action(&p, &wifi("OpenCafe", true));
        assert_eq!(untrusted.vpn, Switch::On);
        assert_eq!(untrusted.firewall, Switch::On);
        assert!(untrusted.block_lan);

        // unknown network without a default trust
        assert!(trusted_network_action(&p, &wifi("Airport", false)).is_empty());
        let with_default = trusted_network_action(&policy(Some(false)), &wifi("Airport", false));
        assert_eq!(with_default.vpn, Switch::On);

        let mut off = p.clone();
        off.trusted_networks_control = false;
        assert!(trusted_network_action(&off, &wifi("OpenCafe", true)).is_empty());
        assert!(trusted_network_action(&p, &wifi("", true)).is_empty());
    }

    #[test]
    fn test_launch_overlay() {
        let mut prefs = Preferences {
            is_autoconnect_on_launch: true,
            ..Default::default()
        };
        let none = wifi("", false);

        assert_eq!(decide(&Trigger::UiClientConnected, &prefs, &none, allowed()).vpn, Switch::On);
        // the daemon variant needs its own flag
        assert!(decide(&Trigger::DaemonStarted, &prefs, &none, allowed()).is_empty());
        prefs.is_autoconnect_on_launch_daemon = true;
        assert_eq!(decide(&Trigger::DaemonStarted, &prefs, &none, allowed()).vpn, Switch::On);
        assert_eq!(decide(&Trigger::UserSessionLogon, &prefs, &none, allowed()).vpn, Switch::On);

        let connected = PolicyInput {
            connected: true,
            ..allowed()
        };
        assert!(decide(&Trigger::UiClientConnected, &prefs, &none, connected).is_empty());
    }

    #[test]
    fn test_trusted_disconnect_blocks_launch_overlay() {
        let prefs = Preferences {
            is_autoconnect_on_launch: true,
            wifi_control: policy(None),
            ..Default::default()
        };
        let home = wifi("Home", false);
        let action = decide(&Trigger::UiClientConnected, &prefs, &home, allowed());
        assert_eq!(action.vpn, Switch::Off);

        // on a network already handled only the "VPN off" meaning survives
        let processed = PolicyInput {
            already_processed: true,
            ..allowed()
        };
        assert!(decide(&Trigger::UiClientConnected, &prefs, &home, processed).is_empty());
    }

    #[test]
    fn test_insecure_network_overlay() {
        let mut prefs = Preferences::default();
        prefs.wifi_control.connect_vpn_on_insecure_network = true;
        let open = wifi("Library", true);

        let trigger = Trigger::WifiChanged(open.clone());
        assert_eq!(decide(&trigger, &prefs, &open, allowed()).vpn, Switch::On);
        assert!(decide(&trigger, &prefs, &wifi("Library", false), allowed()).is_empty());

        // no UI attached and no background permission
        assert!(decide(&trigger, &prefs, &open, PolicyInput::default()).is_empty());
    }

    fn server(gateway: &str, country: &str, ip: &str) -> ServerInfo {
        ServerInfo {
            gateway: gateway.into(),
            country_code: country.into(),
            hosts: vec![test_host(gateway, ip, 4000)],
            ..Default::default()
        }
    }

    #[test]
    fn test_random_exit_avoids_entry_country() {
        let list = vec![
            server("nl1", "NL", "10.1.0.1"),
            server("nl2", "NL", "10.1.0.2"),
            server("de1", "DE", "10.1.0.3"),
        ];
        let entry = vec![test_host("nl1", "10.1.0.1", 4000)];
        let country = country_of(&list, &entry);
        assert_eq!(country.as_deref(), Some("NL"));

        for _ in 0..20 {
            let candidates = without_country(&list, country.as_deref());
            assert_eq!(random_server(&candidates).unwrap().gateway, "de1");
        }
        assert!(random_server(&without_country(&list[..2], Some("NL"))).is_none());
    }

    async fn autoconnect(
        bed: &TestBed,
    ) -> (AutoConnect, Arc<ConnectionEngine>, tokio::sync::broadcast::Sender<()>) {
        let engine = ConnectionEngine::new(bed.connection_deps());
        let (stop, stop_rx) = tokio::sync::broadcast::channel(1);
        engine.start(stop_rx);
        let sweeper = Arc::new(PingSweeper::new(bed.pinger.clone(), bed.firewall.clone(), bed.events.clone()));
        let wifi = Arc::new(WifiWatcher::new(bed.wifi.clone(), bed.events.clone()));
        let ac = AutoConnect::new(
            bed.prefs.clone(),
            bed.firewall.clone(),
            engine.clone(),
            bed.servers.clone(),
            sweeper,
            wifi,
        );
        (ac, engine, stop)
    }

    #[tokio::test]
    async fn test_untrusted_wifi_connects_behind_kill_switch() {
        let dir = tempfile::tempdir().unwrap();
        let bed = TestBed::new(dir.path()).logged_in();
        let params = bed.connect_params();
        bed.prefs
            .update(|p| {
                p.last_connection_params = params.clone();
                p.wifi_control = policy(None);
                p.wifi_control.can_apply_in_background = true;
                p.is_fw_allow_lan = true;
            })
            .unwrap();
        let mut rx = bed.events.subscribe();
        let (ac, engine, _stop) = autoconnect(&bed).await;

        let open = wifi("OpenCafe", true);
        ac.evaluate(Trigger::WifiChanged(open.clone())).await.unwrap();
        assert!(bed.firewall_backend.is_on());
        assert!(bed
            .firewall_backend
            .calls()
            .iter()
            .any(|c| c.starts_with("allow_lan:false")));
        // the user's own setting survives
        assert!(bed.prefs.get().is_fw_allow_lan);

        loop {
            match rx.recv().await.unwrap() {
                DaemonEvent::Connected(info) => {
                    assert_eq!(info.client_ip, Some("10.0.0.2".parse().unwrap()));
                    break;
                }
                DaemonEvent::Disconnected { description, .. } => panic!("disconnected: {}", description),
                _ => {}
            }
        }
        assert!(bed.prefs.get().last_connection_params.firewall_on);

        // the same network is not handled twice
        ac.evaluate(Trigger::WifiChanged(open)).await.unwrap();
        assert_eq!(bed.tunnels.created(), 1);

        engine.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_saved_params() {
        let dir = tempfile::tempdir().unwrap();
        let bed = TestBed::new(dir.path()).logged_in();
        bed.prefs
            .update(|p| {
                p.is_autoconnect_on_launch = true;
                p.is_autoconnect_on_launch_daemon = true;
            })
            .unwrap();
        let (ac, engine, _stop) = autoconnect(&bed).await;

        let err = ac.evaluate(Trigger::DaemonStarted).await.unwrap_err();
        assert!(matches!(err, Error::BackgroundConnectionNoParams));
        assert!(!engine.is_active());
    }

    #[tokio::test]
    async fn test_logged_out_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let bed = TestBed::new(dir.path());
        bed.prefs.update(|p| p.is_autoconnect_on_launch = true).unwrap();
        let (ac, engine, _stop) = autoconnect(&bed).await;
        ac.evaluate(Trigger::UiClientConnected).await.unwrap();
        assert!(!engine.is_active());
    }
}
