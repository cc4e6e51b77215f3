//! Daemon service
//!
//! [`Service`] owns every long-lived component, wires them together and turns
//! control requests into calls on them. The control protocol server only deals
//! with connections, authentication and broadcasting; everything a request
//! actually does lives here.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use warden_proto::request::{Request, SessionDelete, SetAlternateDns};
use warden_proto::response::{
    ApiResponse, AppIconResp, CheckAccessiblePortsResponse, ConnectSettingsResp, ConnectedResp,
    DiagnosticsGeneratedResp, DisabledFunctions, DisconnectedResp, DnsPredefinedConfigsResp,
    HelloResp, InstalledAppsResp, ParanoidModeStatus, PingResultType, PingServersResp,
    ServerListResp, SetAlternateDnsResp, WiFiAvailableNetworksResp, WiFiCurrentNetworkResp,
    WiFiNetworkInfo,
};
use warden_proto::{DisconnectReason, Response, VpnState};

use crate::api::ApiClient;
use crate::autoconnect::{AutoConnect, ClientProbe, Trigger};
use crate::config::Config;
use crate::connection::proxy::HelperProxyLauncher;
use crate::connection::netchange::NetRouteWatcher;
use crate::connection::tunnel::LauncherTunnelFactory;
use crate::connection::{ConnectionDeps, ConnectionEngine};
use crate::dns::{anti_tracker_dns, DnsController};
use crate::eaa::Eaa;
use crate::error::{Error, Result};
use crate::event::{ChannelEventHandler, ConnectionInfo, DaemonEvent, EventHandler};
use crate::firewall::FirewallController;
use crate::kem::KemHelperProcess;
use crate::netinfo::PortChecker;
use crate::ping::{PingSweeper, SweepOptions, SystemPinger};
use crate::platform::{AppsProvider, PlatformHelper, WifiState};
use crate::preferences::{Preferences, PreferencesStore};
use crate::servers::ServersUpdater;
use crate::session::SessionManager;
use crate::splittun::SplitTunnelController;
use crate::wgkeys::{KeysManager, WgToolKeyGenerator};
use crate::wifi::WifiWatcher;

/// Capacity of the daemon event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Longest log tail included in diagnostics
const DIAGNOSTICS_LOG_TAIL: usize = 256 * 1024;

/// Default budget of a client-requested ping sweep
const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(6);

/// Long-lived components handed to [`Service::new`]
pub struct Components {
    pub prefs: Arc<PreferencesStore>,
    pub api: Arc<ApiClient>,
    pub firewall: Arc<FirewallController>,
    pub dns: Arc<DnsController>,
    pub split_tunnel: Arc<SplitTunnelController>,
    pub keys: Arc<KeysManager>,
    pub session: Arc<SessionManager>,
    pub servers: Arc<ServersUpdater>,
    pub engine: Arc<ConnectionEngine>,
    pub sweeper: Arc<PingSweeper>,
    pub wifi: Arc<WifiWatcher>,
    pub apps: Arc<dyn AppsProvider>,
    pub eaa: Arc<Eaa>,
    pub events: Arc<ChannelEventHandler>,
    /// Tunnel kinds unavailable on this host
    pub disabled_functions: DisabledFunctions,
    pub log_file: Option<PathBuf>,
}

impl Components {
    /// Build the production components from the daemon configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let events = Arc::new(ChannelEventHandler::new(EVENT_CHANNEL_CAPACITY));
        let prefs = Arc::new(PreferencesStore::load(&config.daemon.settings_file));
        let api = Arc::new(ApiClient::with_default_transport(&config.api, &config.daemon.platform)?);

        let helpers = &config.helpers;
        let platform = Arc::new(PlatformHelper::new(&helpers.platform));
        let kem = Arc::new(KemHelperProcess::new(&helpers.kem));
        let keygen = Arc::new(WgToolKeyGenerator::new(&helpers.wg));

        let firewall = Arc::new(FirewallController::new(platform.clone(), prefs.clone(), events.clone()));
        let dns = Arc::new(DnsController::new(platform.clone(), firewall.clone(), events.clone()));
        let split_tunnel = Arc::new(SplitTunnelController::new(
            platform.clone(),
            prefs.clone(),
            events.clone(),
        ));
        let keys = Arc::new(KeysManager::new(
            api.clone(),
            prefs.clone(),
            firewall.clone(),
            kem.clone(),
            keygen.clone(),
            events.clone(),
        ));
        let session = SessionManager::new(
            api.clone(),
            prefs.clone(),
            firewall.clone(),
            kem,
            keygen,
            keys.clone(),
            events.clone(),
        );
        let servers = Arc::new(ServersUpdater::new(
            api.clone(),
            &config.daemon.servers_cache_file,
            events.clone(),
        ));

        let engine = ConnectionEngine::new(ConnectionDeps {
            prefs: prefs.clone(),
            firewall: firewall.clone(),
            dns: dns.clone(),
            split_tunnel: split_tunnel.clone(),
            keys: keys.clone(),
            servers: servers.clone(),
            tunnels: Arc::new(LauncherTunnelFactory::new(&helpers.w_tunnel, &helpers.c_tunnel)),
            routes: Arc::new(NetRouteWatcher::default()),
            proxies: Arc::new(HelperProxyLauncher::new(&helpers.transport_proxy)),
            events: events.clone(),
        });

        let sweeper = Arc::new(PingSweeper::new(
            Arc::new(SystemPinger::new()),
            firewall.clone(),
            events.clone(),
        ));
        let wifi = Arc::new(WifiWatcher::new(platform.clone(), events.clone()));

        Ok(Self {
            prefs,
            api,
            firewall,
            dns,
            split_tunnel,
            keys,
            session,
            servers,
            engine,
            sweeper,
            wifi,
            apps: platform,
            eaa: Arc::new(Eaa::load(&config.daemon.eaa_file)),
            events,
            disabled_functions: DisabledFunctions {
                w_tunnel_error: missing_helper(&helpers.w_tunnel),
                c_tunnel_error: missing_helper(&helpers.c_tunnel),
                split_tunnel_error: String::new(),
            },
            log_file: config.daemon.log_file.as_ref().map(PathBuf::from),
        })
    }
}

fn missing_helper(program: &str) -> String {
    if Path::new(program).exists() {
        String::new()
    } else {
        format!("{} not found", program)
    }
}

pub struct Service {
    pub prefs: Arc<PreferencesStore>,
    pub api: Arc<ApiClient>,
    pub firewall: Arc<FirewallController>,
    pub dns: Arc<DnsController>,
    pub split_tunnel: Arc<SplitTunnelController>,
    pub keys: Arc<KeysManager>,
    pub session: Arc<SessionManager>,
    pub servers: Arc<ServersUpdater>,
    pub engine: Arc<ConnectionEngine>,
    pub sweeper: Arc<PingSweeper>,
    pub wifi: Arc<WifiWatcher>,
    pub autoconnect: Arc<AutoConnect>,
    pub eaa: Arc<Eaa>,
    pub events: Arc<ChannelEventHandler>,
    apps: Arc<dyn AppsProvider>,
    ports: PortChecker,
    disabled_functions: DisabledFunctions,
    log_file: Option<PathBuf>,
    shutdown: broadcast::Sender<()>,
}

impl Service {
    pub fn new(parts: Components) -> Arc<Self> {
        let autoconnect = Arc::new(AutoConnect::new(
            parts.prefs.clone(),
            parts.firewall.clone(),
            parts.engine.clone(),
            parts.servers.clone(),
            parts.sweeper.clone(),
            parts.wifi.clone(),
        ));

        // keys are not rotated through a W-Tunnel that is up
        let engine: Weak<ConnectionEngine> = Arc::downgrade(&parts.engine);
        parts.keys.set_tunnel_probe(Arc::new(move || {
            engine.upgrade().is_some_and(|e| e.is_w_tunnel_connected())
        }));
        let firewall: Weak<FirewallController> = Arc::downgrade(&parts.firewall);
        parts.api.set_connectivity_gate(Arc::new(move || {
            firewall.upgrade().and_then(|f| f.connectivity_blocked())
        }));

        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            prefs: parts.prefs,
            api: parts.api,
            firewall: parts.firewall,
            dns: parts.dns,
            split_tunnel: parts.split_tunnel,
            keys: parts.keys,
            session: parts.session,
            servers: parts.servers,
            engine: parts.engine,
            sweeper: parts.sweeper,
            wifi: parts.wifi,
            autoconnect,
            eaa: parts.eaa,
            events: parts.events,
            apps: parts.apps,
            ports: PortChecker::new(),
            disabled_functions: parts.disabled_functions,
            log_file: parts.log_file,
            shutdown,
        })
    }

    /// Tell auto-connect whether a UI client is attached
    pub fn set_client_probe(&self, probe: ClientProbe) {
        self.autoconnect.set_client_probe(probe);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bring the host into the state the preferences describe
    pub async fn init(&self) -> Result<()> {
        self.firewall.init().await?;
        if let Err(e) = self.split_tunnel.init().await {
            log::warn!("Split tunnel not initialised: {}", e);
        }
        if let Err(e) = self.dns.apply_user_settings(&self.prefs.get().user_prefs).await {
            log::warn!("DNS user settings not applied: {}", e);
        }
        self.refresh_api_exceptions().await;
        Ok(())
    }

    /// Start the background tasks; they run until [`Self::shutdown`]
    pub async fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![
            self.engine.start(self.shutdown.subscribe()),
            tokio::spawn(self.servers.clone().run(self.shutdown.subscribe())),
            self.wifi.start(self.shutdown.subscribe()).await,
        ];

        let service = self.clone();
        let mut events = self.events.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => service.react(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Service skipped {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        }));

        self.session.start().await;

        let service = self.clone();
        tasks.push(tokio::spawn(async move {
            service.run_autoconnect(Trigger::DaemonStarted).await;
        }));
        tasks
    }

    /// Receiver fired when the daemon should stop
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Disconnect and leave the host without VPN leftovers
    ///
    /// A persistent kill-switch stays enabled.
    pub async fn shutdown(&self) {
        log::info!("Service stopping");
        if let Err(e) = self.engine.disconnect().await {
            log::warn!("Disconnect on shutdown failed: {}", e);
        }
        self.request_shutdown();
        if let Err(e) = self.dns.reset().await {
            log::warn!("DNS not restored: {}", e);
        }
        if !self.firewall.is_persistent() {
            if let Err(e) = self.firewall.set_enabled(false).await {
                log::warn!("Firewall not disabled: {}", e);
            }
        }
    }

    /// Remove everything the daemon configured on the host (`--cleanup`)
    pub async fn cleanup(&self) -> Result<()> {
        let mut result = Ok(());
        if let Err(e) = self.firewall.set_persistent(false).await {
            log::error!("Persistent firewall not disabled: {}", e);
            result = Err(e);
        }
        if let Err(e) = self.firewall.set_enabled(false).await {
            log::error!("Firewall not disabled: {}", e);
            result = Err(e);
        }
        if self.prefs.is_logged_in() {
            if let Err(e) = self.session.logout(true).await {
                log::error!("Logout failed: {}", e);
                result = Err(e);
            }
        }
        result
    }

    async fn react(self: &Arc<Self>, event: DaemonEvent) {
        match event {
            DaemonEvent::AttemptFinished => {
                let session = self.session.clone();
                tokio::spawn(async move {
                    match session.request_status().await {
                        Ok(_) | Err(Error::NotLoggedIn) => {}
                        Err(e) => log::debug!("Session status after connection attempt: {}", e),
                    }
                });
            }
            DaemonEvent::ServersUpdated => self.refresh_api_exceptions().await,
            DaemonEvent::WifiChanged { ssid, is_insecure } => {
                if let Err(e) = self.dns.update_if_wrong_settings().await {
                    log::warn!("DNS check failed: {}", e);
                }
                let service = self.clone();
                tokio::spawn(async move {
                    service
                        .run_autoconnect(Trigger::WifiChanged(WifiState { ssid, is_insecure }))
                        .await;
                });
            }
            _ => {}
        }
    }

    async fn refresh_api_exceptions(&self) {
        let Some(servers) = self.servers.cached() else {
            return;
        };
        let mut ips = servers.api_ips(false);
        ips.extend(servers.api_ips(true));
        if let Err(e) = self.firewall.set_api_server_ips(ips).await {
            log::warn!("API server exceptions not updated: {}", e);
        }
    }

    /// Evaluate auto-connect; failures surface as error events
    pub async fn run_autoconnect(&self, trigger: Trigger) {
        if let Err(e) = self.autoconnect.evaluate(trigger).await {
            log::error!("Automatic connection failed: {}", e);
            self.events
                .on_event(DaemonEvent::Error {
                    message: format!("Automatic connection failed: {}", e),
                    recoverable: true,
                })
                .await;
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub async fn hello_resp(&self) -> HelloResp {
        let prefs = self.prefs.get();
        let mut disabled = self.disabled_functions.clone();
        disabled.split_tunnel_error = self.split_tunnel.availability_error().await.unwrap_or_default();
        HelloResp {
            version: env!("CARGO_PKG_VERSION").to_string(),
            processor_arch: std::env::consts::ARCH.to_string(),
            session: prefs.session.to_resp(),
            account: prefs.account.clone(),
            disabled_functions: disabled,
            dns: self.dns.capabilities().await,
            settings_session_uuid: prefs.settings_session_uuid.clone(),
            paranoid_mode: ParanoidModeStatus {
                is_enabled: self.eaa.is_enabled(),
            },
            daemon_settings: prefs.settings_resp(),
        }
    }

    /// Current tunnel state as the response a client expects
    pub fn vpn_state_resp(&self) -> Response {
        let status = self.engine.status();
        match (&status.info, status.state) {
            (Some(info), VpnState::Connected) => Response::ConnectedResp(connected_resp(info)),
            (_, VpnState::Disconnected) => Response::DisconnectedResp(DisconnectedResp::default()),
            (_, state) => Response::vpn_state(state, ""),
        }
    }

    pub async fn servers_resp(&self) -> Result<Response> {
        let servers = self.servers.get().await?;
        Ok(Response::ServerListResp(ServerListResp {
            vpn_servers: servers.as_ref().clone(),
        }))
    }

    pub async fn wifi_resp(&self) -> Result<Response> {
        let state = self.wifi.current().await?;
        Ok(Response::WiFiCurrentNetworkResp(WiFiCurrentNetworkResp {
            ssid: state.ssid,
            is_insecure_network: state.is_insecure,
        }))
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Serve one authenticated request
    ///
    /// `secret` is the `ProtocolSecret` the request came with.
    pub async fn handle(self: &Arc<Self>, request: Request, secret: &str) -> Result<Response> {
        let resp = match request {
            Request::Hello(_) => return Err(Error::InvalidState("Hello is handled by the server".into())),

            // Session
            Request::SessionNew(req) => {
                let resp = self.session.login(&req).await?;
                if self.prefs.is_logged_in() {
                    let service = self.clone();
                    tokio::spawn(async move { service.run_autoconnect(Trigger::UserSessionLogon).await });
                }
                Response::SessionNewResp(resp)
            }
            Request::SessionDelete(req) => {
                self.session_delete(&req).await?;
                Response::EmptyResp
            }
            Request::AccountStatus => Response::AccountStatusResp(self.session.request_status().await?),
            Request::ParanoidModeSetPassword(req) => {
                self.eaa.set_secret(secret, &req.new_secret).await?;
                self.events.on_event(DaemonEvent::SessionChanged).await;
                Response::EmptyResp
            }

            // Connection
            Request::Connect(req) => {
                self.engine.connect(req.params, false)?;
                Response::EmptyResp
            }
            Request::Disconnect => {
                if !self.engine.is_active() {
                    Response::DisconnectedResp(DisconnectedResp {
                        reason: DisconnectReason::DisconnectRequested,
                        ..Default::default()
                    })
                } else {
                    self.engine.disconnect().await?;
                    Response::EmptyResp
                }
            }
            Request::PauseConnection(req) => {
                self.engine.pause(Duration::from_secs(req.duration)).await?;
                self.vpn_state_resp()
            }
            Request::ResumeConnection => {
                self.engine.resume().await?;
                self.vpn_state_resp()
            }
            Request::GetVPNState => self.vpn_state_resp(),
            Request::ConnectSettings(req) => {
                self.engine.set_connect_settings(req.params)?;
                Response::EmptyResp
            }
            Request::ConnectSettingsGet => Response::ConnectSettingsResp(ConnectSettingsResp {
                params: self.engine.connect_settings(),
            }),

            // Catalog
            Request::GetServers => self.servers_resp().await?,
            Request::PingServers(req) => {
                let servers = self.servers.get().await?;
                let timeout = match req.time_out_ms {
                    0 => DEFAULT_PING_TIMEOUT,
                    ms => Duration::from_millis(ms),
                };
                let opts = SweepOptions {
                    timeout,
                    prioritized: req.vpn_type_prioritization.then_some(req.vpn_type_prioritized),
                    skip_second_phase: req.skip_second_phase,
                };
                let results = self.sweeper.sweep(&servers, opts).await?;
                let mut ping_results: Vec<PingResultType> = results
                    .into_iter()
                    .map(|(ip, ping)| PingResultType {
                        host: ip.to_string(),
                        ping,
                    })
                    .collect();
                ping_results.sort_by(|a, b| a.host.cmp(&b.host));
                Response::PingServersResp(PingServersResp { ping_results })
            }
            Request::CheckAccessiblePorts(req) => {
                let servers = self.servers.get().await?;
                let ports = self.ports.check(&servers, &req.ports_to_test).await?;
                Response::CheckAccessiblePortsResponse(CheckAccessiblePortsResponse { ports })
            }

            // Firewall
            Request::KillSwitchGetStatus => Response::KillSwitchStatusResp(self.firewall.status().await?),
            Request::KillSwitchSetEnabled(req) => {
                self.firewall.set_enabled(req.is_enabled).await?;
                Response::EmptyResp
            }
            Request::KillSwitchSetIsPersistent(req) => {
                self.firewall.set_persistent(req.is_persistent).await?;
                Response::EmptyResp
            }
            Request::KillSwitchSetAllowLan(req) => {
                self.firewall.set_allow_lan(req.allow_lan).await?;
                Response::EmptyResp
            }
            Request::KillSwitchSetAllowLanMulticast(req) => {
                self.firewall.set_allow_lan_multicast(req.allow_lan_multicast).await?;
                Response::EmptyResp
            }
            Request::KillSwitchSetAllowApiServers(req) => {
                self.firewall.set_allow_api_servers(req.is_allow_api_servers).await?;
                Response::EmptyResp
            }
            Request::KillSwitchSetUserExceptions(req) => {
                self.firewall
                    .set_user_exceptions(&req.user_exceptions, req.fail_on_parsing_error)
                    .await?;
                Response::EmptyResp
            }

            // DNS
            Request::SetAlternateDns(req) => self.set_alternate_dns(req).await?,
            Request::GetDnsPredefinedConfigs => Response::DnsPredefinedConfigsResp(DnsPredefinedConfigsResp {
                dns_configs: self.dns.predefined_configs().await?,
            }),

            // Split tunnel
            Request::SplitTunnelGetStatus => Response::SplitTunnelStatus(self.split_tunnel.status().await),
            Request::SplitTunnelSetConfig(req) => {
                self.split_tunnel.set_config(&req).await?;
                Response::EmptyResp
            }
            Request::SplitTunnelAddApp(req) => {
                Response::SplitTunnelAddAppCmdResp(self.split_tunnel.add_app(&req.exec).await?)
            }
            Request::SplitTunnelRemoveApp(req) => {
                self.split_tunnel.remove_app(req.pid, &req.exec).await?;
                Response::EmptyResp
            }
            Request::SplitTunnelAddedPidInfo(req) => {
                self.split_tunnel
                    .added_pid_info(req.pid, &req.exec, &req.cmd_to_execute)
                    .await?;
                Response::EmptyResp
            }

            // Preferences
            Request::SetPreference(req) => {
                self.set_preference(&req.key, &req.value).await?;
                Response::EmptyResp
            }
            Request::SetUserPreferences(req) => {
                self.prefs.update(|p| p.user_prefs = req.user_prefs.clone())?;
                self.dns.apply_user_settings(&req.user_prefs).await?;
                self.events.on_event(DaemonEvent::SettingsChanged).await;
                Response::EmptyResp
            }

            // Tunnel keys
            Request::WireGuardGenerateNewKeys(req) => {
                if !self.prefs.is_logged_in() {
                    return Err(Error::NotLoggedIn);
                }
                self.keys.generate_keys(req.only_update_if_necessary).await?;
                Response::EmptyResp
            }
            Request::WireGuardSetKeysRotationInterval(req) => {
                self.prefs.set_wg_keys_rotation_interval(req.interval)?;
                self.keys.stop_rotation().await;
                if self.prefs.is_logged_in() {
                    self.keys.start_rotation().await?;
                }
                self.events.on_event(DaemonEvent::SessionChanged).await;
                Response::EmptyResp
            }

            // Wi-Fi
            Request::WiFiAvailableNetworks => {
                let networks = self
                    .wifi
                    .available_networks()
                    .await?
                    .into_iter()
                    .map(|ssid| WiFiNetworkInfo { ssid })
                    .collect();
                Response::WiFiAvailableNetworksResp(WiFiAvailableNetworksResp { networks })
            }
            Request::WiFiCurrentNetwork => self.wifi_resp().await?,
            Request::WiFiSettings(req) => {
                let mut params = req.params;
                params.dedup_networks();
                self.prefs.update(|p| p.wifi_control = params)?;
                self.events.on_event(DaemonEvent::SettingsChanged).await;

                let service = self.clone();
                tokio::spawn(async move {
                    let wifi = service.wifi.current().await.unwrap_or_default();
                    service.run_autoconnect(Trigger::WifiChanged(wifi)).await;
                });
                Response::EmptyResp
            }

            // Introspection
            Request::ApiRequest(req) => {
                let mut resp = ApiResponse {
                    api_path: req.api_path.clone(),
                    ..Default::default()
                };
                match self
                    .api
                    .request_by_alias(&req.api_path, req.ip_protocol_required)
                    .await
                {
                    Ok(data) => resp.response_data = String::from_utf8_lossy(&data).into_owned(),
                    Err(e) => resp.error = e.to_string(),
                }
                Response::ApiResponse(resp)
            }
            Request::GenerateDiagnostics => Response::DiagnosticsGeneratedResp(self.diagnostics().await),
            Request::GetInstalledApps(req) => Response::InstalledAppsResp(InstalledAppsResp {
                apps: self.apps.installed_apps(&req.extra_args_json).await?,
            }),
            Request::GetAppIcon(req) => Response::AppIconResp(AppIconResp {
                app_icon: self.apps.app_icon(&req.app_binary_path).await?,
                app_binary_path: req.app_binary_path,
            }),
        };
        Ok(resp)
    }

    async fn session_delete(&self, req: &SessionDelete) -> Result<()> {
        self.engine.disconnect().await?;
        if req.need_to_disable_firewall {
            self.firewall.set_persistent(false).await?;
            self.firewall.set_enabled(false).await?;
        }
        self.session.logout(req.is_can_delete_session_locally).await?;
        if req.need_to_reset_settings {
            log::info!("Resetting settings");
            self.prefs.update(|p| {
                let uuid = p.settings_session_uuid.clone();
                *p = Preferences::default();
                p.settings_session_uuid = uuid;
            })?;
            self.events.on_event(DaemonEvent::SettingsChanged).await;
        }
        Ok(())
    }

    async fn set_alternate_dns(&self, req: SetAlternateDns) -> Result<Response> {
        let multihop = self.engine.connect_settings().is_multihop();
        let dns = if req.anti_tracker.enabled {
            let servers = self.servers.get().await?;
            anti_tracker_dns(&servers, &req.anti_tracker, multihop)?
        } else {
            req.dns.clone()
        };

        let mut params = self.engine.connect_settings();
        params.manual_dns = req.dns;
        params.metadata.anti_tracker = req.anti_tracker;
        self.engine.set_connect_settings(params)?;

        let status = self.engine.status();
        if let (true, Some(info)) = (status.is_connected(), status.info.as_ref()) {
            if let Err(e) = self.dns.set_manual(&dns, info.client_ip).await {
                return Ok(Response::SetAlternateDnsResp(SetAlternateDnsResp {
                    is_success: false,
                    changed_dns: self.dns.current(),
                    error_message: e.to_string(),
                }));
            }
        }
        Ok(Response::SetAlternateDnsResp(SetAlternateDnsResp {
            is_success: true,
            changed_dns: dns,
            error_message: String::new(),
        }))
    }

    async fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        let flag = || {
            value
                .trim()
                .to_ascii_lowercase()
                .parse::<bool>()
                .map_err(|_| Error::InvalidArgument(format!("{}: expected a boolean, got '{}'", key, value)))
        };
        // firewall keys go through the controller so the filter follows
        match key {
            "IsFwPersistant" => self.firewall.set_persistent(flag()?).await?,
            "IsFwAllowLAN" => self.firewall.set_allow_lan(flag()?).await?,
            "IsFwAllowLANMulticast" => self.firewall.set_allow_lan_multicast(flag()?).await?,
            "IsFwAllowApiServers" => self.firewall.set_allow_api_servers(flag()?).await?,
            "FwUserExceptions" => self.firewall.set_user_exceptions(value, false).await?,
            _ => {
                self.prefs.set_preference(key, value)?;
            }
        }
        self.events.on_event(DaemonEvent::SettingsChanged).await;
        Ok(())
    }

    async fn diagnostics(&self) -> DiagnosticsGeneratedResp {
        let service_log = match &self.log_file {
            Some(path) => match tokio::fs::read(path).await {
                Ok(data) => {
                    let start = data.len().saturating_sub(DIAGNOSTICS_LOG_TAIL);
                    String::from_utf8_lossy(&data[start..]).into_owned()
                }
                Err(e) => format!("log file {} not readable: {}", path.display(), e),
            },
            None => String::new(),
        };
        let settings_summary =
            serde_json::to_string_pretty(&self.prefs.get().redacted()).unwrap_or_default();
        DiagnosticsGeneratedResp {
            service_log,
            settings_summary,
            last_error: self.engine.last_error().unwrap_or_default(),
        }
    }
}

/// Wire form of an established connection
pub fn connected_resp(info: &ConnectionInfo) -> ConnectedResp {
    let ip = |ip: Option<std::net::IpAddr>| ip.map(|ip| ip.to_string()).unwrap_or_default();
    ConnectedResp {
        vpn_type: info.vpn_type,
        time_sec_from_1970: info.connected_since,
        client_ip: ip(info.client_ip),
        client_ipv6: ip(info.client_ipv6),
        server_ip: ip(info.server_ip),
        server_port: info.server_port,
        exit_hostname: info.exit_hostname.clone(),
        manual_dns: info.manual_dns.clone(),
        is_tcp: info.is_tcp,
        mtu: info.mtu,
        is_can_pause: info.is_can_pause,
        is_paused: info.is_paused(),
        paused_till: info.paused_till.map(|t| t.to_rfc3339()).unwrap_or_default(),
    }
}
