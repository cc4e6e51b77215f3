//! In-memory doubles of the platform seams
//!
//! Every mock records what it was asked to do so tests can assert on the
//! resulting state instead of on call sequences. [`TestBed`] wires the
//! controllers over the mocks the same way the daemon wires them over the
//! platform helper.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ipnet::IpNet;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};

use warden_proto::api::KemCiphers;
use warden_proto::response::{AppInfo, DisabledFunctions, DnsAbilities, SplitTunnelApp};
use warden_proto::servers::HostInfo;
use warden_proto::types::{PortProtocol, PortSpec, TransportProxy, UserPreferences};
use warden_proto::{AccountStatus, ConnectionParams, DnsSettings, VpnType};

use crate::api::transport::{HttpRequest, HttpResponse, HttpTransport};
use crate::api::ApiClient;
use crate::config::ApiConfig;
use crate::connection::netchange::{RouteWatcher, RoutingChange};
use crate::connection::proxy::{ProxyLauncher, RunningProxy};
use crate::connection::tunnel::{TunnelConfig, TunnelDetails, TunnelEvent, TunnelExit, TunnelFactory, TunnelProcess};
use crate::connection::{ConnectionDeps, ConnectionEngine};
use crate::dns::DnsController;
use crate::eaa::Eaa;
use crate::error::{Error, Result};
use crate::event::ChannelEventHandler;
use crate::firewall::FirewallController;
use crate::kem::{KemAlgorithm, KemHelper, KemKeyPair};
use crate::ping::{PingSweeper, Pinger};
use crate::platform::{
    AppsProvider, ClientConnectedInfo, DnsBackend, FirewallBackend, SplitTunnelBackend, SplitTunnelConfig,
    WifiSource, WifiState,
};
use crate::preferences::{PreferencesStore, SessionCredentials, WgKeys};
use crate::servers::ServersUpdater;
use crate::service::Components;
use crate::session::SessionManager;
use crate::splittun::SplitTunnelController;
use crate::wgkeys::{KeyGenerator, KeysManager};
use crate::wifi::WifiWatcher;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// HTTPS transport
// ============================================================================

/// Answers API requests by path
#[derive(Default)]
pub struct MockHttpTransport {
    responses: Mutex<HashMap<String, serde_json::Value>>,
    failing_targets: Mutex<HashSet<IpAddr>>,
    fail_dns: AtomicBool,
    fail_pins: AtomicBool,
    delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `path` with HTTP 200 and `body`
    pub fn respond(&self, path: &str, body: serde_json::Value) {
        lock(&self.responses).insert(path.to_string(), body);
    }

    /// Fail requests that resolve the host name instead of dialling an IP
    pub fn fail_dns(&self, fail: bool) {
        self.fail_dns.store(fail, Ordering::SeqCst);
    }

    pub fn fail_target(&self, ip: IpAddr) {
        lock(&self.failing_targets).insert(ip);
    }

    pub fn fail_pins(&self, fail: bool) {
        self.fail_pins.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    /// Every attempted request, failed ones included
    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    pub fn clear_requests(&self) {
        lock(&self.requests).clear();
    }
}

#[async_trait]
impl HttpTransport for MockHttpTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        lock(&self.requests).push(request.clone());

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_pins.load(Ordering::SeqCst) {
            return Err(Error::CertificatePinFailure(request.host.clone()));
        }
        match request.target {
            None if self.fail_dns.load(Ordering::SeqCst) => {
                return Err(Error::Http(format!("failed to resolve {}", request.host)));
            }
            Some(ip) if lock(&self.failing_targets).contains(&ip) => {
                return Err(Error::Http(format!("connection to {} refused", ip)));
            }
            _ => {}
        }

        let body = lock(&self.responses)
            .get(&request.path)
            .cloned()
            .ok_or_else(|| Error::Http(format!("no route for {}", request.path)))?;
        Ok(HttpResponse {
            status: 200,
            body: serde_json::to_vec(&body)?,
        })
    }
}

// ============================================================================
// Firewall
// ============================================================================

#[derive(Default)]
struct FirewallState {
    enabled: bool,
    persistent: bool,
    exceptions: HashSet<IpAddr>,
    dns: Option<IpAddr>,
    connected: Option<ClientConnectedInfo>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct MockFirewall {
    state: Mutex<FirewallState>,
}

impl MockFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_on(&self) -> bool {
        lock(&self.state).enabled
    }

    pub fn has_exception(&self, ip: IpAddr) -> bool {
        lock(&self.state).exceptions.contains(&ip)
    }

    /// DNS server the filter lets through
    pub fn dns(&self) -> Option<IpAddr> {
        lock(&self.state).dns
    }

    /// Endpoints of the connected client, if any
    pub fn connected(&self) -> Option<ClientConnectedInfo> {
        lock(&self.state).connected.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    fn record(&self, call: impl Into<String>) -> std::sync::MutexGuard<'_, FirewallState> {
        let mut state = lock(&self.state);
        state.calls.push(call.into());
        state
    }
}

#[async_trait]
impl FirewallBackend for MockFirewall {
    async fn set_enabled(&self, enable: bool) -> Result<()> {
        self.record(format!("set_enabled:{}", enable)).enabled = enable;
        Ok(())
    }

    async fn is_enabled(&self) -> Result<bool> {
        Ok(self.is_on())
    }

    async fn set_persistent(&self, persistent: bool) -> Result<()> {
        let mut state = self.record(format!("set_persistent:{}", persistent));
        state.persistent = persistent;
        if persistent {
            state.enabled = true;
        }
        Ok(())
    }

    async fn allow_lan(&self, allow_lan: bool, allow_multicast: bool) -> Result<()> {
        self.record(format!("allow_lan:{}:{}", allow_lan, allow_multicast));
        Ok(())
    }

    async fn set_user_exceptions(&self, exceptions: &[IpNet]) -> Result<()> {
        self.record(format!("user_exceptions:{}", exceptions.len()));
        Ok(())
    }

    async fn add_hosts_exception(&self, ips: &[IpAddr], _icmp_only: bool, _persistent: bool) -> Result<()> {
        self.record("add_hosts").exceptions.extend(ips.iter().copied());
        Ok(())
    }

    async fn remove_hosts_exception(&self, ips: &[IpAddr], _icmp_only: bool, _persistent: bool) -> Result<()> {
        let mut state = self.record("remove_hosts");
        for ip in ips {
            state.exceptions.remove(ip);
        }
        Ok(())
    }

    async fn client_connected(&self, info: &ClientConnectedInfo) -> Result<()> {
        self.record("client_connected").connected = Some(info.clone());
        Ok(())
    }

    async fn client_disconnected(&self) -> Result<()> {
        self.record("client_disconnected").connected = None;
        Ok(())
    }

    async fn client_paused(&self) -> Result<()> {
        self.record("client_paused");
        Ok(())
    }

    async fn client_resumed(&self) -> Result<()> {
        self.record("client_resumed");
        Ok(())
    }

    async fn on_change_dns(&self, dns: Option<IpAddr>) -> Result<()> {
        self.record("on_change_dns").dns = dns;
        Ok(())
    }
}

// ============================================================================
// DNS
// ============================================================================

#[derive(Default)]
pub struct MockDns {
    system: Mutex<Option<DnsSettings>>,
    paused: AtomicBool,
    user_settings: Mutex<Option<UserPreferences>>,
}

impl MockDns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manual DNS the system currently uses
    pub fn current(&self) -> Option<DnsSettings> {
        lock(&self.system).clone()
    }

    /// Simulate an external change of the system configuration
    pub fn set_system(&self, dns: Option<DnsSettings>) {
        *lock(&self.system) = dns;
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn user_settings(&self) -> Option<UserPreferences> {
        lock(&self.user_settings).clone()
    }
}

#[async_trait]
impl DnsBackend for MockDns {
    async fn set_manual(&self, dns: &DnsSettings, _local_ip: Option<IpAddr>) -> Result<()> {
        self.set_system(Some(dns.clone()));
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.set_system(None);
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self, _dns: &DnsSettings) -> Result<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_user_settings(&self, prefs: &UserPreferences) -> Result<()> {
        *lock(&self.user_settings) = Some(prefs.clone());
        Ok(())
    }

    async fn is_wrong(&self, expected: &DnsSettings) -> Result<bool> {
        Ok(self.current().as_ref() != Some(expected))
    }

    async fn capabilities(&self) -> DnsAbilities {
        DnsAbilities {
            can_use_dns_over_tls: false,
            can_use_dns_over_https: true,
        }
    }

    async fn predefined_configs(&self) -> Result<Vec<DnsSettings>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Split tunnel
// ============================================================================

pub struct MockSplitTunnel {
    by_path: bool,
    unavailable: Mutex<Option<String>>,
    configs: Mutex<Vec<SplitTunnelConfig>>,
    apps: Mutex<Vec<SplitTunnelApp>>,
}

impl MockSplitTunnel {
    pub fn new(identifies_by_path: bool) -> Self {
        Self {
            by_path: identifies_by_path,
            unavailable: Mutex::new(None),
            configs: Mutex::new(Vec::new()),
            apps: Mutex::new(Vec::new()),
        }
    }

    pub fn set_unavailable(&self, reason: Option<String>) {
        *lock(&self.unavailable) = reason;
    }

    pub fn last_config(&self) -> Option<SplitTunnelConfig> {
        lock(&self.configs).last().cloned()
    }

    pub fn apply_count(&self) -> usize {
        lock(&self.configs).len()
    }
}

#[async_trait]
impl SplitTunnelBackend for MockSplitTunnel {
    async fn availability_error(&self) -> Option<String> {
        lock(&self.unavailable).clone()
    }

    fn identifies_apps_by_path(&self) -> bool {
        self.by_path
    }

    async fn apply_config(&self, config: &SplitTunnelConfig) -> Result<()> {
        lock(&self.configs).push(config.clone());
        Ok(())
    }

    async fn is_app_running(&self, _exec: &str) -> Result<bool> {
        Ok(false)
    }

    async fn add_pid(&self, pid: i32, exec: &str) -> Result<()> {
        let mut apps = lock(&self.apps);
        apps.retain(|a| a.pid != pid);
        apps.push(SplitTunnelApp {
            pid,
            exec: exec.to_string(),
            cmd: exec.to_string(),
        });
        Ok(())
    }

    async fn remove_pid(&self, pid: i32) -> Result<()> {
        lock(&self.apps).retain(|a| a.pid != pid);
        Ok(())
    }

    async fn running_apps(&self) -> Result<Vec<SplitTunnelApp>> {
        Ok(lock(&self.apps).clone())
    }
}

// ============================================================================
// Keys
// ============================================================================

/// KEM helper with predictable keys and secrets
#[derive(Default)]
pub struct MockKem;

impl MockKem {
    pub fn new() -> Self {
        Self
    }

    /// Ciphers for both algorithms as the API would return them
    pub fn ciphers() -> KemCiphers {
        KemCiphers {
            kyber1024: "c1".into(),
            mceliece348864: "c2".into(),
        }
    }

    /// Pre-shared key derived from [`Self::ciphers`]
    pub fn expected_psk() -> String {
        BASE64.encode(Sha256::digest(b"secret-c1secret-c2"))
    }
}

#[async_trait]
impl KemHelper for MockKem {
    async fn generate_keys(&self, algorithm: KemAlgorithm) -> Result<KemKeyPair> {
        Ok(KemKeyPair {
            private_key: format!("priv-{}", algorithm.name()),
            public_key: format!("pub-{}", algorithm.name()),
        })
    }

    async fn decode_cipher(&self, _algorithm: KemAlgorithm, _private_key: &str, cipher: &str) -> Result<String> {
        Ok(BASE64.encode(format!("secret-{}", cipher)))
    }
}

/// Hands out `pub-N`/`priv-N`, counting from 1
#[derive(Default)]
pub struct MockKeyGenerator {
    counter: AtomicUsize,
}

impl MockKeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyGenerator for MockKeyGenerator {
    async fn generate(&self) -> Result<(String, String)> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((format!("pub-{}", n), format!("priv-{}", n)))
    }
}

// ============================================================================
// Ping, Wi-Fi, apps
// ============================================================================

/// Answers after a configured round-trip time; unknown hosts never answer
#[derive(Default)]
pub struct MockPinger {
    rtt: Mutex<HashMap<IpAddr, Duration>>,
}

impl MockPinger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rtt(&self, ip: IpAddr, rtt: Duration) {
        lock(&self.rtt).insert(ip, rtt);
    }
}

#[async_trait]
impl Pinger for MockPinger {
    async fn ping(&self, ip: IpAddr, timeout: Duration) -> Option<Duration> {
        let rtt = lock(&self.rtt).get(&ip).copied();
        match rtt {
            Some(rtt) if rtt <= timeout => {
                tokio::time::sleep(rtt).await;
                Some(rtt)
            }
            _ => {
                tokio::time::sleep(timeout).await;
                None
            }
        }
    }
}

#[derive(Default)]
pub struct MockWifi {
    current: Mutex<WifiState>,
    available: Mutex<Vec<String>>,
}

impl MockWifi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, state: WifiState) {
        *lock(&self.current) = state;
    }

    pub fn set_available(&self, networks: Vec<String>) {
        *lock(&self.available) = networks;
    }
}

#[async_trait]
impl WifiSource for MockWifi {
    async fn current_network(&self) -> Result<WifiState> {
        Ok(lock(&self.current).clone())
    }

    async fn available_networks(&self) -> Result<Vec<String>> {
        Ok(lock(&self.available).clone())
    }
}

#[derive(Default)]
pub struct MockAppsProvider {
    apps: Mutex<Vec<AppInfo>>,
}

impl MockAppsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_apps(&self, apps: Vec<AppInfo>) {
        *lock(&self.apps) = apps;
    }
}

#[async_trait]
impl AppsProvider for MockAppsProvider {
    async fn installed_apps(&self, _extra_args_json: &str) -> Result<Vec<AppInfo>> {
        Ok(lock(&self.apps).clone())
    }

    async fn app_icon(&self, binary_path: &str) -> Result<String> {
        Ok(BASE64.encode(binary_path))
    }
}

// ============================================================================
// Tunnels
// ============================================================================

/// Tunnel that comes up on its own and runs until told to stop
pub struct MockTunnel {
    config: TunnelConfig,
    connect_delay: Duration,
    early_exit: Option<TunnelExit>,
    exit: watch::Sender<Option<TunnelExit>>,
    paused: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MockTunnel {
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// End the tunnel as if the engine process had exited
    pub fn exit(&self, exit: TunnelExit) {
        self.exit.send_replace(Some(exit));
    }

    async fn wait_exit(&self) -> TunnelExit {
        let mut rx = self.exit.subscribe();
        loop {
            if let Some(exit) = rx.borrow_and_update().clone() {
                return exit;
            }
            if rx.changed().await.is_err() {
                return TunnelExit::Normal;
            }
        }
    }
}

#[async_trait]
impl TunnelProcess for MockTunnel {
    async fn run(&self, events: mpsc::Sender<TunnelEvent>) -> Result<TunnelExit> {
        lock(&self.calls).push("run".into());
        if let Some(exit) = self.early_exit.clone() {
            return Ok(exit);
        }

        let _ = events
            .send(TunnelEvent::Initialised {
                tunnel_ip: self.config.local_ip,
            })
            .await;

        tokio::select! {
            exit = self.wait_exit() => return Ok(exit),
            _ = tokio::time::sleep(self.connect_delay) => {}
        }

        let _ = events
            .send(TunnelEvent::Connected(TunnelDetails {
                client_ip: self.config.local_ip,
                client_ipv6: self.config.local_ipv6,
                client_port: 51820,
            }))
            .await;
        Ok(self.wait_exit().await)
    }

    async fn disconnect(&self) -> Result<()> {
        lock(&self.calls).push("disconnect".into());
        self.exit.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(TunnelExit::Normal);
                true
            } else {
                false
            }
        });
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        lock(&self.calls).push("pause".into());
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        lock(&self.calls).push("resume".into());
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn default_dns(&self) -> Option<IpAddr> {
        self.config.default_dns
    }
}

#[derive(Default)]
struct TunnelBehaviour {
    create_error: Option<String>,
    early_exit: Option<TunnelExit>,
    connect_delay: Duration,
}

#[derive(Default)]
pub struct MockTunnelFactory {
    behaviour: Mutex<TunnelBehaviour>,
    created: Mutex<Vec<Arc<MockTunnel>>>,
}

impl MockTunnelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make [`TunnelFactory::create`] fail
    pub fn fail_create(&self, error: Option<String>) {
        lock(&self.behaviour).create_error = error;
    }

    /// New tunnels end with `exit` before reporting anything
    pub fn exit_at_start(&self, exit: Option<TunnelExit>) {
        lock(&self.behaviour).early_exit = exit;
    }

    /// Time between `Initialised` and `Connected`
    pub fn set_connect_delay(&self, delay: Duration) {
        lock(&self.behaviour).connect_delay = delay;
    }

    pub fn created(&self) -> usize {
        lock(&self.created).len()
    }

    pub fn configs(&self) -> Vec<TunnelConfig> {
        lock(&self.created).iter().map(|t| t.config.clone()).collect()
    }

    pub fn last(&self) -> Option<Arc<MockTunnel>> {
        lock(&self.created).last().cloned()
    }
}

#[async_trait]
impl TunnelFactory for MockTunnelFactory {
    async fn create(&self, config: TunnelConfig) -> Result<Arc<dyn TunnelProcess>> {
        let (early_exit, connect_delay) = {
            let behaviour = lock(&self.behaviour);
            if let Some(e) = &behaviour.create_error {
                return Err(Error::Connection(e.clone()));
            }
            (behaviour.early_exit.clone(), behaviour.connect_delay)
        };

        let tunnel = Arc::new(MockTunnel {
            config,
            connect_delay,
            early_exit,
            exit: watch::channel(None).0,
            paused: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        });
        lock(&self.created).push(tunnel.clone());
        Ok(tunnel)
    }
}

// ============================================================================
// Routes and proxies
// ============================================================================

#[derive(Default)]
pub struct MockRouteWatcher {
    notify: Mutex<Option<mpsc::Sender<RoutingChange>>>,
    starts: AtomicUsize,
}

impl MockRouteWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.notify).is_some()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Report a routing change; false when nothing watches
    pub async fn trigger(&self, change: RoutingChange) -> bool {
        let notify = lock(&self.notify).clone();
        match notify {
            Some(tx) => tx.send(change).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl RouteWatcher for MockRouteWatcher {
    async fn start(&self, _tunnel_ip: IpAddr, notify: mpsc::Sender<RoutingChange>) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *lock(&self.notify) = Some(notify);
        Ok(())
    }

    async fn stop(&self) {
        lock(&self.notify).take();
    }
}

pub struct MockProxyLauncher {
    next_port: AtomicU16,
    starts: Mutex<Vec<(TransportProxy, SocketAddr)>>,
}

impl Default for MockProxyLauncher {
    fn default() -> Self {
        Self {
            next_port: AtomicU16::new(40000),
            starts: Mutex::new(Vec::new()),
        }
    }
}

impl MockProxyLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starts(&self) -> Vec<(TransportProxy, SocketAddr)> {
        lock(&self.starts).clone()
    }
}

#[async_trait]
impl ProxyLauncher for MockProxyLauncher {
    async fn start(&self, kind: TransportProxy, remote: SocketAddr) -> Result<RunningProxy> {
        lock(&self.starts).push((kind, remote));
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        Ok(RunningProxy::detached(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)))
    }
}

// ============================================================================
// Test bed
// ============================================================================

/// Entry server used by [`TestBed::connect_params`]
pub const TEST_SERVER_IP: &str = "198.51.100.20";

/// Controllers wired over the mocks, with state kept under `dir`
///
/// # Panics
///
/// Construction panics when the API client cannot be built; this is a test
/// harness only.
pub struct TestBed {
    pub prefs: Arc<PreferencesStore>,
    pub transport: Arc<MockHttpTransport>,
    pub api: Arc<ApiClient>,
    pub firewall_backend: Arc<MockFirewall>,
    pub firewall: Arc<FirewallController>,
    pub dns_backend: Arc<MockDns>,
    pub dns: Arc<DnsController>,
    pub split_backend: Arc<MockSplitTunnel>,
    pub split_tunnel: Arc<SplitTunnelController>,
    pub kem: Arc<MockKem>,
    pub keygen: Arc<MockKeyGenerator>,
    pub keys: Arc<KeysManager>,
    pub session: Arc<SessionManager>,
    pub servers: Arc<ServersUpdater>,
    pub tunnels: Arc<MockTunnelFactory>,
    pub routes: Arc<MockRouteWatcher>,
    pub proxies: Arc<MockProxyLauncher>,
    pub events: Arc<ChannelEventHandler>,
    pub pinger: Arc<MockPinger>,
    pub wifi: Arc<MockWifi>,
    pub apps: Arc<MockAppsProvider>,
}

impl TestBed {
    pub fn new(dir: &Path) -> Self {
        let events = Arc::new(ChannelEventHandler::new(256));
        let prefs = Arc::new(PreferencesStore::load(dir.join("settings.json")));
        let transport = Arc::new(MockHttpTransport::new());
        let api = Arc::new(
            ApiClient::new(transport.clone(), &ApiConfig::default(), "Linux").expect("API client"),
        );

        let firewall_backend = Arc::new(MockFirewall::new());
        let firewall = Arc::new(FirewallController::new(
            firewall_backend.clone(),
            prefs.clone(),
            events.clone(),
        ));
        let dns_backend = Arc::new(MockDns::new());
        let dns = Arc::new(DnsController::new(dns_backend.clone(), firewall.clone(), events.clone()));
        let split_backend = Arc::new(MockSplitTunnel::new(false));
        let split_tunnel = Arc::new(SplitTunnelController::new(
            split_backend.clone(),
            prefs.clone(),
            events.clone(),
        ));

        let kem = Arc::new(MockKem::new());
        let keygen = Arc::new(MockKeyGenerator::new());
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
            kem.clone(),
            keygen.clone(),
            keys.clone(),
            events.clone(),
        );
        let servers = Arc::new(ServersUpdater::new(api.clone(), dir.join("servers.json"), events.clone()));

        Self {
            prefs,
            transport,
            api,
            firewall_backend,
            firewall,
            dns_backend,
            dns,
            split_backend,
            split_tunnel,
            kem,
            keygen,
            keys,
            session,
            servers,
            tunnels: Arc::new(MockTunnelFactory::new()),
            routes: Arc::new(MockRouteWatcher::new()),
            proxies: Arc::new(MockProxyLauncher::new()),
            events,
            pinger: Arc::new(MockPinger::new()),
            wifi: Arc::new(MockWifi::new()),
            apps: Arc::new(MockAppsProvider::new()),
        }
    }

    /// Store a session with fresh tunnel keys, so no key update is due
    pub fn logged_in(self) -> Self {
        self.prefs
            .set_session(
                AccountStatus {
                    active: true,
                    current_plan: "Pro".into(),
                    capabilities: vec!["multihop".into()],
                    ..Default::default()
                },
                SessionCredentials {
                    account_id: "i-AAAA-BBBB-CCCC".into(),
                    session: "tok".into(),
                    vpn_user: "u".into(),
                    vpn_pass: "p".into(),
                    wg: WgKeys {
                        public_key: "pub-0".into(),
                        private_key: "priv-0".into(),
                        local_ip: "10.0.0.2".into(),
                        preshared_key: String::new(),
                    },
                },
            )
            .expect("store session");
        self
    }

    pub fn connection_deps(&self) -> ConnectionDeps {
        ConnectionDeps {
            prefs: self.prefs.clone(),
            firewall: self.firewall.clone(),
            dns: self.dns.clone(),
            split_tunnel: self.split_tunnel.clone(),
            keys: self.keys.clone(),
            servers: self.servers.clone(),
            tunnels: self.tunnels.clone(),
            routes: self.routes.clone(),
            proxies: self.proxies.clone(),
            events: self.events.clone(),
        }
    }

    /// Service components over the mocks; the EAA secret lives in `dir`
    pub fn components(&self, dir: &Path) -> Components {
        Components {
            prefs: self.prefs.clone(),
            api: self.api.clone(),
            firewall: self.firewall.clone(),
            dns: self.dns.clone(),
            split_tunnel: self.split_tunnel.clone(),
            keys: self.keys.clone(),
            session: self.session.clone(),
            servers: self.servers.clone(),
            engine: ConnectionEngine::new(self.connection_deps()),
            sweeper: Arc::new(PingSweeper::new(
                self.pinger.clone(),
                self.firewall.clone(),
                self.events.clone(),
            )),
            wifi: Arc::new(WifiWatcher::new(self.wifi.clone(), self.events.clone())),
            apps: self.apps.clone(),
            eaa: Arc::new(Eaa::load(dir.join("eaa"))),
            events: self.events.clone(),
            disabled_functions: DisabledFunctions::default(),
            log_file: None,
        }
    }

    /// Single-hop W-Tunnel request to [`TEST_SERVER_IP`]
    pub fn connect_params(&self) -> ConnectionParams {
        let mut params = ConnectionParams {
            vpn_type: VpnType::WTunnel,
            ..Default::default()
        };
        params.w_tunnel.port = PortSpec {
            port: 2049,
            protocol: PortProtocol::Udp,
        };
        params.w_tunnel.entry_vpn_server.hosts = vec![test_host("nl1", TEST_SERVER_IP, 0)];
        params
    }
}

/// Gateway host with a valid tunnel public key
pub fn test_host(name: &str, ip: &str, multihop_port: u16) -> HostInfo {
    HostInfo {
        hostname: format!("{}.wg.example.net", name),
        host: ip.into(),
        public_key: BASE64.encode([7u8; 32]),
        local_ip: "172.16.0.1/12".into(),
        multihop_port,
        v2ray: "198.51.100.99".into(),
        ..Default::default()
    }
}
