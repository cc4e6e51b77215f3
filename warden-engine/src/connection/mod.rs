//! Connection engine
//!
//! Connect requests go through a one-slot queue served by a single worker.
//! A new request replaces an unprocessed one and silently stops the active
//! attempt. The worker keeps the tunnel alive (reconnecting after a drop)
//! until the client asks to disconnect or a successor request arrives.
//!
//! Every attempt records what it changed (firewall, exceptions, DNS, proxy,
//! route watcher) and undoes it in reverse order before `Disconnected` is
//! reported.

pub mod netchange;
pub mod params;
pub mod proxy;
pub mod tunnel;

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::pin::pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use warden_proto::servers::HostInfo;
use warden_proto::types::{ConnectionParams, PortProtocol, TransportProxy};
use warden_proto::{DisconnectReason, DnsSettings, VpnState, VpnType};

use crate::dns::{anti_tracker_dns, DnsController};
use crate::error::{Error, Result};
use crate::event::{ConnectionInfo, DaemonEvent, EventHandler};
use crate::firewall::FirewallController;
use crate::netinfo;
use crate::platform::{ClientConnectedInfo, SplitTunnelAddresses};
use crate::preferences::{Preferences, PreferencesStore};
use crate::servers::ServersUpdater;
use crate::splittun::SplitTunnelController;
use crate::wgkeys::KeysManager;

use netchange::{RouteWatcher, RoutingChange};
use proxy::{ProxyLauncher, RunningProxy};
use tunnel::{TunnelConfig, TunnelEvent, TunnelExit, TunnelFactory, TunnelProcess};

/// A connection that lasted at least this long is retried without delay
pub const FAST_RECONNECT_AFTER: Duration = Duration::from_secs(30);
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const MIN_PAUSE: Duration = Duration::from_secs(1);
const PAUSE_TICK: Duration = Duration::from_secs(1);

/// What the worker should do with the current tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredState {
    Disconnect,
    Connect,
    /// Reached after the first `Connected`; drops are reconnected
    KeepConnection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    DisconnectRequested,
    Superseded,
}

/// State reported to clients
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VpnStatus {
    pub state: VpnState,
    /// Set while connected (and paused)
    pub info: Option<ConnectionInfo>,
}

impl VpnStatus {
    pub fn is_connected(&self) -> bool {
        self.state == VpnState::Connected && self.info.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.info.as_ref().is_some_and(|i| i.is_paused())
    }
}

/// Everything the engine drives
#[derive(Clone)]
pub struct ConnectionDeps {
    pub prefs: Arc<PreferencesStore>,
    pub firewall: Arc<FirewallController>,
    pub dns: Arc<DnsController>,
    pub split_tunnel: Arc<SplitTunnelController>,
    pub keys: Arc<KeysManager>,
    pub servers: Arc<ServersUpdater>,
    pub tunnels: Arc<dyn TunnelFactory>,
    pub routes: Arc<dyn RouteWatcher>,
    pub proxies: Arc<dyn ProxyLauncher>,
    pub events: Arc<dyn EventHandler>,
}

struct Queue {
    pending: Option<ConnectionParams>,
    required: RequiredState,
    running: bool,
}

struct ActiveAttempt {
    stop: mpsc::UnboundedSender<StopReason>,
    tunnel: Option<Arc<dyn TunnelProcess>>,
}

/// Side effects of one attempt, undone by [`ConnectionEngine::cleanup`]
#[derive(Default)]
struct Undo {
    disable_firewall: bool,
    exceptions: Vec<IpAddr>,
    proxy: Option<RunningProxy>,
    route_watcher: bool,
    tunnel_started: bool,
    connected: bool,
}

/// How one attempt ended
struct AttemptEnd {
    exit: TunnelExit,
    stopped: Option<StopReason>,
    error: Option<Error>,
}

impl AttemptEnd {
    fn stopped(reason: StopReason) -> Self {
        Self {
            exit: TunnelExit::Normal,
            stopped: Some(reason),
            error: None,
        }
    }
}

pub struct ConnectionEngine {
    deps: ConnectionDeps,

    queue: Mutex<Queue>,
    /// Bumped whenever the queue or the required state changes
    queue_gen: watch::Sender<u64>,
    running: watch::Sender<bool>,

    connect_lock: tokio::sync::Mutex<()>,
    pause_lock: tokio::sync::Mutex<()>,

    status: RwLock<VpnStatus>,
    active: Mutex<Option<ActiveAttempt>>,
    addresses: Mutex<SplitTunnelAddresses>,

    staged: Mutex<Option<ConnectionParams>>,
    last_error: Mutex<Option<String>>,
}

impl ConnectionEngine {
    pub fn new(deps: ConnectionDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            queue: Mutex::new(Queue {
                pending: None,
                required: RequiredState::Disconnect,
                running: false,
            }),
            queue_gen: watch::channel(0).0,
            running: watch::channel(false).0,
            connect_lock: tokio::sync::Mutex::new(()),
            pause_lock: tokio::sync::Mutex::new(()),
            status: RwLock::new(VpnStatus::default()),
            active: Mutex::new(None),
            addresses: Mutex::new(SplitTunnelAddresses::default()),
            staged: Mutex::new(None),
            last_error: Mutex::new(None),
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn status(&self) -> VpnStatus {
        self.status.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn required_state(&self) -> RequiredState {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).required
    }

    /// An attempt is queued or in progress
    pub fn is_active(&self) -> bool {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.running || queue.pending.is_some()
    }

    pub fn is_w_tunnel_connected(&self) -> bool {
        let status = self.status();
        status.is_connected()
            && status
                .info
                .as_ref()
                .is_some_and(|i| i.vpn_type == VpnType::WTunnel)
    }

    /// Tunnel and outbound addresses of the current attempt
    pub fn addresses(&self) -> SplitTunnelAddresses {
        self.addresses.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ========================================================================
    // Last-used parameters
    // ========================================================================

    /// Store the last-used parameters; staged until an active attempt ends
    pub fn set_connect_settings(&self, params: ConnectionParams) -> Result<()> {
        if self.is_active() {
            log::debug!("Connection active; connect settings staged");
            *self.staged.lock().unwrap_or_else(|e| e.into_inner()) = Some(params);
            return Ok(());
        }
        self.deps
            .prefs
            .update(|p| p.last_connection_params = params)
    }

    pub fn connect_settings(&self) -> ConnectionParams {
        if let Some(staged) = self.staged.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return staged;
        }
        self.deps.prefs.get().last_connection_params
    }

    fn apply_staged_settings(&self) {
        let staged = self.staged.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(params) = staged {
            if let Err(e) = self.deps.prefs.update(|p| p.last_connection_params = params) {
                log::error!("Failed to store staged connect settings: {}", e);
            }
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Queue a connection request
    ///
    /// The parameters are validated before anything else happens; an older
    /// unprocessed request is replaced and an active attempt is stopped
    /// without reporting `Disconnected`.
    pub fn connect(&self, params: ConnectionParams, can_fix_multihop: bool) -> Result<()> {
        let prefs = self.deps.prefs.get();
        if !prefs.session.is_logged_in() {
            return Err(Error::NotLoggedIn);
        }
        let normalized = params::normalize(&params, &prefs.account, can_fix_multihop)?;

        self.deps
            .prefs
            .update(|p| p.last_connection_params = params.clone())?;

        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.pending.is_some() {
                log::info!("Replacing unprocessed connection request");
            }
            queue.pending = Some(normalized);
            queue.required = RequiredState::Connect;
        }
        self.stop_active(StopReason::Superseded);
        self.queue_gen.send_modify(|g| *g += 1);
        Ok(())
    }

    /// Stop the tunnel and wait until the attempt is cleaned up
    pub async fn disconnect(&self) -> Result<()> {
        let running = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.pending = None;
            queue.required = RequiredState::Disconnect;
            queue.running
        };
        self.queue_gen.send_modify(|g| *g += 1);
        if !running {
            return Ok(());
        }

        log::info!("Disconnect requested");
        self.stop_active(StopReason::DisconnectRequested);

        let mut rx = self.running.subscribe();
        rx.wait_for(|running| !running)
            .await
            .map_err(|_| Error::Shutdown)?;
        Ok(())
    }

    fn stop_active(&self, reason: StopReason) {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(active) = active.as_ref() {
            let _ = active.stop.send(reason);
        }
    }

    fn should_stop(&self) -> Option<StopReason> {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.required == RequiredState::Disconnect {
            Some(StopReason::DisconnectRequested)
        } else if queue.pending.is_some() {
            Some(StopReason::Superseded)
        } else {
            None
        }
    }

    fn has_pending(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .is_some()
    }

    fn promote_required(&self) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.required == RequiredState::Connect {
            queue.required = RequiredState::KeepConnection;
        }
    }

    // ========================================================================
    // Worker
    // ========================================================================

    /// Serve queued requests until shutdown
    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let engine = self.clone();
        let mut gen = self.queue_gen.subscribe();
        tokio::spawn(async move {
            loop {
                gen.borrow_and_update();
                let request = {
                    let mut queue = engine.queue.lock().unwrap_or_else(|e| e.into_inner());
                    let request = queue.pending.take();
                    if request.is_some() {
                        queue.running = true;
                    }
                    request
                };

                if let Some(params) = request {
                    engine.running.send_replace(true);
                    engine.process(params).await;
                    continue;
                }

                tokio::select! {
                    changed = gen.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.recv() => {
                        log::debug!("Connection worker stopping");
                        break;
                    }
                }
            }
        })
    }

    async fn process(self: &Arc<Self>, params: ConnectionParams) {
        let (reason, error) = self.keep_connection(params).await;

        self.set_status(VpnStatus::default());

        let failure = error.is_some();
        let description = error.as_ref().map(|e| e.to_string()).unwrap_or_default();
        if let Some(e) = &error {
            log::error!("Connection failed: {}", e);
            *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(e.to_string());
        }

        if self.has_pending() {
            log::debug!("Successor request queued; Disconnected not reported");
        } else {
            self.deps
                .events
                .on_event(DaemonEvent::Disconnected {
                    failure,
                    reason,
                    description,
                })
                .await;
        }

        self.queue.lock().unwrap_or_else(|e| e.into_inner()).running = false;
        self.apply_staged_settings();
        self.running.send_replace(false);
        self.deps.events.on_event(DaemonEvent::AttemptFinished).await;
    }

    /// Run attempts until the required state says stop
    async fn keep_connection(&self, params: ConnectionParams) -> (DisconnectReason, Option<Error>) {
        self.set_state(VpnState::Connecting, "").await;

        loop {
            let started = Instant::now();
            let end = match self.connect_once(&params).await {
                Ok(end) => end,
                Err(e) if self.required_state() != RequiredState::KeepConnection => {
                    return (DisconnectReason::Unknown, Some(e));
                }
                Err(e) => {
                    log::error!("Reconnection attempt failed: {}", e);
                    AttemptEnd {
                        exit: TunnelExit::Error(e.to_string()),
                        stopped: None,
                        error: None,
                    }
                }
            };

            if let Some(reason) = end.stopped.or_else(|| self.should_stop()) {
                let reason = match reason {
                    StopReason::DisconnectRequested => DisconnectReason::DisconnectRequested,
                    StopReason::Superseded => DisconnectReason::Unknown,
                };
                return (reason, end.error);
            }
            if let Some(e) = end.error {
                if self.required_state() != RequiredState::KeepConnection {
                    return (DisconnectReason::Unknown, Some(e));
                }
                log::error!("Connection dropped: {}", e);
            }

            match &end.exit {
                TunnelExit::AuthenticationFailure => {
                    return (
                        DisconnectReason::AuthenticationError,
                        Some(Error::AuthenticationFailure),
                    );
                }
                TunnelExit::Error(message) if self.required_state() != RequiredState::KeepConnection => {
                    return (DisconnectReason::Unknown, Some(Error::Connection(message.clone())));
                }
                _ => {}
            }

            if self.required_state() != RequiredState::KeepConnection {
                return (DisconnectReason::Unknown, None);
            }

            let delay = if end.exit == TunnelExit::ReconnectRequired || started.elapsed() >= FAST_RECONNECT_AFTER {
                Duration::ZERO
            } else {
                RECONNECT_DELAY
            };
            self.set_state(VpnState::Reconnecting, "").await;
            log::info!("Reconnecting in {:?}", delay);
            if !self.wait_reconnect_delay(delay).await {
                let reason = match self.should_stop() {
                    Some(StopReason::DisconnectRequested) => DisconnectReason::DisconnectRequested,
                    _ => DisconnectReason::Unknown,
                };
                return (reason, None);
            }
        }
    }

    /// Sleep unless a request changes the plan; false when reconnecting is cancelled
    async fn wait_reconnect_delay(&self, delay: Duration) -> bool {
        let mut gen = self.queue_gen.subscribe();
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            gen.borrow_and_update();
            if self.should_stop().is_some() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                changed = gen.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    // ========================================================================
    // One attempt
    // ========================================================================

    async fn connect_once(&self, params: &ConnectionParams) -> Result<AttemptEnd> {
        let _guard = self.connect_lock.lock().await;

        let (stop_tx, mut stop_rx) = mpsc::unbounded_channel();
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(ActiveAttempt {
            stop: stop_tx,
            tunnel: None,
        });
        if let Some(reason) = self.should_stop() {
            self.active.lock().unwrap_or_else(|e| e.into_inner()).take();
            return Ok(AttemptEnd::stopped(reason));
        }

        let prefs = self.deps.prefs.get();
        let mut params = params.clone();
        let inverse_split = prefs.is_split_tunnel && prefs.is_split_tunnel_inversed;
        if inverse_split {
            // this attempt only; the stored parameters keep the flags
            params.firewall_on = false;
            params.firewall_on_during_connection = false;
        }

        let mut undo = Undo::default();
        let result = self
            .bring_up(&params, &prefs, inverse_split, &mut undo, &mut stop_rx)
            .await;
        self.cleanup(undo).await;
        self.active.lock().unwrap_or_else(|e| e.into_inner()).take();
        result
    }

    async fn bring_up(
        &self,
        params: &ConnectionParams,
        prefs: &Preferences,
        inverse_split: bool,
        undo: &mut Undo,
        stop_rx: &mut mpsc::UnboundedReceiver<StopReason>,
    ) -> Result<AttemptEnd> {
        self.detect_outbound_addresses(params.ipv6).await;

        let (mut config, server) = self.tunnel_config(params).await?;
        let manual_dns = self.resolve_dns(params)?;

        // firewall before anything leaves the host
        let firewall = &self.deps.firewall;
        firewall.on_change_dns(None).await?;
        let firewall_enabled = firewall.is_enabled().await?;
        if !firewall_enabled {
            if params.firewall_on {
                log::info!("Enabling kill-switch before connecting");
                firewall.set_enabled(true).await?;
            } else if params.firewall_on_during_connection {
                log::info!("Enabling kill-switch for the connection");
                firewall.set_enabled(true).await?;
                undo.disable_firewall = true;
            }
        }

        let mut exceptions = vec![server.ip()];
        let proxy_remote = match params.transport_proxy {
            TransportProxy::None => None,
            kind => {
                let entry = params
                    .entry_hosts()
                    .first()
                    .ok_or_else(|| Error::InvalidArgument("no entry host".into()))?;
                let ip: IpAddr = entry.v2ray.trim().parse().map_err(|_| {
                    Error::InvalidArgument(format!("no transport proxy endpoint for {}", entry.hostname))
                })?;
                exceptions.push(ip);
                Some((kind, SocketAddr::new(ip, config.remote.port())))
            }
        };
        exceptions.dedup();
        firewall.add_hosts_exception(&exceptions, false, false).await?;
        undo.exceptions = exceptions;

        if let Err(e) = self.deps.dns.apply_user_settings(&prefs.user_prefs).await {
            log::warn!("Failed to apply DNS user settings: {}", e);
        }

        if let Some((kind, remote)) = proxy_remote {
            let proxy = self.deps.proxies.start(kind, remote).await?;
            config.remote = proxy.local;
            undo.proxy = Some(proxy);
        }

        if let Some(reason) = self.should_stop() {
            return Ok(AttemptEnd::stopped(reason));
        }

        let tunnel = self.deps.tunnels.create(config.clone()).await?;
        if let Some(active) = self.active.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
            active.tunnel = Some(tunnel.clone());
        }
        undo.tunnel_started = true;

        let ctx = AttemptContext {
            params,
            config: &config,
            server,
            manual_dns,
            inverse_split,
        };
        self.run_tunnel(&ctx, tunnel, undo, stop_rx).await
    }

    async fn run_tunnel(
        &self,
        ctx: &AttemptContext<'_>,
        tunnel: Arc<dyn TunnelProcess>,
        undo: &mut Undo,
        stop_rx: &mut mpsc::UnboundedReceiver<StopReason>,
    ) -> Result<AttemptEnd> {
        let (event_tx, mut event_rx) = mpsc::channel(32);
        let (route_tx, mut route_rx) = mpsc::channel(8);
        let mut run = pin!(tunnel.run(event_tx));
        let mut ticker = tokio::time::interval(PAUSE_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut stopped = None;
        let mut error = None;
        let mut events_open = true;

        let exit = loop {
            tokio::select! {
                exit = &mut run => break exit?,

                event = event_rx.recv(), if events_open => {
                    let Some(event) = event else {
                        events_open = false;
                        continue;
                    };
                    if let Err(e) = self.on_tunnel_event(ctx, event, &tunnel, &route_tx, undo).await {
                        log::error!("Connection setup failed: {}", e);
                        error.get_or_insert(e);
                        let _ = tunnel.disconnect().await;
                    }
                }

                Some(change) = route_rx.recv() => {
                    self.on_routing_change(change, &tunnel, undo).await;
                }

                Some(reason) = stop_rx.recv(), if stopped.is_none() => {
                    log::info!("Stopping tunnel ({:?})", reason);
                    stopped = Some(reason);
                    if let Err(e) = tunnel.disconnect().await {
                        log::warn!("Tunnel disconnect failed: {}", e);
                    }
                }

                _ = ticker.tick() => self.check_pause_deadline().await,
            }
        };

        Ok(AttemptEnd {
            exit,
            stopped,
            error,
        })
    }

    async fn on_tunnel_event(
        &self,
        ctx: &AttemptContext<'_>,
        event: TunnelEvent,
        tunnel: &Arc<dyn TunnelProcess>,
        route_tx: &mpsc::Sender<RoutingChange>,
        undo: &mut Undo,
    ) -> Result<()> {
        match event {
            TunnelEvent::State { state, info } => {
                if !matches!(state, VpnState::Connected | VpnState::Disconnected) {
                    self.set_state(state, &info).await;
                }
            }

            TunnelEvent::Initialised { tunnel_ip } => {
                let tunnel_ip = tunnel_ip.or(ctx.config.local_ip);
                if !ctx.inverse_split {
                    if let Some(ip) = tunnel_ip {
                        match self.deps.routes.start(ip, route_tx.clone()).await {
                            Ok(()) => undo.route_watcher = true,
                            Err(e) => log::warn!("Route watcher not started: {}", e),
                        }
                    }
                }
                if !ctx.manual_dns.is_empty() {
                    self.deps.dns.set_manual(&ctx.manual_dns, tunnel_ip).await?;
                }
                self.set_state(VpnState::Initialised, "").await;
            }

            TunnelEvent::Connected(details) => {
                let client_ip = details.client_ip.or(ctx.config.local_ip);
                let client_ipv6 = details.client_ipv6.or(ctx.config.local_ipv6);

                let addresses = {
                    let mut addresses = self.addresses.lock().unwrap_or_else(|e| e.into_inner());
                    addresses.tunnel_ipv4 = client_ip;
                    addresses.tunnel_ipv6 = client_ipv6;
                    addresses.clone()
                };
                if let Err(e) = self.deps.split_tunnel.update_addresses(addresses, true).await {
                    log::warn!("Split tunnel not updated: {}", e);
                }

                self.deps
                    .firewall
                    .client_connected(&ClientConnectedInfo {
                        client_ip,
                        client_ipv6,
                        client_port: details.client_port,
                        server_ip: Some(ctx.server.ip()),
                        server_port: ctx.server.port(),
                        is_tcp: ctx.config.is_tcp,
                    })
                    .await?;
                undo.connected = true;

                if ctx.manual_dns.is_empty() {
                    self.deps.firewall.on_change_dns(tunnel.default_dns()).await?;
                }

                self.promote_required();

                let info = ConnectionInfo {
                    vpn_type: ctx.params.vpn_type,
                    connected_since: Utc::now().timestamp(),
                    client_ip,
                    client_ipv6,
                    client_port: details.client_port,
                    server_ip: Some(ctx.server.ip()),
                    server_port: ctx.server.port(),
                    exit_hostname: ctx.config.exit_hostname.clone(),
                    manual_dns: ctx.manual_dns.clone(),
                    is_tcp: ctx.config.is_tcp,
                    mtu: ctx.config.mtu,
                    is_can_pause: true,
                    paused_till: None,
                };
                self.set_status(VpnStatus {
                    state: VpnState::Connected,
                    info: Some(info.clone()),
                });
                self.deps.events.on_event(DaemonEvent::Connected(info)).await;
            }
        }
        Ok(())
    }

    async fn on_routing_change(&self, change: RoutingChange, tunnel: &Arc<dyn TunnelProcess>, undo: &mut Undo) {
        match change {
            RoutingChange::Changed => {
                if self.status().is_paused() {
                    log::info!("Routing changed while paused; ignored");
                    return;
                }
                log::info!("Default route left the tunnel; reconnecting");
                self.deps.routes.stop().await;
                undo.route_watcher = false;
                if let Err(e) = self
                    .deps
                    .firewall
                    .add_hosts_exception(&undo.exceptions, false, false)
                    .await
                {
                    log::warn!("Failed to restore host exceptions: {}", e);
                }
                self.set_state(VpnState::Reconnecting, "routing changed").await;
                if let Err(e) = tunnel.disconnect().await {
                    log::warn!("Tunnel disconnect failed: {}", e);
                }
            }
            RoutingChange::Updated => {
                if let Err(e) = self.deps.dns.update_if_wrong_settings().await {
                    log::warn!("DNS check after routing update failed: {}", e);
                }
            }
        }
    }

    async fn cleanup(&self, undo: Undo) {
        if undo.tunnel_started {
            self.set_state(VpnState::Exiting, "").await;
        }

        if undo.route_watcher {
            self.deps.routes.stop().await;
        }
        if let Err(e) = self.deps.firewall.on_change_dns(None).await {
            log::warn!("Firewall DNS rule not reset: {}", e);
        }
        if undo.connected {
            if let Err(e) = self.deps.firewall.client_disconnected().await {
                log::warn!("Firewall disconnect hook failed: {}", e);
            }
        }
        if self.deps.firewall.is_paused() {
            log::info!("Tunnel exited while paused; restoring kill-switch");
            if let Err(e) = self.deps.firewall.client_resumed().await {
                log::warn!("Kill-switch not restored: {}", e);
            }
        }
        if undo.disable_firewall {
            if let Err(e) = self.deps.firewall.set_enabled(false).await {
                log::warn!("Kill-switch not disabled: {}", e);
            }
        }
        if let Some(proxy) = undo.proxy {
            proxy.stop().await;
        }
        if let Err(e) = self.deps.dns.reset().await {
            log::warn!("DNS not reset: {}", e);
        }
        if !undo.exceptions.is_empty() {
            if let Err(e) = self
                .deps
                .firewall
                .remove_hosts_exception(&undo.exceptions, false, false)
                .await
            {
                log::warn!("Host exceptions not removed: {}", e);
            }
        }

        let addresses = {
            let mut addresses = self.addresses.lock().unwrap_or_else(|e| e.into_inner());
            addresses.tunnel_ipv4 = None;
            addresses.tunnel_ipv6 = None;
            addresses.clone()
        };
        if let Err(e) = self.deps.split_tunnel.update_addresses(addresses, false).await {
            log::warn!("Split tunnel not updated: {}", e);
        }
    }

    // ========================================================================
    // Pause
    // ========================================================================

    /// Pause the connected tunnel for `duration`; pausing again moves the deadline
    pub async fn pause(&self, duration: Duration) -> Result<DateTime<Utc>> {
        if duration < MIN_PAUSE {
            return Err(Error::InvalidArgument("pause duration must be at least 1 second".into()));
        }
        let _guard = self.pause_lock.lock().await;

        let (tunnel, mut info) = self.connected_tunnel()?;
        if !info.is_paused() {
            self.deps.firewall.client_paused().await?;
            if let Err(e) = self.deps.dns.pause().await {
                log::warn!("DNS not paused: {}", e);
            }
            tunnel.pause().await?;
        }

        let seconds = i64::try_from(duration.as_secs())
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| Error::InvalidArgument("pause duration out of range".into()))?;
        let till = Utc::now() + seconds;
        log::info!("Connection paused till {}", till.to_rfc3339());

        info.paused_till = Some(till);
        self.update_info(&info);
        self.deps.events.on_event(DaemonEvent::Connected(info)).await;
        Ok(till)
    }

    pub async fn resume(&self) -> Result<()> {
        let _guard = self.pause_lock.lock().await;

        let (tunnel, mut info) = self.connected_tunnel()?;
        if !info.is_paused() {
            return Ok(());
        }

        if let Err(e) = tunnel.resume().await {
            log::error!("Tunnel resume failed: {}", e);
        }
        if let Err(e) = self.deps.dns.resume().await {
            log::warn!("DNS not resumed: {}", e);
        }
        self.deps.firewall.client_resumed().await?;

        log::info!("Connection resumed");
        info.paused_till = None;
        self.update_info(&info);
        self.deps.events.on_event(DaemonEvent::Connected(info)).await;
        Ok(())
    }

    async fn check_pause_deadline(&self) {
        let due = self
            .status()
            .info
            .and_then(|i| i.paused_till)
            .is_some_and(|till| Utc::now().timestamp() >= till.timestamp());
        if due {
            if let Err(e) = self.resume().await {
                log::error!("Automatic resume failed: {}", e);
            }
        }
    }

    fn connected_tunnel(&self) -> Result<(Arc<dyn TunnelProcess>, ConnectionInfo)> {
        let status = self.status();
        let info = match status.info {
            Some(info) if status.state == VpnState::Connected => info,
            _ => return Err(Error::InvalidState("VPN is not connected".into())),
        };
        let tunnel = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|a| a.tunnel.clone())
            .ok_or_else(|| Error::InvalidState("VPN is not connected".into()))?;
        Ok((tunnel, info))
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn set_status(&self, status: VpnStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn update_info(&self, info: &ConnectionInfo) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        if status.state == VpnState::Connected {
            status.info = Some(info.clone());
        }
    }

    async fn set_state(&self, state: VpnState, info: &str) {
        self.set_status(VpnStatus { state, info: None });
        self.deps
            .events
            .on_event(DaemonEvent::VpnStateChanged {
                state,
                info: info.to_string(),
            })
            .await;
    }

    async fn detect_outbound_addresses(&self, ipv6: bool) {
        let outbound_ipv4 = netinfo::outbound_ip(false).await.ok();
        let outbound_ipv6 = if ipv6 {
            netinfo::outbound_ip(true).await.ok()
        } else {
            None
        };
        if outbound_ipv4.is_none() && outbound_ipv6.is_none() {
            log::warn!("Outbound address not detected");
        }
        let mut addresses = self.addresses.lock().unwrap_or_else(|e| e.into_inner());
        addresses.outbound_ipv4 = outbound_ipv4;
        addresses.outbound_ipv6 = outbound_ipv6;
    }

    fn resolve_dns(&self, params: &ConnectionParams) -> Result<DnsSettings> {
        let anti_tracker = &params.metadata.anti_tracker;
        if !anti_tracker.enabled {
            return Ok(params.manual_dns.clone());
        }
        let servers = self
            .deps
            .servers
            .cached()
            .ok_or_else(|| Error::InvalidState("server list is not available for anti-tracker".into()))?;
        anti_tracker_dns(&servers, anti_tracker, params.is_multihop())
    }

    /// Tunnel configuration and the real server endpoint
    async fn tunnel_config(&self, params: &ConnectionParams) -> Result<(TunnelConfig, SocketAddr)> {
        let session = self.deps.prefs.session();
        if !session.is_logged_in() {
            return Err(Error::NotLoggedIn);
        }

        let entry = params
            .entry_hosts()
            .first()
            .ok_or_else(|| Error::InvalidArgument("no entry host".into()))?;
        let entry_ip = entry
            .ip()
            .ok_or_else(|| Error::InvalidArgument(format!("invalid host address '{}'", entry.host)))?;
        let exit = params.exit_hosts().first();
        let port = params.port();

        let remote_port = match exit {
            Some(exit) => exit.multihop_port,
            None => port.port,
        };
        let server = SocketAddr::new(entry_ip, remote_port);
        let exit_hostname = exit.map(|h| h.hostname.clone()).unwrap_or_default();
        let proxy_tcp = params.transport_proxy == TransportProxy::Tcp;

        let config = match params.vpn_type {
            VpnType::WTunnel => {
                if let Err(e) = self.deps.keys.generate_keys(true).await {
                    if !session.is_wg_credentials_ok() {
                        return Err(e);
                    }
                    log::warn!("Key update failed, using the current keys: {}", e);
                }
                let session = self.deps.prefs.session();
                if !session.is_wg_credentials_ok() {
                    return Err(Error::InvalidState(
                        "tunnel credentials are not defined; please log in again".into(),
                    ));
                }

                let server_public_key = exit.unwrap_or(entry).public_key.clone();
                let local_ip = session.wg_local_ip.parse().ok();
                let local_ipv6 = if params.ipv6 || params.ipv6_only {
                    tunnel_ipv6(entry, local_ip)
                } else {
                    None
                };
                TunnelConfig {
                    vpn_type: VpnType::WTunnel,
                    remote: server,
                    is_tcp: proxy_tcp,
                    mtu: params.w_tunnel.mtu,
                    local_ip,
                    local_ipv6,
                    default_dns: entry
                        .local_ip
                        .split('/')
                        .next()
                        .and_then(|ip| ip.trim().parse().ok()),
                    server_public_key,
                    private_key: session.wg_private_key,
                    preshared_key: session.wg_preshared_key,
                    username: String::new(),
                    password: String::new(),
                    proxy: Default::default(),
                    obfuscator: Default::default(),
                    exit_hostname,
                }
            }
            VpnType::CTunnel => TunnelConfig {
                vpn_type: VpnType::CTunnel,
                remote: server,
                is_tcp: proxy_tcp || port.protocol == PortProtocol::Tcp,
                mtu: 0,
                local_ip: None,
                local_ipv6: None,
                default_dns: None,
                server_public_key: String::new(),
                private_key: String::new(),
                preshared_key: String::new(),
                username: session.vpn_user,
                password: session.vpn_pass,
                proxy: params.c_tunnel.proxy.clone(),
                obfuscator: params.c_tunnel.obfuscator,
                exit_hostname,
            },
        };
        Ok((config, server))
    }
}

struct AttemptContext<'a> {
    params: &'a ConnectionParams,
    config: &'a TunnelConfig,
    /// Endpoint clients see, even when a local proxy is in front
    server: SocketAddr,
    manual_dns: DnsSettings,
    inverse_split: bool,
}

/// In-tunnel IPv6 address: the entry host's IPv6 local prefix carrying the
/// client's IPv4 address in its low 32 bits
fn tunnel_ipv6(entry: &HostInfo, local_ip: Option<IpAddr>) -> Option<IpAddr> {
    let prefix: Ipv6Addr = entry.ipv6_local_ip()?.split('/').next()?.trim().parse().ok()?;
    let IpAddr::V4(client) = local_ip? else {
        return None;
    };
    let address = u128::from(prefix) | u128::from(u32::from(client));
    Some(IpAddr::V6(Ipv6Addr::from(address)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::TestBed;
    use warden_proto::servers::HostIpv6;

    async fn connected(bed: &TestBed, engine: &Arc<ConnectionEngine>, rx: &mut broadcast::Receiver<DaemonEvent>) -> ConnectionInfo {
        engine.connect(bed.connect_params(), false).unwrap();
        loop {
            match rx.recv().await.unwrap() {
                DaemonEvent::Connected(info) => return info,
                DaemonEvent::Disconnected { description, .. } => panic!("disconnected: {}", description),
                _ => {}
            }
        }
    }

    async fn next_connected(rx: &mut broadcast::Receiver<DaemonEvent>) -> ConnectionInfo {
        loop {
            if let DaemonEvent::Connected(info) = rx.recv().await.unwrap() {
                return info;
            }
        }
    }

    fn events(bed: &TestBed) -> broadcast::Receiver<DaemonEvent> {
        bed.events.subscribe()
    }

    #[tokio::test]
    async fn test_pause_too_short_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bed = TestBed::new(dir.path()).logged_in();
        let engine = ConnectionEngine::new(bed.connection_deps());
        let err = engine.pause(Duration::from_millis(500)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err = engine.pause(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_pause_and_auto_resume() {
        let dir = tempfile::tempdir().unwrap();
        let bed = TestBed::new(dir.path()).logged_in();
        bed.firewall.set_enabled(true).await.unwrap();
        let engine = ConnectionEngine::new(bed.connection_deps());
        let mut rx = events(&bed);
        let (_stop, stop_rx) = broadcast::channel(1);
        engine.start(stop_rx);

        connected(&bed, &engine, &mut rx).await;

        let started = Instant::now();
        let till = engine.pause(Duration::from_secs(2)).await.unwrap();
        let paused = next_connected(&mut rx).await;
        assert_eq!(paused.paused_till, Some(till));
        assert!(engine.status().is_paused());
        assert!(!bed.firewall_backend.is_on());
        assert!(bed.tunnels.last().unwrap().is_paused());

        let resumed = next_connected(&mut rx).await;
        assert!(!resumed.is_paused());
        assert!(started.elapsed() <= Duration::from_secs(2 + 2));
        assert!(bed.firewall_backend.is_on());
        assert!(!bed.tunnels.last().unwrap().is_paused());

        engine.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_persistent_kill_switch_stays_on_while_paused() {
        let dir = tempfile::tempdir().unwrap();
        let bed = TestBed::new(dir.path()).logged_in();
        bed.firewall.set_persistent(true).await.unwrap();
        bed.firewall.set_enabled(true).await.unwrap();
        let engine = ConnectionEngine::new(bed.connection_deps());
        let mut rx = events(&bed);
        let (_stop, stop_rx) = broadcast::channel(1);
        engine.start(stop_rx);

        connected(&bed, &engine, &mut rx).await;
        engine.pause(Duration::from_secs(60)).await.unwrap();
        assert!(bed.firewall_backend.is_on());

        engine.resume().await.unwrap();
        assert!(!engine.status().is_paused());
        engine.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_while_paused_restores_kill_switch() {
        let dir = tempfile::tempdir().unwrap();
        let bed = TestBed::new(dir.path()).logged_in();
        bed.firewall.set_enabled(true).await.unwrap();
        let engine = ConnectionEngine::new(bed.connection_deps());
        let mut rx = events(&bed);
        let (_stop, stop_rx) = broadcast::channel(1);
        engine.start(stop_rx);

        connected(&bed, &engine, &mut rx).await;
        engine.pause(Duration::from_secs(60)).await.unwrap();
        assert!(!bed.firewall_backend.is_on());

        engine.disconnect().await.unwrap();
        assert!(bed.firewall_backend.is_on());
        assert!(!bed.firewall.is_paused());
        assert!(!engine.status().is_paused());
    }

    #[tokio::test]
    async fn test_connect_settings_staged_while_active() {
        let dir = tempfile::tempdir().unwrap();
        let bed = TestBed::new(dir.path()).logged_in();
        let engine = ConnectionEngine::new(bed.connection_deps());
        let mut rx = events(&bed);
        let (_stop, stop_rx) = broadcast::channel(1);
        engine.start(stop_rx);

        connected(&bed, &engine, &mut rx).await;

        let mut staged = bed.connect_params();
        staged.ipv6 = true;
        engine.set_connect_settings(staged.clone()).unwrap();
        assert_eq!(engine.connect_settings(), staged);
        assert_ne!(bed.prefs.get().last_connection_params, staged);

        engine.disconnect().await.unwrap();
        assert_eq!(bed.prefs.get().last_connection_params, staged);
    }

    fn ipv6_host(bed: &TestBed) -> ConnectionParams {
        let mut params = bed.connect_params();
        params.w_tunnel.entry_vpn_server.hosts[0].ipv6 = Some(HostIpv6 {
            host: "2001:db8::7".into(),
            local_ip: "fd00:4956:504e:ffff::/96".into(),
            multihop_port: 0,
        });
        params
    }

    #[test]
    fn test_tunnel_ipv6_from_host_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let bed = TestBed::new(dir.path());
        let params = ipv6_host(&bed);
        let host = &params.w_tunnel.entry_vpn_server.hosts[0];

        let ip = tunnel_ipv6(host, "10.0.0.2".parse().ok()).unwrap();
        assert_eq!(ip, "fd00:4956:504e:ffff::a00:2".parse::<IpAddr>().unwrap());
        assert_eq!(tunnel_ipv6(host, None), None);
        assert_eq!(tunnel_ipv6(&bed.connect_params().w_tunnel.entry_vpn_server.hosts[0], "10.0.0.2".parse().ok()), None);
    }

    #[tokio::test]
    async fn test_ipv6_in_tunnel_configured() {
        let dir = tempfile::tempdir().unwrap();
        let bed = TestBed::new(dir.path()).logged_in();
        let engine = ConnectionEngine::new(bed.connection_deps());
        let mut rx = events(&bed);
        let (_stop, stop_rx) = broadcast::channel(1);
        engine.start(stop_rx);

        let mut params = ipv6_host(&bed);
        params.ipv6 = true;
        engine.connect(params, false).unwrap();
        let info = next_connected(&mut rx).await;

        let expected: IpAddr = "fd00:4956:504e:ffff::a00:2".parse().unwrap();
        assert_eq!(bed.tunnels.configs()[0].local_ipv6, Some(expected));
        assert_eq!(info.client_ipv6, Some(expected));
        engine.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_ipv6_in_tunnel_only_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let bed = TestBed::new(dir.path()).logged_in();
        let engine = ConnectionEngine::new(bed.connection_deps());
        let mut rx = events(&bed);
        let (_stop, stop_rx) = broadcast::channel(1);
        engine.start(stop_rx);

        engine.connect(ipv6_host(&bed), false).unwrap();
        next_connected(&mut rx).await;
        assert_eq!(bed.tunnels.configs()[0].local_ipv6, None);
        engine.disconnect().await.unwrap();
    }
}
