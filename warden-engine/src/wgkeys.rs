//! W-Tunnel key generation and rotation

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use warden_proto::api::{KemPublicKeys, WgKeySetRequest, WgKeySetResponse};

use crate::api::ApiClient;
use crate::error::{Error, Result};
use crate::event::{DaemonEvent, EventHandler};
use crate::firewall::FirewallController;
use crate::helper;
use crate::kem::{KemExchange, KemHelper, PresharedKey};
use crate::preferences::{PreferencesStore, WgKeys};

/// Longest sleep between checks; timers are not trusted across host suspend
pub const MAX_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Upper bound of the retry delay after failures
pub const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Produces tunnel key pairs
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    /// Returns `(public, private)` in base64
    async fn generate(&self) -> Result<(String, String)>;
}

/// Key generation through the `wg` tool
pub struct WgToolKeyGenerator {
    program: String,
}

impl WgToolKeyGenerator {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl KeyGenerator for WgToolKeyGenerator {
    async fn generate(&self) -> Result<(String, String)> {
        let private = helper::run_text(&self.program, &["genkey"], None).await?;
        let public = helper::run_text(&self.program, &["pubkey"], Some(private.as_bytes())).await?;
        if private.is_empty() || public.is_empty() {
            return Err(Error::Helper("key generation returned empty keys".into()));
        }
        Ok((public, private))
    }
}

/// Told when the API no longer knows the session
#[async_trait]
pub trait SessionLostHandler: Send + Sync {
    async fn on_session_not_found(&self);
}

/// True when a W-Tunnel is currently up
pub type TunnelProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Delay after `failures` consecutive failed attempts: 5, 10, 15... minutes, at most one hour
pub fn retry_delay(failures: u32) -> Duration {
    (MAX_CHECK_INTERVAL * failures.max(1)).min(MAX_RETRY_INTERVAL)
}

struct Rotation {
    interval: i64,
    stop: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct KeysManager {
    api: Arc<ApiClient>,
    prefs: Arc<PreferencesStore>,
    firewall: Arc<FirewallController>,
    kem: Arc<dyn KemHelper>,
    keygen: Arc<dyn KeyGenerator>,
    events: Arc<dyn EventHandler>,
    update_lock: tokio::sync::Mutex<()>,
    rotation: Mutex<Option<Rotation>>,
    session_lost: RwLock<Option<Weak<dyn SessionLostHandler>>>,
    tunnel_probe: RwLock<Option<TunnelProbe>>,
}

impl KeysManager {
    pub fn new(
        api: Arc<ApiClient>,
        prefs: Arc<PreferencesStore>,
        firewall: Arc<FirewallController>,
        kem: Arc<dyn KemHelper>,
        keygen: Arc<dyn KeyGenerator>,
        events: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            api,
            prefs,
            firewall,
            kem,
            keygen,
            events,
            update_lock: tokio::sync::Mutex::new(()),
            rotation: Mutex::new(None),
            session_lost: RwLock::new(None),
            tunnel_probe: RwLock::new(None),
        }
    }

    pub fn set_session_lost_handler(&self, handler: Weak<dyn SessionLostHandler>) {
        *self.session_lost.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn set_tunnel_probe(&self, probe: TunnelProbe) {
        *self.tunnel_probe.write().unwrap_or_else(|e| e.into_inner()) = Some(probe);
    }

    fn w_tunnel_connected(&self) -> bool {
        self.tunnel_probe
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|probe| probe())
            .unwrap_or(false)
    }

    pub fn is_rotation_running(&self) -> bool {
        self.rotation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// (Re)start the rotation loop; a no-op while no public key is active
    pub async fn start_rotation(self: &Arc<Self>) -> Result<()> {
        self.stop_rotation().await;

        let session = self.prefs.session();
        let interval = session.wg_keys_regen_interval;
        if interval <= 0 {
            return Err(Error::InvalidState(
                "unable to start key rotation (interval not defined)".into(),
            ));
        }
        if session.wg_public_key.is_empty() {
            log::info!("No active tunnel public key; key rotation disabled");
            return Ok(());
        }

        let (stop, stop_rx) = broadcast::channel(1);
        let handle = tokio::spawn(self.clone().rotation_loop(stop_rx));
        *self.rotation.lock().unwrap_or_else(|e| e.into_inner()) = Some(Rotation {
            interval,
            stop,
            handle,
        });
        Ok(())
    }

    pub async fn stop_rotation(&self) {
        let rotation = self.rotation.lock().unwrap_or_else(|e| e.into_inner()).take();
        // not awaited: a forced logout may come from the loop itself
        if let Some(rotation) = rotation {
            let _ = rotation.stop.send(());
            drop(rotation.handle);
        }
    }

    async fn rotation_loop(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        log::info!("Keys rotation started");
        let mut failures: u32 = 0;

        loop {
            let wait = if failures > 0 {
                retry_delay(failures)
            } else {
                let session = self.prefs.session();
                let due = session.wg_key_generated + session.wg_keys_regen_interval;
                let left = due - chrono::Utc::now().timestamp();
                if left <= 0 {
                    Duration::from_secs(1)
                } else {
                    Duration::from_secs(left as u64).min(MAX_CHECK_INTERVAL)
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.recv() => break,
            }

            match self.update_keys(true).await {
                Ok(()) => failures = 0,
                Err(e) => {
                    log::error!("Failed to update tunnel keys: {}", e);
                    failures = failures.saturating_add(1);
                }
            }
        }
        log::info!("Keys rotation stopped");
    }

    /// Generate and register new keys, then make sure rotation runs with the current interval
    pub async fn generate_keys(self: &Arc<Self>, only_if_necessary: bool) -> Result<()> {
        self.update_keys(only_if_necessary).await?;

        let interval = self.prefs.session().wg_keys_regen_interval;
        let restart = match self.rotation.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(rotation) => rotation.interval != interval,
            None => true,
        };
        if restart {
            self.start_rotation().await?;
        }
        Ok(())
    }

    async fn update_keys(&self, only_if_necessary: bool) -> Result<()> {
        let result = {
            let _guard = self.update_lock.lock().await;
            self.update_keys_locked(only_if_necessary).await
        };

        // the handler logs out, which stops rotation; the update lock must be free by then
        if let Err(e) = &result {
            if e.is_session_not_found() {
                let handler = self
                    .session_lost
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_ref()
                    .and_then(Weak::upgrade);
                if let Some(handler) = handler {
                    handler.on_session_not_found().await;
                }
            }
        }
        result
    }

    async fn update_keys_locked(&self, only_if_necessary: bool) -> Result<()> {
        let session = self.prefs.session();
        if !session.is_logged_in() {
            return Err(Error::NotLoggedIn);
        }

        if only_if_necessary && !session.wg_public_key.is_empty() {
            if session.wg_keys_regen_interval <= 0 {
                return Err(Error::InvalidState("key rotation interval is not defined".into()));
            }
            let due = session.wg_key_generated + session.wg_keys_regen_interval;
            if due >= chrono::Utc::now().timestamp() {
                return Ok(());
            }
        }

        log::info!("Updating tunnel keys...");

        if let Some(reason) = self.firewall.connectivity_blocked() {
            return Err(Error::ConnectivityBlocked(reason));
        }

        let (public_key, private_key) = self.keygen.generate().await?;

        let active_key = if self.w_tunnel_connected() {
            session.wg_public_key.clone()
        } else {
            String::new()
        };

        let exchange = match KemExchange::generate(self.kem.as_ref()).await {
            Ok(exchange) => Some(exchange),
            Err(e) => {
                log::warn!("KEM keys not generated; continuing without pre-shared key: {}", e);
                None
            }
        };

        let mut request = WgKeySetRequest {
            session_token: session.session.clone(),
            public_key: public_key.clone(),
            connected_public_key: active_key,
            kem: exchange
                .as_ref()
                .map(KemExchange::public_keys)
                .unwrap_or_default(),
        };

        let resp = self.send_key_set(&request).await?;

        let preshared_key = match &exchange {
            None => String::new(),
            Some(exchange) => match exchange.preshared_key(self.kem.as_ref(), &resp.ciphers).await? {
                PresharedKey::Derived(psk) => psk,
                PresharedKey::NotOffered => {
                    log::warn!("The server did not return KEM ciphers; no pre-shared key will be used");
                    String::new()
                }
                PresharedKey::Incomplete => {
                    log::warn!("Incomplete KEM ciphers received; repeating the request without KEM");
                    request.kem = KemPublicKeys::default();
                    let retry = self.send_key_set(&request).await?;
                    return self.store_keys(public_key, private_key, retry, String::new()).await;
                }
            },
        };

        self.store_keys(public_key, private_key, resp, preshared_key).await
    }

    async fn send_key_set(&self, request: &WgKeySetRequest) -> Result<WgKeySetResponse> {
        if request.connected_public_key.is_empty() {
            // the API drops every key of the session on such a request
            self.prefs.erase_wg_keys()?;
        }

        match self.api.wg_key_set(request).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                log::info!("Tunnel keys not updated: {}", e);
                Err(e)
            }
        }
    }

    async fn store_keys(
        &self,
        public_key: String,
        private_key: String,
        resp: WgKeySetResponse,
        preshared_key: String,
    ) -> Result<()> {
        log::info!("Tunnel keys updated ({}:{})", resp.ip_address, public_key);
        self.prefs.update_wg_keys(WgKeys {
            public_key,
            private_key,
            local_ip: resp.ip_address,
            preshared_key,
        })?;
        self.events.on_event(DaemonEvent::SessionChanged).await;
        Ok(())
    }
}
