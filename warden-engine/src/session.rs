//! Account session: login, logout and the hourly status check

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use warden_proto::api::{KemPublicKeys, SessionNewRequest, SessionNewResponse, CODE_ACCOUNT_NOT_ACTIVE, CODE_SUCCESS};
use warden_proto::request::SessionNew;
use warden_proto::response::{AccountStatusResp, SessionNewResp};
use warden_proto::types::is_valid_account_id;
use warden_proto::AccountStatus;

use crate::api::{ApiClient, SessionNewOutcome};
use crate::error::{Error, Result};
use crate::event::{DaemonEvent, EventHandler};
use crate::firewall::FirewallController;
use crate::kem::{KemExchange, KemHelper, PresharedKey};
use crate::preferences::{PreferencesStore, SessionCredentials, WgKeys};
use crate::wgkeys::{KeyGenerator, KeysManager, SessionLostHandler};

/// Interval of the background session status check
pub const STATUS_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

struct Checker {
    stop: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct SessionManager {
    api: Arc<ApiClient>,
    prefs: Arc<PreferencesStore>,
    firewall: Arc<FirewallController>,
    kem: Arc<dyn KemHelper>,
    keygen: Arc<dyn KeyGenerator>,
    keys: Arc<KeysManager>,
    events: Arc<dyn EventHandler>,
    needs_refresh: AtomicBool,
    checker: Mutex<Option<Checker>>,
}

impl SessionManager {
    pub fn new(
        api: Arc<ApiClient>,
        prefs: Arc<PreferencesStore>,
        firewall: Arc<FirewallController>,
        kem: Arc<dyn KemHelper>,
        keygen: Arc<dyn KeyGenerator>,
        keys: Arc<KeysManager>,
        events: Arc<dyn EventHandler>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            api,
            prefs,
            firewall,
            kem,
            keygen,
            keys,
            events,
            needs_refresh: AtomicBool::new(false),
            checker: Mutex::new(None),
        });
        let handler: Arc<dyn SessionLostHandler> = manager.clone();
        manager.keys.set_session_lost_handler(Arc::downgrade(&handler));
        manager
    }

    pub fn keys(&self) -> &Arc<KeysManager> {
        &self.keys
    }

    /// A status check was skipped because the firewall blocked it
    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh.load(Ordering::SeqCst)
    }

    /// Resume background work for a session restored from disk
    pub async fn start(self: &Arc<Self>) {
        if !self.prefs.is_logged_in() {
            return;
        }
        self.start_checker(true);
        if let Err(e) = self.keys.start_rotation().await {
            log::error!("Failed to start key rotation: {}", e);
        }
    }

    pub async fn login(self: &Arc<Self>, req: &SessionNew) -> Result<SessionNewResp> {
        let account_id = req.account_id.trim();
        if !is_valid_account_id(account_id) {
            return Err(Error::InvalidArgument(format!("invalid account ID '{}'", account_id)));
        }

        self.firewall.allow_api_servers_temporarily().await?;
        let result = self.login_inner(account_id, req).await;
        self.firewall.restore_api_servers().await;
        result
    }

    async fn login_inner(self: &Arc<Self>, account_id: &str, req: &SessionNew) -> Result<SessionNewResp> {
        self.logout_local().await?;

        let (public_key, private_key) = self.keygen.generate().await?;
        let exchange = match KemExchange::generate(self.kem.as_ref()).await {
            Ok(exchange) => Some(exchange),
            Err(e) => {
                log::warn!("KEM keys not generated; continuing without pre-shared key: {}", e);
                None
            }
        };

        let mut request = SessionNewRequest {
            account_id: account_id.to_string(),
            force_login: req.force_login,
            public_key: public_key.clone(),
            kem: exchange
                .as_ref()
                .map(KemExchange::public_keys)
                .unwrap_or_default(),
            captcha_id: req.captcha_id.trim().to_string(),
            captcha: req.captcha.trim().to_string(),
            confirmation_2fa: req.confirmation_2fa.trim().to_string(),
        };

        let (mut outcome, mut raw) = self.api.session_new(&request).await?;
        let mut preshared_key = String::new();

        if let (SessionNewOutcome::Success(success), Some(exchange)) = (&outcome, &exchange) {
            match exchange
                .preshared_key(self.kem.as_ref(), &success.wireguard.ciphers)
                .await?
            {
                PresharedKey::Derived(psk) => preshared_key = psk,
                PresharedKey::NotOffered => {
                    log::warn!("The server did not return KEM ciphers; no pre-shared key will be used")
                }
                PresharedKey::Incomplete => {
                    log::warn!("Incomplete KEM ciphers received; repeating login without KEM");
                    request.kem = KemPublicKeys::default();
                    (outcome, raw) = self.api.session_new(&request).await?;
                }
            }
        }

        match outcome {
            SessionNewOutcome::Success(success) => {
                self.store_login(account_id, public_key, private_key, preshared_key, success)
                    .await?;
                let prefs = self.prefs.get();
                Ok(SessionNewResp {
                    api_status: CODE_SUCCESS,
                    api_error_message: String::new(),
                    session: prefs.session.to_resp(),
                    account: prefs.account,
                    raw_response: String::new(),
                })
            }
            SessionNewOutcome::Limit(limit) => {
                log::info!("Login refused: session limit reached");
                Ok(SessionNewResp {
                    api_status: limit.status.status,
                    api_error_message: limit.status.message,
                    account: limit.data.into(),
                    raw_response: raw,
                    ..Default::default()
                })
            }
            SessionNewOutcome::Failed(status) => {
                log::info!("Login refused: [{}] {}", status.status, status.message);
                Ok(SessionNewResp {
                    api_status: status.status,
                    api_error_message: status.message,
                    raw_response: raw,
                    ..Default::default()
                })
            }
        }
    }

    async fn store_login(
        self: &Arc<Self>,
        account_id: &str,
        public_key: String,
        private_key: String,
        preshared_key: String,
        resp: SessionNewResponse,
    ) -> Result<()> {
        let account: AccountStatus = resp.service_status.into();
        self.prefs.set_session(
            account,
            SessionCredentials {
                account_id: account_id.to_string(),
                session: resp.token,
                vpn_user: resp.vpn_username,
                vpn_pass: resp.vpn_password,
                wg: WgKeys {
                    public_key,
                    private_key,
                    local_ip: resp.wireguard.ip_address,
                    preshared_key,
                },
            },
        )?;
        log::info!("Logged in");

        self.needs_refresh.store(false, Ordering::SeqCst);
        self.start_checker(false);
        if let Err(e) = self.keys.start_rotation().await {
            log::error!("Failed to start key rotation: {}", e);
        }
        self.events.on_event(DaemonEvent::SessionChanged).await;
        Ok(())
    }

    /// Delete the session remotely, then locally
    ///
    /// A failed remote delete only keeps the session when local deletion is not allowed.
    pub async fn logout(&self, can_delete_locally: bool) -> Result<()> {
        let session = self.prefs.session();
        if session.is_logged_in() {
            self.firewall.allow_api_servers_temporarily().await?;
            let deleted = self.api.session_delete(&session.session).await;
            self.firewall.restore_api_servers().await;

            if let Err(e) = deleted {
                if !can_delete_locally && !e.is_session_not_found() {
                    return Err(e);
                }
                log::warn!("Remote session delete failed; deleting locally: {}", e);
            }
        }
        self.logout_local().await
    }

    /// Forget the session without talking to the API
    pub async fn logout_local(&self) -> Result<()> {
        self.stop_checker().await;
        self.keys.stop_rotation().await;
        let was_logged_in = self.prefs.is_logged_in();
        self.prefs.logout()?;
        self.needs_refresh.store(false, Ordering::SeqCst);
        if was_logged_in {
            log::info!("Logged out");
            self.events.on_event(DaemonEvent::SessionChanged).await;
        }
        Ok(())
    }

    /// Ask the API for the account state and store it
    pub async fn request_status(&self) -> Result<AccountStatusResp> {
        let session = self.prefs.session();
        if !session.is_logged_in() {
            return Err(Error::NotLoggedIn);
        }

        if let Some(reason) = self.firewall.connectivity_blocked() {
            self.needs_refresh.store(true, Ordering::SeqCst);
            return Err(Error::ConnectivityBlocked(reason));
        }

        match self.api.session_status(&session.session).await {
            Ok(status) => {
                self.needs_refresh.store(false, Ordering::SeqCst);
                let account: AccountStatus = status.into();
                self.prefs.update_account_info(account.clone())?;
                self.events.on_event(DaemonEvent::SessionChanged).await;
                Ok(AccountStatusResp {
                    api_status: CODE_SUCCESS,
                    session_token: session.session,
                    account,
                    ..Default::default()
                })
            }
            Err(e) if e.api_code() == Some(CODE_ACCOUNT_NOT_ACTIVE) => {
                self.needs_refresh.store(false, Ordering::SeqCst);
                let mut account = self.prefs.get().account;
                account.active = false;
                self.prefs.update_account_info(account.clone())?;
                self.events.on_event(DaemonEvent::SessionChanged).await;
                Ok(AccountStatusResp {
                    api_status: CODE_ACCOUNT_NOT_ACTIVE,
                    api_error_message: api_message(&e),
                    session_token: session.session,
                    account,
                })
            }
            Err(e) if e.is_session_not_found() => {
                log::warn!("Session not found on the server; logging out");
                self.logout_local().await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn start_checker(self: &Arc<Self>, check_now: bool) {
        let mut checker = self.checker.lock().unwrap_or_else(|e| e.into_inner());
        if checker.is_some() {
            return;
        }
        let (stop, stop_rx) = broadcast::channel(1);
        let handle = tokio::spawn(status_loop(Arc::downgrade(self), check_now, stop_rx));
        *checker = Some(Checker { stop, handle });
    }

    async fn stop_checker(&self) {
        let checker = self.checker.lock().unwrap_or_else(|e| e.into_inner()).take();
        // not awaited: a forced logout may come from the loop itself
        if let Some(checker) = checker {
            let _ = checker.stop.send(());
            drop(checker.handle);
        }
    }

    pub fn is_checker_running(&self) -> bool {
        self.checker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

async fn status_loop(manager: Weak<SessionManager>, check_now: bool, mut stop: broadcast::Receiver<()>) {
    if !check_now {
        tokio::select! {
            _ = tokio::time::sleep(STATUS_CHECK_INTERVAL) => {}
            _ = stop.recv() => return,
        }
    }
    loop {
        let Some(strong) = manager.upgrade() else {
            return;
        };
        match strong.request_status().await {
            Ok(_) => {}
            Err(Error::ConnectivityBlocked(reason)) => {
                log::info!("Session status check skipped: {}", reason)
            }
            Err(e) => log::warn!("Session status check failed: {}", e),
        }
        if !strong.prefs.is_logged_in() {
            return;
        }
        drop(strong);

        tokio::select! {
            _ = tokio::time::sleep(STATUS_CHECK_INTERVAL) => {}
            _ = stop.recv() => return,
        }
    }
}

#[async_trait]
impl SessionLostHandler for SessionManager {
    async fn on_session_not_found(&self) {
        log::warn!("Session not found on the server; logging out");
        if let Err(e) = self.logout_local().await {
            log::error!("Forced logout failed: {}", e);
        }
    }
}

fn api_message(err: &Error) -> String {
    match err {
        Error::Api { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{SESSION_DELETE_PATH, SESSION_NEW_PATH, SESSION_STATUS_PATH, WG_KEY_SET_PATH};
    use crate::config::ApiConfig;
    use crate::event::LoggingEventHandler;
    use crate::mock::{MockFirewall, MockHttpTransport, MockKem, MockKeyGenerator};
    use crate::preferences::SessionStatus;
    use serde_json::json;

    struct Harness {
        _dir: tempfile::TempDir,
        transport: Arc<MockHttpTransport>,
        prefs: Arc<PreferencesStore>,
        firewall: Arc<FirewallController>,
        session: Arc<SessionManager>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let prefs = Arc::new(PreferencesStore::load(dir.path().join("settings.json")));
        let transport = Arc::new(MockHttpTransport::new());
        let api = Arc::new(ApiClient::new(transport.clone(), &ApiConfig::default(), "Linux").unwrap());
        let events: Arc<dyn EventHandler> = Arc::new(LoggingEventHandler);
        let firewall = Arc::new(FirewallController::new(
            Arc::new(MockFirewall::new()),
            prefs.clone(),
            events.clone(),
        ));
        let kem: Arc<dyn KemHelper> = Arc::new(MockKem::new());
        let keygen: Arc<dyn KeyGenerator> = Arc::new(MockKeyGenerator::new());
        let keys = Arc::new(KeysManager::new(
            api.clone(),
            prefs.clone(),
            firewall.clone(),
            kem.clone(),
            keygen.clone(),
            events.clone(),
        ));
        let session = SessionManager::new(api, prefs.clone(), firewall.clone(), kem, keygen, keys, events);
        Harness {
            _dir: dir,
            transport,
            prefs,
            firewall,
            session,
        }
    }

    fn login_ok() -> serde_json::Value {
        let ciphers = MockKem::ciphers();
        json!({
            "status": 200,
            "token": "tok",
            "vpn_username": "u",
            "vpn_password": "p",
            "service_status": {"is_active": true, "current_plan": "Pro", "capabilities": ["multihop"]},
            "wireguard": {"status": 200, "ip_address": "10.0.0.2",
                          "kem_cipher1": ciphers.kyber1024, "kem_cipher2": ciphers.mceliece348864}
        })
    }

    fn new_session(force: bool) -> SessionNew {
        SessionNew {
            account_id: "i-AAAA-BBBB-CCCC".into(),
            force_login: force,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_login_derives_preshared_key() {
        let h = harness();
        h.transport.respond(SESSION_NEW_PATH, login_ok());

        let resp = h.session.login(&new_session(false)).await.unwrap();
        assert_eq!(resp.api_status, 200);
        assert_eq!(resp.session.wg_local_ip, "10.0.0.2");
        assert!(resp.session.wg_use_preshared_key);
        assert!(resp.account.active);

        let stored = h.prefs.session();
        assert_eq!(stored.session, "tok");
        assert_eq!(stored.wg_preshared_key, MockKem::expected_psk());
        assert!(h.session.is_checker_running());
        assert!(h.session.keys().is_rotation_running());

        h.session.logout_local().await.unwrap();
    }

    #[tokio::test]
    async fn test_login_session_limit() {
        let h = harness();
        h.transport.respond(
            SESSION_NEW_PATH,
            json!({"status": 602, "message": "Session limit", "data": {"limit": 5, "is_active": true}}),
        );

        let resp = h.session.login(&new_session(false)).await.unwrap();
        assert_eq!(resp.api_status, 602);
        assert_eq!(resp.api_error_message, "Session limit");
        assert_eq!(resp.account.limit, 5);
        assert!(resp.session.session.is_empty());
        assert!(!h.prefs.is_logged_in());

        h.transport.respond(SESSION_NEW_PATH, login_ok());
        let resp = h.session.login(&new_session(true)).await.unwrap();
        assert_eq!(resp.api_status, 200);
        let body: serde_json::Value =
            serde_json::from_slice(h.transport.requests().last().unwrap().body.as_ref().unwrap()).unwrap();
        assert_eq!(body["force"], true);

        h.session.logout_local().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_account_id_rejected_before_request() {
        let h = harness();
        let req = SessionNew {
            account_id: "ivpn1234".into(),
            ..Default::default()
        };
        assert!(matches!(h.session.login(&req).await, Err(Error::InvalidArgument(_))));
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_login_allowed_through_blocking_firewall() {
        let h = harness();
        h.firewall.set_allow_api_servers(false).await.unwrap();
        h.firewall.set_enabled(true).await.unwrap();
        assert!(h.firewall.connectivity_blocked().is_some());

        h.transport.respond(SESSION_NEW_PATH, login_ok());
        h.session.login(&new_session(false)).await.unwrap();
        // the temporary allowance is gone again
        assert!(h.firewall.connectivity_blocked().is_some());
        h.session.logout_local().await.unwrap();
    }

    #[tokio::test]
    async fn test_login_then_logout_clears_everything() {
        let h = harness();
        h.transport.respond(SESSION_NEW_PATH, login_ok());
        h.transport.respond(SESSION_DELETE_PATH, json!({"status": 200}));
        h.session.login(&new_session(false)).await.unwrap();

        h.session.logout(false).await.unwrap();
        let prefs = h.prefs.get();
        assert_eq!(prefs.session, SessionStatus::default());
        assert_eq!(prefs.account, AccountStatus::default());
        assert!(!h.session.is_checker_running());
        assert!(!h.session.keys().is_rotation_running());
    }

    #[tokio::test]
    async fn test_remote_delete_failure() {
        let h = harness();
        h.transport.respond(SESSION_NEW_PATH, login_ok());
        h.transport
            .respond(SESSION_DELETE_PATH, json!({"status": 500, "message": "internal"}));
        h.session.login(&new_session(false)).await.unwrap();

        assert!(h.session.logout(false).await.is_err());
        assert!(h.prefs.is_logged_in());

        h.session.logout(true).await.unwrap();
        assert!(!h.prefs.is_logged_in());
    }

    #[tokio::test]
    async fn test_status_check_session_not_found_forces_logout() {
        let h = harness();
        h.transport.respond(SESSION_NEW_PATH, login_ok());
        h.session.login(&new_session(false)).await.unwrap();

        h.transport
            .respond(SESSION_STATUS_PATH, json!({"status": 601, "message": "Session not found"}));
        let err = h.session.request_status().await.unwrap_err();
        assert!(err.is_session_not_found());
        assert!(!h.prefs.is_logged_in());
        assert!(!h.session.keys().is_rotation_running());
    }

    #[tokio::test]
    async fn test_status_check_inactive_account_keeps_session() {
        let h = harness();
        h.transport.respond(SESSION_NEW_PATH, login_ok());
        h.session.login(&new_session(false)).await.unwrap();

        h.transport
            .respond(SESSION_STATUS_PATH, json!({"status": 702, "message": "Account is not active"}));
        let resp = h.session.request_status().await.unwrap();
        assert_eq!(resp.api_status, 702);
        assert!(!resp.account.active);
        assert!(h.prefs.is_logged_in());
        assert!(!h.prefs.get().account.active);
        h.session.logout_local().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_check_blocked_by_firewall() {
        let h = harness();
        h.transport.respond(SESSION_NEW_PATH, login_ok());
        h.session.login(&new_session(false)).await.unwrap();
        let sent = h.transport.requests().len();

        h.firewall.set_allow_api_servers(false).await.unwrap();
        h.firewall.set_enabled(true).await.unwrap();
        assert!(matches!(
            h.session.request_status().await,
            Err(Error::ConnectivityBlocked(_))
        ));
        assert!(h.session.needs_refresh());
        assert_eq!(h.transport.requests().len(), sent);
        h.session.logout_local().await.unwrap();
    }

    #[tokio::test]
    async fn test_rotation_session_not_found_logs_out() {
        let h = harness();
        h.transport.respond(SESSION_NEW_PATH, login_ok());
        h.session.login(&new_session(false)).await.unwrap();

        h.transport
            .respond(WG_KEY_SET_PATH, json!({"status": 601, "message": "Session not found"}));
        h.prefs.set_wg_keys_rotation_interval(1).unwrap();
        h.session.keys().start_rotation().await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while h.prefs.is_logged_in() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("forced logout did not finish");
        assert!(!h.session.keys().is_rotation_running());
        assert!(!h.session.is_checker_running());

        // the update lock was released by the rotation task
        let keys = h.session.keys().clone();
        let result = tokio::time::timeout(Duration::from_secs(3), keys.generate_keys(false))
            .await
            .expect("key generation blocked");
        assert!(matches!(result, Err(Error::NotLoggedIn)));
    }
}
