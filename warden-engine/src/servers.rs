//! Server catalog: cached copy, disk cache and the periodic refresh loop

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use warden_proto::ServersInfo;

use crate::api::ApiClient;
use crate::error::{Error, Result};
use crate::event::{DaemonEvent, EventHandler};
use crate::preferences::write_private_file;

/// Delay between successful refreshes
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Retry delay after a failed first refresh
pub const FIRST_RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// One-slot notification of a successful refresh
pub struct ServersSubscription {
    rx: mpsc::Receiver<()>,
}

impl ServersSubscription {
    /// Wait for the next refresh; `None` once the updater is gone
    pub async fn changed(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

/// Keeps the server catalog up to date
pub struct ServersUpdater {
    api: Arc<ApiClient>,
    cache_path: PathBuf,
    events: Arc<dyn EventHandler>,
    servers: RwLock<Option<Arc<ServersInfo>>>,
    subscribers: Mutex<Vec<mpsc::Sender<()>>>,
}

impl ServersUpdater {
    /// Create the updater and seed it from the cache file, without network access
    pub fn new(api: Arc<ApiClient>, cache_path: impl Into<PathBuf>, events: Arc<dyn EventHandler>) -> Self {
        let updater = Self {
            api,
            cache_path: cache_path.into(),
            events,
            servers: RwLock::new(None),
            subscribers: Mutex::new(Vec::new()),
        };

        match read_cache(&updater.cache_path) {
            Ok(servers) => {
                updater
                    .api
                    .set_alternate_ips(servers.api_ips(false), servers.api_ips(true));
                *updater.servers.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(servers));
            }
            Err(CacheError::Rejected(api_only, reason)) => {
                log::warn!("{}", reason);
                updater
                    .api
                    .set_alternate_ips(api_only.api_ips(false), api_only.api_ips(true));
            }
            Err(CacheError::Unreadable(reason)) => log::warn!("{}", reason),
        }
        updater
    }

    /// Cached catalog, without triggering a download
    pub fn cached(&self) -> Option<Arc<ServersInfo>> {
        self.servers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Cached catalog, downloading it when nothing is cached yet
    pub async fn get(&self) -> Result<Arc<ServersInfo>> {
        if let Some(servers) = self.cached() {
            return Ok(servers);
        }
        self.update().await
    }

    pub async fn force_refresh(&self) -> Result<Arc<ServersInfo>> {
        self.update().await
    }

    pub fn subscribe(&self) -> ServersSubscription {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        ServersSubscription { rx }
    }

    async fn update(&self) -> Result<Arc<ServersInfo>> {
        let servers = self
            .api
            .servers()
            .await
            .map_err(|e| Error::Http(format!("failed to download servers list: {}", e)))?;

        if servers.config.ports.openvpn.is_empty() {
            return Err(Error::Http(
                "no C-Tunnel ports in the server list; skipping received data".into(),
            ));
        }
        if servers.config.ports.wireguard.is_empty() {
            return Err(Error::Http(
                "no W-Tunnel ports in the server list; skipping received data".into(),
            ));
        }

        log::info!(
            "Updated servers info ({} C-Tunnel; {} W-Tunnel)",
            servers.openvpn.len(),
            servers.wireguard.len()
        );

        let servers = Arc::new(servers);
        *self.servers.write().unwrap_or_else(|e| e.into_inner()) = Some(servers.clone());
        self.api
            .set_alternate_ips(servers.api_ips(false), servers.api_ips(true));

        match serde_json::to_vec(servers.as_ref()) {
            Ok(data) => {
                if let Err(e) = write_private_file(&self.cache_path, &data) {
                    log::error!("Failed to save servers cache file: {}", e);
                }
            }
            Err(e) => log::error!("Failed to serialize servers: {}", e),
        }

        self.notify();
        self.events.on_event(DaemonEvent::ServersUpdated).await;
        Ok(servers)
    }

    fn notify(&self) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| match tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Refresh loop: hourly, with a 5 minute retry after a failed first attempt
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut first = true;
        loop {
            let delay = match self.update().await {
                Ok(_) => REFRESH_INTERVAL,
                Err(e) => {
                    log::error!("{}", e);
                    if first {
                        FIRST_RETRY_INTERVAL
                    } else {
                        REFRESH_INTERVAL
                    }
                }
            };
            first = false;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => {
                    log::debug!("Servers updater stopped");
                    return;
                }
            }
        }
    }
}

enum CacheError {
    /// Parsed, but not trusted; only the API IPs are kept
    Rejected(ServersInfo, String),
    Unreadable(String),
}

fn read_cache(path: &Path) -> std::result::Result<ServersInfo, CacheError> {
    let data = fs::read(path)
        .map_err(|e| CacheError::Unreadable(format!("Failed to read servers cache file: {}", e)))?;
    let servers: ServersInfo = serde_json::from_slice(&data).map_err(|e| {
        CacheError::Unreadable(format!("Failed to parse servers cache file: {}", e))
    })?;

    if let Err(reason) = check_private_permissions(path) {
        let _ = fs::remove_file(path);
        return Err(CacheError::Rejected(
            servers.only_api_info(),
            format!("Skip reading servers cache file: {}", reason),
        ));
    }
    Ok(servers)
}

/// The file must not be accessible to group or others
#[cfg(unix)]
pub(crate) fn check_private_permissions(path: &Path) -> std::result::Result<(), String> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(path)
        .map_err(|e| e.to_string())?
        .permissions()
        .mode();
    if mode & 0o077 != 0 {
        return Err(format!(
            "wrong access rights {:o} of {}",
            mode & 0o777,
            path.display()
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn check_private_permissions(_path: &Path) -> std::result::Result<(), String> {
    Ok(())
}
