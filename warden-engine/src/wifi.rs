//! Wi-Fi change notifications
//!
//! The Wi-Fi source is polled; a change is only reported once it has been
//! stable for [`NOTIFY_DELAY`], so a roaming adapter does not trigger a burst
//! of auto-connect evaluations.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::event::{DaemonEvent, EventHandler};
use crate::platform::{WifiSource, WifiState};

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const NOTIFY_DELAY: Duration = Duration::from_secs(1);

pub struct WifiWatcher {
    source: Arc<dyn WifiSource>,
    events: Arc<dyn EventHandler>,
    last: RwLock<Option<WifiState>>,
}

impl WifiWatcher {
    pub fn new(source: Arc<dyn WifiSource>, events: Arc<dyn EventHandler>) -> Self {
        Self {
            source,
            events,
            last: RwLock::new(None),
        }
    }

    /// Network the host is attached to right now
    pub async fn current(&self) -> Result<WifiState> {
        let state = self.source.current_network().await?;
        *self.last.write().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        Ok(state)
    }

    /// Last known network without asking the adapter
    pub fn cached(&self) -> Option<WifiState> {
        self.last.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn available_networks(&self) -> Result<Vec<String>> {
        let mut networks = self.source.available_networks().await?;
        networks.retain(|s| !s.trim().is_empty());
        networks.sort();
        networks.dedup();
        Ok(networks)
    }

    /// Record the current network, then watch for changes until shutdown
    pub async fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        if let Err(e) = self.current().await {
            log::warn!("Wi-Fi state unavailable: {}", e);
        }

        let watcher = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = shutdown.recv() => {
                        log::debug!("Wi-Fi watcher stopped");
                        return;
                    }
                }
                watcher.poll().await;
            }
        })
    }

    async fn poll(&self) {
        let Ok(state) = self.source.current_network().await else {
            return;
        };
        if self.cached().as_ref() == Some(&state) {
            return;
        }

        tokio::time::sleep(NOTIFY_DELAY).await;
        let Ok(settled) = self.source.current_network().await else {
            return;
        };
        if settled != state {
            // still changing; the next poll picks it up
            return;
        }

        *self.last.write().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        self.events
            .on_event(DaemonEvent::WifiChanged {
                ssid: state.ssid,
                is_insecure: state.is_insecure,
            })
            .await;
    }
}
