//! Routing change detection while a tunnel is up

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::netinfo;

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingChange {
    /// The default route no longer goes through the tunnel
    Changed,
    /// Routes changed but traffic still leaves through the tunnel
    Updated,
}

#[async_trait]
pub trait RouteWatcher: Send + Sync {
    /// Report routing changes for the tunnel owning `tunnel_ip` until [`Self::stop`]
    async fn start(&self, tunnel_ip: IpAddr, notify: mpsc::Sender<RoutingChange>) -> Result<()>;

    async fn stop(&self);
}

/// Key identifying a default route
type DefaultRoute = (IpAddr, Option<IpAddr>, Option<u32>);

fn is_default(route: &net_route::Route) -> bool {
    route.prefix == 0 && route.destination.is_unspecified()
}

async fn default_routes(handle: &net_route::Handle) -> Result<Vec<DefaultRoute>> {
    let routes = handle
        .list()
        .await
        .map_err(|e| Error::Connection(format!("failed to list routes: {}", e)))?;
    let mut defaults: Vec<DefaultRoute> = routes
        .iter()
        .filter(|r| is_default(r))
        .map(|r| (r.destination, r.gateway, r.ifindex))
        .collect();
    defaults.sort();
    Ok(defaults)
}

/// Classify a change by where traffic to the internet leaves now
pub fn classify(outbound: Option<IpAddr>, tunnel_ip: IpAddr) -> RoutingChange {
    if outbound == Some(tunnel_ip) {
        RoutingChange::Updated
    } else {
        RoutingChange::Changed
    }
}

struct Running {
    stop: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Polls the system routing table through `net-route`
pub struct NetRouteWatcher {
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl Default for NetRouteWatcher {
    fn default() -> Self {
        Self::new(POLL_INTERVAL)
    }
}

impl NetRouteWatcher {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            running: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RouteWatcher for NetRouteWatcher {
    async fn start(&self, tunnel_ip: IpAddr, notify: mpsc::Sender<RoutingChange>) -> Result<()> {
        self.stop().await;

        let handle = net_route::Handle::new()
            .map_err(|e| Error::Connection(format!("failed to create route handle: {}", e)))?;
        let mut known = default_routes(&handle).await?;
        let interval = self.interval;
        let (stop, mut stop_rx) = broadcast::channel(1);

        log::debug!("Route watcher started for {}", tunnel_ip);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop_rx.recv() => break,
                }

                let current = match default_routes(&handle).await {
                    Ok(routes) => routes,
                    Err(e) => {
                        log::warn!("{}", e);
                        continue;
                    }
                };
                if current == known {
                    continue;
                }
                known = current;

                let outbound = netinfo::outbound_ip(tunnel_ip.is_ipv6()).await.ok();
                let change = classify(outbound, tunnel_ip);
                log::info!("Default route changed ({:?}); outbound address {:?}", change, outbound);
                if notify.send(change).await.is_err() {
                    break;
                }
            }
            log::debug!("Route watcher stopped");
        });

        *self.running.lock().unwrap_or_else(|e| e.into_inner()) = Some(Running { stop, handle: task });
        Ok(())
    }

    async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(running) = running {
            let _ = running.stop.send(());
            let _ = running.handle.await;
        }
    }
}
