//! Local transport proxy in front of the tunnel

use std::net::{Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use warden_proto::types::TransportProxy;

use crate::error::{Error, Result};
use crate::netinfo;

/// How long a freshly started proxy must stay alive to count as started
const STARTUP_GRACE: Duration = Duration::from_millis(200);

/// A proxy listening on loopback and forwarding to the server's proxy endpoint
pub struct RunningProxy {
    pub local: SocketAddr,
    child: Option<Child>,
}

impl RunningProxy {
    /// A proxy not backed by a child process
    pub fn detached(local: SocketAddr) -> Self {
        Self { local, child: None }
    }

    pub async fn stop(mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                log::debug!("Transport proxy already stopped: {}", e);
            }
            log::info!("Transport proxy on {} stopped", self.local);
        }
    }
}

#[async_trait]
pub trait ProxyLauncher: Send + Sync {
    async fn start(&self, kind: TransportProxy, remote: SocketAddr) -> Result<RunningProxy>;
}

/// Runs the configured proxy executable
pub struct HelperProxyLauncher {
    program: String,
}

impl HelperProxyLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ProxyLauncher for HelperProxyLauncher {
    async fn start(&self, kind: TransportProxy, remote: SocketAddr) -> Result<RunningProxy> {
        let transport = match kind {
            TransportProxy::Udp => "udp",
            TransportProxy::Tcp => "tcp",
            TransportProxy::None => {
                return Err(Error::InvalidArgument("no transport proxy requested".into()))
            }
        };

        let port = netinfo::free_tcp_port().await?;
        let local = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port);

        log::info!("Starting {} transport proxy {} -> {}", transport, local, remote);
        let mut child = Command::new(&self.program)
            .args([
                "--transport",
                transport,
                "--listen",
                &local.to_string(),
                "--remote",
                &remote.to_string(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Helper(format!("failed to execute {}: {}", self.program, e)))?;

        tokio::time::sleep(STARTUP_GRACE).await;
        if let Some(status) = child.try_wait()? {
            return Err(Error::Helper(format!(
                "transport proxy exited during start-up: {}",
                status
            )));
        }

        Ok(RunningProxy {
            local,
            child: Some(child),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_proxy_lifecycle() {
        let launcher = HelperProxyLauncher::new("/bin/sleep");
        // sleep rejects the flags and exits at once
        let remote: SocketAddr = "198.51.100.1:443".parse().unwrap();
        assert!(launcher.start(TransportProxy::Udp, remote).await.is_err());
        assert!(launcher.start(TransportProxy::None, remote).await.is_err());
    }

    #[tokio::test]
    async fn test_running_proxy_stops() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("proxy.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let launcher = HelperProxyLauncher::new(script.to_string_lossy());
        let proxy = launcher
            .start(TransportProxy::Tcp, "198.51.100.1:443".parse().unwrap())
            .await
            .unwrap();
        assert!(proxy.local.ip().is_loopback());
        assert_ne!(proxy.local.port(), 0);
        proxy.stop().await;
    }
}
