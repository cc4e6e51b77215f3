//! Tunnel engine processes
//!
//! The tunnel itself is run by an external launcher (one per tunnel kind). The
//! launcher receives a [`TunnelConfig`] as a single JSON line on stdin, then
//! reads control commands (`pause`, `resume`, `disconnect`) on the following
//! lines. It reports progress as JSON lines on stdout and signals how it
//! ended through its exit code.

use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use warden_proto::types::{ObfuscatorConfig, ProxyParams};
use warden_proto::{VpnState, VpnType};

use crate::error::{Error, Result};

/// Launcher exit code: the tunnel ended normally
pub const EXIT_NORMAL: i32 = 0;
/// Launcher exit code: the server rejected the credentials
pub const EXIT_AUTH_FAILURE: i32 = 2;
/// Launcher exit code: the tunnel asks to be restarted immediately
pub const EXIT_RECONNECT_REQUIRED: i32 = 3;

/// Everything a launcher needs to bring one tunnel up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub vpn_type: VpnType,
    /// Where the tunnel connects to; a local proxy when a transport proxy is used
    pub remote: SocketAddr,
    pub is_tcp: bool,
    pub mtu: u32,

    pub local_ip: Option<IpAddr>,
    pub local_ipv6: Option<IpAddr>,
    /// Resolver inside the tunnel when no manual DNS is set
    pub default_dns: Option<IpAddr>,

    pub server_public_key: String,
    pub private_key: String,
    pub preshared_key: String,

    pub username: String,
    pub password: String,
    pub proxy: ProxyParams,
    pub obfuscator: ObfuscatorConfig,

    pub exit_hostname: String,
}

/// Addresses of an established tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDetails {
    pub client_ip: Option<IpAddr>,
    pub client_ipv6: Option<IpAddr>,
    pub client_port: u16,
}

/// Progress reported by a running tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TunnelEvent {
    /// Intermediate engine state (auth, config, routes...)
    State {
        state: VpnState,
        #[serde(default)]
        info: String,
    },
    /// Interface is up; traffic is not flowing yet
    Initialised {
        #[serde(default)]
        tunnel_ip: Option<IpAddr>,
    },
    /// Handshake finished
    Connected(TunnelDetails),
}

/// How a tunnel run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelExit {
    Normal,
    AuthenticationFailure,
    ReconnectRequired,
    Error(String),
}

#[async_trait]
pub trait TunnelProcess: Send + Sync {
    /// Run until the tunnel ends, reporting progress on `events`
    async fn run(&self, events: mpsc::Sender<TunnelEvent>) -> Result<TunnelExit>;

    /// Ask the tunnel to stop; `run` returns once it has
    async fn disconnect(&self) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Resolver to use when the user has not set one
    fn default_dns(&self) -> Option<IpAddr>;
}

#[async_trait]
pub trait TunnelFactory: Send + Sync {
    async fn create(&self, config: TunnelConfig) -> Result<Arc<dyn TunnelProcess>>;
}

/// Starts tunnels through the configured launcher executables
pub struct LauncherTunnelFactory {
    w_tunnel: String,
    c_tunnel: String,
}

impl LauncherTunnelFactory {
    pub fn new(w_tunnel: impl Into<String>, c_tunnel: impl Into<String>) -> Self {
        Self {
            w_tunnel: w_tunnel.into(),
            c_tunnel: c_tunnel.into(),
        }
    }
}

#[async_trait]
impl TunnelFactory for LauncherTunnelFactory {
    async fn create(&self, config: TunnelConfig) -> Result<Arc<dyn TunnelProcess>> {
        let program = match config.vpn_type {
            VpnType::WTunnel => self.w_tunnel.clone(),
            VpnType::CTunnel => self.c_tunnel.clone(),
        };
        Ok(Arc::new(LauncherTunnel::new(program, config)))
    }
}

pub struct LauncherTunnel {
    program: String,
    config: TunnelConfig,
    commands: Mutex<Option<mpsc::UnboundedSender<&'static str>>>,
    stop_requested: AtomicBool,
}

impl LauncherTunnel {
    pub fn new(program: impl Into<String>, config: TunnelConfig) -> Self {
        Self {
            program: program.into(),
            config,
            commands: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        }
    }

    fn send(&self, command: &'static str) -> Result<()> {
        let commands = self.commands.lock().unwrap_or_else(|e| e.into_inner());
        match commands.as_ref() {
            Some(tx) => tx
                .send(command)
                .map_err(|_| Error::InvalidState("tunnel is not running".into())),
            None => Err(Error::InvalidState("tunnel is not running".into())),
        }
    }
}

#[async_trait]
impl TunnelProcess for LauncherTunnel {
    async fn run(&self, events: mpsc::Sender<TunnelEvent>) -> Result<TunnelExit> {
        if self.stop_requested.load(Ordering::SeqCst) {
            return Ok(TunnelExit::Normal);
        }

        log::info!("Starting {} launcher: {}", self.config.vpn_type, self.program);
        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Helper(format!("failed to execute {}: {}", self.program, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Helper("launcher stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Helper("launcher stdout unavailable".into()))?;
        let stderr = child.stderr.take();

        let mut line = serde_json::to_vec(&self.config)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();
        *self.commands.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        if self.stop_requested.load(Ordering::SeqCst) {
            self.send("disconnect")?;
        }

        let writer = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let line = format!("{}\n", command);
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let stderr_reader = stderr.map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("[tunnel] {}", line);
                }
            })
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<TunnelEvent>(line) {
                Ok(event) => {
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("Unrecognised tunnel event '{}': {}", line, e),
            }
        }

        let status = child.wait().await?;
        self.commands.lock().unwrap_or_else(|e| e.into_inner()).take();
        writer.abort();
        if let Some(reader) = stderr_reader {
            let _ = reader.await;
        }

        let exit = match status.code() {
            Some(EXIT_NORMAL) => TunnelExit::Normal,
            Some(EXIT_AUTH_FAILURE) => TunnelExit::AuthenticationFailure,
            Some(EXIT_RECONNECT_REQUIRED) => TunnelExit::ReconnectRequired,
            Some(code) => TunnelExit::Error(format!("tunnel exited with code {}", code)),
            None => TunnelExit::Error("tunnel terminated by signal".into()),
        };
        log::info!("{} launcher exited: {:?}", self.config.vpn_type, exit);
        Ok(exit)
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_requested.store(true, Ordering::SeqCst);
        // not started yet: run() sees the flag
        let _ = self.send("disconnect");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.send("pause")
    }

    async fn resume(&self) -> Result<()> {
        self.send("resume")
    }

    fn default_dns(&self) -> Option<IpAddr> {
        self.config.default_dns
    }
}
