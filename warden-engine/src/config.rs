//! Daemon configuration (`warden.toml`)
//!
//! This is the static, administrator-owned configuration read once at start.
//! User-mutable settings live in [`crate::preferences`].

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
///
/// # Example Configuration
///
/// ```toml
/// [daemon]
/// log_level = "info"
/// settings_file = "/etc/warden/settings.json"
///
/// [api]
/// host = "api.ivpn.net"
/// alternate_ips = ["198.51.100.10"]
///
/// [helpers]
/// platform = "/usr/lib/warden/warden-platform"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub helpers: HelpersConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.daemon.validate()?;
        self.api.validate()?;
        self.helpers.validate()?;
        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# Warden VPN daemon configuration

[daemon]
# Log level: "error", "warn", "info", "debug", "trace"
# Overridden by RUST_LOG, and forced to "debug" by --logging
log_level = "info"

# Optional log file; its tail is included in generated diagnostics
# log_file = "/var/log/warden/wardend.log"

# User preferences (JSON, owner-only). A ".tmp" sibling is used for atomic saves.
settings_file = "/etc/warden/settings.json"

# Cached server catalog (JSON, owner-only)
servers_cache_file = "/etc/warden/servers.json"

# Extended client authentication (EAA) hash file
eaa_file = "/etc/warden/eaa"

# Handoff file "<port>:<hex secret>" read by local clients
port_file = "/var/lib/warden/port.txt"

# Platform name used for update-info aliases: "Linux", "macOS", "Windows"
# platform = "Linux"

[api]
# Logical API host. TLS server name and Host header always use this name.
host = "api.ivpn.net"

# Host serving update information
update_host = "repo.ivpn.net"

# Fallback IPs of the API host, tried when DNS-based access fails.
# The server catalog refreshes this list at runtime.
alternate_ips = []

# Extra SPKI pins (base64 SHA-256) added to the built-in pin sets.
# Every API host needs at least one pin; the daemon refuses to start without.
# extra_pins = []

# Whole-request and connect timeouts, in seconds
request_timeout = 10
dial_timeout = 5

[helpers]
# Platform helper: firewall, DNS, split tunnel, Wi-Fi, apps, ping
platform = "/usr/lib/warden/warden-platform"

# Post-quantum KEM helper ("genkeys <alg>", "decpsk <alg>")
kem = "/usr/lib/warden/warden-kem"

# Tunnel key tool ("genkey", "pubkey")
wg = "/usr/bin/wg"

# Tunnel engine launchers
w_tunnel = "/usr/lib/warden/w-tunnel"
c_tunnel = "/usr/lib/warden/c-tunnel"

# Local transport proxy launcher
transport_proxy = "/usr/lib/warden/transport-proxy"
"#
        .to_string()
    }
}

/// General daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log file path (optional)
    #[serde(default)]
    pub log_file: Option<String>,

    #[serde(default = "default_settings_file")]
    pub settings_file: PathBuf,

    #[serde(default = "default_servers_cache_file")]
    pub servers_cache_file: PathBuf,

    #[serde(default = "default_eaa_file")]
    pub eaa_file: PathBuf,

    #[serde(default = "default_port_file")]
    pub port_file: PathBuf,

    /// Platform name for update-info aliases
    #[serde(default = "default_platform")]
    pub platform: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
            settings_file: default_settings_file(),
            servers_cache_file: default_servers_cache_file(),
            eaa_file: default_eaa_file(),
            port_file: default_port_file(),
            platform: default_platform(),
        }
    }
}

impl DaemonConfig {
    fn validate(&self) -> Result<()> {
        match self.log_level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(Error::Config(format!("invalid log_level: {}", other)));
            }
        }
        if self.settings_file.as_os_str().is_empty() {
            return Err(Error::Config("settings_file is required".into()));
        }
        if self.port_file.as_os_str().is_empty() {
            return Err(Error::Config("port_file is required".into()));
        }
        Ok(())
    }
}

/// Remote API access
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_update_host")]
    pub update_host: String,

    #[serde(default)]
    pub alternate_ips: Vec<String>,

    #[serde(default)]
    pub extra_pins: Vec<String>,

    /// Seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Seconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            update_host: default_update_host(),
            alternate_ips: Vec::new(),
            extra_pins: Vec::new(),
            request_timeout: default_request_timeout(),
            dial_timeout: default_dial_timeout(),
        }
    }
}

impl ApiConfig {
    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("api.host is required".into()));
        }
        if self.request_timeout == 0 || self.dial_timeout == 0 {
            return Err(Error::Config("API timeouts must be positive".into()));
        }
        if self.dial_timeout > self.request_timeout {
            return Err(Error::Config(format!(
                "api.dial_timeout ({}) exceeds api.request_timeout ({})",
                self.dial_timeout, self.request_timeout
            )));
        }
        self.alternate_ip_addrs()?;
        Ok(())
    }

    /// Parsed `alternate_ips`
    pub fn alternate_ip_addrs(&self) -> Result<Vec<IpAddr>> {
        self.alternate_ips
            .iter()
            .map(|s| {
                s.trim()
                    .parse::<IpAddr>()
                    .map_err(|_| Error::Config(format!("invalid alternate API IP: {}", s)))
            })
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }
}

/// External helper executables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelpersConfig {
    #[serde(default = "default_platform_helper")]
    pub platform: String,

    #[serde(default = "default_kem_helper")]
    pub kem: String,

    #[serde(default = "default_wg_tool")]
    pub wg: String,

    #[serde(default = "default_w_tunnel")]
    pub w_tunnel: String,

    #[serde(default = "default_c_tunnel")]
    pub c_tunnel: String,

    #[serde(default = "default_transport_proxy")]
    pub transport_proxy: String,
}

impl Default for HelpersConfig {
    fn default() -> Self {
        Self {
            platform: default_platform_helper(),
            kem: default_kem_helper(),
            wg: default_wg_tool(),
            w_tunnel: default_w_tunnel(),
            c_tunnel: default_c_tunnel(),
            transport_proxy: default_transport_proxy(),
        }
    }
}

impl HelpersConfig {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("platform", &self.platform),
            ("kem", &self.kem),
            ("wg", &self.wg),
            ("w_tunnel", &self.w_tunnel),
            ("c_tunnel", &self.c_tunnel),
            ("transport_proxy", &self.transport_proxy),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("helpers.{} must not be empty", name)));
            }
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_settings_file() -> PathBuf {
    PathBuf::from("/etc/warden/settings.json")
}

fn default_servers_cache_file() -> PathBuf {
    PathBuf::from("/etc/warden/servers.json")
}

fn default_eaa_file() -> PathBuf {
    PathBuf::from("/etc/warden/eaa")
}

fn default_port_file() -> PathBuf {
    PathBuf::from("/var/lib/warden/port.txt")
}

fn default_platform() -> String {
    match std::env::consts::OS {
        "macos" => "macOS",
        "windows" => "Windows",
        _ => "Linux",
    }
    .to_string()
}

fn default_api_host() -> String {
    "api.ivpn.net".to_string()
}

fn default_update_host() -> String {
    "repo.ivpn.net".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_dial_timeout() -> u64 {
    5
}

fn default_platform_helper() -> String {
    "/usr/lib/warden/warden-platform".to_string()
}

fn default_kem_helper() -> String {
    "/usr/lib/warden/warden-kem".to_string()
}

fn default_wg_tool() -> String {
    "/usr/bin/wg".to_string()
}

fn default_w_tunnel() -> String {
    "/usr/lib/warden/w-tunnel".to_string()
}

fn default_c_tunnel() -> String {
    "/usr/lib/warden/c-tunnel".to_string()
}

fn default_transport_proxy() -> String {
    "/usr/lib/warden/transport-proxy".to_string()
}
