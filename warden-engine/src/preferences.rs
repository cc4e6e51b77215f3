//! Persistent user preferences (`settings.json`)
//!
//! The store owns the on-disk settings. Saves go through a `.tmp` sibling
//! that is renamed over the primary file, so a crash never leaves a torn
//! file; a load falls back to the sibling when the primary is unreadable.

use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use warden_proto::response::SessionResp;
use warden_proto::types::UserPreferences;
use warden_proto::{AccountStatus, ConnectionParams, WiFiParams, PROTOCOL_VERSION};

use crate::error::{Error, Result};

/// Default tunnel-key rotation interval (seconds)
pub const DEFAULT_WG_KEYS_INTERVAL: i64 = 24 * 60 * 60;

/// Block list that was the only choice before named lists existed
const LEGACY_BLOCK_LIST: &str = "Oisdbig";

/// Credentials of the logged-in account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStatus {
    #[serde(rename = "AccountID")]
    pub account_id: String,
    /// Session token
    #[serde(rename = "Session")]
    pub session: String,
    #[serde(rename = "OpenVPNUser")]
    pub vpn_user: String,
    #[serde(rename = "OpenVPNPass")]
    pub vpn_pass: String,
    #[serde(rename = "WGPublicKey")]
    pub wg_public_key: String,
    #[serde(rename = "WGPrivateKey")]
    pub wg_private_key: String,
    #[serde(rename = "WGLocalIP")]
    pub wg_local_ip: String,
    #[serde(rename = "WGPreSharedKey")]
    pub wg_preshared_key: String,
    /// Unix seconds, 0 when the keys are incomplete
    #[serde(rename = "WGKeyGenerated")]
    pub wg_key_generated: i64,
    /// Seconds
    #[serde(rename = "WGKeysRegenInerval")]
    pub wg_keys_regen_interval: i64,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            session: String::new(),
            vpn_user: String::new(),
            vpn_pass: String::new(),
            wg_public_key: String::new(),
            wg_private_key: String::new(),
            wg_local_ip: String::new(),
            wg_preshared_key: String::new(),
            wg_key_generated: 0,
            wg_keys_regen_interval: DEFAULT_WG_KEYS_INTERVAL,
        }
    }
}

impl SessionStatus {
    pub fn is_logged_in(&self) -> bool {
        !self.session.is_empty()
    }

    /// Public key, private key and local IP are all present
    pub fn is_wg_credentials_ok(&self) -> bool {
        !self.wg_public_key.is_empty()
            && !self.wg_private_key.is_empty()
            && !self.wg_local_ip.is_empty()
    }

    fn update_wg_keys(&mut self, keys: WgKeys) {
        let mut local_ip = keys.local_ip.trim().to_string();
        if !local_ip.is_empty() && local_ip.parse::<IpAddr>().is_err() {
            log::error!("Unable to save tunnel credentials (local IP has wrong format)");
            local_ip.clear();
        }

        self.wg_public_key = keys.public_key.trim().to_string();
        self.wg_private_key = keys.private_key.trim().to_string();
        self.wg_local_ip = local_ip;
        self.wg_preshared_key = keys.preshared_key.trim().to_string();

        self.wg_key_generated = if self.is_wg_credentials_ok() {
            chrono::Utc::now().timestamp()
        } else {
            0
        };
    }

    /// Wire form; the private key never leaves the daemon
    pub fn to_resp(&self) -> SessionResp {
        SessionResp {
            account_id: self.account_id.clone(),
            session: self.session.clone(),
            wg_public_key: self.wg_public_key.clone(),
            wg_local_ip: self.wg_local_ip.clone(),
            wg_key_generated: self.wg_key_generated,
            wg_keys_regen_inerval: self.wg_keys_regen_interval,
            wg_use_preshared_key: !self.wg_preshared_key.is_empty(),
        }
    }
}

/// Tunnel key material
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WgKeys {
    pub public_key: String,
    pub private_key: String,
    pub local_ip: String,
    pub preshared_key: String,
}

/// Everything a successful login produces
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCredentials {
    pub account_id: String,
    pub session: String,
    pub vpn_user: String,
    pub vpn_pass: String,
    pub wg: WgKeys,
}

/// All persisted daemon preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Preferences {
    /// Daemon version that saved the file
    pub version: String,
    /// Changes whenever the settings are recreated from scratch
    #[serde(rename = "SettingsSessionUUID")]
    pub settings_session_uuid: String,
    pub is_logging: bool,
    pub is_fw_persistant: bool,
    #[serde(rename = "IsFwAllowLAN")]
    pub is_fw_allow_lan: bool,
    #[serde(rename = "IsFwAllowLANMulticast")]
    pub is_fw_allow_lan_multicast: bool,
    pub is_fw_allow_api_servers: bool,
    /// Comma separated `x.x.x.x[/xx]` list
    pub fw_user_exceptions: String,
    pub is_stop_on_client_disconnect: bool,
    pub is_autoconnect_on_launch: bool,
    /// Also auto-connect at daemon start and user logon, not only on UI attach
    pub is_autoconnect_on_launch_daemon: bool,

    pub is_split_tunnel: bool,
    pub is_split_tunnel_inversed: bool,
    pub is_split_tunnel_any_dns: bool,
    pub is_split_tunnel_allow_when_no_vpn: bool,
    pub split_tunnel_apps: Vec<String>,

    pub session: SessionStatus,
    pub account: AccountStatus,
    pub user_prefs: UserPreferences,
    pub last_connection_params: ConnectionParams,
    #[serde(rename = "WiFiControl")]
    pub wifi_control: WiFiParams,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            version: String::new(),
            settings_session_uuid: new_uuid(),
            is_logging: false,
            is_fw_persistant: false,
            is_fw_allow_lan: false,
            is_fw_allow_lan_multicast: false,
            is_fw_allow_api_servers: true,
            fw_user_exceptions: String::new(),
            is_stop_on_client_disconnect: false,
            is_autoconnect_on_launch: false,
            is_autoconnect_on_launch_daemon: false,
            is_split_tunnel: false,
            is_split_tunnel_inversed: false,
            is_split_tunnel_any_dns: false,
            is_split_tunnel_allow_when_no_vpn: false,
            split_tunnel_apps: Vec::new(),
            session: SessionStatus::default(),
            account: AccountStatus::default(),
            user_prefs: UserPreferences::default(),
            last_connection_params: ConnectionParams::default(),
            wifi_control: WiFiParams::default(),
        }
    }
}

impl Preferences {
    /// Parse a settings file and bring it up to date
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let mut value: Value = serde_json::from_slice(data)?;
        hoist_obfuscator_config(&mut value);
        let mut prefs: Preferences = serde_json::from_value(value)?;
        prefs.migrate();
        Ok(prefs)
    }

    fn migrate(&mut self) {
        if !self.session.is_wg_credentials_ok() {
            self.session.wg_key_generated = 0;
        }
        if self.session.wg_keys_regen_interval <= 0 {
            self.session.wg_keys_regen_interval = DEFAULT_WG_KEYS_INTERVAL;
            log::info!(
                "Default value for preferences: WGKeysRegenInerval={}s",
                DEFAULT_WG_KEYS_INTERVAL
            );
        }
        if self.settings_session_uuid.is_empty() {
            self.settings_session_uuid = new_uuid();
        }

        if compare_versions(&self.version, "3.10.0") <= 0 {
            let anti_tracker = &mut self.last_connection_params.metadata.anti_tracker;
            if anti_tracker.anti_tracker_block_list_name.is_empty() {
                log::info!(
                    "Upgrading from {}: keeping the previous default block list '{}'",
                    display_version(&self.version),
                    LEGACY_BLOCK_LIST
                );
                anti_tracker.anti_tracker_block_list_name = LEGACY_BLOCK_LIST.to_string();
            }
        }

        if compare_versions(&self.version, "3.11.0") <= 0 {
            log::info!(
                "Upgrading from {}: allowing API servers through the firewall",
                display_version(&self.version)
            );
            self.is_fw_allow_api_servers = true;
        }

        self.wifi_control.dedup_networks();
    }

    /// Wire form of the daemon-level settings
    pub fn settings_resp(&self) -> warden_proto::response::SettingsResp {
        warden_proto::response::SettingsResp {
            is_autoconnect_on_launch: self.is_autoconnect_on_launch,
            is_autoconnect_on_launch_daemon: self.is_autoconnect_on_launch_daemon,
            is_logging: self.is_logging,
            is_stop_on_client_disconnect: self.is_stop_on_client_disconnect,
            user_prefs: self.user_prefs.clone(),
            wifi: self.wifi_control.clone(),
        }
    }

    /// JSON of the preferences with credentials blanked, for diagnostics
    pub fn redacted(&self) -> Value {
        let mut copy = self.clone();
        for secret in [
            &mut copy.session.session,
            &mut copy.session.vpn_user,
            &mut copy.session.vpn_pass,
            &mut copy.session.wg_private_key,
            &mut copy.session.wg_preshared_key,
        ] {
            if !secret.is_empty() {
                *secret = "<redacted>".to_string();
            }
        }
        let proxy = &mut copy.last_connection_params.c_tunnel.proxy;
        if !proxy.password.is_empty() {
            proxy.password = "<redacted>".to_string();
        }
        serde_json::to_value(&copy).unwrap_or(Value::Null)
    }
}

/// Settings written by older releases kept the obfuscator config at top level
fn hoist_obfuscator_config(value: &mut Value) {
    let Some(root) = value.as_object_mut() else {
        return;
    };
    let Some(obfs) = root.remove("Obfs4proxy") else {
        return;
    };
    let Some(c_tunnel) = root
        .entry("LastConnectionParams")
        .or_insert_with(|| Value::Object(Default::default()))
        .as_object_mut()
        .map(|params| {
            params
                .entry("OpenVpnParameters")
                .or_insert_with(|| Value::Object(Default::default()))
        })
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    if !c_tunnel.contains_key("Obfs4proxy") && obfs.is_object() {
        log::info!("Moving obfuscator settings into the C-Tunnel parameters");
        c_tunnel.insert("Obfs4proxy".to_string(), obfs);
    }
}

fn display_version(version: &str) -> &str {
    if version.is_empty() {
        "<unknown version>"
    } else {
        version
    }
}

/// Compare dotted version strings numerically
///
/// Missing components count as 0 and non-numeric suffixes are ignored
/// (`3.10.23-beta` == `3.10.23`). An empty version is older than anything.
pub fn compare_versions(a: &str, b: &str) -> i32 {
    fn parts(v: &str) -> Option<Vec<u64>> {
        let v = v.trim();
        if v.is_empty() {
            return None;
        }
        Some(
            v.split('.')
                .map(|p| {
                    let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
                    digits.parse().unwrap_or(0)
                })
                .collect(),
        )
    }

    match (parts(a), parts(b)) {
        (None, None) => 0,
        (None, Some(_)) => -1,
        (Some(_), None) => 1,
        (Some(a), Some(b)) => {
            let len = a.len().max(b.len());
            for i in 0..len {
                let x = a.get(i).copied().unwrap_or(0);
                let y = b.get(i).copied().unwrap_or(0);
                if x != y {
                    return if x < y { -1 } else { 1 };
                }
            }
            0
        }
    }
}

fn new_uuid() -> String {
    let mut bytes: [u8; 16] = rand::random();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write `data` to `path` atomically with owner-only permissions
pub fn write_private_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    let tmp = tmp_path(path);

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }

    fs::rename(&tmp, path)?;
    // rename consumed it; only a failed rename leaves one behind
    let _ = fs::remove_file(&tmp);
    Ok(())
}

/// Thread-safe owner of [`Preferences`]
pub struct PreferencesStore {
    path: PathBuf,
    prefs: RwLock<Preferences>,
}

impl PreferencesStore {
    /// Load from disk; never fails (falls back to the temp sibling, then defaults)
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let prefs = match Self::read(&path) {
            Ok(prefs) => prefs,
            Err(primary_err) => {
                let tmp = tmp_path(&path);
                match Self::read(&tmp) {
                    Ok(prefs) => {
                        log::warn!(
                            "Failed to read preferences ({}); using {}",
                            primary_err,
                            tmp.display()
                        );
                        prefs
                    }
                    Err(_) => {
                        log::warn!(
                            "Failed to read preferences from {} ({}); using defaults",
                            path.display(),
                            primary_err
                        );
                        Preferences::default()
                    }
                }
            }
        };
        Self {
            path,
            prefs: RwLock::new(prefs),
        }
    }

    /// Store over the given preferences without touching the disk
    pub fn new(path: impl Into<PathBuf>, prefs: Preferences) -> Self {
        Self {
            path: path.into(),
            prefs: RwLock::new(prefs),
        }
    }

    fn read(path: &Path) -> Result<Preferences> {
        let data = fs::read(path)?;
        Preferences::from_json(&data)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current preferences
    pub fn get(&self) -> Preferences {
        self.prefs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn session(&self) -> SessionStatus {
        self.prefs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .session
            .clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.prefs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .session
            .is_logged_in()
    }

    /// Mutate and persist
    ///
    /// The in-memory change stays even when the save fails; the error is
    /// returned to the caller.
    pub fn update<R>(&self, f: impl FnOnce(&mut Preferences) -> R) -> Result<R> {
        let mut prefs = self.prefs.write().unwrap_or_else(|e| e.into_inner());
        let result = f(&mut prefs);
        Self::persist(&self.path, &mut prefs)?;
        Ok(result)
    }

    pub fn save(&self) -> Result<()> {
        let mut prefs = self.prefs.write().unwrap_or_else(|e| e.into_inner());
        Self::persist(&self.path, &mut prefs)
    }

    fn persist(path: &Path, prefs: &mut Preferences) -> Result<()> {
        prefs.version = PROTOCOL_VERSION.to_string();
        let data = serde_json::to_vec(&*prefs)?;
        write_private_file(path, &data).map_err(|e| {
            log::error!("Failed to save preferences to {}: {}", path.display(), e);
            e
        })
    }

    /// Store a fresh login; an empty token or account clears the account data
    pub fn set_session(&self, account: AccountStatus, creds: SessionCredentials) -> Result<()> {
        self.update(|p| {
            let interval = p.session.wg_keys_regen_interval;
            p.account = if creds.session.trim().is_empty() || creds.account_id.trim().is_empty() {
                AccountStatus::default()
            } else {
                account
            };
            p.session = SessionStatus {
                account_id: creds.account_id.trim().to_string(),
                session: creds.session.trim().to_string(),
                vpn_user: creds.vpn_user.trim().to_string(),
                vpn_pass: creds.vpn_pass.trim().to_string(),
                wg_keys_regen_interval: if interval > 0 {
                    interval
                } else {
                    DEFAULT_WG_KEYS_INTERVAL
                },
                ..Default::default()
            };
            p.session.update_wg_keys(creds.wg);
        })
    }

    /// Clear the session and account, keeping the rotation interval
    pub fn logout(&self) -> Result<()> {
        self.set_session(AccountStatus::default(), SessionCredentials::default())
    }

    pub fn update_account_info(&self, account: AccountStatus) -> Result<()> {
        self.update(|p| {
            p.account = if p.session.is_logged_in() && !p.session.account_id.is_empty() {
                account
            } else {
                AccountStatus::default()
            };
        })
    }

    pub fn update_wg_keys(&self, keys: WgKeys) -> Result<()> {
        self.update(|p| p.session.update_wg_keys(keys))
    }

    /// Drop local tunnel keys (the session itself stays)
    pub fn erase_wg_keys(&self) -> Result<()> {
        self.update_wg_keys(WgKeys::default())
    }

    pub fn set_wg_keys_rotation_interval(&self, seconds: i64) -> Result<()> {
        if seconds <= 0 {
            return Err(Error::InvalidArgument(format!(
                "key rotation interval must be positive: {}",
                seconds
            )));
        }
        self.update(|p| p.session.wg_keys_regen_interval = seconds)
    }

    /// Apply a `SetPreference` key/value pair
    ///
    /// Returns `false` for keys this daemon does not know; those are ignored.
    pub fn set_preference(&self, key: &str, value: &str) -> Result<bool> {
        let flag = || {
            value
                .trim()
                .to_ascii_lowercase()
                .parse::<bool>()
                .map_err(|_| Error::InvalidArgument(format!("{}: expected a boolean, got '{}'", key, value)))
        };

        let known = match key {
            "IsLogging" => {
                let v = flag()?;
                self.update(|p| p.is_logging = v)?;
                true
            }
            "IsFwPersistant" => {
                let v = flag()?;
                self.update(|p| p.is_fw_persistant = v)?;
                true
            }
            "IsFwAllowLAN" => {
                let v = flag()?;
                self.update(|p| p.is_fw_allow_lan = v)?;
                true
            }
            "IsFwAllowLANMulticast" => {
                let v = flag()?;
                self.update(|p| p.is_fw_allow_lan_multicast = v)?;
                true
            }
            "IsFwAllowApiServers" => {
                let v = flag()?;
                self.update(|p| p.is_fw_allow_api_servers = v)?;
                true
            }
            "FwUserExceptions" => {
                let v = value.trim().to_string();
                self.update(|p| p.fw_user_exceptions = v)?;
                true
            }
            "IsStopOnClientDisconnect" => {
                let v = flag()?;
                self.update(|p| p.is_stop_on_client_disconnect = v)?;
                true
            }
            "IsAutoconnectOnLaunch" => {
                let v = flag()?;
                self.update(|p| p.is_autoconnect_on_launch = v)?;
                true
            }
            "IsAutoconnectOnLaunchDaemon" => {
                let v = flag()?;
                self.update(|p| p.is_autoconnect_on_launch_daemon = v)?;
                true
            }
            "EnableIPv6InTunnel" => {
                let v = flag()?;
                self.update(|p| p.last_connection_params.ipv6 = v)?;
                true
            }
            _ => {
                log::warn!("Preference key '{}' not supported", key);
                false
            }
        };

        if known {
            log::info!("Preference {}='{}'", key, value);
        }
        Ok(known)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> PreferencesStore {
        PreferencesStore::load(dir.path().join("settings.json"))
    }

    fn login(store: &PreferencesStore) {
        store
            .set_session(
                AccountStatus {
                    active: true,
                    current_plan: "Standard".into(),
                    ..Default::default()
                },
                SessionCredentials {
                    account_id: "i-AAAA-BBBB-CCCC".into(),
                    session: "tok".into(),
                    vpn_user: "user".into(),
                    vpn_pass: "pass".into(),
                    wg: WgKeys {
                        public_key: "pub".into(),
                        private_key: "priv".into(),
                        local_ip: "10.0.0.2".into(),
                        preshared_key: "psk".into(),
                    },
                },
            )
            .unwrap();
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("3.10.0", "3.10.0"), 0);
        assert_eq!(compare_versions("3.9.45", "3.10.0"), -1);
        assert_eq!(compare_versions("3.10.23", "3.10.0"), 1);
        assert_eq!(compare_versions("3.11", "3.11.0"), 0);
        assert_eq!(compare_versions("3.11.0-beta", "3.11.0"), 0);
        assert_eq!(compare_versions("", "3.10.0"), -1);
        assert_eq!(compare_versions("4", "3.99.99"), 1);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let prefs = store.get();
        assert!(prefs.is_fw_allow_api_servers);
        assert!(!prefs.session.is_logged_in());
        assert_eq!(prefs.session.wg_keys_regen_interval, DEFAULT_WG_KEYS_INTERVAL);
        assert_eq!(prefs.settings_session_uuid.len(), 36);
    }

    #[test]
    fn test_save_load_fixed_point() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        login(&store);
        store.set_preference("IsAutoconnectOnLaunch", "true").unwrap();

        let first = fs::read(store.path()).unwrap();
        let reloaded = store_in(&dir);
        reloaded.save().unwrap();
        let second = fs::read(store.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(reloaded.get(), store.get());
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save().unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!tmp_path(store.path()).exists());
    }

    #[test]
    fn test_falls_back_to_tmp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, b"{ not json").unwrap();
        fs::write(
            tmp_path(&path),
            br#"{"Version":"3.14.0","IsLogging":true}"#,
        )
        .unwrap();

        let store = PreferencesStore::load(&path);
        assert!(store.get().is_logging);
    }

    #[test]
    fn test_migrations_from_old_version() {
        let data = br#"{
            "Version": "3.9.45",
            "IsFwAllowApiServers": false,
            "Obfs4proxy": {"Obfs4Type": 2, "Obfs4Iat": 1},
            "Session": {"AccountID": "i-AAAA-BBBB-CCCC", "Session": "tok",
                        "WGPublicKey": "pub", "WGKeyGenerated": 1700000000}
        }"#;
        let prefs = Preferences::from_json(data).unwrap();

        assert!(prefs.is_fw_allow_api_servers);
        assert_eq!(
            prefs
                .last_connection_params
                .metadata
                .anti_tracker
                .anti_tracker_block_list_name,
            "Oisdbig"
        );
        assert_eq!(prefs.last_connection_params.c_tunnel.obfuscator.obfs4_type, 2);
        // keys incomplete: timestamp reset
        assert_eq!(prefs.session.wg_key_generated, 0);
        assert_eq!(prefs.session.wg_keys_regen_interval, DEFAULT_WG_KEYS_INTERVAL);
    }

    #[test]
    fn test_current_version_is_not_migrated() {
        let data = br#"{"Version": "3.14.0", "IsFwAllowApiServers": false}"#;
        let prefs = Preferences::from_json(data).unwrap();
        assert!(!prefs.is_fw_allow_api_servers);
        assert!(prefs
            .last_connection_params
            .metadata
            .anti_tracker
            .anti_tracker_block_list_name
            .is_empty());
    }

    #[test]
    fn test_logout_clears_session_keeps_interval() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.set_wg_keys_rotation_interval(3600).unwrap();
        login(&store);

        let session = store.session();
        assert!(session.is_logged_in());
        assert!(session.is_wg_credentials_ok());
        assert!(session.wg_key_generated > 0);
        assert!(session.to_resp().wg_use_preshared_key);

        store.logout().unwrap();
        let prefs = store.get();
        assert_eq!(prefs.session.session, "");
        assert_eq!(prefs.session.wg_public_key, "");
        assert_eq!(prefs.session.wg_preshared_key, "");
        assert_eq!(prefs.account, AccountStatus::default());
        assert_eq!(prefs.session.wg_keys_regen_interval, 3600);
    }

    #[test]
    fn test_invalid_local_ip_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        login(&store);
        store
            .update_wg_keys(WgKeys {
                public_key: "pub2".into(),
                private_key: "priv2".into(),
                local_ip: "not-an-ip".into(),
                preshared_key: String::new(),
            })
            .unwrap();
        let session = store.session();
        assert_eq!(session.wg_local_ip, "");
        assert!(!session.is_wg_credentials_ok());
        assert_eq!(session.wg_key_generated, 0);
    }

    #[test]
    fn test_set_preference_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        assert!(store.set_preference("IsStopOnClientDisconnect", "true").unwrap());
        assert!(store.set_preference("EnableIPv6InTunnel", "TRUE").unwrap());
        assert!(store.set_preference("FwUserExceptions", " 10.0.0.0/8 ").unwrap());
        assert!(!store.set_preference("NoSuchKey", "1").unwrap());
        assert!(store.set_preference("IsLogging", "maybe").is_err());

        let prefs = store.get();
        assert!(prefs.is_stop_on_client_disconnect);
        assert!(prefs.last_connection_params.ipv6);
        assert_eq!(prefs.fw_user_exceptions, "10.0.0.0/8");
    }

    #[test]
    fn test_account_info_needs_session() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .update_account_info(AccountStatus {
                active: true,
                ..Default::default()
            })
            .unwrap();
        assert!(!store.get().account.active);
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        login(&store);
        let text = store.get().redacted().to_string();
        assert!(!text.contains("\"tok\""));
        assert!(!text.contains("priv"));
        assert!(text.contains("i-AAAA-BBBB-CCCC"));
    }
}
