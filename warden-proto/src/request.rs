//! Client -> daemon messages
//!
//! A request line is decoded in two steps: first the [`RequestHeader`]
//! (`Command`, `Idx`, `ProtocolSecret`), then the full [`Request`] which is
//! internally tagged by `Command`.

use serde::{Deserialize, Serialize};

use crate::dns::DnsSettings;
use crate::servers::PortInfo;
use crate::types::{
    AntiTrackerMetadata, ClientType, ConnectionParams, IpProtocol, UserPreferences, VpnType,
    WiFiParams,
};

/// Fields common to every request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    #[serde(rename = "Command")]
    pub command: String,
    #[serde(rename = "Idx", default)]
    pub idx: i64,
    /// EAA secret, empty when not used
    #[serde(rename = "ProtocolSecret", default)]
    pub protocol_secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Hello {
    pub version: String,
    /// Per-launch secret read from the handoff file
    pub secret: u64,
    pub client_type: ClientType,
    pub get_servers_list: bool,
    pub get_status: bool,
    pub get_split_tunnel_status: bool,
    #[serde(rename = "GetWiFiCurrentState")]
    pub get_wifi_current_state: bool,
    /// Leave the VPN and firewall untouched when this client goes away
    pub keep_daemon_alone: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PingServers {
    pub time_out_ms: u64,
    pub vpn_type_prioritized: VpnType,
    pub vpn_type_prioritization: bool,
    pub skip_second_phase: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CheckAccessiblePorts {
    pub ports_to_test: Vec<PortInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct KillSwitchSetEnabled {
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct KillSwitchSetIsPersistent {
    pub is_persistent: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchSetAllowLan {
    #[serde(rename = "AllowLAN")]
    pub allow_lan: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchSetAllowLanMulticast {
    #[serde(rename = "AllowLANMulticast")]
    pub allow_lan_multicast: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct KillSwitchSetAllowApiServers {
    pub is_allow_api_servers: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct KillSwitchSetUserExceptions {
    /// Comma separated list of `x.x.x.x[/xx]` entries
    pub user_exceptions: String,
    pub fail_on_parsing_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SetPreference {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SetUserPreferences {
    pub user_prefs: UserPreferences,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SetAlternateDns {
    pub dns: DnsSettings,
    pub anti_tracker: AntiTrackerMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Connect {
    pub params: ConnectionParams,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PauseConnection {
    /// Pause length in seconds
    pub duration: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SessionNew {
    #[serde(rename = "AccountID")]
    pub account_id: String,
    pub force_login: bool,
    #[serde(rename = "CaptchaID")]
    pub captcha_id: String,
    pub captcha: String,
    #[serde(rename = "Confirmation2FA")]
    pub confirmation_2fa: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SessionDelete {
    pub need_to_reset_settings: bool,
    pub need_to_disable_firewall: bool,
    pub is_can_delete_session_locally: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ParanoidModeSetPassword {
    pub new_secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WireGuardGenerateNewKeys {
    pub only_update_if_necessary: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WireGuardSetKeysRotationInterval {
    /// Interval in seconds
    pub interval: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WiFiSettings {
    pub params: WiFiParams,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SplitTunnelSetConfig {
    pub is_enabled: bool,
    pub is_inversed: bool,
    pub is_any_dns: bool,
    pub is_allow_when_no_vpn: bool,
    /// Disable and erase all split-tunnel configuration; other fields are ignored
    pub reset: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SplitTunnelAddApp {
    pub exec: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SplitTunnelRemoveApp {
    pub pid: i32,
    pub exec: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SplitTunnelAddedPidInfo {
    pub pid: i32,
    pub exec: String,
    pub cmd_to_execute: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiRequest {
    #[serde(rename = "APIPath")]
    pub api_path: String,
    #[serde(rename = "IPProtocolRequired")]
    pub ip_protocol_required: IpProtocol,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GetInstalledApps {
    #[serde(rename = "ExtraArgsJSON")]
    pub extra_args_json: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GetAppIcon {
    pub app_binary_path: String,
}

/// Every request the daemon understands, tagged by `Command`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Command")]
pub enum Request {
    Hello(Hello),

    // Session
    SessionNew(SessionNew),
    SessionDelete(SessionDelete),
    AccountStatus,
    #[serde(rename = "ParanoidModeSetPasswordReq")]
    ParanoidModeSetPassword(ParanoidModeSetPassword),

    // Connection
    Connect(Connect),
    Disconnect,
    PauseConnection(PauseConnection),
    ResumeConnection,
    #[serde(rename = "GetVPNState")]
    GetVPNState,
    ConnectSettings(Connect),
    ConnectSettingsGet,

    // Catalog
    GetServers,
    PingServers(PingServers),
    CheckAccessiblePorts(CheckAccessiblePorts),

    // Firewall
    KillSwitchGetStatus,
    KillSwitchSetEnabled(KillSwitchSetEnabled),
    KillSwitchSetIsPersistent(KillSwitchSetIsPersistent),
    #[serde(rename = "KillSwitchSetAllowLAN")]
    KillSwitchSetAllowLan(KillSwitchSetAllowLan),
    #[serde(rename = "KillSwitchSetAllowLANMulticast")]
    KillSwitchSetAllowLanMulticast(KillSwitchSetAllowLanMulticast),
    KillSwitchSetAllowApiServers(KillSwitchSetAllowApiServers),
    KillSwitchSetUserExceptions(KillSwitchSetUserExceptions),

    // DNS
    SetAlternateDns(SetAlternateDns),
    GetDnsPredefinedConfigs,

    // Split tunnel
    SplitTunnelGetStatus,
    SplitTunnelSetConfig(SplitTunnelSetConfig),
    SplitTunnelAddApp(SplitTunnelAddApp),
    SplitTunnelRemoveApp(SplitTunnelRemoveApp),
    SplitTunnelAddedPidInfo(SplitTunnelAddedPidInfo),

    // Preferences
    SetPreference(SetPreference),
    SetUserPreferences(SetUserPreferences),

    // Tunnel keys
    WireGuardGenerateNewKeys(WireGuardGenerateNewKeys),
    WireGuardSetKeysRotationInterval(WireGuardSetKeysRotationInterval),

    // Wi-Fi
    WiFiAvailableNetworks,
    WiFiCurrentNetwork,
    WiFiSettings(WiFiSettings),

    // Introspection
    #[serde(rename = "APIRequest")]
    ApiRequest(ApiRequest),
    GenerateDiagnostics,
    GetInstalledApps(GetInstalledApps),
    GetAppIcon(GetAppIcon),
}

impl Request {
    /// Commands accepted without the EAA secret when EAA is enabled
    pub const EAA_WHITELIST: &'static [&'static str] = &[
        "Hello",
        "GetVPNState",
        "GetServers",
        "PingServers",
        "APIRequest",
        "WiFiAvailableNetworks",
        "KillSwitchGetStatus",
        "SplitTunnelGetStatus",
        "GetDnsPredefinedConfigs",
        "AccountStatus",
    ];

    /// Every command name the daemon accepts
    pub const COMMANDS: &'static [&'static str] = &[
        "Hello",
        "SessionNew",
        "SessionDelete",
        "AccountStatus",
        "ParanoidModeSetPasswordReq",
        "Connect",
        "Disconnect",
        "PauseConnection",
        "ResumeConnection",
        "GetVPNState",
        "ConnectSettings",
        "ConnectSettingsGet",
        "GetServers",
        "PingServers",
        "CheckAccessiblePorts",
        "KillSwitchGetStatus",
        "KillSwitchSetEnabled",
        "KillSwitchSetIsPersistent",
        "KillSwitchSetAllowLAN",
        "KillSwitchSetAllowLANMulticast",
        "KillSwitchSetAllowApiServers",
        "KillSwitchSetUserExceptions",
        "SetAlternateDns",
        "GetDnsPredefinedConfigs",
        "SplitTunnelGetStatus",
        "SplitTunnelSetConfig",
        "SplitTunnelAddApp",
        "SplitTunnelRemoveApp",
        "SplitTunnelAddedPidInfo",
        "SetPreference",
        "SetUserPreferences",
        "WireGuardGenerateNewKeys",
        "WireGuardSetKeysRotationInterval",
        "WiFiAvailableNetworks",
        "WiFiCurrentNetwork",
        "WiFiSettings",
        "APIRequest",
        "GenerateDiagnostics",
        "GetInstalledApps",
        "GetAppIcon",
    ];

    /// Wire name of the command
    pub fn command(&self) -> &'static str {
        match self {
            Request::Hello(_) => "Hello",
            Request::SessionNew(_) => "SessionNew",
            Request::SessionDelete(_) => "SessionDelete",
            Request::AccountStatus => "AccountStatus",
            Request::ParanoidModeSetPassword(_) => "ParanoidModeSetPasswordReq",
            Request::Connect(_) => "Connect",
            Request::Disconnect => "Disconnect",
            Request::PauseConnection(_) => "PauseConnection",
            Request::ResumeConnection => "ResumeConnection",
            Request::GetVPNState => "GetVPNState",
            Request::ConnectSettings(_) => "ConnectSettings",
            Request::ConnectSettingsGet => "ConnectSettingsGet",
            Request::GetServers => "GetServers",
            Request::PingServers(_) => "PingServers",
            Request::CheckAccessiblePorts(_) => "CheckAccessiblePorts",
            Request::KillSwitchGetStatus => "KillSwitchGetStatus",
            Request::KillSwitchSetEnabled(_) => "KillSwitchSetEnabled",
            Request::KillSwitchSetIsPersistent(_) => "KillSwitchSetIsPersistent",
            Request::KillSwitchSetAllowLan(_) => "KillSwitchSetAllowLAN",
            Request::KillSwitchSetAllowLanMulticast(_) => "KillSwitchSetAllowLANMulticast",
            Request::KillSwitchSetAllowApiServers(_) => "KillSwitchSetAllowApiServers",
            Request::KillSwitchSetUserExceptions(_) => "KillSwitchSetUserExceptions",
            Request::SetAlternateDns(_) => "SetAlternateDns",
            Request::GetDnsPredefinedConfigs => "GetDnsPredefinedConfigs",
            Request::SplitTunnelGetStatus => "SplitTunnelGetStatus",
            Request::SplitTunnelSetConfig(_) => "SplitTunnelSetConfig",
            Request::SplitTunnelAddApp(_) => "SplitTunnelAddApp",
            Request::SplitTunnelRemoveApp(_) => "SplitTunnelRemoveApp",
            Request::SplitTunnelAddedPidInfo(_) => "SplitTunnelAddedPidInfo",
            Request::SetPreference(_) => "SetPreference",
            Request::SetUserPreferences(_) => "SetUserPreferences",
            Request::WireGuardGenerateNewKeys(_) => "WireGuardGenerateNewKeys",
            Request::WireGuardSetKeysRotationInterval(_) => "WireGuardSetKeysRotationInterval",
            Request::WiFiAvailableNetworks => "WiFiAvailableNetworks",
            Request::WiFiCurrentNetwork => "WiFiCurrentNetwork",
            Request::WiFiSettings(_) => "WiFiSettings",
            Request::ApiRequest(_) => "APIRequest",
            Request::GenerateDiagnostics => "GenerateDiagnostics",
            Request::GetInstalledApps(_) => "GetInstalledApps",
            Request::GetAppIcon(_) => "GetAppIcon",
        }
    }

    /// Whether the command may run without the EAA secret
    pub fn is_eaa_whitelisted(command: &str) -> bool {
        Self::EAA_WHITELIST.contains(&command)
    }
}
