//! Daemon -> client messages
//!
//! Responses carry the `Idx` of the request that produced them; broadcasts
//! carry `Idx = 0`. The `Idx` field is added by [`crate::codec`], so the
//! payload structs here only describe the command-specific fields.

use serde::{Deserialize, Serialize};

use crate::dns::DnsSettings;
use crate::servers::{PortInfo, ServersInfo};
use crate::types::{
    AccountStatus, ConnectionParams, DisconnectReason, ErrorType, UserPreferences, VpnState,
    VpnType, WiFiParams,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SessionResp {
    #[serde(rename = "AccountID")]
    pub account_id: String,
    /// Session token; never logged
    pub session: String,
    pub wg_public_key: String,
    #[serde(rename = "WgLocalIP")]
    pub wg_local_ip: String,
    /// Unix seconds
    pub wg_key_generated: i64,
    /// Seconds; the misspelling is part of the wire format
    pub wg_keys_regen_inerval: i64,
    pub wg_use_preshared_key: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DnsAbilities {
    pub can_use_dns_over_tls: bool,
    pub can_use_dns_over_https: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ParanoidModeStatus {
    pub is_enabled: bool,
}

/// Functionality unavailable on this host, with a human-readable reason
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DisabledFunctions {
    pub w_tunnel_error: String,
    pub c_tunnel_error: String,
    pub split_tunnel_error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SettingsResp {
    pub is_autoconnect_on_launch: bool,
    pub is_autoconnect_on_launch_daemon: bool,
    pub is_logging: bool,
    pub is_stop_on_client_disconnect: bool,
    pub user_prefs: UserPreferences,
    #[serde(rename = "WiFi")]
    pub wifi: WiFiParams,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HelloResp {
    pub version: String,
    pub processor_arch: String,
    pub session: SessionResp,
    pub account: AccountStatus,
    pub disabled_functions: DisabledFunctions,
    pub dns: DnsAbilities,
    #[serde(rename = "SettingsSessionUUID")]
    pub settings_session_uuid: String,
    pub paranoid_mode: ParanoidModeStatus,
    pub daemon_settings: SettingsResp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ErrorResp {
    pub error_message: String,
    pub error_title: String,
    pub error_type: ErrorType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionNewResp {
    #[serde(rename = "APIStatus")]
    pub api_status: i64,
    #[serde(rename = "APIErrorMessage")]
    pub api_error_message: String,
    #[serde(rename = "Session")]
    pub session: SessionResp,
    #[serde(rename = "Account")]
    pub account: AccountStatus,
    /// Raw API body for captcha / 2FA flows
    #[serde(rename = "RawResponse")]
    pub raw_response: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountStatusResp {
    #[serde(rename = "APIStatus")]
    pub api_status: i64,
    #[serde(rename = "APIErrorMessage")]
    pub api_error_message: String,
    #[serde(rename = "SessionToken")]
    pub session_token: String,
    #[serde(rename = "Account")]
    pub account: AccountStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConnectedResp {
    pub vpn_type: VpnType,
    pub time_sec_from_1970: i64,
    #[serde(rename = "ClientIP")]
    pub client_ip: String,
    #[serde(rename = "ClientIPv6")]
    pub client_ipv6: String,
    #[serde(rename = "ServerIP")]
    pub server_ip: String,
    pub server_port: u16,
    pub exit_hostname: String,
    #[serde(rename = "ManualDNS")]
    pub manual_dns: DnsSettings,
    #[serde(rename = "IsTCP")]
    pub is_tcp: bool,
    pub mtu: u32,
    pub is_can_pause: bool,
    pub is_paused: bool,
    /// RFC3339; empty when not paused
    pub paused_till: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DisconnectedResp {
    pub failure: bool,
    pub reason: DisconnectReason,
    pub reason_description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VpnStateResp {
    /// Upper-case state name
    pub state: String,
    pub state_val: VpnState,
    pub state_additional_info: String,
}

impl VpnStateResp {
    pub fn new(state: VpnState, info: impl Into<String>) -> Self {
        Self {
            state: state.name().to_string(),
            state_val: state,
            state_additional_info: info.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServerListResp {
    #[serde(rename = "VpnServers")]
    pub vpn_servers: ServersInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PingResultType {
    pub host: String,
    /// Milliseconds
    pub ping: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PingServersResp {
    pub ping_results: Vec<PingResultType>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CheckAccessiblePortsResponse {
    pub ports: Vec<PortInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct KillSwitchStatusResp {
    pub is_enabled: bool,
    pub is_persistent: bool,
    #[serde(rename = "IsAllowLAN")]
    pub is_allow_lan: bool,
    pub is_allow_multicast: bool,
    pub is_allow_api_servers: bool,
    pub user_exceptions: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SetAlternateDnsResp {
    pub is_success: bool,
    #[serde(rename = "ChangedDNS")]
    pub changed_dns: DnsSettings,
    pub error_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DnsPredefinedConfigsResp {
    pub dns_configs: Vec<DnsSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConnectSettingsResp {
    pub params: ConnectionParams,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SplitTunnelApp {
    pub pid: i32,
    pub exec: String,
    pub cmd: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SplitTunnelStatus {
    pub is_enabled: bool,
    pub is_inversed: bool,
    pub is_any_dns: bool,
    pub is_allow_when_no_vpn: bool,
    pub is_functionality_not_available: bool,
    pub is_can_get_app_icon_for_binary: bool,
    /// Binaries configured by path
    pub split_tunnel_apps: Vec<String>,
    /// Processes currently running in the split tunnel
    pub running_apps: Vec<SplitTunnelApp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SplitTunnelAddAppCmdResp {
    pub exec: String,
    pub cmd_to_execute: String,
    pub is_already_running: bool,
    pub is_already_running_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WiFiNetworkInfo {
    #[serde(rename = "SSID")]
    pub ssid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WiFiAvailableNetworksResp {
    pub networks: Vec<WiFiNetworkInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WiFiCurrentNetworkResp {
    #[serde(rename = "SSID")]
    pub ssid: String,
    pub is_insecure_network: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiResponse {
    #[serde(rename = "APIPath")]
    pub api_path: String,
    #[serde(rename = "ResponseData")]
    pub response_data: String,
    #[serde(rename = "Error")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DiagnosticsGeneratedResp {
    pub service_log: String,
    pub settings_summary: String,
    pub last_error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AppInfo {
    pub app_name: String,
    pub app_group: String,
    pub app_bin_path: String,
    pub app_icon: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct InstalledAppsResp {
    pub apps: Vec<AppInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AppIconResp {
    pub app_binary_path: String,
    /// Base64 PNG
    pub app_icon: String,
}

/// Every response and broadcast the daemon sends, tagged by `Command`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Command")]
pub enum Response {
    EmptyResp,
    ErrorResp(ErrorResp),
    /// Error raised while no client was attached
    ErrorRespDelayed(ErrorResp),
    ServiceExitingResp,

    HelloResp(HelloResp),
    SessionNewResp(SessionNewResp),
    AccountStatusResp(AccountStatusResp),

    ConnectedResp(ConnectedResp),
    DisconnectedResp(DisconnectedResp),
    VpnStateResp(VpnStateResp),
    ConnectSettingsResp(ConnectSettingsResp),

    ServerListResp(ServerListResp),
    PingServersResp(PingServersResp),
    CheckAccessiblePortsResponse(CheckAccessiblePortsResponse),

    KillSwitchStatusResp(KillSwitchStatusResp),
    #[serde(rename = "SetAlternateDNSResp")]
    SetAlternateDnsResp(SetAlternateDnsResp),
    DnsPredefinedConfigsResp(DnsPredefinedConfigsResp),
    SettingsResp(SettingsResp),

    SplitTunnelStatus(SplitTunnelStatus),
    SplitTunnelAddAppCmdResp(SplitTunnelAddAppCmdResp),

    WiFiAvailableNetworksResp(WiFiAvailableNetworksResp),
    WiFiCurrentNetworkResp(WiFiCurrentNetworkResp),

    #[serde(rename = "APIResponse")]
    ApiResponse(ApiResponse),
    DiagnosticsGeneratedResp(DiagnosticsGeneratedResp),
    InstalledAppsResp(InstalledAppsResp),
    AppIconResp(AppIconResp),
}

impl Response {
    /// Plain error with the generic type
    pub fn error(message: impl Into<String>) -> Self {
        Response::ErrorResp(ErrorResp {
            error_message: message.into(),
            ..Default::default()
        })
    }

    pub fn typed_error(error_type: ErrorType, title: &str, message: impl Into<String>) -> Self {
        Response::ErrorResp(ErrorResp {
            error_message: message.into(),
            error_title: title.to_string(),
            error_type,
        })
    }

    pub fn vpn_state(state: VpnState, info: impl Into<String>) -> Self {
        Response::VpnStateResp(VpnStateResp::new(state, info))
    }

    /// Wire name of the response
    pub fn command(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.get("Command").and_then(|c| c.as_str()).map(str::to_string))
            .unwrap_or_default()
    }
}
