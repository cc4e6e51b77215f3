//! Shared data model: tunnel kinds, states, connection parameters, account data

use serde::{Deserialize, Serialize};

use crate::dns::DnsSettings;
use crate::servers::HostInfo;

wire_enum! {
    /// Tunnel kind
    ///
    /// The integer values are fixed by the wire format: the classical
    /// TLS-based tunnel is `0`, the UDP tunnel with per-session keys is `1`.
    pub enum VpnType {
        CTunnel = 0,
        WTunnel = 1,
    }
}

impl Default for VpnType {
    fn default() -> Self {
        VpnType::CTunnel
    }
}

impl std::fmt::Display for VpnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VpnType::CTunnel => write!(f, "C-Tunnel"),
            VpnType::WTunnel => write!(f, "W-Tunnel"),
        }
    }
}

wire_enum! {
    /// Tunnel state as reported by tunnel engines and forwarded to clients
    pub enum VpnState {
        Disconnected = 0,
        Connecting = 1,
        Wait = 2,
        Auth = 3,
        GetConfig = 4,
        AssignIp = 5,
        AddRoutes = 6,
        Connected = 7,
        Reconnecting = 8,
        TcpConnect = 9,
        Exiting = 10,
        Initialised = 11,
    }
}

impl Default for VpnState {
    fn default() -> Self {
        VpnState::Disconnected
    }
}

impl VpnState {
    /// Any state between "connect requested" and "fully stopped"
    pub fn is_active(&self) -> bool {
        !matches!(self, VpnState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, VpnState::Connected)
    }

    /// Upper-case name used in `VpnStateResp.State`
    pub fn name(&self) -> &'static str {
        match self {
            VpnState::Disconnected => "DISCONNECTED",
            VpnState::Connecting => "CONNECTING",
            VpnState::Wait => "WAIT",
            VpnState::Auth => "AUTH",
            VpnState::GetConfig => "GETCONFIG",
            VpnState::AssignIp => "ASSIGNIP",
            VpnState::AddRoutes => "ADDROUTES",
            VpnState::Connected => "CONNECTED",
            VpnState::Reconnecting => "RECONNECTING",
            VpnState::TcpConnect => "TCP_CONNECT",
            VpnState::Exiting => "EXITING",
            VpnState::Initialised => "INITIALISED",
        }
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            VpnState::Disconnected => "Disconnected",
            VpnState::Connecting => "Connecting...",
            VpnState::Wait => "Waiting for server...",
            VpnState::Auth => "Authenticating...",
            VpnState::GetConfig => "Downloading configuration...",
            VpnState::AssignIp => "Assigning addresses...",
            VpnState::AddRoutes => "Adding routes...",
            VpnState::Connected => "Connected",
            VpnState::Reconnecting => "Reconnecting...",
            VpnState::TcpConnect => "Establishing TCP connection...",
            VpnState::Exiting => "Disconnecting...",
            VpnState::Initialised => "Tunnel initialised",
        }
    }
}

impl std::fmt::Display for VpnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

wire_enum! {
    /// Why a connection ended
    pub enum DisconnectReason {
        Unknown = 0,
        AuthenticationError = 1,
        DisconnectRequested = 2,
    }
}

impl Default for DisconnectReason {
    fn default() -> Self {
        DisconnectReason::Unknown
    }
}

wire_enum! {
    /// Classification attached to `ErrorResp`
    pub enum ErrorType {
        Unknown = 0,
        ParanoidModePasswordError = 1,
    }
}

impl Default for ErrorType {
    fn default() -> Self {
        ErrorType::Unknown
    }
}

wire_enum! {
    /// Kind of local client
    pub enum ClientType {
        Ui = 0,
        Cli = 1,
    }
}

impl Default for ClientType {
    fn default() -> Self {
        ClientType::Ui
    }
}

wire_enum! {
    /// How an entry or exit server is chosen
    pub enum ServerSelection {
        Default = 0,
        Fastest = 1,
        Random = 2,
    }
}

impl Default for ServerSelection {
    fn default() -> Self {
        ServerSelection::Default
    }
}

wire_enum! {
    /// IP family constraint for API requests
    pub enum IpProtocol {
        Any = 0,
        V4 = 1,
        V6 = 2,
    }
}

impl Default for IpProtocol {
    fn default() -> Self {
        IpProtocol::Any
    }
}

wire_enum! {
    /// Optional local transport proxy placed in front of the tunnel
    pub enum TransportProxy {
        None = 0,
        Udp = 1,
        Tcp = 2,
    }
}

impl Default for TransportProxy {
    fn default() -> Self {
        TransportProxy::None
    }
}

wire_enum! {
    /// Transport of the tunnel's outer connection
    pub enum PortProtocol {
        Udp = 0,
        Tcp = 1,
    }
}

impl Default for PortProtocol {
    fn default() -> Self {
        PortProtocol::Udp
    }
}

/// Anti-tracker DNS selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AntiTrackerMetadata {
    pub enabled: bool,
    pub hardcore: bool,
    pub anti_tracker_block_list_name: String,
}

/// Client-side hints about how the parameters were produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConnectMetadata {
    pub server_selection_entry: ServerSelection,
    pub server_selection_exit: ServerSelection,
    pub anti_tracker: AntiTrackerMetadata,
    pub fastest_gateways_exclude_list: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: PortProtocol,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HostList {
    pub hosts: Vec<HostInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExitServer {
    #[serde(rename = "ExitSrvID")]
    pub exit_srv_id: String,
    pub hosts: Vec<HostInfo>,
}

/// Upstream HTTP/SOCKS proxy for the C-Tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProxyParams {
    #[serde(rename = "Type")]
    pub kind: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Obfuscator sub-process settings (C-Tunnel only); `obfs4_type == 0` disables it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ObfuscatorConfig {
    pub obfs4_type: i32,
    pub obfs4_iat: i32,
}

impl ObfuscatorConfig {
    pub fn is_enabled(&self) -> bool {
        self.obfs4_type > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WTunnelParams {
    pub port: PortSpec,
    pub entry_vpn_server: HostList,
    pub multihop_exit_server: ExitServer,
    /// 0 selects the engine default
    pub mtu: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CTunnelParams {
    pub port: PortSpec,
    pub entry_vpn_server: HostList,
    pub multihop_exit_server: ExitServer,
    pub proxy: ProxyParams,
    #[serde(rename = "Obfs4proxy")]
    pub obfuscator: ObfuscatorConfig,
}

/// Complete input of a connect request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConnectionParams {
    pub metadata: ConnectMetadata,
    #[serde(rename = "IPv6")]
    pub ipv6: bool,
    #[serde(rename = "IPv6Only")]
    pub ipv6_only: bool,
    pub vpn_type: VpnType,
    #[serde(rename = "ManualDNS")]
    pub manual_dns: DnsSettings,
    pub firewall_on: bool,
    pub firewall_on_during_connection: bool,
    pub transport_proxy: TransportProxy,
    #[serde(rename = "WireGuardParameters")]
    pub w_tunnel: WTunnelParams,
    #[serde(rename = "OpenVpnParameters")]
    pub c_tunnel: CTunnelParams,
}

impl ConnectionParams {
    pub fn entry_hosts(&self) -> &[HostInfo] {
        match self.vpn_type {
            VpnType::WTunnel => &self.w_tunnel.entry_vpn_server.hosts,
            VpnType::CTunnel => &self.c_tunnel.entry_vpn_server.hosts,
        }
    }

    pub fn entry_hosts_mut(&mut self) -> &mut Vec<HostInfo> {
        match self.vpn_type {
            VpnType::WTunnel => &mut self.w_tunnel.entry_vpn_server.hosts,
            VpnType::CTunnel => &mut self.c_tunnel.entry_vpn_server.hosts,
        }
    }

    pub fn exit_server(&self) -> &ExitServer {
        match self.vpn_type {
            VpnType::WTunnel => &self.w_tunnel.multihop_exit_server,
            VpnType::CTunnel => &self.c_tunnel.multihop_exit_server,
        }
    }

    pub fn exit_hosts(&self) -> &[HostInfo] {
        &self.exit_server().hosts
    }

    pub fn exit_hosts_mut(&mut self) -> &mut Vec<HostInfo> {
        match self.vpn_type {
            VpnType::WTunnel => &mut self.w_tunnel.multihop_exit_server.hosts,
            VpnType::CTunnel => &mut self.c_tunnel.multihop_exit_server.hosts,
        }
    }

    /// Multihop mode is implied by a non-empty exit host list
    pub fn is_multihop(&self) -> bool {
        !self.exit_hosts().is_empty()
    }

    pub fn port(&self) -> PortSpec {
        match self.vpn_type {
            VpnType::WTunnel => self.w_tunnel.port,
            VpnType::CTunnel => self.c_tunnel.port,
        }
    }

    pub fn set_port(&mut self, port: PortSpec) {
        match self.vpn_type {
            VpnType::WTunnel => self.w_tunnel.port = port,
            VpnType::CTunnel => self.c_tunnel.port = port,
        }
    }
}

/// Account capability that permits multihop connections
pub const CAPABILITY_MULTIHOP: &str = "multihop";

/// Subscription status of the logged-in account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AccountStatus {
    pub active: bool,
    pub active_until: i64,
    pub current_plan: String,
    pub payment_method: String,
    pub is_renewable: bool,
    pub will_auto_rebill: bool,
    pub is_free_trial: bool,
    pub capabilities: Vec<String>,
    pub upgradable: bool,
    pub upgrade_to_plan: String,
    #[serde(rename = "UpgradeToURL")]
    pub upgrade_to_url: String,
    pub limit: i32,
}

impl AccountStatus {
    /// Populated from a real API answer (as opposed to a default value)
    pub fn is_initialized(&self) -> bool {
        !self.current_plan.is_empty() || !self.capabilities.is_empty()
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(capability))
    }

    /// Unknown account data does not block multihop; the server decides.
    pub fn can_connect_multihop(&self) -> bool {
        !self.is_initialized() || self.has_capability(CAPABILITY_MULTIHOP)
    }
}

/// Per-SSID trust flag
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct WiFiNetwork {
    pub ssid: String,
    #[serde(rename = "isTrusted")]
    pub is_trusted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WiFiActions {
    pub un_trusted_connect_vpn: bool,
    pub un_trusted_enable_firewall: bool,
    pub un_trusted_block_lan: bool,
    pub trusted_disconnect_vpn: bool,
    pub trusted_disable_firewall: bool,
}

impl Default for WiFiActions {
    fn default() -> Self {
        Self {
            un_trusted_connect_vpn: true,
            un_trusted_enable_firewall: true,
            un_trusted_block_lan: true,
            trusted_disconnect_vpn: true,
            trusted_disable_firewall: true,
        }
    }
}

/// Trusted-network policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WiFiParams {
    pub can_apply_in_background: bool,
    #[serde(rename = "connectVPNOnInsecureNetwork")]
    pub connect_vpn_on_insecure_network: bool,
    pub trusted_networks_control: bool,
    /// `None` means unknown networks get no automatic action
    pub default_trust_status_trusted: Option<bool>,
    pub networks: Vec<WiFiNetwork>,
    pub actions: WiFiActions,
}

impl WiFiParams {
    /// Drop later duplicates of an SSID, keeping the first entry
    pub fn dedup_networks(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.networks.retain(|n| seen.insert(n.ssid.clone()));
    }

    /// Trust status of an SSID, falling back to the default trust
    pub fn trust_of(&self, ssid: &str) -> Option<bool> {
        self.networks
            .iter()
            .find(|n| n.ssid == ssid)
            .map(|n| n.is_trusted)
            .or(self.default_trust_status_trusted)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LinuxUserPreferences {
    /// Manage `/etc/resolv.conf` directly instead of going through resolved
    pub is_dns_mgmt_old_style: bool,
}

/// Platform-specific user preferences
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UserPreferences {
    pub linux: LinuxUserPreferences,
}

/// Check an account id: `i-XXXX-XXXX-XXXX` or `ivpn` followed by 7-8 alphanumerics
pub fn is_valid_account_id(account_id: &str) -> bool {
    let id = account_id.trim();
    if let Some(rest) = id.strip_prefix("i-") {
        let groups: Vec<&str> = rest.split('-').collect();
        return groups.len() == 3 && groups.iter().all(|g| g.chars().count() == 4);
    }
    if let Some(rest) = id.strip_prefix("ivpn") {
        return (7..=8).contains(&rest.len()) && rest.chars().all(|c| c.is_ascii_alphanumeric());
    }
    false
}
