//! Server catalog (`servers.json`) as published by the API and cached on disk

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::types::VpnType;

/// IPv6 endpoint of a host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostIpv6 {
    pub host: String,
    pub local_ip: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub multihop_port: u16,
}

/// Obfuscation endpoints of a C-Tunnel host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfsParams {
    pub obfs3_multihop_port: u16,
    pub obfs4_multihop_port: u16,
    pub obfs4_key: String,
}

/// One tunnel endpoint of a server
///
/// The same structure serves both tunnel kinds; `public_key` and `local_ip`
/// are only populated for W-Tunnel hosts and `obfs` only for C-Tunnel hosts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostInfo {
    pub hostname: String,
    pub host: String,
    pub dns_name: String,
    pub multihop_port: u16,
    pub load: f32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub public_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub local_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<HostIpv6>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obfs: Option<ObfsParams>,
    /// Address of the transport-proxy endpoint serving this host
    #[serde(skip_serializing_if = "String::is_empty")]
    pub v2ray: String,
}

impl HostInfo {
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.trim().parse().ok()
    }

    /// IPv6 local address inside the tunnel, if the host supports IPv6
    pub fn ipv6_local_ip(&self) -> Option<&str> {
        self.ipv6
            .as_ref()
            .map(|v6| v6.local_ip.trim())
            .filter(|ip| !ip.is_empty())
    }

    /// Gateway id prefix: `nl1.gw.example.net` -> `nl1`
    pub fn gateway_prefix(&self) -> &str {
        gateway_prefix(&self.hostname)
    }
}

/// Normalise a gateway id to its part before the first `.`
pub fn gateway_prefix(id: &str) -> &str {
    id.split('.').next().unwrap_or(id)
}

/// A location offering one or more hosts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub gateway: String,
    pub country_code: String,
    pub country: String,
    pub city: String,
    pub latitude: f32,
    pub longitude: f32,
    pub isp: String,
    pub hosts: Vec<HostInfo>,
}

impl ServerInfo {
    pub fn has_host(&self, host_ip: &str) -> bool {
        self.hosts.iter().any(|h| h.host == host_ip)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsInfo {
    pub ip: String,
    #[serde(rename = "multihop-ip", skip_serializing_if = "String::is_empty")]
    pub multihop_ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiTrackerInfo {
    pub default: DnsInfo,
    pub hardcore: DnsInfo,
}

/// Named block-list resolver pair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AntiTrackerPlusServer {
    pub name: String,
    pub description: String,
    pub normal: String,
    pub hardcore: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiTrackerPlusInfo {
    #[serde(rename = "DnsServers")]
    pub dns_servers: Vec<AntiTrackerPlusServer>,
}

/// Alternate API endpoints used when DNS resolution of the API host fails
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiInfo {
    pub ips: Vec<String>,
    pub ipv6s: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

/// A port (or port range) and its transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PortInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<PortRange>,
}

impl PortInfo {
    pub fn tcp(port: u16) -> Self {
        Self {
            kind: "TCP".into(),
            port,
            range: None,
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            kind: "UDP".into(),
            port,
            range: None,
        }
    }

    pub fn is_tcp(&self) -> bool {
        self.kind.trim().eq_ignore_ascii_case("tcp")
    }

    pub fn is_udp(&self) -> bool {
        self.kind.trim().eq_ignore_ascii_case("udp")
    }

    /// Same transport and port, ignoring letter case of the transport
    pub fn same_as(&self, other: &PortInfo) -> bool {
        self.port == other.port
            && self.is_tcp() == other.is_tcp()
            && self.is_udp() == other.is_udp()
            && self.range == other.range
    }
}

impl std::fmt::Display for PortInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.port, self.range) {
            (p, _) if p > 0 => write!(f, "{}:{}", self.kind, p),
            (_, Some(r)) if r.min > 0 && r.min < r.max => {
                write!(f, "{}:[{}-{}]", self.kind, r.min, r.max)
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfsPortInfo {
    pub port: u16,
}

/// Echo server used to probe which ports are reachable
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortTestInfo {
    pub echo_server: String,
}

/// Ports offered by transport proxies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct V2RayPorts {
    pub udp: Vec<PortInfo>,
    pub tcp: Vec<PortInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsInfo {
    pub openvpn: Vec<PortInfo>,
    pub wireguard: Vec<PortInfo>,
    pub obfs3: ObfsPortInfo,
    pub obfs4: ObfsPortInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v2ray: Option<V2RayPorts>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub test: Vec<PortTestInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServersConfig {
    pub antitracker: AntiTrackerInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub antitracker_plus: Option<AntiTrackerPlusInfo>,
    pub api: ApiInfo,
    pub ports: PortsInfo,
}

/// The full catalog
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServersInfo {
    pub wireguard: Vec<ServerInfo>,
    pub openvpn: Vec<ServerInfo>,
    pub config: ServersConfig,
}

impl ServersInfo {
    /// Servers for the given tunnel kind
    pub fn servers(&self, vpn_type: VpnType) -> &[ServerInfo] {
        match vpn_type {
            VpnType::WTunnel => &self.wireguard,
            VpnType::CTunnel => &self.openvpn,
        }
    }

    /// A catalog is usable only when both port lists are populated
    pub fn has_ports(&self) -> bool {
        !self.config.ports.openvpn.is_empty() && !self.config.ports.wireguard.is_empty()
    }

    /// Server owning the given host IP
    pub fn server_by_host(&self, vpn_type: VpnType, host_ip: &str) -> Option<&ServerInfo> {
        self.servers(vpn_type).iter().find(|s| s.has_host(host_ip))
    }

    /// Alternate API IPs, v4 or v6
    pub fn api_ips(&self, ipv6: bool) -> Vec<IpAddr> {
        let list = if ipv6 {
            &self.config.api.ipv6s
        } else {
            &self.config.api.ips
        };
        list.iter().filter_map(|s| s.trim().parse().ok()).collect()
    }

    /// Catalog that only keeps the alternate API IP lists
    pub fn only_api_info(&self) -> ServersInfo {
        ServersInfo {
            config: ServersConfig {
                api: self.config.api.clone(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "wireguard": [{
            "gateway": "nl.wg.example.net", "country_code": "NL", "country": "Netherlands",
            "city": "Amsterdam", "latitude": 52.37, "longitude": 4.89, "isp": "Datapacket",
            "hosts": [{
                "hostname": "nl3.wg.example.net", "host": "185.102.218.104", "dns_name": "nl3.wg.example.net",
                "public_key": "AsMT2FqpkZbjzWeDch6GwufF5odl259W/hIkGytVfWo=", "local_ip": "172.16.0.1/12",
                "ipv6": {"host": "2a00:1678:2470:23::1", "local_ip": "fd00:4956:504e:ffff::/96"},
                "multihop_port": 22010, "load": 12.5
            }]
        }],
        "openvpn": [{
            "gateway": "de.gw.example.net", "country_code": "DE", "country": "Germany", "city": "Frankfurt",
            "hosts": [{"hostname": "de1.gw.example.net", "host": "185.102.219.26", "multihop_port": 20001,
                       "obfs": {"obfs3_multihop_port": 23001, "obfs4_multihop_port": 24001, "obfs4_key": "k"}}]
        }],
        "config": {
            "antitracker": {"default": {"ip": "10.0.254.2"}, "hardcore": {"ip": "10.0.254.3"}},
            "api": {"ips": ["198.50.177.220", "bogus"], "ipv6s": ["2607:5300:203:1735::8888"]},
            "ports": {
                "openvpn": [{"type": "UDP", "port": 2049}, {"type": "TCP", "port": 443}],
                "wireguard": [{"type": "UDP", "port": 2049}, {"type": "UDP", "range": {"min": 30000, "max": 65000}}],
                "obfs3": {"port": 5145}, "obfs4": {"port": 5146}
            },
            "future_field": true
        }
    }"#;

    #[test]
    fn test_parse_catalog() {
        let info: ServersInfo = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(info.wireguard.len(), 1);
        assert_eq!(info.openvpn.len(), 1);
        assert!(info.has_ports());

        let wg_host = &info.wireguard[0].hosts[0];
        assert_eq!(wg_host.gateway_prefix(), "nl3");
        assert_eq!(wg_host.ipv6_local_ip(), Some("fd00:4956:504e:ffff::/96"));
        assert_eq!(wg_host.multihop_port, 22010);

        let ovpn_host = &info.openvpn[0].hosts[0];
        assert_eq!(ovpn_host.obfs.as_ref().unwrap().obfs4_multihop_port, 24001);
        assert!(ovpn_host.ipv6_local_ip().is_none());
    }

    #[test]
    fn test_api_ips_skip_invalid() {
        let info: ServersInfo = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(info.api_ips(false).len(), 1);
        assert_eq!(info.api_ips(true).len(), 1);

        let only_api = info.only_api_info();
        assert!(only_api.wireguard.is_empty());
        assert!(!only_api.has_ports());
        assert_eq!(only_api.config.api, info.config.api);
    }

    #[test]
    fn test_server_by_host() {
        let info: ServersInfo = serde_json::from_str(SAMPLE).unwrap();
        let srv = info
            .server_by_host(VpnType::WTunnel, "185.102.218.104")
            .unwrap();
        assert_eq!(srv.country_code, "NL");
        assert!(info.server_by_host(VpnType::CTunnel, "185.102.218.104").is_none());
    }

    #[test]
    fn test_port_display_and_compare() {
        let range = PortInfo {
            kind: "UDP".into(),
            port: 0,
            range: Some(PortRange { min: 30000, max: 65000 }),
        };
        assert_eq!(range.to_string(), "UDP:[30000-65000]");
        assert_eq!(PortInfo::tcp(443).to_string(), "TCP:443");

        let lower = PortInfo {
            kind: "tcp".into(),
            port: 443,
            range: None,
        };
        assert!(lower.same_as(&PortInfo::tcp(443)));
        assert!(!lower.same_as(&PortInfo::udp(443)));
    }
}
