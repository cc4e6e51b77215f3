//! DNS settings as exchanged with clients and stored in preferences

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

wire_enum! {
    /// Transport encryption of a DNS server
    pub enum DnsEncryption {
        None = 0,
        DnsOverTls = 1,
        DnsOverHttps = 2,
    }
}

impl Default for DnsEncryption {
    fn default() -> Self {
        DnsEncryption::None
    }
}

/// One DNS server: address plus optional DoT/DoH template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DnsServerConfig {
    pub address: String,
    pub encryption: DnsEncryption,
    pub template: String,
}

impl DnsServerConfig {
    /// Plain (unencrypted) server
    pub fn plain(ip: IpAddr) -> Self {
        Self {
            address: ip.to_string(),
            encryption: DnsEncryption::None,
            template: String::new(),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.address.trim().parse().ok()
    }

    /// An address that is blank, unparsable, `0.0.0.0`, broadcast or `::` means "no server"
    pub fn is_empty(&self) -> bool {
        match self.ip() {
            None => true,
            Some(IpAddr::V4(v4)) => v4 == Ipv4Addr::UNSPECIFIED || v4 == Ipv4Addr::BROADCAST,
            Some(IpAddr::V6(v6)) => v6 == Ipv6Addr::UNSPECIFIED,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.ip(), Some(IpAddr::V6(_)))
    }

    /// Trim fields and check that the template agrees with the encryption type
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        self.address = self.address.trim().to_string();
        self.template = self.template.trim().to_string();

        if self.address.is_empty() {
            return Ok(());
        }
        if self.address.parse::<IpAddr>().is_err() {
            return Err(Error::Validation(format!(
                "invalid DNS IP address: {}",
                self.address
            )));
        }

        match self.encryption {
            DnsEncryption::None => {
                if !self.template.is_empty() {
                    return Err(Error::Validation(
                        "template should be empty for 'None' encryption".into(),
                    ));
                }
            }
            DnsEncryption::DnsOverHttps => {
                if self.template.is_empty() {
                    return Err(Error::Validation("template URL is required for DoH".into()));
                }
                if !self.template.starts_with("https://") {
                    return Err(Error::Validation(format!(
                        "invalid template URL for DoH: {}",
                        self.template
                    )));
                }
            }
            DnsEncryption::DnsOverTls => {
                if self.template.is_empty() {
                    return Err(Error::Validation("template is required for DoT".into()));
                }
            }
        }
        Ok(())
    }

    /// Human-readable form used in logs
    pub fn info_string(&self) -> String {
        if self.is_empty() {
            return "<none>".into();
        }
        match self.encryption {
            DnsEncryption::None => self.address.clone(),
            DnsEncryption::DnsOverTls => format!("{} (DoT {})", self.address, self.template),
            DnsEncryption::DnsOverHttps => format!("{} (DoH {})", self.address, self.template),
        }
    }
}

/// Ordered list of DNS servers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DnsSettings {
    pub servers: Vec<DnsServerConfig>,
}

impl DnsSettings {
    /// Settings with a single plain server, or empty settings for `None`
    pub fn from_ip(ip: Option<IpAddr>) -> Self {
        match ip {
            Some(ip) => Self {
                servers: vec![DnsServerConfig::plain(ip)],
            },
            None => Self::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.iter().all(DnsServerConfig::is_empty)
    }

    /// True when at least one server uses DoT or DoH
    pub fn uses_encryption(&self) -> bool {
        self.servers
            .iter()
            .any(|s| !s.is_empty() && s.encryption != DnsEncryption::None)
    }

    /// First usable server address
    pub fn first_ip(&self) -> Option<IpAddr> {
        self.servers
            .iter()
            .filter(|s| !s.is_empty())
            .find_map(DnsServerConfig::ip)
    }

    /// Drop empty entries and validate the rest
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        for server in self.servers.iter_mut() {
            server.validate_and_normalize()?;
        }
        self.servers.retain(|s| !s.is_empty());
        Ok(())
    }

    pub fn info_string(&self) -> String {
        if self.is_empty() {
            return "<none>".into();
        }
        self.servers
            .iter()
            .map(DnsServerConfig::info_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}
