//! DNS controller and anti-tracker resolver selection

use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use warden_proto::response::DnsAbilities;
use warden_proto::servers::DnsInfo;
use warden_proto::types::{AntiTrackerMetadata, UserPreferences};
use warden_proto::{DnsSettings, ServersInfo};

use crate::error::{Error, Result};
use crate::event::{DaemonEvent, EventHandler};
use crate::firewall::FirewallController;
use crate::platform::DnsBackend;

/// Block list used when a requested list is not in the catalog
pub const BASIC_BLOCK_LIST: &str = "Basic";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ManualDns {
    dns: DnsSettings,
    local_ip: Option<IpAddr>,
}

pub struct DnsController {
    backend: Arc<dyn DnsBackend>,
    firewall: Arc<FirewallController>,
    events: Arc<dyn EventHandler>,
    current: RwLock<Option<ManualDns>>,
}

impl DnsController {
    pub fn new(
        backend: Arc<dyn DnsBackend>,
        firewall: Arc<FirewallController>,
        events: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            backend,
            firewall,
            events,
            current: RwLock::new(None),
        }
    }

    /// Manual DNS in force, empty when the system default is used
    pub fn current(&self) -> DnsSettings {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|m| m.dns.clone())
            .unwrap_or_default()
    }

    pub async fn set_manual(&self, dns: &DnsSettings, local_ip: Option<IpAddr>) -> Result<()> {
        let mut dns = dns.clone();
        dns.validate_and_normalize()?;
        if dns.is_empty() {
            return self.reset().await;
        }

        self.backend.set_manual(&dns, local_ip).await?;
        self.firewall.on_change_dns(dns.first_ip()).await?;

        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(ManualDns {
            dns: dns.clone(),
            local_ip,
        });
        self.events.on_event(DaemonEvent::DnsChanged(dns)).await;
        Ok(())
    }

    pub async fn reset(&self) -> Result<()> {
        let was_set = self
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some();

        self.backend.reset().await?;
        self.firewall.on_change_dns(None).await?;
        if was_set {
            self.events
                .on_event(DaemonEvent::DnsChanged(DnsSettings::default()))
                .await;
        }
        Ok(())
    }

    pub async fn apply_user_settings(&self, prefs: &UserPreferences) -> Result<()> {
        self.backend.apply_user_settings(prefs).await
    }

    /// Re-apply the manual DNS when something else changed the system setting
    pub async fn update_if_wrong_settings(&self) -> Result<()> {
        let current = self
            .current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(manual) = current else {
            return Ok(());
        };

        if self.backend.is_wrong(&manual.dns).await? {
            log::warn!(
                "System DNS configuration changed externally; restoring {}",
                manual.dns.info_string()
            );
            self.backend.set_manual(&manual.dns, manual.local_ip).await?;
        }
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        self.backend.pause().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.backend.resume(&self.current()).await
    }

    pub async fn capabilities(&self) -> DnsAbilities {
        self.backend.capabilities().await
    }

    pub async fn predefined_configs(&self) -> Result<Vec<DnsSettings>> {
        self.backend.predefined_configs().await
    }
}

/// Resolver for the anti-tracker selection
///
/// A named block list is looked up in the catalog case-insensitively; an
/// unknown name falls back to the basic list and, when the catalog carries no
/// named lists, to the legacy default/hardcore pair.
pub fn anti_tracker_dns(
    servers: &ServersInfo,
    meta: &AntiTrackerMetadata,
    multihop: bool,
) -> Result<DnsSettings> {
    if !meta.enabled {
        return Ok(DnsSettings::default());
    }

    let named = servers
        .config
        .antitracker_plus
        .as_ref()
        .map(|plus| plus.dns_servers.as_slice())
        .unwrap_or_default();

    let wanted = meta.anti_tracker_block_list_name.trim();
    let entry = named
        .iter()
        .find(|s| !wanted.is_empty() && s.name.eq_ignore_ascii_case(wanted))
        .or_else(|| {
            if !wanted.is_empty() {
                log::warn!("Block list '{}' not found; using '{}'", wanted, BASIC_BLOCK_LIST);
            }
            named
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(BASIC_BLOCK_LIST))
        });

    let address = match entry {
        Some(server) if !multihop => {
            if meta.hardcore {
                server.hardcore.clone()
            } else {
                server.normal.clone()
            }
        }
        _ => {
            let legacy = if meta.hardcore {
                &servers.config.antitracker.hardcore
            } else {
                &servers.config.antitracker.default
            };
            legacy_address(legacy, multihop)
        }
    };

    let ip: IpAddr = address.trim().parse().map_err(|_| {
        Error::InvalidArgument("no anti-tracker DNS available for this configuration".into())
    })?;
    Ok(DnsSettings::from_ip(Some(ip)))
}

fn legacy_address(info: &DnsInfo, multihop: bool) -> String {
    if multihop && !info.multihop_ip.is_empty() {
        info.multihop_ip.clone()
    } else {
        info.ip.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LoggingEventHandler;
    use crate::mock::{MockDns, MockFirewall};
    use crate::preferences::PreferencesStore;

    fn catalog() -> ServersInfo {
        serde_json::from_value(serde_json::json!({
            "config": {
                "antitracker": {
                    "default": {"ip": "10.0.254.2", "multihop-ip": "10.0.254.102"},
                    "hardcore": {"ip": "10.0.254.3", "multihop-ip": "10.0.254.103"}
                },
                "antitracker_plus": {"DnsServers": [
                    {"Name": "Basic", "Normal": "10.0.254.2", "Hardcore": "10.0.254.3"},
                    {"Name": "OisdBig", "Normal": "10.0.254.4", "Hardcore": "10.0.254.5"}
                ]}
            }
        }))
        .unwrap()
    }

    fn meta(name: &str, hardcore: bool) -> AntiTrackerMetadata {
        AntiTrackerMetadata {
            enabled: true,
            hardcore,
            anti_tracker_block_list_name: name.into(),
        }
    }

    fn ip_of(dns: DnsSettings) -> String {
        dns.first_ip().unwrap().to_string()
    }

    #[test]
    fn test_named_list_case_insensitive() {
        let servers = catalog();
        assert_eq!(ip_of(anti_tracker_dns(&servers, &meta("oisdbig", false), false).unwrap()), "10.0.254.4");
        assert_eq!(ip_of(anti_tracker_dns(&servers, &meta("OISDBIG", true), false).unwrap()), "10.0.254.5");
    }

    #[test]
    fn test_unknown_list_uses_basic() {
        let servers = catalog();
        assert_eq!(ip_of(anti_tracker_dns(&servers, &meta("Gone", false), false).unwrap()), "10.0.254.2");
    }

    #[test]
    fn test_multihop_and_legacy_catalog() {
        let servers = catalog();
        assert_eq!(ip_of(anti_tracker_dns(&servers, &meta("", true), true).unwrap()), "10.0.254.103");

        let mut legacy = servers.clone();
        legacy.config.antitracker_plus = None;
        assert_eq!(ip_of(anti_tracker_dns(&legacy, &meta("OisdBig", false), false).unwrap()), "10.0.254.2");
    }

    #[test]
    fn test_disabled_gives_empty() {
        let dns = anti_tracker_dns(&catalog(), &AntiTrackerMetadata::default(), false).unwrap();
        assert!(dns.is_empty());
        assert!(anti_tracker_dns(&ServersInfo::default(), &meta("", false), false).is_err());
    }

    #[tokio::test]
    async fn test_set_manual_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = Arc::new(PreferencesStore::load(dir.path().join("settings.json")));
        let fw_backend = Arc::new(MockFirewall::new());
        let firewall = Arc::new(FirewallController::new(
            fw_backend.clone(),
            prefs,
            Arc::new(LoggingEventHandler),
        ));
        let backend = Arc::new(MockDns::new());
        let dns = DnsController::new(backend.clone(), firewall, Arc::new(LoggingEventHandler));

        let manual = DnsSettings::from_ip(Some("9.9.9.9".parse().unwrap()));
        dns.set_manual(&manual, None).await.unwrap();
        assert_eq!(backend.current(), Some(manual.clone()));
        assert_eq!(dns.current(), manual);
        assert_eq!(fw_backend.dns(), Some("9.9.9.9".parse().unwrap()));

        // something else rewrote the system DNS
        backend.set_system(None);
        dns.update_if_wrong_settings().await.unwrap();
        assert_eq!(backend.current(), Some(manual));

        dns.reset().await.unwrap();
        assert_eq!(backend.current(), None);
        assert!(dns.current().is_empty());
        assert_eq!(fw_backend.dns(), None);
    }
}
