//! Remote account API client
//!
//! Requests to the API host are routed in this order: the last IP that
//! worked, the host name through DNS, then each alternate IP published in
//! the server catalog. Whatever address is dialled, TLS uses the logical
//! host name and the same pin set. With [`IpProtocol::Any`] the IPv4 route
//! is tried first and IPv6 only when it fails and the host has an IPv6 route.

pub mod pinning;
pub mod transport;

use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use warden_proto::api::{
    ApiStatus, GeoLookupResponse, ServiceStatus, SessionLimitResponse, SessionNewRequest,
    SessionNewResponse, SessionStatusResponse, SessionTokenRequest, WgKeySetRequest,
    WgKeySetResponse, CODE_SESSIONS_LIMIT_REACHED, CODE_SUCCESS,
};
use warden_proto::{IpProtocol, ServersInfo};

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::netinfo;

pub use pinning::PinSet;
pub use transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

pub const SESSION_NEW_PATH: &str = "/v4/session/new";
pub const SESSION_STATUS_PATH: &str = "/v4/session/status";
pub const SESSION_DELETE_PATH: &str = "/v4/session/delete";
pub const WG_KEY_SET_PATH: &str = "/v4/session/wg/set";
pub const GEO_LOOKUP_PATH: &str = "/v4/geo-lookup";
pub const SERVERS_PATH: &str = "/v5/servers.json";

const GEO_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Reports why the daemon's own API traffic is currently blocked
pub type ConnectivityGate = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Tells whether the host has an outbound route of the family (`true` for IPv6)
pub type RouteCheck = Arc<dyn Fn(bool) -> BoxFuture<'static, bool> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostKind {
    Api,
    Update,
}

/// Result of `session/new`
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNewOutcome {
    Success(SessionNewResponse),
    /// Code 602, with the account status of the limit
    Limit(SessionLimitResponse),
    /// Any other API status (captcha, 2FA, bad credentials...)
    Failed(ApiStatus),
}

impl SessionNewOutcome {
    pub fn status(&self) -> &ApiStatus {
        match self {
            SessionNewOutcome::Success(r) => &r.status,
            SessionNewOutcome::Limit(r) => &r.status,
            SessionNewOutcome::Failed(s) => s,
        }
    }
}

#[derive(Debug, Default)]
struct AlternateIps {
    v4: Vec<IpAddr>,
    v6: Vec<IpAddr>,
    last_good_v4: Option<IpAddr>,
    last_good_v6: Option<IpAddr>,
}

impl AlternateIps {
    fn list(&self, ipv6: bool) -> &[IpAddr] {
        if ipv6 {
            &self.v6
        } else {
            &self.v4
        }
    }

    fn last_good(&self, ipv6: bool) -> Option<IpAddr> {
        if ipv6 {
            self.last_good_v6
        } else {
            self.last_good_v4
        }
    }

    fn set_last_good(&mut self, ipv6: bool, ip: Option<IpAddr>) {
        if ipv6 {
            self.last_good_v6 = ip;
        } else {
            self.last_good_v4 = ip;
        }
    }
}

type GeoSlot = Mutex<Option<(Instant, GeoLookupResponse)>>;

/// Client of the account API and the update host
pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
    api_host: String,
    update_host: String,
    platform: String,
    ips: RwLock<AlternateIps>,
    gate: RwLock<Option<ConnectivityGate>>,
    route_check: RwLock<RouteCheck>,
    geo_v4: GeoSlot,
    geo_v6: GeoSlot,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &ApiConfig, platform: &str) -> Result<Self> {
        let client = Self {
            transport,
            api_host: config.host.clone(),
            update_host: config.update_host.clone(),
            platform: platform.to_string(),
            ips: RwLock::new(AlternateIps::default()),
            gate: RwLock::new(None),
            route_check: RwLock::new(Arc::new(|ipv6| {
                async move { netinfo::outbound_ip(ipv6).await.is_ok() }.boxed()
            })),
            geo_v4: Mutex::new(None),
            geo_v6: Mutex::new(None),
        };
        let configured = config.alternate_ip_addrs()?;
        let (v6, v4): (Vec<IpAddr>, Vec<IpAddr>) = configured.into_iter().partition(IpAddr::is_ipv6);
        client.set_alternate_ips(v4, v6);
        Ok(client)
    }

    /// Real transport with the build-time pin sets
    pub fn with_default_transport(config: &ApiConfig, platform: &str) -> Result<Self> {
        let transport = ReqwestTransport::new(
            &[
                (config.host.as_str(), PinSet::api(&config.extra_pins)),
                (config.update_host.as_str(), PinSet::update(&config.extra_pins)),
            ],
            config.dial_timeout(),
            config.request_timeout(),
        )?;
        Self::new(Arc::new(transport), config, platform)
    }

    pub fn api_host(&self) -> &str {
        &self.api_host
    }

    pub fn set_connectivity_gate(&self, gate: ConnectivityGate) {
        *self.gate.write().unwrap_or_else(|e| e.into_inner()) = Some(gate);
    }

    pub fn set_route_check(&self, check: RouteCheck) {
        *self.route_check.write().unwrap_or_else(|e| e.into_inner()) = check;
    }

    async fn has_route(&self, ipv6: bool) -> bool {
        let check = self.route_check.read().unwrap_or_else(|e| e.into_inner()).clone();
        check(ipv6).await
    }

    /// Replace the alternate IP lists; a last-good IP that is no longer listed is dropped
    pub fn set_alternate_ips(&self, v4: Vec<IpAddr>, v6: Vec<IpAddr>) {
        let mut ips = self.ips.write().unwrap_or_else(|e| e.into_inner());
        if ips.last_good_v4.is_some_and(|ip| !v4.contains(&ip)) {
            ips.last_good_v4 = None;
        }
        if ips.last_good_v6.is_some_and(|ip| !v6.contains(&ip)) {
            ips.last_good_v6 = None;
        }
        ips.v4 = v4;
        ips.v6 = v6;
    }

    pub fn alternate_ips(&self, ipv6: bool) -> Vec<IpAddr> {
        self.ips
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .list(ipv6)
            .to_vec()
    }

    pub fn last_good_ip(&self, ipv6: bool) -> Option<IpAddr> {
        self.ips
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last_good(ipv6)
    }

    fn check_connectivity(&self) -> Result<()> {
        let gate = self.gate.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(reason) = gate.and_then(|g| g()) {
            return Err(Error::ConnectivityBlocked(reason));
        }
        Ok(())
    }

    /// Raw request to the API host
    pub async fn request_raw(
        &self,
        path: &str,
        method: HttpMethod,
        ip_protocol: IpProtocol,
        body: Option<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.check_connectivity()?;
        self.route(HostKind::Api, path, method, ip_protocol, body, timeout)
            .await
    }

    async fn route(
        &self,
        host: HostKind,
        path: &str,
        method: HttpMethod,
        ip_protocol: IpProtocol,
        body: Option<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let request = HttpRequest {
            host: match host {
                HostKind::Api => self.api_host.clone(),
                HostKind::Update => self.update_host.clone(),
            },
            path: path.to_string(),
            method,
            body,
            target: None,
            timeout,
        };

        if host == HostKind::Update {
            return self
                .transport
                .send(&request)
                .await
                .map(|r| r.body)
                .map_err(|e| {
                    log::warn!("Failed to access {}", self.update_host);
                    e
                });
        }

        match ip_protocol {
            IpProtocol::V4 => self.request_api_host(request, false, false).await,
            IpProtocol::V6 => self.request_api_host(request, true, false).await,
            IpProtocol::Any => match self.request_api_host(request.clone(), false, true).await {
                Ok(body) => Ok(body),
                Err(err4) => {
                    if !self.has_route(true).await {
                        log::info!("Failed to access API server using IPv4; no IPv6 route");
                        return Err(err4);
                    }
                    log::info!("Failed to access API server using IPv4. Trying IPv6 ...");
                    self.request_api_host(request, true, true)
                        .await
                        .map_err(|_| err4)
                }
            },
        }
    }

    async fn request_api_host(
        &self,
        mut request: HttpRequest,
        ipv6: bool,
        can_use_dns: bool,
    ) -> Result<Vec<u8>> {
        let mut first_err: Option<Error> = None;

        if let Some(ip) = self.last_good_ip(ipv6) {
            request.target = Some(ip);
            match self.transport.send(&request).await {
                Ok(resp) => return Ok(resp.body),
                Err(e) => first_err = Some(e),
            }
        }

        if can_use_dns {
            request.target = None;
            match self.transport.send(&request).await {
                Ok(resp) => {
                    self.ips
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .set_last_good(ipv6, None);
                    return Ok(resp.body);
                }
                Err(e) => {
                    log::warn!("Failed to access {}: {}", self.api_host, e);
                    first_err.get_or_insert(e);
                }
            }
        }

        let family = if ipv6 { " (IPv6)" } else { "" };
        for (i, ip) in self.alternate_ips(ipv6).into_iter().enumerate() {
            log::info!("Trying to use alternate API IP #{}{}...", i, family);
            request.target = Some(ip);
            match self.transport.send(&request).await {
                Ok(resp) => {
                    self.ips
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .set_last_good(ipv6, Some(ip));
                    log::info!("Success!");
                    return Ok(resp.body);
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        Err(match first_err {
            Some(Error::CertificatePinFailure(msg)) => Error::CertificatePinFailure(msg),
            Some(Error::Timeout(msg)) => Error::Timeout(format!("unable to access API server: {}", msg)),
            Some(e) => Error::Http(format!("unable to access API server: {}", e)),
            None => Error::Http(format!("unable to access API server{}: no address to try", family)),
        })
    }

    async fn post_json<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<(Resp, Vec<u8>)> {
        let data = self
            .request_raw(
                path,
                HttpMethod::Post,
                IpProtocol::Any,
                Some(serde_json::to_vec(body)?),
                None,
            )
            .await?;
        let parsed = serde_json::from_slice(&data)
            .map_err(|e| Error::Http(format!("failed to deserialize API response: {}", e)))?;
        Ok((parsed, data))
    }

    /// `session/new`; non-success API statuses are an outcome, not an error
    pub async fn session_new(&self, request: &SessionNewRequest) -> Result<(SessionNewOutcome, String)> {
        let (status, data): (ApiStatus, _) = self.post_json(SESSION_NEW_PATH, request).await?;
        let raw = String::from_utf8_lossy(&data).to_string();

        let outcome = match status.status {
            CODE_SUCCESS => SessionNewOutcome::Success(serde_json::from_slice(&data)?),
            CODE_SESSIONS_LIMIT_REACHED => SessionNewOutcome::Limit(serde_json::from_slice(&data)?),
            _ => SessionNewOutcome::Failed(status),
        };
        Ok((outcome, raw))
    }

    pub async fn session_status(&self, session_token: &str) -> Result<ServiceStatus> {
        let request = SessionTokenRequest {
            session_token: session_token.to_string(),
        };
        let (resp, _): (SessionStatusResponse, _) =
            self.post_json(SESSION_STATUS_PATH, &request).await?;
        if resp.status.status != CODE_SUCCESS {
            return Err(Error::api(resp.status.status, resp.status.message));
        }
        Ok(resp.service_status)
    }

    pub async fn session_delete(&self, session_token: &str) -> Result<()> {
        let request = SessionTokenRequest {
            session_token: session_token.to_string(),
        };
        let (resp, _): (ApiStatus, _) = self.post_json(SESSION_DELETE_PATH, &request).await?;
        if resp.status != CODE_SUCCESS {
            return Err(Error::api(resp.status, resp.message));
        }
        Ok(())
    }

    /// `session/wg/set`; the returned local IP is checked to be an address
    pub async fn wg_key_set(&self, request: &WgKeySetRequest) -> Result<WgKeySetResponse> {
        let (resp, _): (WgKeySetResponse, _) = self.post_json(WG_KEY_SET_PATH, request).await?;
        if resp.status.status != CODE_SUCCESS {
            return Err(Error::api(resp.status.status, resp.status.message));
        }
        if resp.ip_address.trim().parse::<IpAddr>().is_err() {
            return Err(Error::Http(
                "failed to set tunnel key (failed to parse local IP in API response)".into(),
            ));
        }
        Ok(resp)
    }

    /// Download the server catalog
    pub async fn servers(&self) -> Result<ServersInfo> {
        let data = self
            .request_raw(SERVERS_PATH, HttpMethod::Get, IpProtocol::Any, None, None)
            .await?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::Http(format!("failed to deserialize server list: {}", e)))
    }

    /// Location of the outbound address of the given family
    ///
    /// Concurrent callers for one family share a single request.
    pub async fn geo_lookup(&self, ip_protocol: IpProtocol) -> Result<GeoLookupResponse> {
        let arrived = Instant::now();
        let slot = match ip_protocol {
            IpProtocol::V6 => &self.geo_v6,
            _ => &self.geo_v4,
        };
        let mut cached = slot.lock().await;
        if let Some((at, resp)) = cached.as_ref() {
            if *at >= arrived {
                return Ok(resp.clone());
            }
        }

        let data = self
            .request_raw(
                GEO_LOOKUP_PATH,
                HttpMethod::Get,
                ip_protocol,
                None,
                Some(GEO_LOOKUP_TIMEOUT),
            )
            .await?;
        let resp: GeoLookupResponse = serde_json::from_slice(&data)?;
        *cached = Some((Instant::now(), resp.clone()));
        Ok(resp)
    }

    /// Requests clients may issue through `APIRequest`
    ///
    /// * `geo-lookup`
    /// * `updateInfo_<platform>`, `updateSign_<platform>` and their `_manual` forms
    pub async fn request_by_alias(&self, alias: &str, ip_protocol: IpProtocol) -> Result<Vec<u8>> {
        let (host, path) = resolve_alias(alias, std::env::consts::ARCH)
            .ok_or_else(|| Error::InvalidArgument("unexpected request alias".into()))?;
        log::debug!("API request by alias '{}' ({})", alias, self.platform);
        self.check_connectivity()?;
        self.route(host, &path, HttpMethod::Get, ip_protocol, None, None)
            .await
    }
}

/// Map an alias to its host and path; arch-dependent update files get `_<arch>`
/// before the extension on anything but x86_64
fn resolve_alias(alias: &str, arch: &str) -> Option<(HostKind, String)> {
    if alias == "geo-lookup" {
        return Some((HostKind::Api, GEO_LOOKUP_PATH.to_string()));
    }

    let (kind, rest) = if let Some(rest) = alias.strip_prefix("updateInfo_") {
        ("update.json", rest)
    } else if let Some(rest) = alias.strip_prefix("updateSign_") {
        ("update.json.sign.sha256.base64", rest)
    } else {
        return None;
    };
    let (manual, platform) = match rest.strip_prefix("manual_") {
        Some(p) => (true, p),
        None => (false, rest),
    };
    let dir = match platform {
        "Linux" => "/stable/_update_info",
        "macOS" => "/macos",
        "Windows" => "/windows",
        _ => return None,
    };
    let file = if manual {
        kind.replacen("update", "update_manual", 1)
    } else {
        kind.to_string()
    };

    let mut path = format!("{}/{}", dir, file);
    if arch != "x86_64" {
        let name_start = dir.len() + 1;
        if let Some(dot) = path[name_start..].find('.') {
            path.insert_str(name_start + dot, &format!("_{}", go_arch(arch)));
        }
    }
    Some((HostKind::Update, path))
}

/// Architecture names used in update file names
fn go_arch(arch: &str) -> &str {
    match arch {
        "aarch64" => "arm64",
        "x86" => "386",
        "arm" => "arm",
        other => other,
    }
}

/// Convert an API status into the error of a failed call
pub fn status_error(status: &ApiStatus) -> Error {
    Error::api(status.status, status.message.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHttpTransport;
    use serde_json::json;

    fn client(transport: Arc<MockHttpTransport>, alternates: &[&str]) -> ApiClient {
        let config = ApiConfig {
            host: "api.example.net".into(),
            update_host: "repo.example.net".into(),
            alternate_ips: alternates.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let api = ApiClient::new(transport, &config, "Linux").unwrap();
        api.set_route_check(Arc::new(|_| async { true }.boxed()));
        api
    }

    #[test]
    fn test_resolve_alias() {
        assert_eq!(
            resolve_alias("geo-lookup", "x86_64"),
            Some((HostKind::Api, "/v4/geo-lookup".to_string()))
        );
        assert_eq!(
            resolve_alias("updateInfo_Linux", "x86_64"),
            Some((HostKind::Update, "/stable/_update_info/update.json".to_string()))
        );
        assert_eq!(
            resolve_alias("updateInfo_macOS", "aarch64"),
            Some((HostKind::Update, "/macos/update_arm64.json".to_string()))
        );
        assert_eq!(
            resolve_alias("updateSign_manual_Windows", "x86_64"),
            Some((
                HostKind::Update,
                "/windows/update_manual.json.sign.sha256.base64".to_string()
            ))
        );
        assert_eq!(resolve_alias("v4/session/status", "x86_64"), None);
        assert_eq!(resolve_alias("updateInfo_Plan9", "x86_64"), None);
    }

    #[tokio::test]
    async fn test_dns_first_then_alternates() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.respond(SERVERS_PATH, json!({"wireguard": [], "openvpn": []}));
        transport.fail_dns(true);
        let api = client(transport.clone(), &["198.51.100.1", "198.51.100.2"]);
        transport.fail_target("198.51.100.1".parse().unwrap());

        api.servers().await.unwrap();
        let targets: Vec<_> = transport.requests().iter().map(|r| r.target).collect();
        assert_eq!(
            targets,
            vec![
                None,
                Some("198.51.100.1".parse().unwrap()),
                Some("198.51.100.2".parse().unwrap())
            ]
        );
        assert_eq!(api.last_good_ip(false), Some("198.51.100.2".parse().unwrap()));
        assert!(transport.requests().iter().all(|r| r.host == "api.example.net"));

        // next request goes straight to the last good IP
        transport.clear_requests();
        api.servers().await.unwrap();
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(
            transport.requests()[0].target,
            Some("198.51.100.2".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_dns_success_resets_last_good() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.respond(SERVERS_PATH, json!({}));
        transport.fail_dns(true);
        let api = client(transport.clone(), &["198.51.100.1"]);
        api.servers().await.unwrap();
        assert!(api.last_good_ip(false).is_some());

        transport.fail_dns(false);
        transport.fail_target("198.51.100.1".parse().unwrap());
        api.servers().await.unwrap();
        assert_eq!(api.last_good_ip(false), None);
    }

    #[tokio::test]
    async fn test_any_falls_back_to_ipv6() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.respond(SERVERS_PATH, json!({}));
        transport.fail_dns(true);
        let api = client(transport.clone(), &["198.51.100.1", "2001:db8::1"]);
        transport.fail_target("198.51.100.1".parse().unwrap());

        api.servers().await.unwrap();
        assert_eq!(api.last_good_ip(true), Some("2001:db8::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_any_without_ipv6_route_stays_on_ipv4() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.respond(SERVERS_PATH, json!({}));
        transport.fail_dns(true);
        let api = client(transport.clone(), &["198.51.100.1", "2001:db8::1"]);
        api.set_route_check(Arc::new(|ipv6| async move { !ipv6 }.boxed()));
        transport.fail_target("198.51.100.1".parse().unwrap());

        assert!(api.servers().await.is_err());
        assert!(transport
            .requests()
            .iter()
            .all(|r| !r.target.is_some_and(|ip| ip.is_ipv6())));
        assert_eq!(api.last_good_ip(true), None);
    }

    #[tokio::test]
    async fn test_connectivity_gate_blocks_before_dial() {
        let transport = Arc::new(MockHttpTransport::new());
        let api = client(transport.clone(), &[]);
        api.set_connectivity_gate(Arc::new(|| Some("firewall is enabled".to_string())));

        let err = api.servers().await.unwrap_err();
        assert!(matches!(err, Error::ConnectivityBlocked(_)));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_pin_failure_surfaces() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.respond(SERVERS_PATH, json!({}));
        transport.fail_pins(true);
        let api = client(transport.clone(), &["198.51.100.1"]);

        let err = api.servers().await.unwrap_err();
        assert!(matches!(err, Error::CertificatePinFailure(_)));
        // still retried on the alternate IP
        assert!(transport
            .requests()
            .iter()
            .any(|r| r.target == Some("198.51.100.1".parse().unwrap())));
    }

    #[tokio::test]
    async fn test_session_new_outcomes() {
        let transport = Arc::new(MockHttpTransport::new());
        let api = client(transport.clone(), &[]);

        transport.respond(
            SESSION_NEW_PATH,
            json!({"status": 602, "message": "Session limit", "data": {"limit": 5, "is_active": true}}),
        );
        let (outcome, raw) = api.session_new(&SessionNewRequest::default()).await.unwrap();
        match outcome {
            SessionNewOutcome::Limit(limit) => {
                assert_eq!(limit.data.limit, 5);
                assert_eq!(limit.status.message, "Session limit");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(raw.contains("602"));

        transport.respond(SESSION_NEW_PATH, json!({"status": 70011, "message": "2FA"}));
        let (outcome, _) = api.session_new(&SessionNewRequest::default()).await.unwrap();
        assert_eq!(outcome.status().status, 70011);
    }

    #[tokio::test]
    async fn test_session_status_error_code() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.respond(SESSION_STATUS_PATH, json!({"status": 601, "message": "Session not found"}));
        let api = client(transport.clone(), &[]);
        let err = api.session_status("tok").await.unwrap_err();
        assert!(err.is_session_not_found());

        let body: serde_json::Value =
            serde_json::from_slice(transport.requests()[0].body.as_ref().unwrap()).unwrap();
        assert_eq!(body, json!({"session_token": "tok"}));
    }

    #[tokio::test]
    async fn test_wg_key_set_requires_ip() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.respond(WG_KEY_SET_PATH, json!({"status": 200, "ip_address": ""}));
        let api = client(transport.clone(), &[]);
        assert!(api.wg_key_set(&WgKeySetRequest::default()).await.is_err());

        transport.respond(WG_KEY_SET_PATH, json!({"status": 200, "ip_address": "10.0.0.9"}));
        let resp = api.wg_key_set(&WgKeySetRequest::default()).await.unwrap();
        assert_eq!(resp.ip_address, "10.0.0.9");
    }

    #[tokio::test]
    async fn test_alias_uses_update_host() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.respond("/stable/_update_info/update.json", json!({"latest": "3.14.0"}));
        let api = client(transport.clone(), &[]);

        if std::env::consts::ARCH == "x86_64" {
            api.request_by_alias("updateInfo_Linux", IpProtocol::Any)
                .await
                .unwrap();
            assert_eq!(transport.requests()[0].host, "repo.example.net");
        }
        assert!(api
            .request_by_alias("v4/session/status", IpProtocol::Any)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_geo_lookup_single_flight() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.respond(GEO_LOOKUP_PATH, json!({"ip_address": "203.0.113.5", "country_code": "NL"}));
        transport.set_delay(Duration::from_millis(50));
        // V4-only requests skip DNS, so the alternate IP is dialled
        let api = Arc::new(client(transport.clone(), &["198.51.100.1"]));

        let a = tokio::spawn({
            let api = api.clone();
            async move { api.geo_lookup(IpProtocol::V4).await }
        });
        let b = tokio::spawn({
            let api = api.clone();
            async move { api.geo_lookup(IpProtocol::V4).await }
        });
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a.country_code, "NL");
        assert_eq!(a, b);
        assert_eq!(transport.requests().len(), 1);
    }
}
