//! Bodies exchanged with the remote account API (snake_case JSON)

use serde::{Deserialize, Serialize};

use crate::types::AccountStatus;

pub const CODE_SUCCESS: i64 = 200;
pub const CODE_UNAUTHORIZED: i64 = 401;
pub const CODE_WG_PUBLIC_KEY_NOT_FOUND: i64 = 424;
pub const CODE_SESSION_NOT_FOUND: i64 = 601;
pub const CODE_SESSIONS_LIMIT_REACHED: i64 = 602;
pub const CODE_ACCOUNT_NOT_ACTIVE: i64 = 702;
pub const CODE_CAPTCHA_REQUIRED: i64 = 70001;
pub const CODE_CAPTCHA_INVALID: i64 = 70002;
pub const CODE_2FA_REQUIRED: i64 = 70011;
pub const CODE_2FA_INVALID_TOKEN: i64 = 70012;

/// Public keys offered for the pre-shared key exchange
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KemPublicKeys {
    #[serde(rename = "kem_public_key1", skip_serializing_if = "String::is_empty")]
    pub kyber1024: String,
    #[serde(rename = "kem_public_key2", skip_serializing_if = "String::is_empty")]
    pub mceliece348864: String,
}

impl KemPublicKeys {
    pub fn is_empty(&self) -> bool {
        self.kyber1024.is_empty() && self.mceliece348864.is_empty()
    }
}

/// Ciphertexts returned by the API for [`KemPublicKeys`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KemCiphers {
    #[serde(rename = "kem_cipher1", skip_serializing_if = "String::is_empty")]
    pub kyber1024: String,
    #[serde(rename = "kem_cipher2", skip_serializing_if = "String::is_empty")]
    pub mceliece348864: String,
}

impl KemCiphers {
    pub fn count(&self) -> usize {
        [&self.kyber1024, &self.mceliece348864]
            .iter()
            .filter(|c| !c.is_empty())
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNewRequest {
    #[serde(rename = "username")]
    pub account_id: String,
    #[serde(rename = "force")]
    pub force_login: bool,
    #[serde(rename = "wg_public_key")]
    pub public_key: String,
    #[serde(flatten)]
    pub kem: KemPublicKeys,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub captcha_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub captcha: String,
    #[serde(rename = "confirmation", skip_serializing_if = "String::is_empty")]
    pub confirmation_2fa: String,
}

/// Body of `session/status` and `session/delete`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTokenRequest {
    pub session_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgKeySetRequest {
    pub session_token: String,
    pub public_key: String,
    /// Key currently registered for the session; empty when unknown
    pub connected_public_key: String,
    #[serde(flatten)]
    pub kem: KemPublicKeys,
}

/// `status` + `message` present in every API answer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiStatus {
    pub status: i64,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceStatus {
    pub is_active: bool,
    pub active_until: i64,
    pub current_plan: String,
    pub payment_method: String,
    pub is_renewable: bool,
    pub will_auto_rebill: bool,
    pub is_on_free_trial: bool,
    pub capabilities: Vec<String>,
    pub upgradable: bool,
    pub upgrade_to_plan: String,
    pub upgrade_to_url: String,
    pub limit: i32,
}

impl From<ServiceStatus> for AccountStatus {
    fn from(s: ServiceStatus) -> Self {
        AccountStatus {
            active: s.is_active,
            active_until: s.active_until,
            current_plan: s.current_plan,
            payment_method: s.payment_method,
            is_renewable: s.is_renewable,
            will_auto_rebill: s.will_auto_rebill,
            is_free_trial: s.is_on_free_trial,
            capabilities: s.capabilities,
            upgradable: s.upgradable,
            upgrade_to_plan: s.upgrade_to_plan,
            upgrade_to_url: s.upgrade_to_url,
            limit: s.limit,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireGuardSessionInfo {
    pub status: i64,
    pub message: String,
    pub ip_address: String,
    #[serde(flatten)]
    pub ciphers: KemCiphers,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionNewResponse {
    #[serde(flatten)]
    pub status: ApiStatus,
    pub token: String,
    pub vpn_username: String,
    pub vpn_password: String,
    pub captcha_id: String,
    pub captcha_image: String,
    pub service_status: ServiceStatus,
    pub wireguard: WireGuardSessionInfo,
}

/// Answer with code 602
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLimitResponse {
    #[serde(flatten)]
    pub status: ApiStatus,
    pub data: ServiceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStatusResponse {
    #[serde(flatten)]
    pub status: ApiStatus,
    pub service_status: ServiceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WgKeySetResponse {
    #[serde(flatten)]
    pub status: ApiStatus,
    pub ip_address: String,
    #[serde(flatten)]
    pub ciphers: KemCiphers,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoLookupResponse {
    pub ip_address: String,
    pub isp: String,
    pub country: String,
    pub country_code: String,
    pub city: String,
    pub latitude: f32,
    pub longitude: f32,
}
