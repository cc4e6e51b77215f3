//! Error types for the daemon core

use thiserror::Error;

use warden_proto::api::{
    CODE_2FA_INVALID_TOKEN, CODE_2FA_REQUIRED, CODE_ACCOUNT_NOT_ACTIVE, CODE_CAPTCHA_INVALID,
    CODE_CAPTCHA_REQUIRED, CODE_SESSIONS_LIMIT_REACHED, CODE_SESSION_NOT_FOUND,
    CODE_UNAUTHORIZED, CODE_WG_PUBLIC_KEY_NOT_FOUND,
};
use warden_proto::ErrorType;

/// Result type alias for daemon operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the daemon core
#[derive(Debug, Error)]
pub enum Error {
    /// The operation needs a logged-in session
    #[error("not logged in")]
    NotLoggedIn,

    /// Account has reached its device limit
    #[error("session limit reached")]
    SessionLimitReached,

    /// Account exists but has no active subscription
    #[error("account is not active")]
    AccountNotActive,

    /// The firewall (or another local policy) blocks the network access
    #[error("connectivity is blocked: {0}")]
    ConnectivityBlocked(String),

    /// No certificate in the server chain matched the pin set
    #[error("certificate pin check failed: {0}")]
    CertificatePinFailure(String),

    /// The API answered with a non-success status
    #[error("API error: [{code}] {message}")]
    Api { code: i64, message: String },

    /// Multihop requested without the account capability
    #[error("multihop is not allowed for this account")]
    MultihopNotAllowed,

    /// EAA secret missing or wrong
    #[error("{0}")]
    ParanoidModePassword(String),

    /// The tunnel engine asked for a clean restart
    #[error("reconnection required")]
    ReconnectRequired,

    /// Tunnel credentials were rejected
    #[error("authentication failed")]
    AuthenticationFailure,

    /// Auto-connect is enabled but nothing was ever connected
    #[error("no saved connection parameters for background connection")]
    BackgroundConnectionNoParams,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// Helper executable failed
    #[error("helper error: {0}")]
    Helper(String),

    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("timeout: {0}")]
    Timeout(String),

    /// A request argument was rejected
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Shutdown requested
    #[error("shutdown requested")]
    Shutdown,

    /// Wire protocol error
    #[error("protocol error: {0}")]
    Proto(#[from] warden_proto::Error),

    /// Anything else
    #[error("{0}")]
    Unknown(String),
}

impl Error {
    /// Construct an API error
    pub fn api(code: i64, message: impl Into<String>) -> Self {
        Error::Api {
            code,
            message: message.into(),
        }
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Connection(_)
                | Error::Http(_)
                | Error::ConnectivityBlocked(_)
                | Error::ReconnectRequired
        )
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }

    /// API status code carried by this error, if any
    pub fn api_code(&self) -> Option<i64> {
        match self {
            Error::Api { code, .. } => Some(*code),
            Error::SessionLimitReached => Some(CODE_SESSIONS_LIMIT_REACHED),
            Error::AccountNotActive => Some(CODE_ACCOUNT_NOT_ACTIVE),
            _ => None,
        }
    }

    /// The session token is no longer known to the API
    pub fn is_session_not_found(&self) -> bool {
        self.api_code() == Some(CODE_SESSION_NOT_FOUND)
    }

    /// Classification sent to clients in `ErrorResp`
    pub fn error_type(&self) -> ErrorType {
        match self {
            Error::ParanoidModePassword(_) => ErrorType::ParanoidModePasswordError,
            _ => ErrorType::Unknown,
        }
    }
}

/// Human-readable description of a known API status code
pub fn api_code_description(code: i64) -> &'static str {
    match code {
        CODE_UNAUTHORIZED => "Invalid credentials",
        CODE_WG_PUBLIC_KEY_NOT_FOUND => "Tunnel public key not found",
        CODE_SESSION_NOT_FOUND => "Session not found",
        CODE_SESSIONS_LIMIT_REACHED => "Session limit reached",
        CODE_ACCOUNT_NOT_ACTIVE => "Account is not active",
        CODE_CAPTCHA_REQUIRED => "Captcha required",
        CODE_CAPTCHA_INVALID => "Captcha is not valid",
        CODE_2FA_REQUIRED => "Two-factor authentication token required",
        CODE_2FA_INVALID_TOKEN => "Two-factor authentication token is not valid",
        _ => "Unknown API error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_not_found() {
        assert!(Error::api(601, "Session not found").is_session_not_found());
        assert!(!Error::api(602, "limit").is_session_not_found());
        assert!(!Error::NotLoggedIn.is_session_not_found());
    }

    #[test]
    fn test_error_type_mapping() {
        assert_eq!(
            Error::ParanoidModePassword("bad".into()).error_type(),
            ErrorType::ParanoidModePasswordError
        );
        assert_eq!(Error::NotLoggedIn.error_type(), ErrorType::Unknown);
    }

    #[test]
    fn test_api_error_display() {
        let err = Error::api(702, "Account is not active");
        assert_eq!(err.to_string(), "API error: [702] Account is not active");
        assert_eq!(err.api_code(), Some(702));
    }
}
