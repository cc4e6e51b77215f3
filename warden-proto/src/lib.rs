//! Warden control protocol
//!
//! Wire types shared by the privileged daemon and its local clients. The
//! transport is a loopback TCP stream carrying newline-delimited JSON objects.
//! Every frame has a `Command` string naming its type and an `Idx` integer
//! correlating a response with the request that caused it. Broadcasts carry
//! `Idx = 0`.
//!
//! ```rust
//! use warden_proto::{codec, Request, Response};
//!
//! let line = r#"{"Command":"GetVPNState","Idx":7,"ProtocolSecret":""}"#;
//! let (header, request) = codec::decode_request(line).unwrap();
//! assert_eq!(header.idx, 7);
//! assert!(matches!(request, Request::GetVPNState));
//!
//! let frame = codec::encode_response(&Response::EmptyResp, header.idx).unwrap();
//! assert_eq!(frame, "{\"Command\":\"EmptyResp\",\"Idx\":7}\n");
//! ```
//!
//! Field names are case-sensitive and are the compatibility contract with
//! existing clients; unknown fields are ignored on input.

/// Declares a C-like enum that travels as a JSON integer.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(try_from = "i64", into = "i64")]
        $vis enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl TryFrom<i64> for $name {
            type Error = crate::Error;

            fn try_from(value: i64) -> crate::Result<Self> {
                match value {
                    $( v if v == $val => Ok($name::$variant), )+
                    _ => Err(crate::Error::OutOfRange { kind: stringify!($name), value }),
                }
            }
        }

        impl From<$name> for i64 {
            fn from(value: $name) -> i64 {
                value as i64
            }
        }
    };
}

pub mod api;
pub mod codec;
pub mod dns;
mod error;
pub mod request;
pub mod response;
pub mod servers;
pub mod types;

pub use dns::{DnsEncryption, DnsServerConfig, DnsSettings};
pub use error::{Error, Result};
pub use request::{Request, RequestHeader};
pub use response::Response;
pub use servers::{HostInfo, PortInfo, ServerInfo, ServersInfo};
pub use types::{
    AccountStatus, AntiTrackerMetadata, ClientType, ConnectionParams, DisconnectReason,
    ErrorType, IpProtocol, PortProtocol, ServerSelection, TransportProxy, VpnState, VpnType,
    WiFiParams,
};

/// Protocol version reported in `HelloResp`
pub const PROTOCOL_VERSION: &str = "3.14.0";

/// Environment variable set when the CLI is spawned by the UI
pub const STARTED_BY_PARENT_ENV: &str = "IVPN_STARTED_BY_PARENT";

/// Value of [`STARTED_BY_PARENT_ENV`] when the parent is the UI
pub const STARTED_BY_PARENT_UI: &str = "IVPN_UI";
