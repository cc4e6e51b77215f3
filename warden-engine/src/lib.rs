//! Warden Engine
//!
//! The privileged core of the VPN daemon: everything that reacts to control
//! requests, owns the tunnel lifecycle and guards the host with the kill
//! switch. The daemon binary only parses the command line, builds a
//! [`Service`] from a [`Config`] and hands connections to the
//! [`ProtocolServer`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Local clients (UI, CLI)                 │
//! └──────────────────────────────┬──────────────────────────────┘
//!                                │ JSON lines over loopback TCP
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ProtocolServer   - Hello / secret / EAA / broadcasts        │
//! │  Service          - request dispatch, event reactor         │
//! │  ┌───────────────┐ ┌───────────────┐ ┌───────────────────┐  │
//! │  │ConnectionEngine│ │SessionManager │ │ AutoConnect       │  │
//! │  │ - reconnects  │ │ - login/keys  │ │ - trusted Wi-Fi   │  │
//! │  │ - pause       │ │ - status poll │ │ - launch policy   │  │
//! │  └──────┬────────┘ └──────┬────────┘ └─────────┬─────────┘  │
//! │         ▼                 ▼                    ▼            │
//! │  Firewall · DNS · SplitTunnel · Servers · Ping · Wi-Fi      │
//! └──────────────────────────────┬──────────────────────────────┘
//!                                ▼
//!          platform helper, tunnel binaries, REST API
//! ```

pub mod api;
pub mod autoconnect;
pub mod config;
pub mod connection;
pub mod dns;
pub mod eaa;
pub mod error;
pub mod event;
pub mod firewall;
pub mod helper;
pub mod kem;
pub mod mock;
pub mod netinfo;
pub mod ping;
pub mod platform;
pub mod preferences;
pub mod protocol;
pub mod servers;
pub mod service;
pub mod session;
pub mod splittun;
pub mod wgkeys;
pub mod wifi;

pub use config::{ApiConfig, Config, DaemonConfig, HelpersConfig};
pub use connection::ConnectionEngine;
pub use error::{Error, Result};
pub use event::{ChannelEventHandler, ConnectionInfo, DaemonEvent, EventHandler, LoggingEventHandler};
pub use protocol::ProtocolServer;
pub use service::{Components, Service};
