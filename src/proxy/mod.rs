//! GATT proxy server
//!
//! Tunnels mesh traffic over point-to-point GATT connections:
//! - `client`: fixed-capacity table of connected proxy clients
//! - `filter`: per-client proxy filters and configuration messages
//! - `sar`: proxy PDU segmentation and reassembly
//! - `identity`: Node Identity / Network ID advertising payloads
//! - `rotation`: time-sliced advertising rotation across subnets
//! - `server`: the single-owner state machine tying these together
//! - `service`: tokio work queue that serializes events into the server

pub mod client;
pub mod config;
pub mod filter;
pub mod identity;
pub mod rotation;
pub mod sar;
pub mod server;
pub mod service;

pub use client::{ClientTable, ProxyClient};
pub use config::{ConfigError, ProxyConfig};
pub use filter::{Filter, FilterMode, FilterStatus};
pub use rotation::{AdvMode, AdvPlan, AdvRotator};
pub use sar::{MsgType, SarError};
pub use server::{ProxyServer, Task};
pub use service::{ProxyEvent, ProxyHandle, ProxyService};

use thiserror::Error;

use crate::ble::{BleError, ConnHandle};
use crate::mesh::MeshError;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Prohibited filter type 0x{0:02x}")]
    InvalidFilterType(u8),

    #[error("Too short {0} message")]
    TooShort(&'static str),

    #[error("No free proxy client slots")]
    NoFreeClient,

    #[error("Connectable advertising deferred (max connections {0})")]
    ConnectionLimit(usize),

    #[error("No proxy client for connection {0}")]
    UnknownClient(ConnHandle),

    #[error("No subnets to advertise on")]
    NoSubnets,

    #[error("Operation not supported in the current state")]
    NotSupported,

    #[error("Node is not provisioned")]
    NotProvisioned,

    #[error("Proxy service already enabled")]
    Busy,

    #[error("Proxy service already disabled")]
    AlreadyDisabled,

    #[error("Configuration message addressed to 0x{0:04x}")]
    UnexpectedDestination(u16),

    #[error("Proxy service stopped")]
    ServiceStopped,

    #[error("SAR error: {0}")]
    Sar(#[from] SarError),

    #[error("Transport error: {0}")]
    Transport(#[from] BleError),

    #[error("Network error: {0}")]
    Network(#[from] MeshError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
