// Mesh Proxy - GATT proxy bearer for Bluetooth Mesh nodes

pub mod ble;
pub mod mesh;
pub mod proxy;

pub use proxy::{ProxyConfig, ProxyError, ProxyHandle, ProxyServer, ProxyService};
