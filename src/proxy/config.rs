//! Proxy server configuration
//!
//! Build-time limits of the proxy (connection slots, filter size, buffer
//! size) plus the Node Identity and SAR timeouts. Loadable from JSON; every
//! field has a default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest device name that still fits a 31-byte scan response.
pub const MAX_DEVICE_NAME_LEN: usize = 29;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Simultaneous proxy connections (client table capacity).
    pub max_connections: usize,
    /// Addresses each client's filter can hold.
    pub filter_size: usize,
    /// How long Node Identity advertising runs once started.
    pub node_id_timeout_secs: u64,
    /// Time allowed between segments of one proxy PDU.
    pub sar_timeout_secs: u64,
    /// Reassembly buffer size per client, in bytes.
    pub reassembly_capacity: usize,
    /// Advertised in the scan response when set.
    pub device_name: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_connections: 3,
            filter_size: 16,
            node_id_timeout_secs: 60,
            sar_timeout_secs: 20,
            reassembly_capacity: 66,
            device_name: None,
        }
    }
}

impl ProxyConfig {
    pub fn node_id_timeout(&self) -> Duration {
        Duration::from_secs(self.node_id_timeout_secs)
    }

    pub fn sar_timeout(&self) -> Duration {
        Duration::from_secs(self.sar_timeout_secs)
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.filter_size == 0 {
            return Err(ConfigError::Invalid(
                "filter_size must be at least 1".to_string(),
            ));
        }
        if self.node_id_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "node_id_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.sar_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sar_timeout_secs must be at least 1".to_string(),
            ));
        }
        if let Some(name) = &self.device_name {
            if name.len() > MAX_DEVICE_NAME_LEN {
                return Err(ConfigError::Invalid(format!(
                    "device_name is {} bytes, at most {} fit",
                    name.len(),
                    MAX_DEVICE_NAME_LEN
                )));
            }
        }
        Ok(())
    }
}
