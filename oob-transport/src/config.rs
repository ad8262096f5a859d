//! Transport configuration.

use serde::{Deserialize, Serialize};

use oob_core::{FreeListConfig, ProcessName};

use crate::error::{OobError, OobResult};
use crate::peer::PeerConfig;
use crate::wire::MAX_PAYLOAD_SIZE;

/// Top-level configuration for an OOB endpoint.
///
/// # Examples
///
/// ```
/// use oob_transport::{OobConfig, ProcessName};
///
/// let config = OobConfig::from_json(r#"{
///     "local_name": {"cell": 0, "job": 1, "vpid": 3},
///     "listen_address": "127.0.0.1:0",
///     "buffer_pool": {"element_size": 1024, "initial": 4, "max": 64, "increment": 4}
/// }"#).expect("valid config");
///
/// assert_eq!(config.local_name, ProcessName::new(0, 1, 3));
/// assert_eq!(config.buffer_pool.max, 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OobConfig {
    /// Name of this process.
    pub local_name: ProcessName,
    /// Address to accept connections on; `None` for send-only endpoints.
    pub listen_address: Option<String>,
    /// Connection and queue settings applied to every peer.
    pub peer: PeerConfig,
    /// Bounds of the payload buffer pool.
    pub buffer_pool: FreeListConfig,
    /// Largest payload accepted from the wire.
    pub max_payload_size: usize,
}

impl Default for OobConfig {
    fn default() -> Self {
        Self {
            local_name: ProcessName::default(),
            listen_address: None,
            peer: PeerConfig::default(),
            buffer_pool: FreeListConfig::default(),
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl OobConfig {
    /// Configuration for `local_name` with default settings.
    pub fn new(local_name: ProcessName) -> Self {
        Self {
            local_name,
            ..Self::default()
        }
    }

    /// Accept connections on `address`.
    pub fn with_listen_address(mut self, address: impl Into<String>) -> Self {
        self.listen_address = Some(address.into());
        self
    }

    /// Replace the peer settings.
    pub fn with_peer_config(mut self, peer: PeerConfig) -> Self {
        self.peer = peer;
        self
    }

    /// Replace the payload pool bounds.
    pub fn with_buffer_pool(mut self, buffer_pool: FreeListConfig) -> Self {
        self.buffer_pool = buffer_pool;
        self
    }

    /// Set the largest payload accepted from the wire.
    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> OobResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings for consistency.
    pub fn validate(&self) -> OobResult<()> {
        if self.local_name.is_wildcard() {
            return Err(OobError::Config(
                "local_name cannot be the wildcard name".to_string(),
            ));
        }
        self.peer.validate().map_err(OobError::Config)?;
        self.buffer_pool.validate()?;
        if self.max_payload_size == 0 || self.max_payload_size > u32::MAX as usize {
            return Err(OobError::Config(format!(
                "max_payload_size {} out of range",
                self.max_payload_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert_eq!(OobConfig::new(ProcessName::new(0, 0, 1)).validate(), Ok(()));
    }

    #[test]
    fn test_rejects_inconsistent_settings() {
        let wildcard = OobConfig::new(ProcessName::ANY);
        assert!(matches!(wildcard.validate(), Err(OobError::Config(_))));

        let pool = OobConfig::new(ProcessName::new(0, 0, 1))
            .with_buffer_pool(FreeListConfig::new(16, 8, 4, 1));
        assert!(matches!(pool.validate(), Err(OobError::Config(_))));

        assert!(matches!(
            OobConfig::from_json("{not json"),
            Err(OobError::Config(_))
        ));
    }
}
