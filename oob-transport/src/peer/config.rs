//! Configuration structures for peer behavior.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for peer connection setup and queuing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Initial delay before retrying a failed connection attempt
    #[serde(with = "millis")]
    pub initial_reconnect_delay: Duration,

    /// Maximum delay between connection attempts
    #[serde(with = "millis")]
    pub max_reconnect_delay: Duration,

    /// Maximum number of sends queued on one peer
    pub max_queue_size: usize,

    /// Timeout for a single connection attempt
    #[serde(with = "millis")]
    pub connection_timeout: Duration,

    /// Number of connection attempts before the peer is marked failed
    pub max_connection_attempts: u32,

    /// Maximum time between connect and receiving the remote identify frame
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            initial_reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(5),
            max_queue_size: 1000,
            connection_timeout: Duration::from_secs(5),
            max_connection_attempts: 3,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl PeerConfig {
    /// Create a new configuration with specified parameters.
    pub fn new(
        max_queue_size: usize,
        connection_timeout: Duration,
        initial_reconnect_delay: Duration,
        max_reconnect_delay: Duration,
        max_connection_attempts: u32,
    ) -> Self {
        Self {
            initial_reconnect_delay,
            max_reconnect_delay,
            max_queue_size,
            connection_timeout,
            max_connection_attempts,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// Set the identify handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Create a configuration for low-latency local networking.
    pub fn local_network() -> Self {
        Self {
            initial_reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_secs(1),
            max_queue_size: 100,
            connection_timeout: Duration::from_millis(500),
            max_connection_attempts: 5,
            handshake_timeout: Duration::from_secs(2),
        }
    }

    /// Create a configuration for high-latency WAN networking.
    pub fn wan_network() -> Self {
        Self {
            initial_reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(60),
            max_queue_size: 5000,
            connection_timeout: Duration::from_secs(30),
            max_connection_attempts: 10,
            handshake_timeout: Duration::from_secs(60),
        }
    }

    /// Check the settings for consistency.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connection_attempts == 0 {
            return Err("max_connection_attempts must be at least 1".to_string());
        }
        if self.max_queue_size == 0 {
            return Err("max_queue_size must be at least 1".to_string());
        }
        if self.initial_reconnect_delay > self.max_reconnect_delay {
            return Err("initial_reconnect_delay exceeds max_reconnect_delay".to_string());
        }
        Ok(())
    }
}

/// Durations as integer milliseconds in config files.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
