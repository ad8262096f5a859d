//! Metrics collection for peers.

use std::time::{Duration, Instant};

/// Counters and timestamps for one peer.
#[derive(Debug, Clone)]
pub struct PeerMetrics {
    /// Total number of connection attempts made
    pub connection_attempts: u64,

    /// Total number of connections established (outbound or accepted)
    pub connections_established: u64,

    /// Total number of failed connection attempts
    pub connection_failures: u64,

    /// Total number of frames written
    pub messages_sent: u64,

    /// Total number of frames read
    pub messages_received: u64,

    /// Total number of sends failed because the connection went away
    pub messages_failed: u64,

    /// Total payload bytes written
    pub bytes_sent: u64,

    /// Total payload bytes read
    pub bytes_received: u64,

    /// Current size of the send queue
    pub current_queue_size: usize,

    /// When the peer entry was created
    pub created_at: Instant,

    /// Time of last successful connection (None if never connected)
    pub last_connected: Option<Instant>,

    /// Time of last connection failure (None if no failures)
    pub last_failure: Option<Instant>,

    /// Current consecutive failure count
    pub consecutive_failures: u32,

    /// Backoff delay that preceded the latest attempt
    pub current_reconnect_delay: Duration,
}

impl Default for PeerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerMetrics {
    /// Create an empty metrics record stamped with the current time.
    pub fn new() -> Self {
        Self {
            connection_attempts: 0,
            connections_established: 0,
            connection_failures: 0,
            messages_sent: 0,
            messages_received: 0,
            messages_failed: 0,
            bytes_sent: 0,
            bytes_received: 0,
            current_queue_size: 0,
            created_at: Instant::now(),
            last_connected: None,
            last_failure: None,
            consecutive_failures: 0,
            current_reconnect_delay: Duration::ZERO,
        }
    }

    /// Record a connection attempt.
    pub fn record_connection_attempt(&mut self) {
        self.connection_attempts += 1;
    }

    /// Record a successful connection.
    pub fn record_connection_success(&mut self) {
        self.connections_established += 1;
        self.last_connected = Some(Instant::now());
        self.consecutive_failures = 0;
    }

    /// Record a failed connection attempt and the delay before the next one.
    pub fn record_connection_failure(&mut self, reconnect_delay: Duration) {
        self.connection_failures += 1;
        self.last_failure = Some(Instant::now());
        self.consecutive_failures += 1;
        self.current_reconnect_delay = reconnect_delay;
    }

    /// Record a frame written.
    pub fn record_message_sent(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Record a frame read.
    pub fn record_message_received(&mut self, bytes: usize) {
        self.messages_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// Record a send that failed with its connection.
    pub fn record_message_failed(&mut self) {
        self.messages_failed += 1;
    }

    /// Calculate connection success rate as a percentage.
    pub fn connection_success_rate(&self) -> f64 {
        if self.connection_attempts == 0 {
            100.0
        } else {
            ((self.connections_established as f64 / self.connection_attempts as f64) * 100.0).min(100.0)
        }
    }
}
