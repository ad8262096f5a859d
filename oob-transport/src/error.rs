//! Error types for the OOB messaging layer.

use oob_core::{PoolError, ProcessName};

/// Errors surfaced by OOB operations and completion callbacks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OobError {
    /// The connection to the peer failed or was lost.
    #[error("connection to {peer} failed")]
    ConnectionFailed {
        /// The peer whose connection failed.
        peer: ProcessName,
    },

    /// A pool or queue bound was reached.
    #[error("out of resources")]
    OutOfResource,

    /// The deadline passed before the operation completed.
    #[error("operation timed out")]
    Timeout,

    /// The arguments are inconsistent.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No matching posted receive.
    #[error("not found")]
    NotFound,

    /// No address is known for the peer.
    #[error("peer {peer} is unreachable")]
    Unreachable {
        /// The unreachable peer.
        peer: ProcessName,
    },

    /// The posted receive was cancelled before it matched.
    #[error("receive cancelled")]
    Cancelled,

    /// The transport is shutting down.
    #[error("transport shut down")]
    Shutdown,

    /// Local socket or runtime setup failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// Configuration rejected at startup.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<PoolError> for OobError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Config(message) => OobError::Config(message),
            PoolError::OutOfResource => OobError::OutOfResource,
            PoolError::Timeout => OobError::Timeout,
            PoolError::Shutdown => OobError::Shutdown,
        }
    }
}

impl From<serde_json::Error> for OobError {
    fn from(err: serde_json::Error) -> Self {
        OobError::Config(err.to_string())
    }
}

/// Result type for OOB operations.
pub type OobResult<T> = Result<T, OobError>;
