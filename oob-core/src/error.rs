//! Error types for the core layer.

use thiserror::Error;

/// Errors returned by [`FreeList`](crate::FreeList) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The pool bounds are inconsistent.
    #[error("invalid pool configuration: {0}")]
    Config(String),

    /// No free item and the pool is already at its maximum size.
    #[error("free list exhausted")]
    OutOfResource,

    /// A bounded wait reached its deadline before an item was released.
    #[error("timed out waiting for a free item")]
    Timeout,

    /// The pool was closed while waiting or before the call.
    #[error("free list closed")]
    Shutdown,
}

/// Result alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;
