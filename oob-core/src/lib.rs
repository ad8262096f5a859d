//! # oob-core
//!
//! Core building blocks for the out-of-band messaging transport.
//!
//! - **Identity**: [`ProcessName`], [`Tag`] and the [`RecvFlags`] bitflags
//! - **Pooling**: [`FreeList`], a bounded, growable pool handing out
//!   [`Pooled`] guards, and the [`PayloadBuf`] payload buffers built on it
//! - **Networking**: the [`NetworkProvider`] / [`Listener`] / [`Connection`]
//!   traits with a Tokio TCP implementation and an in-process
//!   [`MemoryNetwork`] for tests

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod buffer;
mod error;
mod free_list;
mod memory;
mod network;
mod types;

// Error exports
pub use error::{PoolError, PoolResult};

// Pool exports
pub use buffer::{payload_pool, PayloadBuf, PooledBuf};
pub use free_list::{FreeList, FreeListConfig, PoolStats, Pooled, Reset};

// Network exports
pub use memory::{MemoryConnection, MemoryListener, MemoryNetwork};
pub use network::{
    Connection, Listener, NetworkProvider, TokioConnection, TokioListener, TokioNetworkProvider,
};

// Core type exports
pub use types::{
    ProcessName, ProcessNameParseError, RecvFlags, SendFlags, Tag, PROCESS_NAME_SIZE,
};
