//! # OOB Transport
//!
//! Out-of-band control messaging between named processes over TCP.
//!
//! This crate provides:
//! - **Wire format**: fixed 40-byte header with CRC32C-checked payloads
//! - **Message**: resumable send and receive cursors over non-blocking sockets
//! - **Peer**: per-process connection state machine with backoff and an
//!   identify handshake
//! - **Matching**: posted and unexpected queues keyed by sender and tag
//! - **Oob**: the endpoint, with blocking, deadline and callback APIs
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use oob_transport::{
//!     Bytes, MemoryNetwork, Oob, OobConfig, ProcessName, RecvFlags, SendFlags,
//! };
//!
//! # async fn demo() -> oob_transport::OobResult<()> {
//! let net = Arc::new(MemoryNetwork::new());
//! let a = ProcessName::new(0, 1, 0);
//! let b = ProcessName::new(0, 1, 1);
//! let server = Oob::start(OobConfig::new(b).with_listen_address("b"), net.clone()).await?;
//! let client = Oob::start(OobConfig::new(a), net).await?;
//! client.add_contact(b, "b");
//!
//! client.send_async(b, vec![Bytes::from_static(b"hello")], 7, |_| {})?;
//! let got = tokio::task::spawn_blocking(move || {
//!     server.recv(ProcessName::ANY, vec![vec![0; 16]], 7, RecvFlags::empty())
//! })
//! .await
//! .expect("join")?;
//! assert_eq!(got.buffers.to_vec(), b"hello");
//! # let _ = SendFlags::NON_BLOCKING;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use bytes::Bytes;
pub use oob_core::{
    Connection, FreeList, FreeListConfig, Listener, MemoryNetwork, NetworkProvider, PayloadBuf,
    PoolError, PoolStats, PooledBuf, ProcessName, RecvFlags, SendFlags, Tag, TokioNetworkProvider,
};

// =============================================================================
// Modules
// =============================================================================

/// Completion records, callbacks and exception handlers.
pub mod completion;

/// Endpoint configuration.
pub mod config;

/// Error types for OOB operations.
pub mod error;

/// Posted and unexpected message matching.
pub mod matching;

/// Resumable framing over non-blocking connections.
pub mod message;

/// The endpoint facade.
pub mod oob;

/// Per-peer connection management.
pub mod peer;

/// Connection tasks and the progress thread.
pub mod reactor;

/// Shared transport state.
pub mod registry;

/// Frame header layout and checksums.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

// Completion exports
pub use completion::{Buffers, Callback, Completion, ExceptionHandler, PeerException};

// Config exports
pub use config::OobConfig;

// Error exports
pub use error::{OobError, OobResult};

// Matching exports
pub use matching::{MatchStats, RecvId};

// Endpoint exports
pub use oob::{Oob, Received};
pub use reactor::ProgressThread;
pub use registry::{OobStats, PeerSnapshot};

// Peer exports
pub use peer::{Direction, PeerConfig, PeerId, PeerMetrics, PeerState};

// Wire format exports
pub use wire::{MessageHeader, MessageKind, WireError, HEADER_SIZE, MAX_PAYLOAD_SIZE};
