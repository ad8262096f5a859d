//! Per-peer connection management.
//!
//! A [`Peer`] represents one remote process. It handles:
//! - **Connection state**: Closed, Connecting, Connected, Failed
//! - **Send queuing** while the connection is being established
//! - **Identify handshake** before any data frame flows
//!
//! # Connection Lifecycle
//!
//! ```text
//! ┌────────┐  initiate_connect  ┌────────────┐  identify  ┌───────────┐
//! │ Closed ├───────────────────►│ Connecting ├───────────►│ Connected │
//! └───▲────┘                    └─────┬──────┘            └─────┬─────┘
//!     │  EOF / close                  │ refused / timeout       │ I/O error
//!     │◄──────────────────────────────┼─────────────────────────┤
//!     │                         ┌─────▼──┐                      │
//!     └─────── send ────────────┤ Failed │◄─────────────────────┘
//!                               └────────┘
//! ```
//!
//! # Backoff Strategy
//!
//! Connection attempts retry with exponential backoff plus jitter, starting
//! at `initial_reconnect_delay` and capped at `max_reconnect_delay`, until
//! `max_connection_attempts` is reached.

/// Peer state machine, send queue and backoff
pub mod core;

/// Configuration structures for peer behavior
pub mod config;

/// Metrics collection for peers
pub mod metrics;

// Re-export main types
pub use config::PeerConfig;
pub use core::{Direction, Peer, PeerId, PeerState};
pub use metrics::PeerMetrics;
