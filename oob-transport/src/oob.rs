//! The public endpoint.
//!
//! [`Oob`] wraps a shared [`Registry`] and exposes blocking, deadline-bounded
//! and callback-based variants of send and receive. Blocking calls park the
//! calling thread, so they must not run on the runtime thread that drives the
//! reactor: use a multi-threaded runtime, `spawn_blocking`, or
//! [`Oob::start_with_progress_thread`].

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use oob_core::{NetworkProvider, ProcessName, RecvFlags, SendFlags, Tag};

use crate::completion::{share, Buffers, Completion, PeerException, WaitSlot};
use crate::config::OobConfig;
use crate::error::{OobError, OobResult};
use crate::matching::RecvId;
use crate::peer::PeerState;
use crate::reactor::{ProgressThread, Reactor};
use crate::registry::{OobStats, PeerSnapshot, Registry};
use crate::wire::MessageKind;

/// A finished blocking receive.
#[derive(Debug)]
pub struct Received {
    /// Sender of the message.
    pub peer: ProcessName,
    /// Message tag.
    pub tag: Tag,
    /// Bytes received, or the full message size with [`RecvFlags::TRUNCATE`].
    pub size: usize,
    /// The filled buffers.
    pub buffers: Buffers,
}

/// An out-of-band messaging endpoint.
///
/// Cloning is cheap; clones share the same registry. The endpoint lives until
/// [`Oob::shutdown`] is called.
#[derive(Debug, Clone)]
pub struct Oob {
    registry: Arc<Registry>,
    local_addr: Option<String>,
}

impl Oob {
    /// Start an endpoint whose reactor runs as a task on the current Tokio
    /// runtime.
    pub async fn start(config: OobConfig, network: Arc<dyn NetworkProvider>) -> OobResult<Self> {
        let (registry, reactor, local_addr) = Reactor::setup(config, network).await?;
        tokio::spawn(reactor.run());
        Ok(Self {
            registry,
            local_addr,
        })
    }

    /// Start an endpoint whose reactor runs on a dedicated thread.
    pub fn start_with_progress_thread(
        config: OobConfig,
        network: Arc<dyn NetworkProvider>,
    ) -> OobResult<(Self, ProgressThread)> {
        let (registry, local_addr, thread) = ProgressThread::spawn(config, network)?;
        Ok((
            Self {
                registry,
                local_addr,
            },
            thread,
        ))
    }

    /// Name of this endpoint.
    pub fn local_name(&self) -> ProcessName {
        self.registry.local()
    }

    /// Address the listener is bound to, if any.
    pub fn local_addr(&self) -> Option<&str> {
        self.local_addr.as_deref()
    }

    /// Record the address where `peer` accepts connections.
    pub fn add_contact(&self, peer: ProcessName, address: impl Into<String>) {
        self.registry.add_contact(peer, address.into());
    }

    /// Register a handler for peer failures. Handlers run outside all
    /// transport locks and may call back into the endpoint.
    pub fn on_exception<F>(&self, handler: F)
    where
        F: Fn(ProcessName, PeerException) + Send + Sync + 'static,
    {
        self.registry.on_exception(Arc::new(handler));
    }

    // =========================================================================
    // Send
    // =========================================================================

    /// Send `buffers` to `peer` and wait until the frame is written, or only
    /// until it is queued with [`SendFlags::NON_BLOCKING`].
    ///
    /// Returns the payload size.
    pub fn send(
        &self,
        peer: ProcessName,
        buffers: Vec<Bytes>,
        tag: Tag,
        flags: SendFlags,
    ) -> OobResult<usize> {
        self.send_inner(peer, buffers, tag, flags, None)
    }

    /// Like [`Oob::send`], giving up at `deadline`.
    ///
    /// On [`OobError::Timeout`] the message stays queued and may still be
    /// delivered.
    pub fn send_until(
        &self,
        peer: ProcessName,
        buffers: Vec<Bytes>,
        tag: Tag,
        flags: SendFlags,
        deadline: Instant,
    ) -> OobResult<usize> {
        self.send_inner(peer, buffers, tag, flags, Some(deadline))
    }

    fn send_inner(
        &self,
        peer: ProcessName,
        buffers: Vec<Bytes>,
        tag: Tag,
        flags: SendFlags,
        deadline: Option<Instant>,
    ) -> OobResult<usize> {
        if flags.contains(SendFlags::NON_BLOCKING) {
            let size = buffers.iter().map(Bytes::len).sum();
            self.registry
                .send(MessageKind::Data, peer, tag, buffers, None)?;
            return Ok(size);
        }
        let slot = WaitSlot::new();
        self.registry
            .send(MessageKind::Data, peer, tag, buffers, Some(slot.target()))?;
        slot.wait(deadline).ok_or(OobError::Timeout)?.status
    }

    /// Queue `buffers` for `peer`; `callback` runs once the frame is written
    /// or has failed, and gets the buffers back.
    pub fn send_async<F>(&self, peer: ProcessName, buffers: Vec<Bytes>, tag: Tag, callback: F) -> OobResult<()>
    where
        F: FnMut(Completion) + Send + 'static,
    {
        self.registry
            .send(MessageKind::Data, peer, tag, buffers, Some(share(Box::new(callback))))
    }

    /// Connect to `peer` if needed and push a ping frame, waiting until it is
    /// written or `deadline` passes.
    pub fn ping(&self, peer: ProcessName, deadline: Instant) -> OobResult<()> {
        let slot = WaitSlot::new();
        self.registry
            .send(MessageKind::Ping, peer, 0, Vec::new(), Some(slot.target()))?;
        slot.wait(Some(deadline))
            .ok_or(OobError::Timeout)?
            .status
            .map(|_| ())
    }

    // =========================================================================
    // Receive
    // =========================================================================

    /// Wait for a message from `peer` (or [`ProcessName::ANY`]) with `tag`.
    pub fn recv(
        &self,
        peer: ProcessName,
        buffers: Vec<Vec<u8>>,
        tag: Tag,
        flags: RecvFlags,
    ) -> OobResult<Received> {
        self.recv_inner(peer, buffers, tag, flags, None)
    }

    /// Like [`Oob::recv`], giving up at `deadline`. A receive that times out
    /// is withdrawn and consumes nothing.
    pub fn recv_until(
        &self,
        peer: ProcessName,
        buffers: Vec<Vec<u8>>,
        tag: Tag,
        flags: RecvFlags,
        deadline: Instant,
    ) -> OobResult<Received> {
        self.recv_inner(peer, buffers, tag, flags, Some(deadline))
    }

    fn recv_inner(
        &self,
        peer: ProcessName,
        buffers: Vec<Vec<u8>>,
        tag: Tag,
        flags: RecvFlags,
        deadline: Option<Instant>,
    ) -> OobResult<Received> {
        if flags.contains(RecvFlags::PERSISTENT) {
            return Err(OobError::InvalidParameter(
                "persistent receives need a callback".to_string(),
            ));
        }
        let slot = WaitSlot::new();
        let id = self
            .registry
            .post_recv(peer, tag, flags, buffers, slot.target())?;
        let completion = match slot.wait(deadline) {
            Some(completion) => completion,
            None if self.registry.withdraw(id) => return Err(OobError::Timeout),
            // Matched while the deadline passed; the completion is on its way.
            None => slot.wait(None).ok_or(OobError::Timeout)?,
        };
        let size = completion.status?;
        Ok(Received {
            peer: completion.peer,
            tag: completion.tag,
            size,
            buffers: completion.buffers,
        })
    }

    /// Post a receive whose `callback` runs on every match (once, unless
    /// [`RecvFlags::PERSISTENT`]) or on failure.
    pub fn recv_async<F>(
        &self,
        peer: ProcessName,
        buffers: Vec<Vec<u8>>,
        tag: Tag,
        flags: RecvFlags,
        callback: F,
    ) -> OobResult<RecvId>
    where
        F: FnMut(Completion) + Send + 'static,
    {
        self.registry
            .post_recv(peer, tag, flags, buffers, share(Box::new(callback)))
    }

    /// Cancel the receives posted for (`peer`, `tag`). With
    /// [`ProcessName::ANY`] every receive posted with `tag` is cancelled,
    /// including those bound to a specific peer.
    ///
    /// Cancelled receives complete with [`OobError::Cancelled`]. Returns once
    /// every match already in progress has been delivered, unless called from
    /// a completion callback.
    pub fn cancel_recv(&self, peer: ProcessName, tag: Tag) -> OobResult<()> {
        self.registry.cancel_recv(peer, tag)
    }

    // =========================================================================
    // Management
    // =========================================================================

    /// Close the connection to `peer`. Its queued sends and the receives
    /// posted for it fail with [`OobError::ConnectionFailed`].
    pub fn close_peer(&self, peer: ProcessName) -> OobResult<()> {
        self.registry.close_peer(peer)
    }

    /// Connection state of `peer`, if known.
    pub fn peer_state(&self, peer: ProcessName) -> Option<PeerState> {
        self.registry.peer_state(peer)
    }

    /// Snapshot of every peer.
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        self.registry.peers()
    }

    /// Transport counters.
    pub fn stats(&self) -> OobStats {
        self.registry.stats()
    }

    /// Close every connection and fail every pending operation with
    /// [`OobError::Shutdown`]. Idempotent.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}
