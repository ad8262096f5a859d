//! Shared transport state.
//!
//! The [`Registry`] owns every peer, the name table, the contact table and the
//! [`MatchEngine`], all behind one coarse lock. Operations mutate state under
//! the lock and collect [`Effects`]; callbacks and exception handlers run only
//! after the lock is released, through an iterative drain queue so a callback
//! that triggers another completion never recurses.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use bytes::Bytes;
use oob_core::{
    payload_pool, Connection, FreeList, PayloadBuf, PoolStats, ProcessName, RecvFlags,
    Tag,
};
use parking_lot::{Condvar, Mutex, RwLock};
use tokio::sync::mpsc;

use crate::completion::{
    Buffers, Completion, Delivery, Effects, ExceptionHandler, PeerException, SharedCallback,
};
use crate::config::OobConfig;
use crate::error::{OobError, OobResult};
use crate::matching::{MatchEngine, MatchStats, RecvId};
use crate::message::{MessageError, ReceivedFrame, RecvProgress, SendMessage};
use crate::peer::core::LinkSignals;
use crate::peer::{Direction, Peer, PeerId, PeerMetrics, PeerState};
use crate::wire::{self, MessageHeader, MessageKind};

/// Work for the reactor.
#[derive(Debug)]
pub(crate) enum ReactorCommand {
    /// Dial `address` for `peer` at `generation`.
    Connect {
        peer: PeerId,
        generation: u64,
        address: String,
    },
    /// Stop accepting and exit.
    Shutdown,
}

/// What the connection driver should do after a read pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// Wait for readability again.
    Continue,
    /// Wait for a payload buffer to be released.
    Stalled,
    /// The connection is gone.
    Closed,
}

/// What the connection driver should wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LinkStatus {
    pub(crate) wants_write: bool,
    pub(crate) handshake_pending: bool,
}

/// Snapshot of one peer.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    /// Registry-local id.
    pub id: PeerId,
    /// Name, once known.
    pub name: Option<ProcessName>,
    /// Address used to reach it.
    pub address: Option<String>,
    /// Who opened the connection.
    pub direction: Direction,
    /// Connection state.
    pub state: PeerState,
    /// Sends waiting on this peer.
    pub queued: usize,
    /// Last failure reason.
    pub last_error: Option<String>,
    /// Counters.
    pub metrics: PeerMetrics,
}

/// Snapshot of the whole transport.
#[derive(Debug, Clone)]
pub struct OobStats {
    /// Peers known to the registry.
    pub peers: usize,
    /// Peers in the connected state.
    pub connected: usize,
    /// Posted and unexpected list sizes.
    pub matching: MatchStats,
    /// Matches whose callbacks have not finished.
    pub in_flight: usize,
    /// Payload pool counters.
    pub pool: PoolStats,
}

enum DispatchItem {
    Completion(Delivery),
    Exception(ProcessName, PeerException),
}

#[derive(Default)]
struct DispatchQueue {
    items: VecDeque<DispatchItem>,
    drainer: Option<ThreadId>,
}

struct Inner {
    peers: HashMap<PeerId, Peer>,
    names: HashMap<ProcessName, PeerId>,
    contacts: HashMap<ProcessName, String>,
    engine: MatchEngine,
    in_flight: usize,
    next_peer: u64,
    shutting_down: bool,
}

impl Inner {
    fn collect(&mut self, effects: &mut Effects, deliveries: Vec<Delivery>) {
        self.in_flight += deliveries.iter().filter(|d| d.matched).count();
        effects.deliveries.extend(deliveries);
    }

    fn allocate_id(&mut self) -> PeerId {
        self.next_peer += 1;
        PeerId(self.next_peer)
    }
}

/// Shared state of one OOB endpoint.
pub struct Registry {
    config: OobConfig,
    inner: Mutex<Inner>,
    match_cond: Condvar,
    dispatch: Mutex<DispatchQueue>,
    pool: FreeList<PayloadBuf>,
    handlers: RwLock<Vec<ExceptionHandler>>,
    commands: mpsc::UnboundedSender<ReactorCommand>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("local", &self.config.local_name)
            .finish()
    }
}

impl Registry {
    pub(crate) fn new(
        config: OobConfig,
        commands: mpsc::UnboundedSender<ReactorCommand>,
    ) -> OobResult<Self> {
        config.validate()?;
        let pool = payload_pool(config.buffer_pool.clone())?;
        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                peers: HashMap::new(),
                names: HashMap::new(),
                contacts: HashMap::new(),
                engine: MatchEngine::new(),
                in_flight: 0,
                next_peer: 0,
                shutting_down: false,
            }),
            match_cond: Condvar::new(),
            dispatch: Mutex::new(DispatchQueue::default()),
            pool,
            handlers: RwLock::new(Vec::new()),
            commands,
        })
    }

    /// Name of this endpoint.
    pub fn local(&self) -> ProcessName {
        self.config.local_name
    }

    /// Configuration in effect.
    pub fn config(&self) -> &OobConfig {
        &self.config
    }

    pub(crate) fn pool(&self) -> &FreeList<PayloadBuf> {
        &self.pool
    }

    // =========================================================================
    // Application-facing operations
    // =========================================================================

    /// Queue a frame for `peer`, connecting first if needed.
    pub(crate) fn send(
        &self,
        kind: MessageKind,
        peer: ProcessName,
        tag: Tag,
        payload: Vec<Bytes>,
        callback: Option<SharedCallback>,
    ) -> OobResult<()> {
        if peer.is_wildcard() {
            return Err(OobError::InvalidParameter(
                "cannot send to the wildcard name".to_string(),
            ));
        }
        let header = MessageHeader::for_payload(
            kind,
            tag,
            self.local(),
            peer,
            &payload,
            self.config.max_payload_size,
        )
        .map_err(|e| OobError::InvalidParameter(e.to_string()))?;
        if peer == self.local() {
            return self.send_to_self(header, payload, callback);
        }

        let mut inner = self.inner.lock();
        if inner.shutting_down {
            return Err(OobError::Shutdown);
        }
        let id = self.peer_for_send(&mut inner, peer)?;
        let Some(p) = inner.peers.get_mut(&id) else {
            return Err(OobError::Unreachable { peer });
        };
        if let Some((generation, address)) = p.initiate_connect() {
            p.metrics_mut().record_connection_attempt();
            let command = ReactorCommand::Connect {
                peer: id,
                generation,
                address,
            };
            if self.commands.send(command).is_err() {
                p.close(PeerState::Failed, Some("reactor stopped".to_string()));
                return Err(OobError::Shutdown);
            }
        }
        p.enqueue(SendMessage::new(header, payload, callback), self.config.peer.max_queue_size)
            .map_err(|_| OobError::OutOfResource)?;
        tracing::debug!(peer = %peer, tag, size = header.size, "send queued");
        Ok(())
    }

    /// Find the peer entry to send through, creating it from the contact table.
    fn peer_for_send(&self, inner: &mut Inner, name: ProcessName) -> OobResult<PeerId> {
        if let Some(&id) = inner.names.get(&name) {
            let reusable = inner
                .peers
                .get(&id)
                .is_some_and(|p| !p.state().is_down() || p.direction() == Direction::Outbound);
            if reusable {
                if let (Some(address), Some(p)) =
                    (inner.contacts.get(&name).cloned(), inner.peers.get_mut(&id))
                {
                    if p.state().is_down() {
                        p.set_address(address);
                    }
                }
                return Ok(id);
            }
            // A closed inbound entry cannot be redialed at its ephemeral address.
            inner.peers.remove(&id);
            inner.names.remove(&name);
        }
        let address = inner
            .contacts
            .get(&name)
            .cloned()
            .ok_or(OobError::Unreachable { peer: name })?;
        let id = inner.allocate_id();
        inner.peers.insert(id, Peer::outbound(id, name, address));
        inner.names.insert(name, id);
        Ok(id)
    }

    /// Deliver a frame addressed to ourselves without touching the network.
    fn send_to_self(
        &self,
        header: MessageHeader,
        payload: Vec<Bytes>,
        callback: Option<SharedCallback>,
    ) -> OobResult<()> {
        let buf = if header.size == 0 {
            None
        } else {
            let mut buf = self.pool.try_get()?;
            buf.prepare(header.size as usize);
            let mut at = 0;
            for segment in &payload {
                buf.as_mut_slice()[at..at + segment.len()].copy_from_slice(segment);
                at += segment.len();
            }
            Some(buf)
        };
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return Err(OobError::Shutdown);
            }
            if header.kind == MessageKind::Data {
                let mut deliveries = Vec::new();
                inner.engine.arrive(
                    ReceivedFrame {
                        header,
                        payload: buf,
                    },
                    &mut deliveries,
                );
                inner.collect(&mut effects, deliveries);
            }
        }
        if let Some(callback) = callback {
            effects.deliveries.push(sent_delivery(callback, header, payload, Ok(header.size as usize)));
        }
        self.deliver(effects);
        Ok(())
    }

    /// Post a receive.
    pub(crate) fn post_recv(
        &self,
        peer: ProcessName,
        tag: Tag,
        flags: RecvFlags,
        buffers: Vec<Vec<u8>>,
        callback: SharedCallback,
    ) -> OobResult<RecvId> {
        let mut effects = Effects::default();
        let id = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return Err(OobError::Shutdown);
            }
            let mut deliveries = Vec::new();
            let id = inner
                .engine
                .post(peer, tag, flags, buffers, callback, &mut deliveries)?;
            inner.collect(&mut effects, deliveries);
            id
        };
        self.deliver(effects);
        Ok(id)
    }

    /// Remove a posted receive without completing it. `false` if it already matched.
    pub(crate) fn withdraw(&self, id: RecvId) -> bool {
        self.inner.lock().engine.withdraw(id)
    }

    /// Cancel receives posted for (`peer`, `tag`) and wait for in-flight
    /// matches to finish, unless called from inside a completion callback.
    pub(crate) fn cancel_recv(&self, peer: ProcessName, tag: Tag) -> OobResult<()> {
        let draining_here = self.dispatch.lock().drainer == Some(thread::current().id());
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock();
            let mut deliveries = Vec::new();
            inner.engine.cancel(peer, tag, &mut deliveries)?;
            inner.collect(&mut effects, deliveries);
            if !draining_here {
                while inner.in_flight > 0 {
                    self.match_cond.wait(&mut inner);
                }
            }
        }
        self.deliver(effects);
        Ok(())
    }

    /// Close the connection to `peer`, failing its pending operations.
    pub(crate) fn close_peer(&self, peer: ProcessName) -> OobResult<()> {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock();
            let id = *inner.names.get(&peer).ok_or(OobError::NotFound)?;
            self.close_locked(
                &mut inner,
                id,
                PeerState::Closed,
                "closed locally".to_string(),
                false,
                &mut effects,
            );
        }
        self.deliver(effects);
        Ok(())
    }

    /// Record where `peer` can be reached.
    pub(crate) fn add_contact(&self, peer: ProcessName, address: String) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(p) = inner.names.get(&peer).and_then(|id| inner.peers.get_mut(id)) {
            if p.state().is_down() && p.direction() == Direction::Outbound {
                p.set_address(address.clone());
            }
        }
        inner.contacts.insert(peer, address);
    }

    pub(crate) fn on_exception(&self, handler: ExceptionHandler) {
        self.handlers.write().push(handler);
    }

    /// State of the peer currently mapped to `name`.
    pub fn peer_state(&self, name: ProcessName) -> Option<PeerState> {
        let inner = self.inner.lock();
        let id = inner.names.get(&name)?;
        inner.peers.get(id).map(Peer::state)
    }

    /// Snapshot of every peer.
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        let inner = self.inner.lock();
        let mut peers: Vec<PeerSnapshot> = inner
            .peers
            .values()
            .map(|p| PeerSnapshot {
                id: p.id(),
                name: p.name(),
                address: p.address().map(str::to_string),
                direction: p.direction(),
                state: p.state(),
                queued: p.queued(),
                last_error: p.last_error().map(str::to_string),
                metrics: p.metrics().clone(),
            })
            .collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    /// Transport counters.
    pub fn stats(&self) -> OobStats {
        let inner = self.inner.lock();
        OobStats {
            peers: inner.peers.len(),
            connected: inner
                .peers
                .values()
                .filter(|p| p.state() == PeerState::Connected)
                .count(),
            matching: inner.engine.stats(),
            in_flight: inner.in_flight,
            pool: self.pool.stats(),
        }
    }

    /// Close every peer, fail every posted receive and close the pool.
    pub(crate) fn shutdown(&self) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return;
            }
            inner.shutting_down = true;
            let ids: Vec<PeerId> = inner.peers.keys().copied().collect();
            for id in ids {
                self.close_locked(
                    &mut inner,
                    id,
                    PeerState::Closed,
                    "shutdown".to_string(),
                    true,
                    &mut effects,
                );
            }
            let mut deliveries = Vec::new();
            let released = inner.engine.drain(OobError::Shutdown, &mut deliveries);
            inner.collect(&mut effects, deliveries);
            tracing::info!(
                local = %self.local(),
                released_unexpected = released,
                "oob registry shut down"
            );
        }
        self.deliver(effects);
        let outstanding = self.pool.close();
        if outstanding > 0 {
            tracing::debug!(outstanding, "payload buffers still held by callers");
        }
        let _ = self.commands.send(ReactorCommand::Shutdown);
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    // =========================================================================
    // Reactor-facing operations
    // =========================================================================

    pub(crate) fn note_connect_failure(&self, id: PeerId, generation: u64, delay: Duration) {
        let mut inner = self.inner.lock();
        if let Some(p) = inner.peers.get_mut(&id) {
            if p.is_current(generation) {
                p.metrics_mut().record_connection_failure(delay);
                p.metrics_mut().record_connection_attempt();
            }
        }
    }

    /// Whether a connect task for `generation` should keep trying.
    pub(crate) fn still_connecting(&self, id: PeerId, generation: u64) -> bool {
        let inner = self.inner.lock();
        !inner.shutting_down
            && inner
                .peers
                .get(&id)
                .is_some_and(|p| p.is_current(generation) && p.state() == PeerState::Connecting)
    }

    /// Install an outbound connection. `None` if the attempt is stale.
    pub(crate) fn on_connected(
        &self,
        id: PeerId,
        generation: u64,
        conn: Arc<dyn Connection>,
    ) -> Option<Arc<LinkSignals>> {
        let mut inner = self.inner.lock();
        let local = self.local();
        let attached = if inner.shutting_down {
            None
        } else {
            inner.peers.get_mut(&id).and_then(|p| {
                let dst = p.name().unwrap_or_default();
                p.attach(generation, Arc::clone(&conn), control_frame(MessageKind::Identify, local, dst))
            })
        };
        if attached.is_none() {
            conn.shutdown();
        }
        attached
    }

    /// Give up on an outbound connection.
    pub(crate) fn on_connect_failed(&self, id: PeerId, generation: u64, reason: String) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock();
            let current = inner
                .peers
                .get(&id)
                .is_some_and(|p| p.is_current(generation) && p.state() == PeerState::Connecting);
            if current {
                tracing::warn!(peer = %id, %reason, "connection attempts exhausted");
                self.close_locked(&mut inner, id, PeerState::Failed, reason, false, &mut effects);
            }
        }
        self.deliver(effects);
    }

    /// Register an accepted connection.
    pub(crate) fn accept_incoming(
        &self,
        conn: Arc<dyn Connection>,
        address: String,
    ) -> Option<(PeerId, u64, Arc<LinkSignals>)> {
        let mut inner = self.inner.lock();
        if inner.shutting_down {
            conn.shutdown();
            return None;
        }
        let id = inner.allocate_id();
        let (peer, signals) = Peer::inbound(id, conn, address.clone());
        let generation = peer.generation();
        inner.peers.insert(id, peer);
        tracing::debug!(peer = %id, %address, "accepted connection");
        Some((id, generation, signals))
    }

    pub(crate) fn link_status(&self, id: PeerId, generation: u64) -> Option<LinkStatus> {
        let inner = self.inner.lock();
        let p = inner.peers.get(&id)?;
        if !p.is_current(generation) {
            return None;
        }
        Some(LinkStatus {
            wants_write: p.wants_write(),
            handshake_pending: p.state() == PeerState::Connecting || p.name().is_none(),
        })
    }

    pub(crate) fn on_handshake_timeout(&self, id: PeerId, generation: u64) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock();
            let pending = inner.peers.get(&id).is_some_and(|p| {
                p.is_current(generation)
                    && (p.state() == PeerState::Connecting || p.name().is_none())
            });
            if pending {
                self.close_locked(
                    &mut inner,
                    id,
                    PeerState::Failed,
                    "identify handshake timed out".to_string(),
                    false,
                    &mut effects,
                );
            }
        }
        self.deliver(effects);
    }

    /// The driver lost the connection outside a read or write pass.
    pub(crate) fn on_link_error(&self, id: PeerId, generation: u64, reason: String) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.peers.get(&id).is_some_and(|p| p.is_current(generation)) {
                self.close_locked(&mut inner, id, PeerState::Failed, reason, false, &mut effects);
            }
        }
        self.deliver(effects);
    }

    /// Read and dispatch frames until the socket would block.
    pub(crate) fn on_readable(&self, id: PeerId, generation: u64) -> ReadOutcome {
        let mut effects = Effects::default();
        let outcome = {
            let mut inner = self.inner.lock();
            loop {
                let Some(p) = inner.peers.get_mut(&id) else {
                    break ReadOutcome::Closed;
                };
                if !p.is_current(generation) {
                    break ReadOutcome::Closed;
                }
                match p.read_step(&self.pool, self.config.max_payload_size) {
                    Ok(RecvProgress::Complete(frame)) => {
                        self.handle_frame(&mut inner, id, frame, &mut effects);
                    }
                    Ok(RecvProgress::Pending) => break ReadOutcome::Continue,
                    Ok(RecvProgress::Stalled) => {
                        tracing::debug!(peer = %id, "payload pool exhausted, read stalled");
                        break ReadOutcome::Stalled;
                    }
                    Err(error) => {
                        let state = match error {
                            MessageError::Eof => PeerState::Closed,
                            _ => PeerState::Failed,
                        };
                        if matches!(error, MessageError::Wire(_)) {
                            tracing::warn!(peer = %id, %error, "malformed frame, closing connection");
                        } else {
                            tracing::debug!(peer = %id, %error, "connection ended");
                        }
                        self.close_locked(&mut inner, id, state, error.to_string(), false, &mut effects);
                        break ReadOutcome::Closed;
                    }
                }
            }
        };
        self.deliver(effects);
        outcome
    }

    /// Write queued frames until the socket would block. `false` once the
    /// connection is gone.
    pub(crate) fn on_writable(&self, id: PeerId, generation: u64) -> bool {
        let mut effects = Effects::default();
        let alive = {
            let mut inner = self.inner.lock();
            match inner.peers.get_mut(&id) {
                Some(p) if p.is_current(generation) => {
                    let mut done = Vec::new();
                    let result = p.write_step(&mut done);
                    for msg in done {
                        let (header, payload, callback) = msg.into_parts();
                        tracing::trace!(peer = %header.dst, tag = header.tag, kind = ?header.kind, "frame written");
                        if let Some(callback) = callback {
                            effects.deliveries.push(sent_delivery(
                                callback,
                                header,
                                payload,
                                Ok(header.size as usize),
                            ));
                        }
                    }
                    match result {
                        Ok(()) => true,
                        Err(error) => {
                            tracing::debug!(peer = %id, %error, "write failed");
                            self.close_locked(
                                &mut inner,
                                id,
                                PeerState::Failed,
                                error.to_string(),
                                false,
                                &mut effects,
                            );
                            false
                        }
                    }
                }
                _ => false,
            }
        };
        self.deliver(effects);
        alive
    }

    // =========================================================================
    // Frame handling
    // =========================================================================

    fn handle_frame(&self, inner: &mut Inner, id: PeerId, frame: ReceivedFrame, effects: &mut Effects) {
        match frame.header.kind {
            MessageKind::Ping => {
                tracing::trace!(peer = %frame.header.src, "ping received");
            }
            MessageKind::Identify => self.handle_identify(inner, id, frame.header.src, effects),
            MessageKind::Data => {
                if frame.header.dst != self.local() {
                    tracing::warn!(
                        src = %frame.header.src,
                        dst = %frame.header.dst,
                        "dropping frame addressed to another process"
                    );
                    return;
                }
                let mut deliveries = Vec::new();
                inner.engine.arrive(frame, &mut deliveries);
                inner.collect(effects, deliveries);
            }
        }
    }

    fn handle_identify(&self, inner: &mut Inner, id: PeerId, remote: ProcessName, effects: &mut Effects) {
        let local = self.local();
        let Some(p) = inner.peers.get_mut(&id) else {
            return;
        };
        match (p.state(), p.name()) {
            (PeerState::Connecting, expected) => {
                if expected != Some(remote) {
                    tracing::warn!(peer = %id, ?expected, %remote, "peer identified under another name");
                    if let Some(old) = expected {
                        if inner.names.get(&old) == Some(&id) {
                            inner.names.remove(&old);
                        }
                    }
                    inner.names.entry(remote).or_insert(id);
                }
                let Some(p) = inner.peers.get_mut(&id) else {
                    return;
                };
                p.set_name(remote);
                p.mark_connected();
                tracing::debug!(peer = %remote, "connected");
            }
            (PeerState::Connected, None) => {
                p.set_name(remote);
                p.reply_identify(control_frame(MessageKind::Identify, local, remote));
                self.adopt_inbound(inner, id, remote, effects);
            }
            _ => {
                tracing::debug!(peer = %id, %remote, "ignoring repeated identify");
            }
        }
    }

    /// Map `remote` to the freshly identified inbound peer `id`, unless an
    /// existing connection to it takes precedence.
    fn adopt_inbound(&self, inner: &mut Inner, id: PeerId, remote: ProcessName, effects: &mut Effects) {
        let Some(existing) = inner.names.get(&remote).copied() else {
            inner.names.insert(remote, id);
            tracing::debug!(peer = %remote, "inbound peer identified");
            return;
        };
        if existing == id {
            return;
        }
        let keep_existing = match inner.peers.get(&existing).map(Peer::state) {
            Some(PeerState::Connected) => true,
            // Simultaneous connect: the lower name's outbound connection wins.
            Some(PeerState::Connecting) => self.local() < remote,
            _ => false,
        };
        if keep_existing {
            tracing::debug!(peer = %remote, "duplicate connection kept for receiving only");
            return;
        }
        let Some(mut old) = inner.peers.remove(&existing) else {
            return;
        };
        let sends = old.take_unstarted();
        for msg in old.close(PeerState::Closed, Some("superseded by inbound connection".to_string())) {
            fail_send(msg, OobError::ConnectionFailed { peer: remote }, effects);
        }
        if let Some(p) = inner.peers.get_mut(&id) {
            p.absorb(sends);
        }
        inner.names.insert(remote, id);
        tracing::debug!(peer = %remote, "inbound connection replaced pending outbound entry");
    }

    /// Tear a peer down, failing its queued sends and, if it is the mapped
    /// entry for its name, the receives bound to that name.
    fn close_locked(
        &self,
        inner: &mut Inner,
        id: PeerId,
        state: PeerState,
        reason: String,
        shutdown: bool,
        effects: &mut Effects,
    ) {
        let Some(p) = inner.peers.get_mut(&id) else {
            return;
        };
        let previous = p.state();
        let name = p.name();
        let direction = p.direction();
        let failed = p.close(state, Some(reason));
        let mapped = name.is_some_and(|n| inner.names.get(&n) == Some(&id));

        for msg in failed {
            let peer = name.unwrap_or(msg.header().dst);
            let error = if shutdown {
                OobError::Shutdown
            } else {
                OobError::ConnectionFailed { peer }
            };
            fail_send(msg, error, effects);
        }
        if let (Some(name), true) = (name, mapped) {
            let error = if shutdown {
                OobError::Shutdown
            } else {
                OobError::ConnectionFailed { peer: name }
            };
            let mut deliveries = Vec::new();
            inner.engine.fail_peer(name, error, &mut deliveries);
            inner.collect(effects, deliveries);
            if !shutdown {
                match previous {
                    PeerState::Connected => effects.exceptions.push((name, PeerException::Disconnected)),
                    PeerState::Connecting => effects.exceptions.push((name, PeerException::ConnectFailed)),
                    _ => {}
                }
            }
        }
        if !mapped && direction == Direction::Inbound {
            inner.peers.remove(&id);
        }
        if !previous.is_down() {
            tracing::debug!(peer = %id, ?name, ?state, "peer closed");
        }
    }

    // =========================================================================
    // Completion dispatch
    // =========================================================================

    /// Run collected callbacks and exception handlers.
    ///
    /// Completions for blocked callers are handed over at once, so a blocking
    /// call made from inside a callback is never stuck behind its own drain
    /// loop. Everything else is queued: the first caller becomes the drainer
    /// and runs items until the queue is empty, and completions produced
    /// meanwhile, by callbacks or other threads, are appended and picked up by
    /// the same loop.
    ///
    /// There is one queue per endpoint, so a callback that blocks for a long
    /// time delays the callbacks of every other peer until it returns.
    pub(crate) fn deliver(&self, effects: Effects) {
        if effects.is_empty() {
            return;
        }
        let (waiters, queued): (Vec<_>, Vec<_>) = effects
            .deliveries
            .into_iter()
            .partition(|delivery| delivery.callback.is_waiter());
        for delivery in waiters {
            self.complete(delivery);
        }
        if queued.is_empty() && effects.exceptions.is_empty() {
            return;
        }
        {
            let mut queue = self.dispatch.lock();
            queue
                .items
                .extend(queued.into_iter().map(DispatchItem::Completion));
            queue.items.extend(
                effects
                    .exceptions
                    .into_iter()
                    .map(|(name, kind)| DispatchItem::Exception(name, kind)),
            );
            if queue.drainer.is_some() {
                return;
            }
            queue.drainer = Some(thread::current().id());
        }
        loop {
            let item = {
                let mut queue = self.dispatch.lock();
                match queue.items.pop_front() {
                    Some(item) => item,
                    None => {
                        queue.drainer = None;
                        return;
                    }
                }
            };
            match item {
                DispatchItem::Completion(delivery) => self.complete(delivery),
                DispatchItem::Exception(name, kind) => {
                    let handlers = self.handlers.read().clone();
                    for handler in handlers {
                        handler(name, kind);
                    }
                }
            }
        }
    }

    fn complete(&self, delivery: Delivery) {
        let matched = delivery.matched;
        delivery.callback.invoke(delivery.completion);
        if matched {
            let mut inner = self.inner.lock();
            inner.in_flight = inner.in_flight.saturating_sub(1);
            if inner.in_flight == 0 {
                self.match_cond.notify_all();
            }
        }
    }
}

/// A zero-length control frame.
fn control_frame(kind: MessageKind, src: ProcessName, dst: ProcessName) -> SendMessage {
    let header = MessageHeader {
        kind,
        tag: 0,
        size: 0,
        checksum: wire::checksum(std::iter::empty::<&[u8]>()),
        src,
        dst,
    };
    SendMessage::new(header, Vec::new(), None)
}

fn sent_delivery(
    callback: SharedCallback,
    header: MessageHeader,
    payload: Vec<Bytes>,
    status: OobResult<usize>,
) -> Delivery {
    Delivery {
        callback,
        completion: Completion {
            status,
            peer: header.dst,
            tag: header.tag,
            buffers: Buffers::Sent(payload),
        },
        matched: false,
    }
}

fn fail_send(msg: SendMessage, error: OobError, effects: &mut Effects) {
    let (header, payload, callback) = msg.into_parts();
    if let Some(callback) = callback {
        effects
            .deliveries
            .push(sent_delivery(callback, header, payload, Err(error)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{share, WaitSlot};
    use crate::peer::PeerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const LOCAL: ProcessName = ProcessName::new(0, 1, 0);
    const REMOTE: ProcessName = ProcessName::new(0, 1, 1);

    fn registry(config: OobConfig) -> (Arc<Registry>, mpsc::UnboundedReceiver<ReactorCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Registry::new(config, tx).expect("registry")), rx)
    }

    fn data(payload: &'static [u8]) -> Vec<Bytes> {
        vec![Bytes::from_static(payload)]
    }

    #[test]
    fn test_nested_completions_are_drained_iteratively() {
        let (registry, _commands) = registry(OobConfig::new(LOCAL));
        let depth = Arc::new(AtomicUsize::new(0));
        let max_depth = Arc::new(AtomicUsize::new(0));
        let count = Arc::new(AtomicUsize::new(0));

        let callback = {
            let (registry, depth, max_depth, count) = (
                Arc::clone(&registry),
                Arc::clone(&depth),
                Arc::clone(&max_depth),
                Arc::clone(&count),
            );
            move |completion: Completion| {
                let now = depth.fetch_add(1, Ordering::SeqCst) + 1;
                max_depth.fetch_max(now, Ordering::SeqCst);
                assert_eq!(completion.status, Ok(1));
                if count.fetch_add(1, Ordering::SeqCst) < 9 {
                    registry
                        .send(MessageKind::Data, LOCAL, 1, data(b"x"), None)
                        .expect("send");
                }
                depth.fetch_sub(1, Ordering::SeqCst);
            }
        };
        registry
            .post_recv(LOCAL, 1, RecvFlags::PERSISTENT, vec![vec![0; 1]], share(Box::new(callback)))
            .expect("post");
        registry
            .send(MessageKind::Data, LOCAL, 1, data(b"x"), None)
            .expect("send");

        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(max_depth.load(Ordering::SeqCst), 1);
        assert_eq!(registry.stats().in_flight, 0);
        registry.shutdown();
    }

    #[test]
    fn test_cancel_inside_callback_does_not_wait_on_itself() {
        let (registry, _commands) = registry(OobConfig::new(LOCAL));
        let statuses = Arc::new(Mutex::new(Vec::new()));

        let callback = {
            let (registry, statuses) = (Arc::clone(&registry), Arc::clone(&statuses));
            move |completion: Completion| {
                let first = statuses.lock().is_empty();
                statuses.lock().push(completion.status.clone());
                if first {
                    registry.cancel_recv(LOCAL, 4).expect("cancel");
                }
            }
        };
        registry
            .post_recv(LOCAL, 4, RecvFlags::PERSISTENT, vec![vec![0; 8]], share(Box::new(callback)))
            .expect("post");
        registry
            .send(MessageKind::Data, LOCAL, 4, data(b"ping"), None)
            .expect("send");

        assert_eq!(
            statuses.lock().as_slice(),
            &[Ok(4), Err(OobError::Cancelled)]
        );
        assert_eq!(registry.stats().matching.posted, 0);
    }

    #[test]
    fn test_waiter_inside_callback_is_woken_directly() {
        let (registry, _commands) = registry(OobConfig::new(LOCAL));
        let results = Arc::new(Mutex::new(Vec::new()));

        let callback = {
            let (registry, results) = (Arc::clone(&registry), Arc::clone(&results));
            move |_: Completion| {
                let deadline = Instant::now() + Duration::from_secs(1);
                let sent = WaitSlot::new();
                registry
                    .send(MessageKind::Data, LOCAL, 2, data(b"yo"), Some(sent.target()))
                    .expect("send");
                let sent = sent.wait(Some(deadline)).map(|c| c.status);

                let received = WaitSlot::new();
                registry
                    .post_recv(LOCAL, 2, RecvFlags::empty(), vec![vec![0; 4]], received.target())
                    .expect("post");
                let received = received.wait(Some(deadline)).map(|c| c.buffers.to_vec());
                results.lock().push((sent, received));
            }
        };
        registry
            .post_recv(LOCAL, 1, RecvFlags::empty(), vec![vec![0; 4]], share(Box::new(callback)))
            .expect("post");
        registry
            .send(MessageKind::Data, LOCAL, 1, data(b"go"), None)
            .expect("send");

        assert_eq!(
            results.lock().as_slice(),
            &[(Some(Ok(2)), Some(b"yo".to_vec()))]
        );
        assert_eq!(registry.stats().in_flight, 0);
        registry.shutdown();
    }

    #[test]
    fn test_send_requests_connection_and_bounds_queue() {
        let peer = PeerConfig::new(
            2,
            Duration::from_secs(1),
            Duration::from_millis(10),
            Duration::from_millis(100),
            1,
        );
        let (registry, mut commands) = registry(OobConfig::new(LOCAL).with_peer_config(peer));

        assert_eq!(
            registry.send(MessageKind::Data, REMOTE, 1, data(b"a"), None),
            Err(OobError::Unreachable { peer: REMOTE })
        );
        registry.add_contact(REMOTE, "remote:1".to_string());
        registry
            .send(MessageKind::Data, REMOTE, 1, data(b"a"), None)
            .expect("send");
        registry
            .send(MessageKind::Data, REMOTE, 1, data(b"b"), None)
            .expect("send");
        assert_eq!(
            registry.send(MessageKind::Data, REMOTE, 1, data(b"c"), None),
            Err(OobError::OutOfResource)
        );

        match commands.try_recv() {
            Ok(ReactorCommand::Connect { address, .. }) => assert_eq!(address, "remote:1"),
            other => panic!("expected a connect command, got {other:?}"),
        }
        assert!(commands.try_recv().is_err());
        assert_eq!(registry.peer_state(REMOTE), Some(PeerState::Connecting));
        assert_eq!(registry.peers()[0].queued, 2);
    }

    #[test]
    fn test_shutdown_fails_queued_sends() {
        let (registry, mut commands) = registry(OobConfig::new(LOCAL));
        registry.add_contact(REMOTE, "remote:1".to_string());
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let callback = {
            let statuses = Arc::clone(&statuses);
            move |completion: Completion| statuses.lock().push(completion.status)
        };
        registry
            .send(MessageKind::Data, REMOTE, 1, data(b"a"), Some(share(Box::new(callback))))
            .expect("send");

        registry.shutdown();
        assert_eq!(statuses.lock().as_slice(), &[Err(OobError::Shutdown)]);
        assert_eq!(registry.close_peer(ProcessName::new(9, 9, 9)), Err(OobError::NotFound));
        assert!(matches!(commands.try_recv(), Ok(ReactorCommand::Connect { .. })));
        assert!(matches!(commands.try_recv(), Ok(ReactorCommand::Shutdown)));
    }
}
