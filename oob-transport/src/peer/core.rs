//! Peer connection state machine.
//!
//! A [`Peer`] owns one connection slot, its send queue and the receive cursor
//! of the frame being assembled. It performs no locking and never runs
//! callbacks: the registry drives it under its lock and turns what it returns
//! (finished or failed sends, received frames) into completions.
//!
//! ```text
//! Closed/Failed --initiate_connect--> Connecting --identify--> Connected
//! (accept) -------------------------------------------------> Connected
//! Connected --EOF / close--> Closed      Connected --I/O error--> Failed
//! Connecting --timeout / refused / handshake timeout--> Failed
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oob_core::{Connection, FreeList, PayloadBuf, ProcessName};
use rand::Rng;
use tokio::sync::Notify;

use super::config::PeerConfig;
use super::metrics::PeerMetrics;
use crate::message::{MessageError, Progress, RecvMessage, RecvProgress, SendMessage};

/// Registry-local identifier of a peer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub(crate) u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// No connection. Initial state, and the state after an orderly close.
    Closed,
    /// Connecting or waiting for the remote identify frame.
    Connecting,
    /// Identified and exchanging frames.
    Connected,
    /// The last connection attempt or connection ended in an error.
    Failed,
}

impl PeerState {
    /// Whether the peer has no connection.
    pub fn is_down(&self) -> bool {
        matches!(self, PeerState::Closed | PeerState::Failed)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We connected to the peer.
    Outbound,
    /// The peer connected to us.
    Inbound,
}

/// Signals shared between a peer and the task driving its connection.
#[derive(Debug, Default)]
pub(crate) struct LinkSignals {
    wake: Notify,
    closed: AtomicBool,
    close_notify: Notify,
}

impl LinkSignals {
    /// Ask the driver to re-check for writable work.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_one();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) async fn closed(&self) {
        while !self.is_closed() {
            self.close_notify.notified().await;
        }
    }
}

struct Link {
    conn: Arc<dyn Connection>,
    signals: Arc<LinkSignals>,
}

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone)]
pub(crate) struct ReconnectState {
    /// Current backoff delay
    current_delay: Duration,

    /// Number of consecutive failures
    failure_count: u32,
}

impl ReconnectState {
    pub(crate) fn new(config: &PeerConfig) -> Self {
        Self {
            current_delay: config.initial_reconnect_delay,
            failure_count: 0,
        }
    }

    /// Record a failure and return the delay before the next attempt, with up
    /// to 20% jitter.
    pub(crate) fn record_failure(&mut self, config: &PeerConfig) -> Duration {
        self.failure_count += 1;
        let delay = self.current_delay;
        self.current_delay = std::cmp::min(self.current_delay * 2, config.max_reconnect_delay);
        let jitter_ms = delay.as_millis() as u64 / 5;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Whether another attempt is allowed.
    pub(crate) fn exhausted(&self, config: &PeerConfig) -> bool {
        self.failure_count >= config.max_connection_attempts
    }
}

/// One remote process as seen by the registry.
pub struct Peer {
    id: PeerId,
    name: Option<ProcessName>,
    address: Option<String>,
    direction: Direction,
    state: PeerState,
    generation: u64,
    link: Option<Link>,
    handshake: Option<SendMessage>,
    current: Option<SendMessage>,
    queue: VecDeque<SendMessage>,
    recv: RecvMessage,
    replied_identify: bool,
    metrics: PeerMetrics,
    last_error: Option<String>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl Peer {
    /// A peer we will connect to at `address`.
    pub(crate) fn outbound(id: PeerId, name: ProcessName, address: String) -> Self {
        Self::blank(id, Some(name), Some(address), Direction::Outbound)
    }

    /// A peer that connected to us; its name is learned from its identify frame.
    pub(crate) fn inbound(
        id: PeerId,
        conn: Arc<dyn Connection>,
        address: String,
    ) -> (Self, Arc<LinkSignals>) {
        let mut peer = Self::blank(id, None, Some(address), Direction::Inbound);
        let signals = Arc::new(LinkSignals::default());
        peer.link = Some(Link {
            conn,
            signals: Arc::clone(&signals),
        });
        peer.generation = 1;
        peer.state = PeerState::Connected;
        peer.metrics.record_connection_success();
        (peer, signals)
    }

    fn blank(
        id: PeerId,
        name: Option<ProcessName>,
        address: Option<String>,
        direction: Direction,
    ) -> Self {
        Self {
            id,
            name,
            address,
            direction,
            state: PeerState::Closed,
            generation: 0,
            link: None,
            handshake: None,
            current: None,
            queue: VecDeque::new(),
            recv: RecvMessage::new(),
            replied_identify: false,
            metrics: PeerMetrics::new(),
            last_error: None,
        }
    }

    /// Registry-local id.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The peer's name, once known.
    pub fn name(&self) -> Option<ProcessName> {
        self.name
    }

    /// Address used to reach the peer.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Which side opened the connection.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current state.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Connection generation; bumped whenever the connection slot changes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Peer metrics.
    pub fn metrics(&self) -> &PeerMetrics {
        &self.metrics
    }

    /// Reason for the last failure, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Number of sends waiting, including one partially written.
    pub fn queued(&self) -> usize {
        self.queue.len() + usize::from(self.current.is_some())
    }

    pub(crate) fn metrics_mut(&mut self) -> &mut PeerMetrics {
        &mut self.metrics
    }

    pub(crate) fn set_name(&mut self, name: ProcessName) {
        self.name = Some(name);
    }

    pub(crate) fn set_address(&mut self, address: String) {
        self.address = Some(address);
    }

    /// Whether `generation` still refers to this peer's live connection slot.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && !self.state.is_down()
    }

    /// Start connecting if the peer is down and an address is known.
    ///
    /// Returns the new generation and the address to dial.
    pub(crate) fn initiate_connect(&mut self) -> Option<(u64, String)> {
        if !self.state.is_down() {
            return None;
        }
        let address = self.address.clone()?;
        self.generation += 1;
        self.state = PeerState::Connecting;
        self.replied_identify = false;
        tracing::debug!(peer = %self.id, %address, generation = self.generation, "connecting");
        Some((self.generation, address))
    }

    /// Install a freshly connected socket and the identify frame to send first.
    pub(crate) fn attach(
        &mut self,
        generation: u64,
        conn: Arc<dyn Connection>,
        identify: SendMessage,
    ) -> Option<Arc<LinkSignals>> {
        if self.generation != generation || self.state != PeerState::Connecting {
            return None;
        }
        let signals = Arc::new(LinkSignals::default());
        self.link = Some(Link {
            conn,
            signals: Arc::clone(&signals),
        });
        self.handshake = Some(identify);
        Some(signals)
    }

    /// The remote identify frame arrived on an outbound connection.
    pub(crate) fn mark_connected(&mut self) {
        if self.state == PeerState::Connecting {
            self.state = PeerState::Connected;
            self.last_error = None;
            self.metrics.record_connection_success();
            self.wake();
        }
    }

    /// Queue our identify reply on an inbound connection. Only the first call
    /// has an effect.
    pub(crate) fn reply_identify(&mut self, identify: SendMessage) {
        if self.direction == Direction::Inbound && !self.replied_identify {
            self.replied_identify = true;
            self.handshake = Some(identify);
            self.wake();
        }
    }

    /// Append a send, or hand it back if the queue is full.
    pub(crate) fn enqueue(&mut self, msg: SendMessage, max: usize) -> Result<(), SendMessage> {
        if self.queued() >= max {
            return Err(msg);
        }
        self.queue.push_back(msg);
        self.metrics.current_queue_size = self.queue.len();
        self.wake();
        Ok(())
    }

    /// Move queued sends that have not started into this peer.
    pub(crate) fn absorb(&mut self, sends: VecDeque<SendMessage>) {
        self.queue.extend(sends);
        self.metrics.current_queue_size = self.queue.len();
        self.wake();
    }

    /// Take every queued send that has not touched a socket.
    pub(crate) fn take_unstarted(&mut self) -> VecDeque<SendMessage> {
        let mut sends = std::mem::take(&mut self.queue);
        if let Some(current) = self.current.take() {
            if current.started() {
                self.current = Some(current);
            } else {
                sends.push_front(current);
            }
        }
        self.metrics.current_queue_size = 0;
        sends
    }

    /// Whether the driver should wait for writability.
    pub(crate) fn wants_write(&self) -> bool {
        self.link.is_some()
            && (self.handshake.is_some()
                || (self.state == PeerState::Connected
                    && (self.current.is_some() || !self.queue.is_empty())))
    }

    /// Write queued frames until the socket would block.
    ///
    /// Frames that finished are appended to `done`. On error the frame being
    /// written stays queued so it fails with the rest when the peer closes.
    pub(crate) fn write_step(&mut self, done: &mut Vec<SendMessage>) -> Result<(), MessageError> {
        let Some(conn) = self.link.as_ref().map(|link| Arc::clone(&link.conn)) else {
            return Ok(());
        };
        loop {
            if self.current.is_none() {
                self.current = match self.handshake.take() {
                    Some(identify) => Some(identify),
                    None if self.state == PeerState::Connected => self.queue.pop_front(),
                    None => None,
                };
            }
            let Some(msg) = self.current.as_mut() else {
                return Ok(());
            };
            match msg.send_handler(conn.as_ref())? {
                Progress::Complete => {
                    if let Some(msg) = self.current.take() {
                        self.metrics.record_message_sent(msg.header().size as usize);
                        done.push(msg);
                    }
                    self.metrics.current_queue_size = self.queue.len();
                }
                Progress::Pending => return Ok(()),
            }
        }
    }

    /// Read at most one frame.
    pub(crate) fn read_step(
        &mut self,
        pool: &FreeList<PayloadBuf>,
        max_payload: usize,
    ) -> Result<RecvProgress, MessageError> {
        let Some(link) = self.link.as_ref() else {
            return Ok(RecvProgress::Pending);
        };
        let progress = self.recv.recv_handler(link.conn.as_ref(), pool, max_payload)?;
        if let RecvProgress::Complete(frame) = &progress {
            self.metrics
                .record_message_received(frame.header.size as usize);
        }
        Ok(progress)
    }

    /// Tear the connection down and move to `state`.
    ///
    /// Returns every send that had not completed. Idempotent: closing a peer
    /// that is already down returns its queued sends and changes nothing else.
    pub(crate) fn close(&mut self, state: PeerState, reason: Option<String>) -> Vec<SendMessage> {
        debug_assert!(state.is_down());
        if let Some(link) = self.link.take() {
            link.signals.close();
            link.conn.shutdown();
        }
        if !self.state.is_down() {
            self.state = state;
            self.generation += 1;
        }
        if reason.is_some() {
            self.last_error = reason;
        }
        self.handshake = None;
        self.recv.reset();
        let mut failed: Vec<SendMessage> = self.current.take().into_iter().collect();
        failed.extend(self.queue.drain(..));
        for _ in &failed {
            self.metrics.record_message_failed();
        }
        self.metrics.current_queue_size = 0;
        failed
    }

    fn wake(&self) {
        if let Some(link) = &self.link {
            link.signals.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{MessageHeader, MessageKind, MAX_PAYLOAD_SIZE};
    use bytes::Bytes;
    use oob_core::{payload_pool, FreeListConfig, MemoryNetwork, NetworkProvider};

    const LOCAL: ProcessName = ProcessName::new(0, 1, 0);
    const REMOTE: ProcessName = ProcessName::new(0, 1, 1);

    fn message(kind: MessageKind, payload: &'static [u8]) -> SendMessage {
        let segments = vec![Bytes::from_static(payload)];
        let header =
            MessageHeader::for_payload(kind, 1, LOCAL, REMOTE, &segments, MAX_PAYLOAD_SIZE)
                .expect("header");
        SendMessage::new(header, segments, None)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = PeerConfig::new(
            10,
            Duration::from_millis(100),
            Duration::from_millis(100),
            Duration::from_millis(300),
            3,
        );
        let mut state = ReconnectState::new(&config);
        let first = state.record_failure(&config);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(120));
        let second = state.record_failure(&config);
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(240));
        assert!(!state.exhausted(&config));
        let third = state.record_failure(&config);
        assert!(third <= Duration::from_millis(360));
        assert!(state.exhausted(&config));
    }

    #[test]
    fn test_connect_only_from_down_states() {
        let mut peer = Peer::outbound(PeerId(1), REMOTE, "remote".to_string());
        let (generation, address) = peer.initiate_connect().expect("connect");
        assert_eq!(address, "remote");
        assert_eq!(peer.state(), PeerState::Connecting);
        assert!(peer.initiate_connect().is_none());

        assert!(peer
            .close(PeerState::Failed, Some("refused".to_string()))
            .is_empty());
        assert_eq!(peer.state(), PeerState::Failed);
        assert!(!peer.is_current(generation));
        let (next, _) = peer.initiate_connect().expect("reconnect from failed");
        assert!(next > generation);
    }

    #[tokio::test]
    async fn test_handshake_gates_queued_sends() {
        let net = MemoryNetwork::new();
        let listener = net.bind("remote").await.expect("bind");
        let conn = net.connect("remote").await.expect("connect");
        let (server, _) = listener.accept().await.expect("accept");
        let pool = payload_pool(FreeListConfig::new(64, 2, 2, 0)).expect("pool");

        let mut peer = Peer::outbound(PeerId(1), REMOTE, "remote".to_string());
        peer.enqueue(message(MessageKind::Data, b"queued"), 10)
            .expect("queue");
        let (generation, _) = peer.initiate_connect().expect("connect");
        assert!(!peer.wants_write());
        peer.attach(generation, conn, message(MessageKind::Identify, b""))
            .expect("attach");

        let mut done = Vec::new();
        peer.write_step(&mut done).expect("write");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].header().kind, MessageKind::Identify);
        assert!(!peer.wants_write());

        peer.mark_connected();
        assert!(peer.wants_write());
        peer.write_step(&mut done).expect("write");
        assert_eq!(done.len(), 2);

        let mut recv = RecvMessage::new();
        let mut kinds = Vec::new();
        while kinds.len() < 2 {
            server.readable().await.expect("readable");
            if let RecvProgress::Complete(frame) = recv
                .recv_handler(server.as_ref(), &pool, MAX_PAYLOAD_SIZE)
                .expect("recv")
            {
                kinds.push(frame.header.kind);
            }
        }
        assert_eq!(kinds, vec![MessageKind::Identify, MessageKind::Data]);
    }

    #[tokio::test]
    async fn test_close_returns_pending_sends_once() {
        let net = MemoryNetwork::new();
        let listener = net.bind("remote").await.expect("bind");
        let conn = net.connect("remote").await.expect("connect");
        let (_server, _) = listener.accept().await.expect("accept");

        let mut peer = Peer::outbound(PeerId(1), REMOTE, "remote".to_string());
        let (generation, _) = peer.initiate_connect().expect("connect");
        let signals = peer
            .attach(generation, conn, message(MessageKind::Identify, b""))
            .expect("attach");
        peer.enqueue(message(MessageKind::Data, b"a"), 10)
            .expect("queue");
        peer.enqueue(message(MessageKind::Data, b"b"), 10)
            .expect("queue");
        assert!(peer.enqueue(message(MessageKind::Data, b"c"), 2).is_err());

        let failed = peer.close(PeerState::Failed, Some("reset".to_string()));
        assert_eq!(failed.len(), 2);
        assert!(signals.is_closed());
        assert_eq!(peer.state(), PeerState::Failed);
        assert_eq!(peer.last_error(), Some("reset"));

        assert!(peer.close(PeerState::Closed, None).is_empty());
        assert_eq!(peer.state(), PeerState::Failed);
        assert_eq!(peer.metrics().messages_failed, 2);
    }
}
