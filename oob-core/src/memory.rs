//! In-process network for tests and single-process deployments.
//!
//! Each connection is a pair of bounded byte pipes. Transfers can be throttled
//! to a fixed number of bytes per `try_read`/`try_write_vectored` call, which
//! forces every partial-I/O path of the message handlers to run.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, IoSlice};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::network::{Connection, Listener, NetworkProvider};

const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Default)]
struct PipeState {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// One direction of a connection.
#[derive(Debug)]
struct Pipe {
    state: Mutex<PipeState>,
    data: Notify,
    space: Notify,
    capacity: usize,
}

impl Pipe {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PipeState::default()),
            data: Notify::new(),
            space: Notify::new(),
            capacity,
        })
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.data.notify_waiters();
        self.space.notify_waiters();
    }
}

/// One end of an in-memory connection.
pub struct MemoryConnection {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    max_transfer: usize,
    peer: String,
}

impl MemoryConnection {
    fn pair(
        capacity: usize,
        max_transfer: usize,
        client_addr: String,
        server_addr: String,
    ) -> (Self, Self) {
        let up = Pipe::new(capacity);
        let down = Pipe::new(capacity);
        let client = Self {
            rx: Arc::clone(&down),
            tx: Arc::clone(&up),
            max_transfer,
            peer: server_addr,
        };
        let server = Self {
            rx: up,
            tx: down,
            max_transfer,
            peer: client_addr,
        };
        (client, server)
    }
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("peer", &self.peer)
            .field("max_transfer", &self.max_transfer)
            .finish()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn readable(&self) -> io::Result<()> {
        loop {
            let notified = self.rx.data.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.rx.state.lock();
                if !state.bytes.is_empty() || state.closed {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    async fn writable(&self) -> io::Result<()> {
        loop {
            let notified = self.tx.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.tx.state.lock();
                if state.bytes.len() < self.tx.capacity || state.closed {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = {
            let mut state = self.rx.state.lock();
            if state.bytes.is_empty() {
                return if state.closed {
                    Ok(0)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                };
            }
            let n = buf.len().min(self.max_transfer).min(state.bytes.len());
            for (dst, src) in buf.iter_mut().zip(state.bytes.drain(..n)) {
                *dst = src;
            }
            n
        };
        self.rx.space.notify_waiters();
        Ok(n)
    }

    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let n = {
            let mut state = self.tx.state.lock();
            if state.closed {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            let room = self.tx.capacity.saturating_sub(state.bytes.len());
            if room == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let mut budget = room.min(self.max_transfer);
            let mut written = 0;
            for slice in bufs {
                if budget == 0 {
                    break;
                }
                let take = slice.len().min(budget);
                state.bytes.extend(&slice[..take]);
                budget -= take;
                written += take;
            }
            written
        };
        if n > 0 {
            self.tx.data.notify_waiters();
        }
        Ok(n)
    }

    fn peer_addr(&self) -> String {
        self.peer.clone()
    }

    fn shutdown(&self) {
        self.rx.close();
        self.tx.close();
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// An in-process network: listeners are registered by address string.
#[derive(Clone)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<MemoryConnection>>>>,
    next_client: Arc<AtomicU64>,
    capacity: usize,
    max_transfer: usize,
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("listeners", &self.listeners.lock().len())
            .field("capacity", &self.capacity)
            .field("max_transfer", &self.max_transfer)
            .finish()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Create an empty network with unthrottled transfers.
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_client: Arc::new(AtomicU64::new(1)),
            capacity: DEFAULT_PIPE_CAPACITY,
            max_transfer: usize::MAX,
        }
    }

    /// Limit every read and write call to at most `bytes` bytes.
    pub fn with_max_transfer(mut self, bytes: usize) -> Self {
        self.max_transfer = bytes.max(1);
        self
    }

    /// Set the number of bytes buffered per direction before writes block.
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = bytes.max(1);
        self
    }
}

#[async_trait]
impl NetworkProvider for MemoryNetwork {
    async fn bind(&self, addr: &str) -> io::Result<Box<dyn Listener>> {
        let mut listeners = self.listeners.lock();
        if listeners.get(addr).is_some_and(|tx| !tx.is_closed()) {
            return Err(io::ErrorKind::AddrInUse.into());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(addr.to_string(), tx);
        Ok(Box::new(MemoryListener {
            addr: addr.to_string(),
            incoming: tokio::sync::Mutex::new(rx),
            listeners: Arc::clone(&self.listeners),
        }))
    }

    async fn connect(&self, addr: &str) -> io::Result<Arc<dyn Connection>> {
        let client_addr = format!(
            "mem-client-{}",
            self.next_client.fetch_add(1, Ordering::Relaxed)
        );
        let (client, server) =
            MemoryConnection::pair(self.capacity, self.max_transfer, client_addr, addr.to_string());
        let listeners = self.listeners.lock();
        let tx = listeners
            .get(addr)
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        tx.send(server)
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(Arc::new(client))
    }
}

/// Listener half of [`MemoryNetwork`]. Unregisters its address on drop.
pub struct MemoryListener {
    addr: String,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryConnection>>,
    listeners: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<MemoryConnection>>>>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> io::Result<(Arc<dyn Connection>, String)> {
        let conn = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let peer = conn.peer_addr();
        Ok((Arc::new(conn), peer))
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.addr.clone())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.listeners.lock().remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_exact(conn: &dyn Connection, buf: &mut [u8]) -> usize {
        let mut filled = 0;
        let mut calls = 0;
        while filled < buf.len() {
            conn.readable().await.expect("readable");
            match conn.try_read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    calls += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("read failed: {e}"),
            }
        }
        calls
    }

    #[tokio::test]
    async fn test_connect_refused_without_listener() {
        let net = MemoryNetwork::new();
        let err = net.connect("nowhere").await.expect_err("no listener");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_throttled_transfer() {
        let net = MemoryNetwork::new().with_max_transfer(1);
        let listener = net.bind("node-a").await.expect("bind");
        let client = net.connect("node-a").await.expect("connect");
        let (server, peer) = listener.accept().await.expect("accept");
        assert!(peer.starts_with("mem-client-"));

        let written = client
            .try_write_vectored(&[IoSlice::new(b"abc")])
            .expect("write");
        assert_eq!(written, 1);
        client
            .try_write_vectored(&[IoSlice::new(b"bc")])
            .expect("write");
        client.try_write_vectored(&[IoSlice::new(b"c")]).expect("write");

        let mut buf = [0u8; 3];
        assert_eq!(read_exact(server.as_ref(), &mut buf).await, 3);
        assert_eq!(&buf, b"abc");
    }

    #[tokio::test]
    async fn test_full_pipe_would_block_then_drains() {
        let net = MemoryNetwork::new().with_capacity(4);
        let listener = net.bind("node-b").await.expect("bind");
        let client = net.connect("node-b").await.expect("connect");
        let (server, _) = listener.accept().await.expect("accept");

        let n = client
            .try_write_vectored(&[IoSlice::new(b"012345")])
            .expect("write");
        assert_eq!(n, 4);
        let err = client
            .try_write_vectored(&[IoSlice::new(b"45")])
            .expect_err("full");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let mut buf = [0u8; 2];
        read_exact(server.as_ref(), &mut buf).await;
        client.writable().await.expect("writable");
        assert_eq!(
            client
                .try_write_vectored(&[IoSlice::new(b"45")])
                .expect("write"),
            2
        );
    }

    #[tokio::test]
    async fn test_drop_signals_eof() {
        let net = MemoryNetwork::new();
        let listener = net.bind("node-c").await.expect("bind");
        let client = net.connect("node-c").await.expect("connect");
        let (server, _) = listener.accept().await.expect("accept");
        drop(client);

        server.readable().await.expect("readable");
        let mut buf = [0u8; 1];
        assert_eq!(server.try_read(&mut buf).expect("eof"), 0);
        let err = server
            .try_write_vectored(&[IoSlice::new(b"x")])
            .expect_err("closed");
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
