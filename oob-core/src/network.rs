//! Network provider abstraction for real and in-memory networking.
//!
//! Connections expose readiness futures plus non-blocking `try_*` calls, so
//! the message handlers above them can run a partial transfer, get
//! `WouldBlock`, and resume later from exactly where they stopped.

use std::fmt;
use std::io::{self, IoSlice};
use std::net::Shutdown;
use std::sync::Arc;

use async_trait::async_trait;

/// A bidirectional byte stream driven by readiness.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Wait until the connection may be readable. Spurious wakeups are allowed.
    async fn readable(&self) -> io::Result<()>;

    /// Wait until the connection may be writable. Spurious wakeups are allowed.
    async fn writable(&self) -> io::Result<()>;

    /// Read without blocking. `Ok(0)` means end of stream.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Gather-write without blocking.
    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Address of the remote end.
    fn peer_addr(&self) -> String;

    /// Shut both directions down. Idempotent.
    fn shutdown(&self);
}

/// Provider trait for creating connections and listeners.
#[async_trait]
pub trait NetworkProvider: Send + Sync + fmt::Debug {
    /// Create a listener bound to the given address.
    async fn bind(&self, addr: &str) -> io::Result<Box<dyn Listener>>;

    /// Connect to a remote address.
    async fn connect(&self, addr: &str) -> io::Result<Arc<dyn Connection>>;
}

/// A listener that accepts incoming connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept a single incoming connection and return it with the remote address.
    async fn accept(&self) -> io::Result<(Arc<dyn Connection>, String)>;

    /// Get the local address this listener is bound to.
    fn local_addr(&self) -> io::Result<String>;
}

/// Real Tokio networking implementation.
#[derive(Debug, Clone, Default)]
pub struct TokioNetworkProvider;

impl TokioNetworkProvider {
    /// Create a new Tokio network provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetworkProvider for TokioNetworkProvider {
    async fn bind(&self, addr: &str) -> io::Result<Box<dyn Listener>> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        Ok(Box::new(TokioListener { inner: listener }))
    }

    async fn connect(&self, addr: &str) -> io::Result<Arc<dyn Connection>> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        Ok(Arc::new(TokioConnection::new(stream, addr.to_string())?))
    }
}

/// Wrapper for Tokio TcpListener to implement [`Listener`].
#[derive(Debug)]
pub struct TokioListener {
    inner: tokio::net::TcpListener,
}

#[async_trait]
impl Listener for TokioListener {
    async fn accept(&self) -> io::Result<(Arc<dyn Connection>, String)> {
        let (stream, addr) = self.inner.accept().await?;
        let addr = addr.to_string();
        let conn = TokioConnection::new(stream, addr.clone())?;
        Ok((Arc::new(conn), addr))
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.inner.local_addr()?.to_string())
    }
}

/// A TCP stream with a duplicated handle kept for shutdown through `&self`.
pub struct TokioConnection {
    stream: tokio::net::TcpStream,
    control: std::net::TcpStream,
    peer: String,
}

impl TokioConnection {
    fn new(stream: tokio::net::TcpStream, peer: String) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let std_stream = stream.into_std()?;
        let control = std_stream.try_clone()?;
        let stream = tokio::net::TcpStream::from_std(std_stream)?;
        Ok(Self {
            stream,
            control,
            peer,
        })
    }
}

impl fmt::Debug for TokioConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioConnection")
            .field("peer", &self.peer)
            .finish()
    }
}

#[async_trait]
impl Connection for TokioConnection {
    async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    async fn writable(&self) -> io::Result<()> {
        self.stream.writable().await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream.try_write_vectored(bufs)
    }

    fn peer_addr(&self) -> String {
        self.peer.clone()
    }

    fn shutdown(&self) {
        // NotConnected once the remote side is already gone
        let _ = self.control.shutdown(Shutdown::Both);
    }
}
