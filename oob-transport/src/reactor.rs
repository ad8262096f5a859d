//! Connection driving.
//!
//! The reactor owns the listener and turns registry commands into tasks: one
//! connect task per outbound attempt and one link driver per established
//! connection. Drivers wait on socket readiness and call back into the
//! [`Registry`], which does all framing and matching under its lock.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use oob_core::{Connection, Listener, NetworkProvider};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::OobConfig;
use crate::error::{OobError, OobResult};
use crate::peer::core::{LinkSignals, ReconnectState};
use crate::peer::PeerId;
use crate::registry::{ReactorCommand, ReadOutcome, Registry};

/// Delay before retrying after a failed accept.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Event loop of one OOB endpoint.
pub(crate) struct Reactor {
    registry: Arc<Registry>,
    network: Arc<dyn NetworkProvider>,
    commands: mpsc::UnboundedReceiver<ReactorCommand>,
    listener: Option<Box<dyn Listener>>,
}

impl Reactor {
    /// Build the registry and bind the listener, if one is configured.
    ///
    /// Returns the registry, the reactor to run, and the bound address.
    pub(crate) async fn setup(
        config: OobConfig,
        network: Arc<dyn NetworkProvider>,
    ) -> OobResult<(Arc<Registry>, Self, Option<String>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let listen = config.listen_address.clone();
        let registry = Arc::new(Registry::new(config, tx)?);
        let (listener, local_addr) = match listen {
            Some(address) => {
                let listener = network
                    .bind(&address)
                    .await
                    .map_err(|e| OobError::Io(format!("cannot listen on {address}: {e}")))?;
                let local_addr = listener
                    .local_addr()
                    .map_err(|e| OobError::Io(e.to_string()))?;
                tracing::info!(local = %registry.local(), address = %local_addr, "oob listening");
                (Some(listener), Some(local_addr))
            }
            None => (None, None),
        };
        let reactor = Self {
            registry: Arc::clone(&registry),
            network,
            commands: rx,
            listener,
        };
        Ok((registry, reactor, local_addr))
    }

    /// Run until the registry shuts down.
    pub(crate) async fn run(mut self) {
        let accept = self.listener.take().map(|listener| {
            tokio::spawn(accept_loop(Arc::clone(&self.registry), listener))
        });
        while let Some(command) = self.commands.recv().await {
            match command {
                ReactorCommand::Connect {
                    peer,
                    generation,
                    address,
                } => {
                    let span = tracing::debug_span!("oob_connect", peer = %peer, generation);
                    tokio::spawn(
                        connect_task(
                            Arc::clone(&self.registry),
                            Arc::clone(&self.network),
                            peer,
                            generation,
                            address,
                        )
                        .instrument(span),
                    );
                }
                ReactorCommand::Shutdown => break,
            }
        }
        if let Some(accept) = accept {
            accept.abort();
        }
        tracing::debug!(local = %self.registry.local(), "reactor stopped");
    }
}

async fn accept_loop(registry: Arc<Registry>, listener: Box<dyn Listener>) {
    loop {
        match listener.accept().await {
            Ok((conn, address)) => {
                if let Some((id, generation, signals)) =
                    registry.accept_incoming(Arc::clone(&conn), address)
                {
                    let span = tracing::debug_span!("oob_link", peer = %id, generation);
                    tokio::spawn(
                        drive_link(Arc::clone(&registry), id, generation, conn, signals)
                            .instrument(span),
                    );
                }
            }
            Err(e) => {
                if registry.is_shutting_down() {
                    return;
                }
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Dial `address` with backoff until it connects, the attempt goes stale, or
/// the attempt budget runs out.
async fn connect_task(
    registry: Arc<Registry>,
    network: Arc<dyn NetworkProvider>,
    id: PeerId,
    generation: u64,
    address: String,
) {
    let config = registry.config().peer.clone();
    let mut backoff = ReconnectState::new(&config);
    loop {
        if !registry.still_connecting(id, generation) {
            return;
        }
        let error = match tokio::time::timeout(config.connection_timeout, network.connect(&address))
            .await
        {
            Ok(Ok(conn)) => {
                if let Some(signals) = registry.on_connected(id, generation, Arc::clone(&conn)) {
                    drive_link(registry, id, generation, conn, signals).await;
                }
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "connect timed out".to_string(),
        };
        let delay = backoff.record_failure(&config);
        if backoff.exhausted(&config) {
            registry.on_connect_failed(id, generation, format!("{address}: {error}"));
            return;
        }
        tracing::debug!(peer = %id, %address, %error, ?delay, "connect failed, retrying");
        registry.note_connect_failure(id, generation, delay);
        tokio::time::sleep(delay).await;
    }
}

/// Pump one connection until it closes or is superseded.
async fn drive_link(
    registry: Arc<Registry>,
    id: PeerId,
    generation: u64,
    conn: Arc<dyn Connection>,
    signals: Arc<LinkSignals>,
) {
    let handshake_deadline =
        tokio::time::Instant::now() + registry.config().peer.handshake_timeout;
    let mut releases = registry.pool().subscribe_releases();
    let mut stalled = false;
    tracing::debug!(peer = %id, generation, remote = %conn.peer_addr(), "link up");

    loop {
        if signals.is_closed() {
            break;
        }
        let Some(status) = registry.link_status(id, generation) else {
            break;
        };
        tokio::select! {
            _ = signals.closed() => break,
            ready = conn.readable(), if !stalled => {
                if let Err(e) = ready {
                    registry.on_link_error(id, generation, e.to_string());
                    break;
                }
                // Mark the current release count seen so a release during the
                // read below wakes the stalled branch.
                releases.borrow_and_update();
                match registry.on_readable(id, generation) {
                    ReadOutcome::Continue => {}
                    ReadOutcome::Stalled => stalled = true,
                    ReadOutcome::Closed => break,
                }
            }
            changed = releases.changed(), if stalled => {
                if changed.is_err() {
                    registry.on_link_error(id, generation, "payload pool closed".to_string());
                    break;
                }
                stalled = false;
            }
            ready = conn.writable(), if status.wants_write => {
                if let Err(e) = ready {
                    registry.on_link_error(id, generation, e.to_string());
                    break;
                }
                if !registry.on_writable(id, generation) {
                    break;
                }
            }
            _ = signals.woken() => {}
            _ = tokio::time::sleep_until(handshake_deadline), if status.handshake_pending => {
                tracing::warn!(peer = %id, "identify handshake timed out");
                registry.on_handshake_timeout(id, generation);
                break;
            }
        }
    }
    conn.shutdown();
    tracing::debug!(peer = %id, generation, "link down");
}

/// A dedicated OS thread running the reactor on its own single-threaded
/// runtime, for callers that use the blocking API without a Tokio runtime.
#[derive(Debug)]
pub struct ProgressThread {
    handle: Option<thread::JoinHandle<()>>,
}

impl ProgressThread {
    /// Start the reactor for `config` on a new thread.
    pub(crate) fn spawn(
        config: OobConfig,
        network: Arc<dyn NetworkProvider>,
    ) -> OobResult<(Arc<Registry>, Option<String>, Self)> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| OobError::Io(e.to_string()))?;
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
        let handle = thread::Builder::new()
            .name("oob-progress".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    match Reactor::setup(config, network).await {
                        Ok((registry, reactor, local_addr)) => {
                            let _ = ready_tx.send(Ok((registry, local_addr)));
                            reactor.run().await;
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                        }
                    }
                });
            })
            .map_err(|e| OobError::Io(e.to_string()))?;
        let (registry, local_addr) = ready_rx
            .recv()
            .map_err(|_| OobError::Io("progress thread exited during startup".to_string()))??;
        Ok((
            registry,
            local_addr,
            Self {
                handle: Some(handle),
            },
        ))
    }

    /// Wait for the thread to exit. It exits once the endpoint is shut down.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("oob progress thread panicked");
            }
        }
    }
}
