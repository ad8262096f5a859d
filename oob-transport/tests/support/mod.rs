//! Shared helpers for the end-to-end tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use oob_transport::{Completion, MemoryNetwork, Oob, OobConfig, PeerConfig, ProcessName};
use tokio::sync::mpsc;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn name(vpid: u32) -> ProcessName {
    ProcessName::new(0, 1, vpid)
}

pub fn address(vpid: u32) -> String {
    format!("oob-{vpid}")
}

pub fn config(vpid: u32) -> OobConfig {
    OobConfig::new(name(vpid))
        .with_listen_address(address(vpid))
        .with_peer_config(PeerConfig::local_network())
}

/// Start a listening endpoint for `vpid` on `net`.
pub async fn endpoint(net: &MemoryNetwork, vpid: u32) -> Oob {
    Oob::start(config(vpid), Arc::new(net.clone()))
        .await
        .expect("start endpoint")
}

/// Make every endpoint able to reach every other one.
pub fn introduce(endpoints: &[&Oob]) {
    for a in endpoints {
        for b in endpoints {
            if a.local_name() != b.local_name() {
                if let Some(addr) = b.local_addr() {
                    a.add_contact(b.local_name(), addr);
                }
            }
        }
    }
}

/// A callback forwarding completions into a channel.
pub fn sink() -> (
    impl FnMut(Completion) + Send + 'static,
    mpsc::UnboundedReceiver<Completion>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |c: Completion| {
            let _ = tx.send(c);
        },
        rx,
    )
}

/// Next completion, or panic after [`WAIT`].
pub async fn next(rx: &mut mpsc::UnboundedReceiver<Completion>) -> Completion {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a completion")
        .expect("completion channel closed")
}

/// Assert that no completion arrives for a short while.
pub async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Completion>) {
    let got = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(got.is_err(), "unexpected completion: {got:?}");
}

/// Poll `cond` until it holds, or panic after [`WAIT`].
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Payload with a recognizable pattern.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
