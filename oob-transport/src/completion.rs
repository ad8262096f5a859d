//! Completion records handed to callbacks.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use oob_core::{PooledBuf, ProcessName, Tag};
use parking_lot::{Condvar, Mutex};

use crate::error::OobResult;

/// Buffers returned to the caller with a completion.
pub enum Buffers {
    /// Nothing to hand back (cancelled, failed or zero-length allocation).
    None,
    /// The caller's receive buffers, each truncated to the bytes copied into it.
    Copied(Vec<Vec<u8>>),
    /// A pooled payload buffer handed over by an `ALLOCATE_BUFFER` receive.
    /// Dropping it returns the buffer to the pool.
    Pooled(PooledBuf),
    /// The payload segments of a finished send.
    Sent(Vec<Bytes>),
}

impl Buffers {
    /// Concatenate whatever bytes the buffers hold.
    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            Buffers::None => Vec::new(),
            Buffers::Copied(bufs) => bufs.concat(),
            Buffers::Pooled(buf) => buf.to_vec(),
            Buffers::Sent(segments) => segments.iter().flat_map(|s| s.iter().copied()).collect(),
        }
    }
}

impl fmt::Debug for Buffers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Buffers::None => write!(f, "None"),
            Buffers::Copied(bufs) => write!(f, "Copied({} buffers)", bufs.len()),
            Buffers::Pooled(buf) => write!(f, "Pooled({} bytes)", buf.len()),
            Buffers::Sent(segments) => write!(f, "Sent({} segments)", segments.len()),
        }
    }
}

/// Outcome of a send or receive, delivered exactly once per operation
/// (once per match for persistent receives).
#[derive(Debug)]
pub struct Completion {
    /// Bytes transferred, or the failure.
    pub status: OobResult<usize>,
    /// The remote peer.
    pub peer: ProcessName,
    /// Message tag.
    pub tag: Tag,
    /// Buffers handed back to the caller.
    pub buffers: Buffers,
}

/// Completion callback. User data travels in the closure's captures.
pub type Callback = Box<dyn FnMut(Completion) + Send>;

/// Where a completion goes.
#[derive(Clone)]
pub(crate) enum SharedCallback {
    /// A user callback, run by the registry's drain loop.
    Callback(Arc<Mutex<Callback>>),
    /// A blocked caller, woken directly and never queued behind callbacks.
    Waiter(Arc<WaitSlot>),
}

impl SharedCallback {
    pub(crate) fn is_waiter(&self) -> bool {
        matches!(self, SharedCallback::Waiter(_))
    }

    pub(crate) fn invoke(&self, completion: Completion) {
        match self {
            SharedCallback::Callback(callback) => {
                let mut callback = callback.lock();
                (*callback)(completion);
            }
            SharedCallback::Waiter(slot) => slot.fill(completion),
        }
    }
}

pub(crate) fn share(callback: Callback) -> SharedCallback {
    SharedCallback::Callback(Arc::new(Mutex::new(callback)))
}

/// One-shot rendezvous between the transport and a blocked caller.
pub(crate) struct WaitSlot {
    value: Mutex<Option<Completion>>,
    filled: Condvar,
}

impl WaitSlot {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(None),
            filled: Condvar::new(),
        })
    }

    /// A completion target that fills this slot.
    pub(crate) fn target(self: &Arc<Self>) -> SharedCallback {
        SharedCallback::Waiter(Arc::clone(self))
    }

    fn fill(&self, completion: Completion) {
        *self.value.lock() = Some(completion);
        self.filled.notify_all();
    }

    /// Wait for the completion, or until `deadline` passes.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> Option<Completion> {
        let mut value = self.value.lock();
        while value.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.filled.wait_until(&mut value, deadline).timed_out() {
                        break;
                    }
                }
                None => self.filled.wait(&mut value),
            }
        }
        value.take()
    }
}

/// Abnormal peer events reported to exception handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerException {
    /// An established connection was lost or closed.
    Disconnected,
    /// Connecting to the peer failed after all attempts.
    ConnectFailed,
}

/// Exception handler, invoked outside all transport locks.
pub type ExceptionHandler = Arc<dyn Fn(ProcessName, PeerException) + Send + Sync>;

/// A completion ready to run once the registry lock is released.
pub(crate) struct Delivery {
    pub(crate) callback: SharedCallback,
    pub(crate) completion: Completion,
    /// Counted in the registry's in-flight match counter.
    pub(crate) matched: bool,
}

/// Work collected under the registry lock and performed after it is dropped.
#[derive(Default)]
pub(crate) struct Effects {
    pub(crate) deliveries: Vec<Delivery>,
    pub(crate) exceptions: Vec<(ProcessName, PeerException)>,
}

impl Effects {
    pub(crate) fn is_empty(&self) -> bool {
        self.deliveries.is_empty() && self.exceptions.is_empty()
    }
}
