//! Matching of posted receives against arriving messages.
//!
//! The engine keeps two FIFO lists: receives posted by the application and
//! messages that arrived before any receive wanted them. A message matches a
//! receive when the receive's peer is the sender (or the wildcard) and the
//! tags are equal. The engine performs no locking and never runs callbacks;
//! it returns [`Delivery`] records that the registry runs after dropping its
//! lock.

use std::collections::VecDeque;

use oob_core::{ProcessName, RecvFlags, Tag};

use crate::completion::{Buffers, Completion, Delivery, SharedCallback};
use crate::error::{OobError, OobResult};
use crate::message::ReceivedFrame;

/// Identifier of a posted receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecvId(u64);

struct PostedRecv {
    id: RecvId,
    peer: ProcessName,
    tag: Tag,
    flags: RecvFlags,
    buffers: Vec<Vec<u8>>,
    callback: SharedCallback,
}

impl PostedRecv {
    fn matches(&self, frame: &ReceivedFrame) -> bool {
        self.tag == frame.header.tag && self.peer.matches(&frame.header.src)
    }

    /// Complete against `frame` without consuming it.
    fn peek(&self, frame: &ReceivedFrame) -> Delivery {
        let mut buffers = self.buffers.clone();
        let copied = copy_into(&mut buffers, frame.bytes());
        self.delivery(frame, copied, Buffers::Copied(buffers))
    }

    /// Complete against `frame`, taking ownership of its payload.
    ///
    /// For persistent receives the posted buffers act as a template and are
    /// cloned; otherwise they move into the completion.
    fn consume(&mut self, frame: ReceivedFrame) -> Delivery {
        if self.flags.contains(RecvFlags::ALLOCATE_BUFFER) {
            let size = frame.header.size as usize;
            let buffers = match frame.payload {
                Some(buf) => Buffers::Pooled(buf),
                None => Buffers::None,
            };
            return self.delivery_raw(frame.header.src, frame.header.tag, size, buffers);
        }
        let mut buffers = if self.flags.contains(RecvFlags::PERSISTENT) {
            self.buffers.clone()
        } else {
            std::mem::take(&mut self.buffers)
        };
        let copied = copy_into(&mut buffers, frame.bytes());
        self.delivery(&frame, copied, Buffers::Copied(buffers))
    }

    fn delivery(&self, frame: &ReceivedFrame, copied: usize, buffers: Buffers) -> Delivery {
        let size = if self.flags.contains(RecvFlags::TRUNCATE) {
            frame.header.size as usize
        } else {
            copied
        };
        self.delivery_raw(frame.header.src, frame.header.tag, size, buffers)
    }

    fn delivery_raw(&self, peer: ProcessName, tag: Tag, size: usize, buffers: Buffers) -> Delivery {
        Delivery {
            callback: self.callback.clone(),
            completion: Completion {
                status: Ok(size),
                peer,
                tag,
                buffers,
            },
            matched: true,
        }
    }

    fn fail(self, error: OobError) -> Delivery {
        Delivery {
            callback: self.callback,
            completion: Completion {
                status: Err(error),
                peer: self.peer,
                tag: self.tag,
                buffers: Buffers::Copied(self.buffers),
            },
            matched: false,
        }
    }
}

/// Copy `data` across `buffers` in order, truncating each buffer to the bytes
/// it received. Returns the number of bytes copied.
fn copy_into(buffers: &mut [Vec<u8>], data: &[u8]) -> usize {
    let mut copied = 0;
    for buf in buffers.iter_mut() {
        let n = buf.len().min(data.len() - copied);
        buf[..n].copy_from_slice(&data[copied..copied + n]);
        buf.truncate(n);
        copied += n;
    }
    copied
}

/// Reject receive flag combinations that cannot be honored.
pub fn validate(flags: RecvFlags) -> OobResult<()> {
    if flags.contains(RecvFlags::PEEK) && flags.contains(RecvFlags::ALLOCATE_BUFFER) {
        return Err(OobError::InvalidParameter(
            "PEEK cannot hand over the payload buffer".to_string(),
        ));
    }
    if flags.contains(RecvFlags::PEEK) && flags.contains(RecvFlags::PERSISTENT) {
        return Err(OobError::InvalidParameter(
            "PEEK receives cannot be persistent".to_string(),
        ));
    }
    Ok(())
}

/// Counts of posted receives and unexpected messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchStats {
    /// Receives waiting for a message.
    pub posted: usize,
    /// Messages waiting for a receive.
    pub unexpected: usize,
    /// Payload bytes held by unexpected messages.
    pub unexpected_bytes: usize,
}

/// Posted and unexpected lists.
#[derive(Default)]
pub struct MatchEngine {
    posted: VecDeque<PostedRecv>,
    unexpected: VecDeque<ReceivedFrame>,
    next_id: u64,
}

impl std::fmt::Debug for MatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchEngine")
            .field("posted", &self.posted.len())
            .field("unexpected", &self.unexpected.len())
            .finish()
    }
}

impl MatchEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Post a receive.
    ///
    /// Already-arrived messages are matched first, oldest first. A
    /// non-persistent receive that matches completes immediately and is not
    /// queued; a persistent one consumes every matching unexpected message and
    /// then stays posted.
    pub(crate) fn post(
        &mut self,
        peer: ProcessName,
        tag: Tag,
        flags: RecvFlags,
        buffers: Vec<Vec<u8>>,
        callback: SharedCallback,
        deliveries: &mut Vec<Delivery>,
    ) -> OobResult<RecvId> {
        validate(flags)?;
        self.next_id += 1;
        let id = RecvId(self.next_id);
        let mut post = PostedRecv {
            id,
            peer,
            tag,
            flags,
            buffers,
            callback,
        };

        let mut index = 0;
        while index < self.unexpected.len() {
            if !post.matches(&self.unexpected[index]) {
                index += 1;
                continue;
            }
            if flags.contains(RecvFlags::PEEK) {
                deliveries.push(post.peek(&self.unexpected[index]));
                return Ok(id);
            }
            let Some(frame) = self.unexpected.remove(index) else {
                break;
            };
            tracing::debug!(peer = %frame.header.src, tag, "matched unexpected message");
            deliveries.push(post.consume(frame));
            if !flags.contains(RecvFlags::PERSISTENT) {
                return Ok(id);
            }
        }

        self.posted.push_back(post);
        Ok(id)
    }

    /// Match an arriving data frame.
    ///
    /// Posts are scanned in order. A matching `PEEK` receive completes and is
    /// removed, and the scan continues for a receive that consumes the
    /// message. Without one the message joins the unexpected list.
    pub(crate) fn arrive(&mut self, frame: ReceivedFrame, deliveries: &mut Vec<Delivery>) {
        let mut index = 0;
        while index < self.posted.len() {
            if !self.posted[index].matches(&frame) {
                index += 1;
                continue;
            }
            if self.posted[index].flags.contains(RecvFlags::PEEK) {
                if let Some(post) = self.posted.remove(index) {
                    deliveries.push(post.peek(&frame));
                }
                continue;
            }
            if self.posted[index].flags.contains(RecvFlags::PERSISTENT) {
                deliveries.push(self.posted[index].consume(frame));
            } else if let Some(mut post) = self.posted.remove(index) {
                deliveries.push(post.consume(frame));
            }
            return;
        }
        tracing::debug!(
            peer = %frame.header.src,
            tag = frame.header.tag,
            size = frame.header.size,
            "no posted receive, queued as unexpected"
        );
        self.unexpected.push_back(frame);
    }

    /// Cancel every receive posted for (`peer`, `tag`). [`ProcessName::ANY`]
    /// cancels every receive with `tag`, whatever peer it was posted for.
    ///
    /// Cancelled receives complete with [`OobError::Cancelled`].
    pub(crate) fn cancel(
        &mut self,
        peer: ProcessName,
        tag: Tag,
        deliveries: &mut Vec<Delivery>,
    ) -> OobResult<()> {
        let before = deliveries.len();
        self.remove_where(
            |post| post.tag == tag && (peer.is_wildcard() || post.peer == peer),
            OobError::Cancelled,
            deliveries,
        );
        if deliveries.len() == before {
            return Err(OobError::NotFound);
        }
        Ok(())
    }

    /// Remove one receive by id without completing it.
    ///
    /// Returns `false` if it already matched.
    pub(crate) fn withdraw(&mut self, id: RecvId) -> bool {
        match self.posted.iter().position(|post| post.id == id) {
            Some(index) => {
                self.posted.remove(index);
                true
            }
            None => false,
        }
    }

    /// Fail every receive bound specifically to `peer`.
    pub(crate) fn fail_peer(
        &mut self,
        peer: ProcessName,
        error: OobError,
        deliveries: &mut Vec<Delivery>,
    ) {
        self.remove_where(|post| post.peer == peer, error, deliveries);
    }

    /// Fail every posted receive and release every unexpected message.
    pub(crate) fn drain(&mut self, error: OobError, deliveries: &mut Vec<Delivery>) -> usize {
        self.remove_where(|_| true, error, deliveries);
        let released = self.unexpected.len();
        self.unexpected.clear();
        released
    }

    /// Current list sizes.
    pub fn stats(&self) -> MatchStats {
        MatchStats {
            posted: self.posted.len(),
            unexpected: self.unexpected.len(),
            unexpected_bytes: self
                .unexpected
                .iter()
                .map(|frame| frame.header.size as usize)
                .sum(),
        }
    }

    fn remove_where(
        &mut self,
        mut predicate: impl FnMut(&PostedRecv) -> bool,
        error: OobError,
        deliveries: &mut Vec<Delivery>,
    ) {
        let mut kept = VecDeque::with_capacity(self.posted.len());
        for post in self.posted.drain(..) {
            if predicate(&post) {
                deliveries.push(post.fail(error.clone()));
            } else {
                kept.push_back(post);
            }
        }
        self.posted = kept;
    }
}
