//! Resumable framing cursors.
//!
//! A [`SendMessage`] gathers its header and payload segments into one
//! vectored write and keeps a cursor (segment index, offset) so a short write
//! resumes exactly where it stopped. A [`RecvMessage`] reads the fixed header,
//! acquires a payload buffer from the pool and then fills it, across any
//! number of partial reads.
//!
//! Both handlers are non-blocking: `WouldBlock` yields [`Progress::Pending`],
//! and only a hard error or end of stream is reported as a [`MessageError`].

use std::io::{self, IoSlice};

use bytes::Bytes;
use oob_core::{Connection, FreeList, PayloadBuf, PoolError, PooledBuf};

use crate::completion::SharedCallback;
use crate::wire::{MessageHeader, WireError, HEADER_SIZE};

/// Errors that end the connection a message is travelling on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// The remote side closed the stream.
    #[error("connection closed by peer")]
    Eof,
    /// The socket reported a hard error.
    #[error("I/O error: {0:?}")]
    Io(io::ErrorKind),
    /// The peer sent a malformed frame.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    /// The payload pool was closed.
    #[error("payload pool closed")]
    PoolClosed,
}

/// Result of driving a send cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The whole frame has been transferred.
    Complete,
    /// The socket would block; call again when ready.
    Pending,
}

/// An outgoing frame with its write cursor.
pub struct SendMessage {
    header: MessageHeader,
    header_bytes: [u8; HEADER_SIZE],
    payload: Vec<Bytes>,
    segment: usize,
    offset: usize,
    callback: Option<SharedCallback>,
}

impl std::fmt::Debug for SendMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendMessage")
            .field("header", &self.header)
            .field("segment", &self.segment)
            .field("offset", &self.offset)
            .finish()
    }
}

impl SendMessage {
    /// Prepare a frame for sending.
    pub(crate) fn new(
        header: MessageHeader,
        payload: Vec<Bytes>,
        callback: Option<SharedCallback>,
    ) -> Self {
        let mut msg = Self {
            header_bytes: header.encode(),
            header,
            payload,
            segment: 0,
            offset: 0,
            callback,
        };
        msg.skip_empty();
        msg
    }

    /// The frame header.
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// Whether any byte of this frame has reached the socket.
    pub fn started(&self) -> bool {
        self.segment > 0 || self.offset > 0
    }

    /// Whether every byte has been written.
    pub fn is_complete(&self) -> bool {
        self.segment > self.payload.len()
    }

    pub(crate) fn into_parts(self) -> (MessageHeader, Vec<Bytes>, Option<SharedCallback>) {
        (self.header, self.payload, self.callback)
    }

    fn segment_bytes(&self, index: usize) -> &[u8] {
        if index == 0 {
            &self.header_bytes
        } else {
            &self.payload[index - 1]
        }
    }

    fn skip_empty(&mut self) {
        while !self.is_complete() && self.offset >= self.segment_bytes(self.segment).len() {
            self.segment += 1;
            self.offset = 0;
        }
    }

    fn advance(&mut self, mut written: usize) {
        while written > 0 && !self.is_complete() {
            let remaining = self.segment_bytes(self.segment).len() - self.offset;
            if written >= remaining {
                written -= remaining;
                self.segment += 1;
                self.offset = 0;
            } else {
                self.offset += written;
                written = 0;
            }
        }
        self.skip_empty();
    }

    /// Write as much of the frame as the socket accepts.
    pub fn send_handler(&mut self, conn: &dyn Connection) -> Result<Progress, MessageError> {
        loop {
            if self.is_complete() {
                return Ok(Progress::Complete);
            }
            let result = {
                let mut slices = Vec::with_capacity(self.payload.len() + 1 - self.segment + 1);
                slices.push(IoSlice::new(&self.segment_bytes(self.segment)[self.offset..]));
                for index in self.segment + 1..=self.payload.len() {
                    slices.push(IoSlice::new(self.segment_bytes(index)));
                }
                conn.try_write_vectored(&slices)
            };
            match result {
                Ok(0) => return Err(MessageError::Io(io::ErrorKind::WriteZero)),
                Ok(n) => self.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(MessageError::Io(e.kind())),
            }
        }
    }
}

/// A fully received frame.
#[derive(Debug)]
pub struct ReceivedFrame {
    /// The validated header.
    pub header: MessageHeader,
    /// The payload, absent for zero-length frames.
    pub payload: Option<PooledBuf>,
}

impl ReceivedFrame {
    /// Payload bytes (empty for zero-length frames).
    pub fn bytes(&self) -> &[u8] {
        self.payload.as_ref().map_or(&[][..], |buf| buf.as_slice())
    }
}

/// Result of driving a receive cursor.
#[derive(Debug)]
pub enum RecvProgress {
    /// A frame is complete; the cursor has been reset for the next one.
    Complete(ReceivedFrame),
    /// The socket would block.
    Pending,
    /// The header is in but no payload buffer is free; retry after a release.
    Stalled,
}

enum Phase {
    Header { filled: usize },
    AwaitingBuffer { header: MessageHeader },
    Body {
        header: MessageHeader,
        buf: PooledBuf,
        filled: usize,
    },
}

/// The incoming frame being assembled on one connection.
pub struct RecvMessage {
    header_buf: [u8; HEADER_SIZE],
    phase: Phase,
}

impl Default for RecvMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RecvMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match &self.phase {
            Phase::Header { filled } => format!("header({filled}/{HEADER_SIZE})"),
            Phase::AwaitingBuffer { header } => format!("awaiting-buffer({})", header.size),
            Phase::Body { header, filled, .. } => format!("body({filled}/{})", header.size),
        };
        f.debug_struct("RecvMessage").field("phase", &phase).finish()
    }
}

impl RecvMessage {
    /// A cursor waiting for the first header byte.
    pub fn new() -> Self {
        Self {
            header_buf: [0u8; HEADER_SIZE],
            phase: Phase::Header { filled: 0 },
        }
    }

    /// Whether a frame is partially received.
    pub fn in_progress(&self) -> bool {
        !matches!(self.phase, Phase::Header { filled: 0 })
    }

    /// Drop any partial frame, returning its buffer to the pool.
    pub fn reset(&mut self) {
        self.phase = Phase::Header { filled: 0 };
    }

    /// Read until a frame completes, the socket would block, or the pool is dry.
    pub fn recv_handler(
        &mut self,
        conn: &dyn Connection,
        pool: &FreeList<PayloadBuf>,
        max_payload: usize,
    ) -> Result<RecvProgress, MessageError> {
        loop {
            match &mut self.phase {
                Phase::Header { filled } => {
                    match read_some(conn, &mut self.header_buf[*filled..])? {
                        None => return Ok(RecvProgress::Pending),
                        Some(n) => *filled += n,
                    }
                    if *filled == HEADER_SIZE {
                        let header = MessageHeader::decode(&self.header_buf, max_payload)?;
                        if header.size == 0 {
                            header.verify(&[])?;
                            self.phase = Phase::Header { filled: 0 };
                            return Ok(RecvProgress::Complete(ReceivedFrame {
                                header,
                                payload: None,
                            }));
                        }
                        self.phase = Phase::AwaitingBuffer { header };
                    }
                }
                Phase::AwaitingBuffer { header } => {
                    let header = *header;
                    match pool.try_get() {
                        Ok(mut buf) => {
                            buf.prepare(header.size as usize);
                            self.phase = Phase::Body {
                                header,
                                buf,
                                filled: 0,
                            };
                        }
                        Err(PoolError::OutOfResource) => return Ok(RecvProgress::Stalled),
                        Err(_) => return Err(MessageError::PoolClosed),
                    }
                }
                Phase::Body {
                    header,
                    buf,
                    filled,
                } => {
                    match read_some(conn, &mut buf.as_mut_slice()[*filled..])? {
                        None => return Ok(RecvProgress::Pending),
                        Some(n) => *filled += n,
                    }
                    if *filled == header.size as usize {
                        header.verify(buf.as_slice())?;
                        let phase = std::mem::replace(&mut self.phase, Phase::Header { filled: 0 });
                        if let Phase::Body { header, buf, .. } = phase {
                            return Ok(RecvProgress::Complete(ReceivedFrame {
                                header,
                                payload: Some(buf),
                            }));
                        }
                    }
                }
            }
        }
    }
}

/// One non-blocking read. `None` means the socket would block.
fn read_some(conn: &dyn Connection, buf: &mut [u8]) -> Result<Option<usize>, MessageError> {
    loop {
        match conn.try_read(buf) {
            Ok(0) => return Err(MessageError::Eof),
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(MessageError::Io(e.kind())),
        }
    }
}
