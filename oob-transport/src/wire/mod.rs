//! Wire format for OOB frames.
//!
//! Frame format (all integers little-endian):
//!
//! ```text
//! [kind:1][version:1][reserved:2][tag:4][size:4][checksum:4][src:12][dst:12][payload:size]
//! ```
//!
//! - **kind**: 1 = Identify, 2 = Ping, 3 = Data
//! - **version**: [`PROTOCOL_VERSION`]
//! - **checksum**: CRC32C of the payload
//! - **src / dst**: sender and intended receiver as (cell, job, vpid)

use bytes::Bytes;
use oob_core::{ProcessName, Tag, PROCESS_NAME_SIZE};

/// Header size: 4 (kind, version, reserved) + 4 (tag) + 4 (size) + 4 (checksum) + 12 + 12.
pub const HEADER_SIZE: usize = 16 + 2 * PROCESS_NAME_SIZE;

/// Protocol version carried by every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default upper bound on a frame payload (64 MiB).
///
/// Frames declaring more than the configured maximum are rejected before any
/// payload buffer is acquired.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// The kind byte is not a known message kind.
    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    /// The peer speaks another protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Checksum verification failed - data was corrupted.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum from header.
        expected: u32,
        /// Computed checksum from data.
        actual: u32,
    },

    /// Payload exceeds maximum allowed size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Declared payload size in bytes.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// Kind of an OOB frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Announces the sender's name on a fresh connection.
    Identify = 1,
    /// Liveness probe, no payload semantics.
    Ping = 2,
    /// Application data delivered to posted receives.
    Data = 3,
}

impl TryFrom<u8> for MessageKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Identify),
            2 => Ok(Self::Ping),
            3 => Ok(Self::Data),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// Fixed-size header preceding every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Frame kind.
    pub kind: MessageKind,
    /// Caller-defined tag.
    pub tag: Tag,
    /// Payload length in bytes.
    pub size: u32,
    /// CRC32C of the payload.
    pub checksum: u32,
    /// Sender.
    pub src: ProcessName,
    /// Intended receiver.
    pub dst: ProcessName,
}

impl MessageHeader {
    /// Build a header for `payload`, computing size and checksum.
    pub fn for_payload(
        kind: MessageKind,
        tag: Tag,
        src: ProcessName,
        dst: ProcessName,
        payload: &[Bytes],
        max_payload: usize,
    ) -> Result<Self, WireError> {
        let size: usize = payload.iter().map(Bytes::len).sum();
        if size > max_payload || size > u32::MAX as usize {
            return Err(WireError::PayloadTooLarge {
                size,
                max: max_payload,
            });
        }
        Ok(Self {
            kind,
            tag,
            size: size as u32,
            checksum: checksum(payload.iter().map(|b| &b[..])),
            src,
            dst,
        })
    }

    /// Serialize header into a fixed array.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.kind as u8;
        buf[1] = PROTOCOL_VERSION;
        buf[4..8].copy_from_slice(&self.tag.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        self.src.encode_into(&mut buf[16..28]);
        self.dst.encode_into(&mut buf[28..40]);
        buf
    }

    /// Deserialize and validate a header.
    ///
    /// # Errors
    ///
    /// - `InsufficientData`: fewer than [`HEADER_SIZE`] bytes
    /// - `UnknownKind` / `UnsupportedVersion`: not a frame we understand
    /// - `PayloadTooLarge`: declared size above `max_payload`
    pub fn decode(buf: &[u8], max_payload: usize) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::InsufficientData {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }
        let kind = MessageKind::try_from(buf[0])?;
        if buf[1] != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(buf[1]));
        }
        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let size = word(8);
        if size as usize > max_payload {
            return Err(WireError::PayloadTooLarge {
                size: size as usize,
                max: max_payload,
            });
        }
        let name = |range: std::ops::Range<usize>| {
            ProcessName::decode(&buf[range]).ok_or(WireError::InsufficientData {
                needed: HEADER_SIZE,
                have: buf.len(),
            })
        };
        Ok(Self {
            kind,
            tag: word(4),
            size,
            checksum: word(12),
            src: name(16..28)?,
            dst: name(28..40)?,
        })
    }

    /// Check a received payload against the header checksum.
    pub fn verify(&self, payload: &[u8]) -> Result<(), WireError> {
        let actual = crc32c::crc32c(payload);
        if actual != self.checksum {
            return Err(WireError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }
}

/// Compute CRC32C over a sequence of payload segments.
pub fn checksum<'a>(segments: impl IntoIterator<Item = &'a [u8]>) -> u32 {
    segments
        .into_iter()
        .fold(0, |crc, segment| crc32c::crc32c_append(crc, segment))
}

/// Serialize a complete frame into one contiguous buffer.
///
/// # Examples
///
/// ```
/// use oob_transport::wire::{encode_frame, MessageHeader, MessageKind, HEADER_SIZE, MAX_PAYLOAD_SIZE};
/// use oob_transport::ProcessName;
///
/// let src = ProcessName::new(0, 1, 0);
/// let dst = ProcessName::new(0, 1, 1);
/// let frame = encode_frame(MessageKind::Data, 7, src, dst, b"hello").expect("encode");
///
/// let header = MessageHeader::decode(&frame, MAX_PAYLOAD_SIZE).expect("decode");
/// assert_eq!(header.size, 5);
/// header.verify(&frame[HEADER_SIZE..]).expect("checksum");
/// ```
pub fn encode_frame(
    kind: MessageKind,
    tag: Tag,
    src: ProcessName,
    dst: ProcessName,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    let header = MessageHeader::for_payload(
        kind,
        tag,
        src,
        dst,
        &[Bytes::copy_from_slice(payload)],
        MAX_PAYLOAD_SIZE,
    )?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(payload);
    Ok(frame)
}
