//! Core types for peer addressing.
//!
//! This module provides the identity and flag types shared by every layer:
//! - [`ProcessName`]: opaque 96-bit process identity (cell, job, vpid)
//! - [`Tag`]: caller-defined message tag
//! - [`RecvFlags`]: receive behavior flags

use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Caller-defined message tag. Matching is exact, there is no tag wildcard.
pub type Tag = u32;

/// Size of a [`ProcessName`] on the wire (three little-endian u32).
pub const PROCESS_NAME_SIZE: usize = 12;

/// Identity of a process in the runtime.
///
/// Names are supplied by the naming service and treated as opaque by the
/// transport. [`ProcessName::ANY`] is the wildcard used when posting a
/// receive that accepts any sender.
///
/// # Examples
///
/// ```
/// use oob_core::ProcessName;
///
/// let name: ProcessName = "0.1.7".parse().expect("parse");
/// assert_eq!(name, ProcessName::new(0, 1, 7));
/// assert!(ProcessName::ANY.matches(&name));
/// assert!(!name.is_wildcard());
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ProcessName {
    /// Cell identifier.
    pub cell: u32,
    /// Job identifier within the cell.
    pub job: u32,
    /// Virtual process id within the job.
    pub vpid: u32,
}

impl ProcessName {
    /// Wildcard name: matches every sender in a posted receive.
    pub const ANY: ProcessName = ProcessName {
        cell: u32::MAX,
        job: u32::MAX,
        vpid: u32::MAX,
    };

    /// Create a process name from its components.
    pub const fn new(cell: u32, job: u32, vpid: u32) -> Self {
        Self { cell, job, vpid }
    }

    /// Whether this is the wildcard name.
    pub const fn is_wildcard(&self) -> bool {
        self.cell == u32::MAX && self.job == u32::MAX && self.vpid == u32::MAX
    }

    /// Whether a message from `sender` satisfies this selector.
    pub fn matches(&self, sender: &ProcessName) -> bool {
        self.is_wildcard() || self == sender
    }

    /// Encode into `buf` (must be at least [`PROCESS_NAME_SIZE`] bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= PROCESS_NAME_SIZE);
        buf[0..4].copy_from_slice(&self.cell.to_le_bytes());
        buf[4..8].copy_from_slice(&self.job.to_le_bytes());
        buf[8..12].copy_from_slice(&self.vpid.to_le_bytes());
    }

    /// Decode from the first [`PROCESS_NAME_SIZE`] bytes of `buf`.
    ///
    /// Returns `None` if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < PROCESS_NAME_SIZE {
            return None;
        }
        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        Some(Self::new(word(0), word(4), word(8)))
    }
}

impl std::fmt::Display for ProcessName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_wildcard() {
            write!(f, "[*]")
        } else {
            write!(f, "[{},{},{}]", self.cell, self.job, self.vpid)
        }
    }
}

/// Error parsing a process name from `cell.job.vpid`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessNameParseError {
    /// Not exactly three dot-separated components.
    #[error("expected cell.job.vpid, got {0} components")]
    WrongArity(usize),
    /// A component is not a u32.
    #[error("invalid component: {0}")]
    InvalidComponent(String),
}

impl FromStr for ProcessName {
    type Err = ProcessNameParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Self::ANY);
        }
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(ProcessNameParseError::WrongArity(parts.len()));
        }
        let mut values = [0u32; 3];
        for (slot, part) in values.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| ProcessNameParseError::InvalidComponent((*part).to_string()))?;
        }
        Ok(Self::new(values[0], values[1], values[2]))
    }
}

bitflags! {
    /// Flags controlling how a posted receive consumes a message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct RecvFlags: u32 {
        /// Inspect a message without consuming it.
        const PEEK = 0b0001;
        /// Hand the pooled payload buffer to the caller instead of copying.
        const ALLOCATE_BUFFER = 0b0010;
        /// Keep the receive posted after every match.
        const PERSISTENT = 0b0100;
        /// Report the full message size even if the caller's buffers were shorter.
        const TRUNCATE = 0b1000;
    }
}

bitflags! {
    /// Flags for send operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SendFlags: u32 {
        /// Return from a blocking send once the message is queued instead of
        /// once it has been written.
        const NON_BLOCKING = 0b0001;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let name = ProcessName::new(1, 0xDEAD_BEEF, 42);
        let mut buf = [0u8; PROCESS_NAME_SIZE];
        name.encode_into(&mut buf);
        assert_eq!(&buf[0..4], &1u32.to_le_bytes());
        assert_eq!(ProcessName::decode(&buf), Some(name));
        assert_eq!(ProcessName::decode(&buf[..11]), None);
    }

    #[test]
    fn test_wildcard_matching() {
        let a = ProcessName::new(0, 1, 0);
        let b = ProcessName::new(0, 1, 1);
        assert!(ProcessName::ANY.matches(&a));
        assert!(a.matches(&a));
        assert!(!a.matches(&b));
        assert_eq!(ProcessName::ANY.to_string(), "[*]");
        assert_eq!(a.to_string(), "[0,1,0]");
    }

    #[test]
    fn test_parse() {
        assert_eq!("*".parse::<ProcessName>(), Ok(ProcessName::ANY));
        assert_eq!(
            "1.2".parse::<ProcessName>(),
            Err(ProcessNameParseError::WrongArity(2))
        );
        assert!(matches!(
            "1.x.3".parse::<ProcessName>(),
            Err(ProcessNameParseError::InvalidComponent(_))
        ));
    }

    #[test]
    fn test_recv_flags_compose() {
        let flags = RecvFlags::PEEK | RecvFlags::TRUNCATE;
        assert!(flags.contains(RecvFlags::PEEK));
        assert!(!flags.contains(RecvFlags::PERSISTENT));
    }
}
