// SPDX-License-Identifier: MIT OR Apache-2.0
use crate::varint::VarintError;

pub mod stp0;
pub mod stp1;

/// The 4-byte token that opens every STP/1 frame.
pub const STP1_MAGIC: &[u8; 4] = b"STP\x01";
/// Plaintext acknowledgement the host sends after `*enable stp-1`.
pub const UPGRADE_TOKEN: &[u8; 6] = b"STP/1\n";
/// The service name that announces STP/1 support in `*services`.
pub const STP1_SERVICE: &str = "stp-1";
/// Upper bound on a single frame body.  Anything larger is treated as corrupt framing.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Consumed bytes are only dropped from the front of the buffer once this many have piled up.
const COMPACT_THRESHOLD: usize = 8192;

/// Errors raised by the frame readers.  All of them are fatal to the host connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Varint(#[from] VarintError),
    #[error("expected STP/1 frame token, got {0:02x?}")]
    BadMagic(Vec<u8>),
    #[error("invalid STP/0 length prefix: {0}")]
    InvalidLength(String),
    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),
    #[error("STP/0 body is not valid UTF-16")]
    InvalidUtf16,
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

/// A growable byte buffer with a read cursor.
///
/// Frame readers append whatever the socket gives them and consume from the front as complete
/// pieces become available.  Consumed bytes stay in place until enough accumulate to make moving
/// the tail worthwhile.
#[derive(Debug, Default)]
pub struct InFlightBuffer {
    bytes: Vec<u8>,
    cursor: usize,
}

impl InFlightBuffer {
    pub fn new() -> InFlightBuffer {
        InFlightBuffer::default()
    }

    /// Appends raw bytes.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// The bytes that have not been consumed yet.
    pub fn unread(&self) -> &[u8] {
        &self.bytes[self.cursor..]
    }

    pub fn len(&self) -> usize {
        self.bytes.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks `n` unread bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.cursor = (self.cursor + n).min(self.bytes.len());
        if self.cursor == self.bytes.len() {
            self.bytes.clear();
            self.cursor = 0;
        } else if self.cursor >= COMPACT_THRESHOLD {
            self.bytes.drain(..self.cursor);
            self.cursor = 0;
        }
    }

    /// Removes and returns everything unread.
    pub fn take_unread(&mut self) -> Vec<u8> {
        let rest = self.bytes.split_off(self.cursor);
        self.bytes.clear();
        self.cursor = 0;
        rest
    }

    /// Number of consumed bytes still held at the front.
    #[cfg(test)]
    fn consumed(&self) -> usize {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_resets_when_drained() {
        let mut buf = InFlightBuffer::new();
        buf.add_bytes(b"hello world");
        buf.consume(6);
        assert_eq!(buf.unread(), b"world");
        assert_eq!(buf.consumed(), 6);
        buf.consume(5);
        assert!(buf.is_empty());
        assert_eq!(buf.consumed(), 0);
    }

    #[test]
    fn compacts_only_past_threshold() {
        let mut buf = InFlightBuffer::new();
        buf.add_bytes(&vec![7u8; COMPACT_THRESHOLD + 10]);
        buf.consume(100);
        assert_eq!(buf.consumed(), 100);
        buf.consume(COMPACT_THRESHOLD);
        assert_eq!(buf.consumed(), 0);
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn take_unread_empties() {
        let mut buf = InFlightBuffer::new();
        buf.add_bytes(b"STP/1\nabc");
        buf.consume(UPGRADE_TOKEN.len());
        assert_eq!(buf.take_unread(), b"abc".to_vec());
        assert!(buf.is_empty());
    }
}
