// SPDX-License-Identifier: MIT OR Apache-2.0
//! STP/0 framing.
//!
//! A frame is the UTF-16BE encoding of `<length> <name> <payload>`, where `<length>` is the decimal
//! number of UTF-16 code units in `<name> <payload>`.  The body therefore spans `2 * length` bytes
//! after the space that ends the length prefix.

use super::{FrameError, InFlightBuffer, MAX_FRAME_LEN};
use crate::message::Stp0Message;

/// Host announcement of its capabilities.  Never forwarded to clients.
pub const SERVICES_COMMAND: &str = "*services";
/// Proxy-to-host request to enable a service (or a protocol version).
pub const ENABLE_COMMAND: &str = "*enable";

/// Longest accepted decimal length prefix.
const MAX_LENGTH_DIGITS: usize = 10;
const SPACE: u16 = b' ' as u16;

/// Where the reader is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Scanning for the space that ends the decimal length.
    ReadLength,
    /// Waiting for `units` UTF-16 code units of body.
    ReadBody { units: usize },
}

/// A complete STP/0 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stp0Frame {
    /// The host's `*services` announcement, split on commas.
    Services(Vec<String>),
    Message(Stp0Message),
}

/// Incremental STP/0 parser.  Bytes may arrive split anywhere, including inside a code unit.
#[derive(Debug)]
pub struct Stp0Reader {
    buf: InFlightBuffer,
    state: ReadState,
}

impl Default for Stp0Reader {
    fn default() -> Self {
        Self::new()
    }
}

impl Stp0Reader {
    pub fn new() -> Stp0Reader {
        Stp0Reader {
            buf: InFlightBuffer::new(),
            state: ReadState::ReadLength,
        }
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.buf.add_bytes(bytes);
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    /// True between frames with nothing buffered.
    pub fn is_idle(&self) -> bool {
        self.state == ReadState::ReadLength && self.buf.is_empty()
    }

    /// Hands over any bytes that have not been parsed.
    pub fn take_unread(&mut self) -> Vec<u8> {
        self.buf.take_unread()
    }

    /// Pops the next complete frame, or `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Stp0Frame>, FrameError> {
        loop {
            match self.state {
                ReadState::ReadLength => match self.read_length()? {
                    Some(units) => self.state = ReadState::ReadBody { units },
                    None => return Ok(None),
                },
                ReadState::ReadBody { units } => {
                    let needed = units * 2;
                    if self.buf.len() < needed {
                        return Ok(None);
                    }
                    let code_units: Vec<u16> = self.buf.unread()[..needed]
                        .chunks_exact(2)
                        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                        .collect();
                    self.buf.consume(needed);
                    self.state = ReadState::ReadLength;
                    let text = String::from_utf16(&code_units).map_err(|_| FrameError::InvalidUtf16)?;
                    return Ok(Some(frame_from_text(&text)));
                }
            }
        }
    }

    fn read_length(&mut self) -> Result<Option<usize>, FrameError> {
        let mut digits = String::new();
        let mut found = None;
        for (i, pair) in self.buf.unread().chunks_exact(2).enumerate() {
            let unit = u16::from_be_bytes([pair[0], pair[1]]);
            if unit == SPACE {
                found = Some((i + 1) * 2);
                break;
            }
            match char::from_u32(u32::from(unit)) {
                Some(c) if c.is_ascii_digit() => digits.push(c),
                _ => {
                    return Err(FrameError::InvalidLength(format!(
                        "unexpected code unit {unit:#06x}"
                    )));
                }
            }
            if digits.len() > MAX_LENGTH_DIGITS {
                return Err(FrameError::InvalidLength(format!("{digits}...")));
            }
        }
        let Some(prefix_len) = found else {
            return Ok(None);
        };
        let units: usize = digits
            .parse()
            .map_err(|_| FrameError::InvalidLength(digits.clone()))?;
        if units.saturating_mul(2) > MAX_FRAME_LEN {
            return Err(FrameError::FrameTooLarge(units.saturating_mul(2)));
        }
        self.buf.consume(prefix_len);
        Ok(Some(units))
    }
}

fn frame_from_text(text: &str) -> Stp0Frame {
    let (name, payload) = text.split_once(' ').unwrap_or((text, ""));
    if name == SERVICES_COMMAND {
        Stp0Frame::Services(parse_service_list(payload))
    } else {
        Stp0Frame::Message(Stp0Message::new(name, payload))
    }
}

/// Splits a comma-separated service list, dropping empty entries.
pub fn parse_service_list(payload: &str) -> Vec<String> {
    payload
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Frames raw text (`<name> <payload>`) for the wire.
pub fn encode_text(text: &str) -> Vec<u8> {
    let units = text.encode_utf16().count();
    format!("{units} {text}")
        .encode_utf16()
        .flat_map(u16::to_be_bytes)
        .collect()
}

pub fn encode_message(message: &Stp0Message) -> Vec<u8> {
    encode_text(&message.to_text())
}
