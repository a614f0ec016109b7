// SPDX-License-Identifier: MIT OR Apache-2.0
//! Non-blocking byte transports.
//!
//! Every socket the reactor owns is driven through [`Transport`], which never blocks: a read
//! either yields bytes, reports that nothing is available yet, or reports that the peer has gone.
//! Writes accept as many bytes as the OS will take and leave the rest to [`OutBuffer`] for the
//! next tick.

use std::fmt::Debug;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;

/// Result of a non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// `n` bytes were placed at the front of the buffer.
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// The peer closed the connection.
    Closed,
}

/// A byte stream that supports non-blocking reads and writes.
pub trait Transport: Send + Debug {
    /// Reads as many bytes as are available without blocking.
    ///
    /// `WouldBlock` and `Interrupted` are reported as [`ReadStatus::WouldBlock`], never as errors.
    fn read_nonblock(&mut self, buf: &mut [u8]) -> Result<ReadStatus, std::io::Error>;

    /// Writes as many bytes as the transport accepts without blocking.
    ///
    /// Returns `Ok(0)` if the transport cannot take anything right now.
    fn write_nonblock(&mut self, data: &[u8]) -> Result<usize, std::io::Error>;

    /// Closes both directions.  Errors are ignored since the connection is being abandoned.
    fn shutdown(&mut self) {}
}

impl Transport for TcpStream {
    fn read_nonblock(&mut self, buf: &mut [u8]) -> Result<ReadStatus, std::io::Error> {
        match self.read(buf) {
            Ok(0) => Ok(ReadStatus::Closed),
            Ok(n) => Ok(ReadStatus::Data(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                Ok(ReadStatus::WouldBlock)
            }
            Err(e) => Err(e),
        }
    }

    fn write_nonblock(&mut self, data: &[u8]) -> Result<usize, std::io::Error> {
        match self.write(data) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn shutdown(&mut self) {
        let _ = TcpStream::shutdown(self, std::net::Shutdown::Both);
    }
}

/// Bytes queued for a transport that has not accepted them yet.
#[derive(Debug, Default)]
pub struct OutBuffer {
    bytes: Vec<u8>,
    cursor: usize,
}

impl OutBuffer {
    pub fn new() -> OutBuffer {
        OutBuffer::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.bytes.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.cursor = 0;
    }

    /// Writes as much as `transport` accepts.  Returns whether any bytes were written.
    pub fn write_to(&mut self, transport: &mut dyn Transport) -> Result<bool, std::io::Error> {
        let mut wrote = false;
        while self.cursor < self.bytes.len() {
            let n = transport.write_nonblock(&self.bytes[self.cursor..])?;
            if n == 0 {
                break;
            }
            self.cursor += n;
            wrote = true;
        }
        if self.cursor == self.bytes.len() {
            self.clear();
        }
        Ok(wrote)
    }
}

/// A reading loop shared by the host link and client sessions.
///
/// Drains everything currently readable from `transport` into `sink`.  Returns `Ok(true)` if
/// any bytes arrived and `Ok(false)` if none did; a closed peer is reported as
/// [`ErrorKind::UnexpectedEof`] once the readable bytes are delivered.
pub fn drain_readable(
    transport: &mut dyn Transport,
    mut sink: impl FnMut(&[u8]),
) -> Result<bool, std::io::Error> {
    let mut buf = [0u8; 8192];
    let mut got = false;
    loop {
        match transport.read_nonblock(&mut buf)? {
            ReadStatus::Data(n) => {
                sink(&buf[..n]);
                got = true;
            }
            ReadStatus::WouldBlock => return Ok(got),
            ReadStatus::Closed => {
                if got {
                    // deliver what arrived; the close is seen again on the next read
                    return Ok(true);
                }
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                ));
            }
        }
    }
}
