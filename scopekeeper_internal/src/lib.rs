//! Wire-level building blocks for the scopekeeper proxy.
//!
//! This crate holds everything about the Scope Transfer Protocol (STP) that does not touch a socket:
//! the varint codec, the logical message types for both protocol versions, the incremental frame
//! readers, and the tag correlation table.  It is not intended for direct use; depend on the
//! `scopekeeper` crate instead.

/// Logical STP/0 and STP/1 messages.
pub mod message;
/// Tag correlation table for command/response pairs.
pub mod tags;
/// LEB128-style variable-length integers.
pub mod varint;
/// Incremental frame readers and encoders for both protocol versions.
pub mod wire;
