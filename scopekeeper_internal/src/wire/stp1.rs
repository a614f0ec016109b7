// SPDX-License-Identifier: MIT OR Apache-2.0
//! STP/1 framing.
//!
//! Every frame is `STP\x01`, a varint record length, and a record.  The record opens with a
//! varint message type followed by protobuf-style `(key, value)` pairs where
//! `key = field << 3 | wire_type`.  Only wire types 0 (varint) and 2 (length-delimited) exist in
//! this protocol.  Unknown fields are skipped; unknown wire types are not, since their length
//! cannot be known.

use super::{FrameError, InFlightBuffer, MAX_FRAME_LEN, STP1_MAGIC};
use crate::message::{
    Format, MessageType, Stp1Message, WIRE_LENGTH_DELIMITED, WIRE_VARINT, field,
};
use crate::varint;

/// Where the reader is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    ReadToken,
    ReadVarintLength,
    ReadBinaryPayload { len: usize },
}

/// Incremental STP/1 parser.
#[derive(Debug)]
pub struct Stp1Reader {
    buf: InFlightBuffer,
    state: ReadState,
}

impl Default for Stp1Reader {
    fn default() -> Self {
        Self::new()
    }
}

impl Stp1Reader {
    pub fn new() -> Stp1Reader {
        Stp1Reader {
            buf: InFlightBuffer::new(),
            state: ReadState::ReadToken,
        }
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.buf.add_bytes(bytes);
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == ReadState::ReadToken && self.buf.is_empty()
    }

    /// Pops the next complete message, or `Ok(None)` if more bytes are needed.
    ///
    /// A token mismatch is reported as soon as the first differing byte arrives.
    pub fn next_message(&mut self) -> Result<Option<Stp1Message>, FrameError> {
        loop {
            match self.state {
                ReadState::ReadToken => {
                    let unread = self.buf.unread();
                    let seen = unread.len().min(STP1_MAGIC.len());
                    if unread[..seen] != STP1_MAGIC[..seen] {
                        return Err(FrameError::BadMagic(unread[..seen].to_vec()));
                    }
                    if seen < STP1_MAGIC.len() {
                        return Ok(None);
                    }
                    self.buf.consume(STP1_MAGIC.len());
                    self.state = ReadState::ReadVarintLength;
                }
                ReadState::ReadVarintLength => {
                    let Some((len, cursor)) = varint::decode(self.buf.unread(), 0)? else {
                        return Ok(None);
                    };
                    let len = usize::try_from(len).unwrap_or(usize::MAX);
                    if len > MAX_FRAME_LEN {
                        return Err(FrameError::FrameTooLarge(len));
                    }
                    self.buf.consume(cursor);
                    self.state = ReadState::ReadBinaryPayload { len };
                }
                ReadState::ReadBinaryPayload { len } => {
                    if self.buf.len() < len {
                        return Ok(None);
                    }
                    let parsed = parse_record(&self.buf.unread()[..len]);
                    self.buf.consume(len);
                    self.state = ReadState::ReadToken;
                    return parsed.map(Some);
                }
            }
        }
    }
}

fn malformed(reason: impl Into<String>) -> FrameError {
    FrameError::MalformedMessage(reason.into())
}

fn read_varint(record: &[u8], cursor: usize) -> Result<(u64, usize), FrameError> {
    varint::decode(record, cursor)?.ok_or_else(|| malformed("record ends inside a varint"))
}

fn to_u32(field: u64, value: u64) -> Result<u32, FrameError> {
    u32::try_from(value).map_err(|_| malformed(format!("field {field} value {value} exceeds u32")))
}

fn to_string(field: u64, bytes: &[u8]) -> Result<String, FrameError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| malformed(format!("field {field} is not valid UTF-8")))
}

/// Decodes one record (the bytes after the frame length).
///
/// Absent fields take their defaults: empty service, command 0, protobuf format, no status or
/// tag, empty payload.
pub fn parse_record(record: &[u8]) -> Result<Stp1Message, FrameError> {
    let (raw_type, mut cursor) = read_varint(record, 0)?;
    let message_type = MessageType::try_from(raw_type)
        .map_err(|t| malformed(format!("unknown message type {t}")))?;
    let mut message = Stp1Message {
        message_type,
        service: String::new(),
        command_id: 0,
        format: Format::Protobuf,
        status: None,
        tag: None,
        client_id: None,
        uuid: None,
        payload: Vec::new(),
    };

    while cursor < record.len() {
        let (key, next) = read_varint(record, cursor)?;
        cursor = next;
        let number = key >> 3;
        match key & 0x7 {
            WIRE_VARINT => {
                let (value, next) = read_varint(record, cursor)?;
                cursor = next;
                match number {
                    field::COMMAND_ID => message.command_id = to_u32(number, value)?,
                    field::FORMAT => {
                        message.format = Format::try_from(value)
                            .map_err(|f| malformed(format!("unknown format {f}")))?
                    }
                    field::STATUS => message.status = Some(to_u32(number, value)?),
                    field::TAG => message.tag = Some(to_u32(number, value)?),
                    field::CLIENT_ID => message.client_id = Some(to_u32(number, value)?),
                    field::SERVICE | field::UUID | field::PAYLOAD => {
                        return Err(malformed(format!("field {number} must be length-delimited")));
                    }
                    _ => {}
                }
            }
            WIRE_LENGTH_DELIMITED => {
                let (len, next) = read_varint(record, cursor)?;
                let end = usize::try_from(len)
                    .ok()
                    .and_then(|len| next.checked_add(len))
                    .filter(|&end| end <= record.len())
                    .ok_or_else(|| malformed(format!("field {number} overruns the record")))?;
                let bytes = &record[next..end];
                cursor = end;
                match number {
                    field::SERVICE => message.service = to_string(number, bytes)?,
                    field::UUID => message.uuid = Some(to_string(number, bytes)?),
                    field::PAYLOAD => message.payload = bytes.to_vec(),
                    field::COMMAND_ID
                    | field::FORMAT
                    | field::STATUS
                    | field::TAG
                    | field::CLIENT_ID => {
                        return Err(malformed(format!("field {number} must be a varint")));
                    }
                    _ => {}
                }
            }
            other => return Err(malformed(format!("unsupported wire type {other}"))),
        }
    }
    Ok(message)
}

fn put_varint_field(out: &mut Vec<u8>, number: u64, value: u64) {
    varint::encode_into((number << 3) | WIRE_VARINT, out);
    varint::encode_into(value, out);
}

fn put_bytes_field(out: &mut Vec<u8>, number: u64, bytes: &[u8]) {
    varint::encode_into((number << 3) | WIRE_LENGTH_DELIMITED, out);
    varint::encode_into(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

/// Encodes a record without the frame header.  The payload field is always present.
pub fn encode_record(message: &Stp1Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + message.service.len() + message.payload.len());
    varint::encode_into(message.message_type as u64, &mut out);
    put_bytes_field(&mut out, field::SERVICE, message.service.as_bytes());
    put_varint_field(&mut out, field::COMMAND_ID, u64::from(message.command_id));
    put_varint_field(&mut out, field::FORMAT, message.format as u64);
    if let Some(status) = message.status {
        put_varint_field(&mut out, field::STATUS, u64::from(status));
    }
    if let Some(tag) = message.tag {
        put_varint_field(&mut out, field::TAG, u64::from(tag));
    }
    if let Some(client_id) = message.client_id {
        put_varint_field(&mut out, field::CLIENT_ID, u64::from(client_id));
    }
    if let Some(uuid) = &message.uuid {
        put_bytes_field(&mut out, field::UUID, uuid.as_bytes());
    }
    put_bytes_field(&mut out, field::PAYLOAD, &message.payload);
    out
}

/// Encodes a complete frame: token, length, record.
pub fn encode_message(message: &Stp1Message) -> Vec<u8> {
    let record = encode_record(message);
    let mut out = Vec::with_capacity(STP1_MAGIC.len() + varint::MAX_VARINT_LEN + record.len());
    out.extend_from_slice(STP1_MAGIC);
    varint::encode_into(record.len() as u64, &mut out);
    out.extend(record);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(service: &str, payload: &str) -> Stp1Message {
        Stp1Message {
            message_type: MessageType::Event,
            service: service.to_string(),
            command_id: 14,
            format: Format::Json,
            status: Some(0),
            tag: None,
            client_id: Some(2),
            uuid: Some("0f3c".to_string()),
            payload: payload.as_bytes().to_vec(),
        }
    }

    fn frame(record: &[u8]) -> Vec<u8> {
        let mut out = STP1_MAGIC.to_vec();
        varint::encode_into(record.len() as u64, &mut out);
        out.extend_from_slice(record);
        out
    }

    #[test]
    fn round_trip() {
        let messages = [
            event("ecmascript-debugger", "[1,2,\"three\"]"),
            Stp1Message::command("scope", 3, Format::Json, 1, "[\"json\"]"),
            event("console-logger", ""),
        ];
        for message in messages {
            let mut reader = Stp1Reader::new();
            reader.add_bytes(&encode_message(&message));
            assert_eq!(reader.next_message().unwrap(), Some(message));
            assert!(reader.is_idle());
        }
    }

    #[test]
    fn resumes_across_every_split() {
        let message = event("window-manager", "{\"x\":1}");
        let bytes = encode_message(&message);
        for cut in 0..bytes.len() {
            let mut reader = Stp1Reader::new();
            reader.add_bytes(&bytes[..cut]);
            assert_eq!(reader.next_message().unwrap(), None, "cut at {cut}");
            reader.add_bytes(&bytes[cut..]);
            assert_eq!(reader.next_message().unwrap(), Some(message.clone()));
        }
    }

    #[test]
    fn back_to_back_frames() {
        let mut bytes = encode_message(&event("a", "1"));
        bytes.extend(encode_message(&event("b", "2")));
        let mut reader = Stp1Reader::new();
        reader.add_bytes(&bytes);
        assert_eq!(reader.next_message().unwrap().unwrap().service, "a");
        assert_eq!(reader.next_message().unwrap().unwrap().service, "b");
        assert_eq!(reader.next_message().unwrap(), None);
    }

    #[test]
    fn empty_payload_is_written() {
        let bytes = encode_record(&Stp1Message::command("scope", 3, Format::Json, 1, ""));
        assert_eq!(&bytes[bytes.len() - 2..], &[0x42, 0x00]);
    }

    #[test]
    fn bad_token_is_reported_early() {
        let mut reader = Stp1Reader::new();
        reader.add_bytes(b"STX");
        assert!(matches!(
            reader.next_message(),
            Err(FrameError::BadMagic(_))
        ));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let mut reader = Stp1Reader::new();
        reader.add_bytes(&frame(&[MessageType::Event as u8]));
        let message = reader.next_message().unwrap().unwrap();
        assert_eq!(message.service, "");
        assert_eq!(message.command_id, 0);
        assert_eq!(message.format, Format::Protobuf);
        assert_eq!(message.status, None);
        assert_eq!(message.tag, None);
        assert!(message.payload.is_empty());
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut record = vec![MessageType::Response as u8];
        put_varint_field(&mut record, 12, 99);
        put_bytes_field(&mut record, 13, b"ignored");
        put_bytes_field(&mut record, field::SERVICE, b"scope");
        put_varint_field(&mut record, field::TAG, 5);
        let message = parse_record(&record).unwrap();
        assert_eq!(message.service, "scope");
        assert_eq!(message.tag, Some(5));
    }

    #[test]
    fn unknown_wire_type_is_fatal() {
        // field 1, wire type 5 (fixed32)
        let record = [MessageType::Event as u8, (1 << 3) | 5, 0, 0, 0, 0];
        assert!(matches!(
            parse_record(&record),
            Err(FrameError::MalformedMessage(_))
        ));
    }

    #[test]
    fn known_field_with_wrong_wire_type() {
        let mut record = vec![MessageType::Event as u8];
        put_varint_field(&mut record, field::SERVICE, 1);
        assert!(matches!(
            parse_record(&record),
            Err(FrameError::MalformedMessage(_))
        ));
        let mut record = vec![MessageType::Event as u8];
        put_bytes_field(&mut record, field::TAG, b"1");
        assert!(matches!(
            parse_record(&record),
            Err(FrameError::MalformedMessage(_))
        ));
    }

    #[test]
    fn rejects_bad_enums_and_overflow() {
        assert!(parse_record(&[9]).is_err());

        let mut record = vec![MessageType::Event as u8];
        put_varint_field(&mut record, field::FORMAT, 7);
        assert!(parse_record(&record).is_err());

        let mut record = vec![MessageType::Event as u8];
        put_varint_field(&mut record, field::COMMAND_ID, u64::from(u32::MAX) + 1);
        assert!(parse_record(&record).is_err());
    }

    #[test]
    fn truncated_field_is_malformed() {
        let mut record = vec![MessageType::Event as u8];
        put_bytes_field(&mut record, field::PAYLOAD, b"abcdef");
        record.truncate(record.len() - 2);
        assert!(matches!(
            parse_record(&record),
            Err(FrameError::MalformedMessage(_))
        ));
    }
}
