use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Field numbers of the STP/1 transport message.
///
/// The message type is not a tagged field: it is the first varint of every record.
pub mod field {
    pub const SERVICE: u64 = 1;
    pub const COMMAND_ID: u64 = 2;
    pub const FORMAT: u64 = 3;
    pub const STATUS: u64 = 4;
    pub const TAG: u64 = 5;
    pub const CLIENT_ID: u64 = 6;
    pub const UUID: u64 = 7;
    pub const PAYLOAD: u64 = 8;
}

/// Wire type of a varint value.
pub const WIRE_VARINT: u64 = 0;
/// Wire type of a length-prefixed blob.
pub const WIRE_LENGTH_DELIMITED: u64 = 2;

/// The `scope` service command id of `Connect`.
pub const SCOPE_CONNECT: u32 = 3;
/// The service that owns the session-level commands.
pub const SCOPE_SERVICE: &str = "scope";

/// What an STP/1 record is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Command = 1,
    Response = 2,
    Event = 3,
    Error = 4,
}

impl TryFrom<u64> for MessageType {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, u64> {
        match value {
            1 => Ok(MessageType::Command),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::Event),
            4 => Ok(MessageType::Error),
            other => Err(other),
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::Command => "command",
            MessageType::Response => "response",
            MessageType::Event => "event",
            MessageType::Error => "error",
        };
        f.write_str(name)
    }
}

/// Payload encoding of an STP/1 record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Protobuf = 0,
    #[default]
    Json = 1,
    Xml = 2,
    Stp = 3,
}

impl TryFrom<u64> for Format {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, u64> {
        match value {
            0 => Ok(Format::Protobuf),
            1 => Ok(Format::Json),
            2 => Ok(Format::Xml),
            3 => Ok(Format::Stp),
            other => Err(other),
        }
    }
}

impl std::str::FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "protobuf" => Ok(Format::Protobuf),
            "json" => Ok(Format::Json),
            "xml" => Ok(Format::Xml),
            "stp" => Ok(Format::Stp),
            other => Err(format!("unknown format `{other}` (expected protobuf, json, xml or stp)")),
        }
    }
}

impl Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Format::Protobuf => "protobuf",
            Format::Json => "json",
            Format::Xml => "xml",
            Format::Stp => "stp",
        };
        f.write_str(name)
    }
}

/// An STP/0 message: a service (or `*command`) name and a text payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stp0Message {
    pub name: String,
    pub payload: String,
}

impl Stp0Message {
    pub fn new(name: impl Into<String>, payload: impl Into<String>) -> Self {
        Stp0Message {
            name: name.into(),
            payload: payload.into(),
        }
    }

    /// The text that gets framed on the wire: `<name> <payload>`.
    pub fn to_text(&self) -> String {
        format!("{} {}", self.name, self.payload)
    }
}

/// An STP/1 transport message.
///
/// `status`, `tag`, `client_id` and `uuid` are optional on the wire; `payload` is always
/// written, even when empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stp1Message {
    pub message_type: MessageType,
    pub service: String,
    pub command_id: u32,
    pub format: Format,
    pub status: Option<u32>,
    pub tag: Option<u32>,
    pub client_id: Option<u32>,
    pub uuid: Option<String>,
    pub payload: Vec<u8>,
}

impl Stp1Message {
    /// Builds a command bound for the host.
    pub fn command(
        service: impl Into<String>,
        command_id: u32,
        format: Format,
        tag: u32,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Stp1Message {
            message_type: MessageType::Command,
            service: service.into(),
            command_id,
            format,
            status: None,
            tag: Some(tag),
            client_id: None,
            uuid: None,
            payload: payload.into(),
        }
    }

    /// True if this is the reply to `command` on `service` carrying `tag`.
    pub fn answers(&self, service: &str, command_id: u32, tag: u32) -> bool {
        matches!(
            self.message_type,
            MessageType::Response | MessageType::Error
        ) && self.service == service
            && self.command_id == command_id
            && self.tag.unwrap_or(0) == tag
    }
}

/// A message of either protocol version, as it travels through the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Stp0(Stp0Message),
    Stp1(Stp1Message),
}

impl Message {
    /// The service the message belongs to.
    pub fn service(&self) -> &str {
        match self {
            Message::Stp0(m) => &m.name,
            Message::Stp1(m) => &m.service,
        }
    }
}

impl From<Stp0Message> for Message {
    fn from(value: Stp0Message) -> Self {
        Message::Stp0(value)
    }
}

impl From<Stp1Message> for Message {
    fn from(value: Stp1Message) -> Self {
        Message::Stp1(value)
    }
}
