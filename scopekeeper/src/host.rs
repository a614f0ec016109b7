//! The link to the debuggee host.
//!
//! A [`HostLink`] owns the single host socket.  It always starts out speaking STP/0 and waits
//! for the host's `*services` announcement.  If the host offers `stp-1` (and STP/0 has not been
//! forced), the link asks for the upgrade with `*enable stp-1` and then expects the plaintext
//! token `STP/1\n`, after which every frame in both directions is STP/1.
//!
//! ```text
//!     proxy                               host
//!       |   <------------  *services a,b,stp-1
//!       |   *enable stp-1  ------------>
//!       |   <------------  STP/1\n
//!       |   <===========>  STP/1 frames
//! ```
//!
//! The link never blocks and never routes messages itself: [`HostLink::poll`] returns
//! [`HostEvent`]s for the router to act on.

use crate::transport::{OutBuffer, Transport, drain_readable};
use scopekeeper_internal::message::{
    Format, Message, MessageType, SCOPE_CONNECT, SCOPE_SERVICE, Stp0Message, Stp1Message,
};
use scopekeeper_internal::tags::TagTable;
use scopekeeper_internal::wire::stp0::{self, ENABLE_COMMAND, Stp0Frame, Stp0Reader};
use scopekeeper_internal::wire::stp1::{self, Stp1Reader};
use scopekeeper_internal::wire::{FrameError, InFlightBuffer, STP1_SERVICE, UPGRADE_TOKEN};
use std::fmt::Display;

/// The negotiated protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    #[default]
    Stp0,
    Stp1,
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVersion::Stp0 => f.write_str("stp-0"),
            ProtocolVersion::Stp1 => f.write_str("stp-1"),
        }
    }
}

/// Where the link is in its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostState {
    /// Connected, nothing received yet.
    AwaitingServiceList,
    /// `*enable stp-1` was sent; the announced services are held until the host confirms.
    AwaitingUpgradeToken { services: Vec<String> },
    Stp0Active,
    Stp1Active,
    /// A fatal error or EOF was seen.  Nothing more is read or written.
    Disconnected,
}

/// Something the router needs to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// The host announced its services.  When `upgrading` is set the list should not be
    /// published until [`HostEvent::Upgraded`] arrives.
    Services {
        services: Vec<String>,
        upgrading: bool,
    },
    /// The host confirmed the switch to STP/1.
    Upgraded { services: Vec<String> },
    /// A regular message for the client.
    Message(Message),
    /// The host accepted the `scope.Connect` sent by [`HostLink::connect_client`] with `tag`.
    ConnectAcknowledged { tag: u32 },
    /// The host rejected a `scope.Connect`.
    ConnectFailed { tag: u32, status: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("host I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("protocol switch with data in flight: {0}")]
    HandshakeOrdering(String),
    #[error("expected the STP/1 upgrade token, got {0:02x?}")]
    BadUpgradeToken(Vec<u8>),
    #[error("{0} cannot be sent while the link is {1:?}")]
    WrongProtocol(&'static str, HostState),
    #[error("the host connection is closed")]
    Disconnected,
    #[error("cannot encode a command payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// First tag used for the proxy's own `scope.Connect` commands.  Tags below it belong to
/// clients.
pub const CONNECT_TAG_BASE: u32 = 1 << 30;

#[derive(Debug)]
pub struct HostLink {
    transport: Box<dyn Transport>,
    state: HostState,
    stp0: Stp0Reader,
    stp1: Stp1Reader,
    token: InFlightBuffer,
    out: OutBuffer,
    /// Tags of outstanding `scope.Connect` commands.
    connects: TagTable<()>,
    force_stp_0: bool,
}

impl HostLink {
    /// Wraps a freshly accepted host connection.
    pub fn new(transport: Box<dyn Transport>, force_stp_0: bool) -> HostLink {
        HostLink {
            transport,
            state: HostState::AwaitingServiceList,
            stp0: Stp0Reader::new(),
            stp1: Stp1Reader::new(),
            token: InFlightBuffer::new(),
            out: OutBuffer::new(),
            connects: TagTable::starting_at(CONNECT_TAG_BASE),
            force_stp_0,
        }
    }

    pub fn state(&self) -> &HostState {
        &self.state
    }

    pub fn version(&self) -> ProtocolVersion {
        match self.state {
            HostState::Stp1Active => ProtocolVersion::Stp1,
            _ => ProtocolVersion::Stp0,
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == HostState::Disconnected
    }

    /// Number of `scope.Connect` commands still awaiting a reply.
    pub fn pending_connects(&self) -> usize {
        self.connects.len()
    }

    /// Reads everything available and returns the resulting events.
    ///
    /// Any error is fatal: the link moves to [`HostState::Disconnected`] and must be dropped.
    pub fn poll(&mut self) -> Result<Vec<HostEvent>, HostError> {
        if self.is_disconnected() {
            return Err(HostError::Disconnected);
        }
        let mut incoming = Vec::new();
        let read = drain_readable(self.transport.as_mut(), |bytes| {
            incoming.extend_from_slice(bytes)
        });
        match read {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.state = HostState::Disconnected;
                return Err(HostError::Disconnected);
            }
            Err(e) => {
                self.state = HostState::Disconnected;
                return Err(e.into());
            }
        }
        if incoming.is_empty() {
            return Ok(Vec::new());
        }
        self.on_bytes(&incoming)
    }

    /// Feeds raw host bytes through the active reader.
    fn on_bytes(&mut self, bytes: &[u8]) -> Result<Vec<HostEvent>, HostError> {
        let mut events = Vec::new();
        let result = match self.state {
            HostState::Disconnected => Err(HostError::Disconnected),
            HostState::AwaitingServiceList | HostState::Stp0Active => {
                self.stp0.add_bytes(bytes);
                self.pump_stp0(&mut events)
            }
            HostState::AwaitingUpgradeToken { .. } => {
                self.token.add_bytes(bytes);
                self.pump_token(&mut events)
            }
            HostState::Stp1Active => {
                self.stp1.add_bytes(bytes);
                self.pump_stp1(&mut events)
            }
        };
        match result {
            Ok(()) => Ok(events),
            Err(e) => {
                self.state = HostState::Disconnected;
                Err(e)
            }
        }
    }

    fn pump_stp0(&mut self, events: &mut Vec<HostEvent>) -> Result<(), HostError> {
        while let Some(frame) = self.stp0.next_frame()? {
            match frame {
                Stp0Frame::Services(services) => {
                    let upgrade =
                        !self.force_stp_0 && services.iter().any(|s| s == STP1_SERVICE);
                    if upgrade {
                        self.begin_upgrade(&services)?;
                        events.push(HostEvent::Services {
                            services,
                            upgrading: true,
                        });
                        // the host sends nothing else until it has seen *enable stp-1
                        return Ok(());
                    }
                    self.state = HostState::Stp0Active;
                    events.push(HostEvent::Services {
                        services,
                        upgrading: false,
                    });
                }
                Stp0Frame::Message(message) => events.push(HostEvent::Message(message.into())),
            }
        }
        Ok(())
    }

    fn begin_upgrade(&mut self, services: &[String]) -> Result<(), HostError> {
        if !self.stp0.is_idle() || !self.out.is_empty() {
            return Err(HostError::HandshakeOrdering(format!(
                "{} bytes unread, {} bytes unsent",
                self.stp0.take_unread().len(),
                self.out.len()
            )));
        }
        self.out
            .push(&stp0::encode_text(&format!("{ENABLE_COMMAND} {STP1_SERVICE}")));
        self.state = HostState::AwaitingUpgradeToken {
            services: services.to_vec(),
        };
        logwise::info_sync!("host offers stp-1, requesting upgrade");
        Ok(())
    }

    fn pump_token(&mut self, events: &mut Vec<HostEvent>) -> Result<(), HostError> {
        let unread = self.token.unread();
        let seen = unread.len().min(UPGRADE_TOKEN.len());
        if unread[..seen] != UPGRADE_TOKEN[..seen] {
            return Err(HostError::BadUpgradeToken(unread[..seen].to_vec()));
        }
        if seen < UPGRADE_TOKEN.len() {
            return Ok(());
        }
        self.token.consume(UPGRADE_TOKEN.len());
        if !self.out.is_empty() {
            return Err(HostError::HandshakeOrdering(format!(
                "{} bytes unsent at upgrade",
                self.out.len()
            )));
        }
        let services = match std::mem::replace(&mut self.state, HostState::Stp1Active) {
            HostState::AwaitingUpgradeToken { services } => services,
            _ => Vec::new(),
        };
        logwise::info_sync!("host switched to stp-1");
        events.push(HostEvent::Upgraded { services });
        let rest = self.token.take_unread();
        if rest.is_empty() {
            return Ok(());
        }
        self.stp1.add_bytes(&rest);
        self.pump_stp1(events)
    }

    fn pump_stp1(&mut self, events: &mut Vec<HostEvent>) -> Result<(), HostError> {
        while let Some(message) = self.stp1.next_message()? {
            let tag = message.tag.unwrap_or(0);
            if self.connects.contains(tag) && message.answers(SCOPE_SERVICE, SCOPE_CONNECT, tag)
            {
                self.connects.take(tag);
                let status = message.status.unwrap_or(0);
                if message.message_type == MessageType::Response && status == 0 {
                    events.push(HostEvent::ConnectAcknowledged { tag });
                } else {
                    logwise::warn_sync!(
                        "scope.Connect rejected with status {status}",
                        status = logwise::privacy::LogIt(&status)
                    );
                    events.push(HostEvent::ConnectFailed { tag, status });
                }
                continue;
            }
            events.push(HostEvent::Message(message.into()));
        }
        Ok(())
    }

    /// Queues an STP/0 message for the host.
    pub fn send_command_stp0(&mut self, message: &Stp0Message) -> Result<(), HostError> {
        match self.state {
            HostState::AwaitingServiceList | HostState::Stp0Active => {
                self.out.push(&stp0::encode_message(message));
                Ok(())
            }
            HostState::Disconnected => Err(HostError::Disconnected),
            ref other => Err(HostError::WrongProtocol("an STP/0 command", other.clone())),
        }
    }

    /// Queues an STP/1 message for the host.
    pub fn send_command_stp1(&mut self, message: &Stp1Message) -> Result<(), HostError> {
        match self.state {
            HostState::Stp1Active => {
                self.out.push(&stp1::encode_message(message));
                Ok(())
            }
            HostState::Disconnected => Err(HostError::Disconnected),
            ref other => Err(HostError::WrongProtocol("an STP/1 command", other.clone())),
        }
    }

    /// Sends `scope.Connect` and returns its tag.  The reply surfaces as
    /// [`HostEvent::ConnectAcknowledged`] or [`HostEvent::ConnectFailed`] carrying the same tag;
    /// every other message keeps its normal routing meanwhile.
    ///
    /// The Connect itself is always JSON, whatever format clients use.
    pub fn connect_client(&mut self) -> Result<u32, HostError> {
        if self.state != HostState::Stp1Active {
            return Err(HostError::WrongProtocol("scope.Connect", self.state.clone()));
        }
        let payload = serde_json::to_vec(&[Format::Json])?;
        let tag = self.connects.alloc(());
        let connect = Stp1Message::command(SCOPE_SERVICE, SCOPE_CONNECT, Format::Json, tag, payload);
        if let Err(e) = self.send_command_stp1(&connect) {
            self.connects.take(tag);
            return Err(e);
        }
        Ok(tag)
    }

    /// Writes as much queued output as the socket accepts.  Returns whether anything was written.
    pub fn flush(&mut self) -> Result<bool, HostError> {
        if self.is_disconnected() {
            return Ok(false);
        }
        match self.out.write_to(self.transport.as_mut()) {
            Ok(wrote) => Ok(wrote),
            Err(e) => {
                self.state = HostState::Disconnected;
                Err(e.into())
            }
        }
    }

    /// Closes the socket and drops anything buffered.
    pub fn close(&mut self) {
        self.transport.shutdown();
        self.out.clear();
        self.connects.clear();
        self.state = HostState::Disconnected;
    }
}
