//! The message router.
//!
//! [`Scope`] holds everything that outlives a single HTTP request: the host link, the
//! negotiated protocol version, the service registry and the rendezvous queue.  Sessions call
//! into it; it answers with [`Delivery`] values that the reactor hands to the right session.

use crate::config::Config;
use crate::host::{HostError, HostEvent, HostLink, HostState, ProtocolVersion};
use crate::rendezvous::Rendezvous;
use crate::transport::Transport;
use scopekeeper_internal::message::{Format, Message, Stp0Message};
use scopekeeper_internal::wire::stp0::ENABLE_COMMAND;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Identifies one HTTP connection for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// What the router needs from the configuration.
#[derive(Debug, Clone)]
pub struct ScopeOptions {
    pub debug: bool,
    pub force_stp_0: bool,
    pub format: Format,
    pub poll_timeout: Duration,
    pub max_pending_messages: usize,
}

impl From<&Config> for ScopeOptions {
    fn from(config: &Config) -> Self {
        ScopeOptions {
            debug: config.debug,
            force_stp_0: config.force_stp_0,
            format: config.format,
            poll_timeout: config.poll_timeout(),
            max_pending_messages: config.max_pending_messages,
        }
    }
}

impl Default for ScopeOptions {
    fn default() -> Self {
        ScopeOptions::from(&Config::default())
    }
}

/// A reply for a parked session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Message {
        session: SessionId,
        message: Message,
    },
    /// The long-poll deadline passed with nothing to deliver.
    Timeout { session: SessionId },
    ServiceList {
        session: SessionId,
        services: Vec<String>,
    },
    /// A `/services` request could not be completed (Connect rejected or unanswered).
    ServicesUnavailable { session: SessionId },
}

impl Delivery {
    pub fn session(&self) -> SessionId {
        match self {
            Delivery::Message { session, .. }
            | Delivery::Timeout { session }
            | Delivery::ServiceList { session, .. }
            | Delivery::ServicesUnavailable { session } => *session,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("no host is connected")]
    NoHost,
    #[error("unknown service {0}")]
    UnknownService(String),
    #[error("service {0} is not enabled")]
    ServiceNotEnabled(String),
    #[error("{0} is negotiated by the handshake and cannot be enabled")]
    ProtocolService(String),
    #[error(transparent)]
    Host(#[from] HostError),
}

/// A `/services` request waiting for the host to acknowledge `scope.Connect`.
#[derive(Debug)]
struct ConnectWaiter {
    tag: u32,
    session: SessionId,
    deadline: Instant,
}

#[derive(Debug)]
pub struct Scope {
    options: ScopeOptions,
    host: Option<HostLink>,
    version: ProtocolVersion,
    service_list: Vec<String>,
    enabled: HashMap<String, bool>,
    queue: Rendezvous<Message, SessionId>,
    connect_waiters: Vec<ConnectWaiter>,
    /// Answers for `/services` requests whose host went away, sent on the next poll.
    orphaned: Vec<Delivery>,
}

impl Scope {
    pub fn new(options: ScopeOptions) -> Scope {
        let queue = Rendezvous::new(options.max_pending_messages);
        Scope {
            options,
            host: None,
            version: ProtocolVersion::Stp0,
            service_list: Vec::new(),
            enabled: HashMap::new(),
            queue,
            connect_waiters: Vec::new(),
            orphaned: Vec::new(),
        }
    }

    pub fn options(&self) -> &ScopeOptions {
        &self.options
    }

    /// Registers a new host connection.  An existing one is closed and its state discarded.
    pub fn set_host(&mut self, transport: Box<dyn Transport>) {
        if self.host.is_some() {
            logwise::warn_sync!("a new host connected, dropping the previous one");
            self.teardown_host();
        }
        self.host = Some(HostLink::new(transport, self.options.force_stp_0));
    }

    pub fn has_host(&self) -> bool {
        self.host.is_some()
    }

    pub fn host_state(&self) -> Option<&HostState> {
        self.host.as_ref().map(HostLink::state)
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        logwise::info_sync!(
            "protocol version is now {version}",
            version = logwise::privacy::LogIt(&version)
        );
        self.version = version;
    }

    /// Publishes the host's service list.
    pub fn set_service_list(&mut self, services: Vec<String>) {
        self.service_list = services;
    }

    pub fn service_list(&self) -> &[String] {
        &self.service_list
    }

    pub fn is_service_known(&self, name: &str) -> bool {
        self.enabled.contains_key(name)
    }

    pub fn is_service_enabled(&self, name: &str) -> bool {
        self.enabled.get(name).copied().unwrap_or(false)
    }

    /// Enables a service.  Returns `Ok(false)` if it already was.
    ///
    /// Under STP/0 this sends `*enable <name>`.  Under STP/1 clients enable services through
    /// `scope` commands themselves, so only the registry changes.
    pub fn enable_service(&mut self, name: &str) -> Result<bool, ScopeError> {
        if name.starts_with("stp-") {
            return Err(ScopeError::ProtocolService(name.to_string()));
        }
        match self.enabled.get(name) {
            None => return Err(ScopeError::UnknownService(name.to_string())),
            Some(true) => {
                logwise::info_sync!(
                    "service {name} is already enabled",
                    name = logwise::privacy::LogIt(&name)
                );
                return Ok(false);
            }
            Some(false) => {}
        }
        if self.version == ProtocolVersion::Stp0 {
            let host = self.host.as_mut().ok_or(ScopeError::NoHost)?;
            host.send_command_stp0(&Stp0Message::new(ENABLE_COMMAND, name))?;
        }
        self.enabled.insert(name.to_string(), true);
        Ok(true)
    }

    /// Sends a client command to the host.
    ///
    /// STP/0 commands need their service enabled; STP/1 commands need it announced by the host.
    pub fn send_command(&mut self, message: Message) -> Result<(), ScopeError> {
        let service = message.service().to_string();
        match &message {
            Message::Stp0(_) if !self.is_service_enabled(&service) => {
                return Err(ScopeError::ServiceNotEnabled(service));
            }
            Message::Stp1(_) if !self.is_service_known(&service) => {
                return Err(ScopeError::UnknownService(service));
            }
            _ => {}
        }
        let host = self.host.as_mut().ok_or(ScopeError::NoHost)?;
        match &message {
            Message::Stp0(m) => host.send_command_stp0(m)?,
            Message::Stp1(m) => host.send_command_stp1(m)?,
        }
        if self.options.debug {
            logwise::info_sync!(
                "send to host: {message}",
                message = logwise::privacy::LogIt(&message)
            );
        }
        Ok(())
    }

    /// Answers `/services`.
    ///
    /// Stale pending messages are discarded first: they belong to the previous client.  Under
    /// STP/1 the list is only returned once the host acknowledges a fresh `scope.Connect`, so
    /// this returns `None` and the answer arrives later from [`Scope::poll_host`].
    pub fn return_service_list(&mut self, session: SessionId, now: Instant) -> Option<Delivery> {
        let flushed = self.queue.flush_pending();
        if flushed > 0 {
            logwise::info_sync!(
                "discarded {flushed} stale messages",
                flushed = logwise::privacy::LogIt(&flushed)
            );
        }
        let host = match self.host.as_mut() {
            Some(host) if self.version == ProtocolVersion::Stp1 => host,
            _ => {
                return Some(Delivery::ServiceList {
                    session,
                    services: self.service_list.clone(),
                });
            }
        };
        match host.connect_client() {
            Ok(tag) => {
                self.connect_waiters.push(ConnectWaiter {
                    tag,
                    session,
                    deadline: now + self.options.poll_timeout,
                });
                None
            }
            Err(e) => {
                logwise::error_sync!(
                    "cannot send scope.Connect: {e}",
                    e = logwise::privacy::LogIt(&e)
                );
                Some(Delivery::ServicesUnavailable { session })
            }
        }
    }

    /// Answers a long-poll: immediately if a message is queued, otherwise the session waits.
    pub fn poll_message(&mut self, session: SessionId, now: Instant) -> Option<Delivery> {
        self.queue
            .on_client_poll(session, now + self.options.poll_timeout)
            .map(|message| Delivery::Message { session, message })
    }

    /// Takes a session out of the long-poll queue.  Returns whether it was waiting.
    pub fn cancel_poll(&mut self, session: SessionId) -> bool {
        self.queue.remove_waiter(&session)
    }

    /// Forgets a session that went away.
    pub fn client_disconnected(&mut self, session: SessionId) {
        self.cancel_poll(session);
        self.connect_waiters.retain(|w| w.session != session);
    }

    /// Hands a message back after its session vanished.
    pub fn redeliver(&mut self, message: Message) -> Option<Delivery> {
        self.queue
            .requeue_front(message)
            .map(|(session, message)| Delivery::Message { session, message })
    }

    /// Evicts every waiter whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<Delivery> {
        let mut out: Vec<Delivery> = self
            .queue
            .expire(now)
            .into_iter()
            .map(|session| Delivery::Timeout { session })
            .collect();
        let (overdue, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.connect_waiters)
            .into_iter()
            .partition(|w| w.deadline <= now);
        self.connect_waiters = kept;
        for waiter in overdue {
            logwise::warn_sync!(
                "scope.Connect with tag {tag} was not answered in time",
                tag = logwise::privacy::LogIt(&waiter.tag)
            );
            out.push(Delivery::ServicesUnavailable {
                session: waiter.session,
            });
        }
        out
    }

    /// Reads from the host and routes whatever arrived.  Returns whether there was host
    /// activity along with the resulting deliveries.
    ///
    /// `/services` requests abandoned by a host teardown since the last call are answered
    /// here too.
    pub fn poll_host(&mut self) -> (bool, Vec<Delivery>) {
        let (active, mut out) = self.read_host();
        if self.orphaned.is_empty() {
            return (active, out);
        }
        let mut orphaned = std::mem::take(&mut self.orphaned);
        orphaned.append(&mut out);
        (true, orphaned)
    }

    fn read_host(&mut self) -> (bool, Vec<Delivery>) {
        let Some(host) = self.host.as_mut() else {
            return (false, Vec::new());
        };
        match host.poll() {
            Ok(events) => {
                let active = !events.is_empty();
                let mut out = Vec::new();
                for event in events {
                    self.handle_event(event, &mut out);
                }
                (active, out)
            }
            Err(HostError::Disconnected) => {
                logwise::info_sync!("host disconnected");
                self.teardown_host();
                (true, Vec::new())
            }
            Err(e) => {
                logwise::error_sync!(
                    "closing host connection: {e}",
                    e = logwise::privacy::LogIt(&e)
                );
                self.teardown_host();
                (true, Vec::new())
            }
        }
    }

    fn handle_event(&mut self, event: HostEvent, out: &mut Vec<Delivery>) {
        match event {
            HostEvent::Services {
                services,
                upgrading,
            } => {
                logwise::info_sync!(
                    "services available: {services}",
                    services = logwise::privacy::LogIt(&services)
                );
                self.enabled = services.iter().map(|s| (s.clone(), false)).collect();
                if !upgrading {
                    self.set_service_list(services);
                }
            }
            HostEvent::Upgraded { services } => {
                self.set_protocol_version(ProtocolVersion::Stp1);
                self.set_service_list(services);
            }
            HostEvent::Message(message) => {
                if let Message::Stp0(m) = &message {
                    if !self.is_service_known(&m.name) {
                        logwise::warn_sync!(
                            "dropping message for unknown service {name}",
                            name = logwise::privacy::LogIt(&m.name)
                        );
                        return;
                    }
                }
                if let Some((session, message)) = self.queue.on_host_event(message) {
                    out.push(Delivery::Message { session, message });
                }
            }
            HostEvent::ConnectAcknowledged { tag } => {
                if let Some(session) = self.take_connect_waiter(tag) {
                    out.push(Delivery::ServiceList {
                        session,
                        services: self.service_list.clone(),
                    });
                }
            }
            HostEvent::ConnectFailed { tag, .. } => {
                if let Some(session) = self.take_connect_waiter(tag) {
                    out.push(Delivery::ServicesUnavailable { session });
                }
            }
        }
    }

    fn take_connect_waiter(&mut self, tag: u32) -> Option<SessionId> {
        let index = self.connect_waiters.iter().position(|w| w.tag == tag)?;
        Some(self.connect_waiters.remove(index).session)
    }

    /// Writes pending host output.  Returns whether anything was written.
    pub fn flush_host(&mut self) -> bool {
        let Some(host) = self.host.as_mut() else {
            return false;
        };
        match host.flush() {
            Ok(wrote) => wrote,
            Err(e) => {
                logwise::error_sync!(
                    "closing host connection: {e}",
                    e = logwise::privacy::LogIt(&e)
                );
                self.teardown_host();
                true
            }
        }
    }

    fn teardown_host(&mut self) {
        if let Some(mut host) = self.host.take() {
            host.close();
        }
        self.reset();
    }

    /// Forgets everything learned from the host.
    ///
    /// Parked long-polls are left to time out.  Sessions waiting on `scope.Connect` are answered
    /// as unavailable on the next [`Scope::poll_host`].
    pub fn reset(&mut self) {
        self.service_list.clear();
        self.enabled.clear();
        self.version = ProtocolVersion::Stp0;
        self.queue.flush_pending();
        for waiter in self.connect_waiters.drain(..) {
            self.orphaned.push(Delivery::ServicesUnavailable {
                session: waiter.session,
            });
        }
    }

    pub fn pending_len(&self) -> usize {
        self.queue.pending_len()
    }

    pub fn waiting_len(&self) -> usize {
        self.queue.waiting_len()
    }

    pub fn is_waiting(&self, session: SessionId) -> bool {
        self.queue.is_waiting(&session)
    }
}
