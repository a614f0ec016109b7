//! One HTTP client connection.
//!
//! The first path segment names a command (`/services`, `/enable/<service>`, `/get-message`,
//! `/post-command/...`).  A command either answers at once or parks the session until the
//! router produces a [`Delivery`] for it.  While parked, further pipelined requests stay in the
//! parser's buffer.

use crate::fallback::Fallback;
use crate::host::ProtocolVersion;
use crate::http::{Method, ParseError, Request, RequestParser, Response, escape_xml};
use crate::scope::{Delivery, Scope, ScopeError, SessionId};
use crate::transport::{OutBuffer, Transport, drain_readable};
use scopekeeper_internal::message::{Format, Message, Stp0Message, Stp1Message};
use std::time::Instant;

const XML_PRELUDE: &str = "<?xml version=\"1.0\"?>";

/// What the session is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Ready for the next request.
    Idle,
    /// Parked in the rendezvous queue.
    AwaitingMessage,
    /// Parked until the host acknowledges `scope.Connect`.
    AwaitingServiceList,
}

/// A request that could not be served.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("cannot handle {0}")]
    NotFound(String),
    #[error(transparent)]
    Scope(#[from] ScopeError),
}

impl RequestError {
    pub fn to_response(&self) -> Response {
        match self {
            RequestError::NotFound(what) => Response::not_found(what),
            RequestError::BadRequest(_) | RequestError::Scope(_) => Response::bad_request(),
        }
    }
}

enum Reply {
    Now(Response),
    Parked(SessionState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Get,
    Post,
}

type Handler = fn(&mut Scope, &Request, &[&str], SessionId, Instant) -> Result<Reply, RequestError>;

/// Command names, with the method each expects.  Lookups are made after `_` and `.` have been
/// turned into `-`.
const COMMANDS: &[(&str, Verb, Handler)] = &[
    ("services", Verb::Get, services),
    ("enable", Verb::Get, enable),
    ("get-message", Verb::Get, get_message),
    ("scope-message", Verb::Get, get_message),
    ("post-command", Verb::Post, post_command),
    ("send-command", Verb::Post, post_command),
];

fn lookup(name: &str) -> Option<(Verb, Handler)> {
    let normalized = name.replace(['_', '.'], "-");
    COMMANDS
        .iter()
        .find(|(n, _, _)| *n == normalized)
        .map(|&(_, verb, handler)| (verb, handler))
}

fn services(
    scope: &mut Scope,
    _request: &Request,
    _args: &[&str],
    session: SessionId,
    now: Instant,
) -> Result<Reply, RequestError> {
    if scope.waiting_len() > 0 {
        logwise::warn_sync!("service list requested while clients are still waiting");
    }
    Ok(match scope.return_service_list(session, now) {
        Some(delivery) => Reply::Now(render_delivery(&delivery, scope.options().format)),
        None => Reply::Parked(SessionState::AwaitingServiceList),
    })
}

fn enable(
    scope: &mut Scope,
    _request: &Request,
    args: &[&str],
    _session: SessionId,
    _now: Instant,
) -> Result<Reply, RequestError> {
    let [service] = args else {
        return Err(RequestError::BadRequest("enable takes one service name".into()));
    };
    scope.enable_service(service)?;
    Ok(Reply::Now(Response::scope_xml("<ok/>")))
}

fn get_message(
    scope: &mut Scope,
    _request: &Request,
    _args: &[&str],
    session: SessionId,
    now: Instant,
) -> Result<Reply, RequestError> {
    Ok(match scope.poll_message(session, now) {
        Some(delivery) => Reply::Now(render_delivery(&delivery, scope.options().format)),
        None => Reply::Parked(SessionState::AwaitingMessage),
    })
}

fn post_command(
    scope: &mut Scope,
    request: &Request,
    args: &[&str],
    _session: SessionId,
    _now: Instant,
) -> Result<Reply, RequestError> {
    let message = match scope.version() {
        ProtocolVersion::Stp0 => {
            let [service, ..] = args else {
                return Err(RequestError::BadRequest("missing service name".into()));
            };
            let body = std::str::from_utf8(&request.body)
                .map_err(|_| RequestError::BadRequest("STP/0 payload is not UTF-8".into()))?;
            Message::from(Stp0Message::new(*service, with_xml_prelude(body)))
        }
        ProtocolVersion::Stp1 => {
            let [service, command_id, tag] = args else {
                return Err(RequestError::BadRequest(
                    "expected /post-command/<service>/<command-id>/<tag>".into(),
                ));
            };
            let command_id: u32 = command_id
                .parse()
                .map_err(|_| RequestError::BadRequest(format!("bad command id {command_id}")))?;
            let tag: u32 = tag
                .parse()
                .map_err(|_| RequestError::BadRequest(format!("bad tag {tag}")))?;
            Message::from(Stp1Message::command(
                *service,
                command_id,
                scope.options().format,
                tag,
                request.body.clone(),
            ))
        }
    };
    scope.send_command(message)?;
    Ok(Reply::Now(Response::scope_xml("<ok/>")))
}

fn with_xml_prelude(body: &str) -> String {
    if body.starts_with("<?xml") || body.starts_with("STP/1") {
        body.to_string()
    } else {
        format!("{XML_PRELUDE}{body}")
    }
}

/// `<services><service name="a"/>...</services>`
pub fn render_service_list(services: &[String]) -> Response {
    let mut body = String::from("<services>");
    for service in services {
        body.push_str(&format!("<service name=\"{}\"/>", escape_xml(service)));
    }
    body.push_str("</services>");
    Response::scope_xml(body)
}

/// Renders a host message with its envelope in `X-Scope-Message-*` headers.
pub fn render_message(message: &Message, format: Format) -> Response {
    let response = Response::new(200, "OK").with_header("Cache-Control", "no-cache");
    match message {
        Message::Stp0(m) => response
            .with_header("X-Scope-Message-Service", &m.name)
            .with_header("Content-Type", "application/xml")
            .with_body(m.payload.as_bytes()),
        Message::Stp1(m) => {
            let content_type = match format {
                Format::Json => "application/json",
                _ => "text/plain",
            };
            // an empty body would be read as "no content" by the client
            let body = if m.payload.is_empty() {
                b" ".to_vec()
            } else {
                m.payload.clone()
            };
            response
                .with_header("X-Scope-Message-Service", &m.service)
                .with_header("X-Scope-Message-Command", m.command_id)
                .with_header("X-Scope-Message-Status", m.status.unwrap_or(0))
                .with_header("X-Scope-Message-Tag", m.tag.unwrap_or(0))
                .with_header("Content-Type", content_type)
                .with_body(body)
        }
    }
}

pub fn render_delivery(delivery: &Delivery, format: Format) -> Response {
    match delivery {
        Delivery::Message { message, .. } => render_message(message, format),
        Delivery::Timeout { .. } => Response::scope_xml("<timeout/>"),
        Delivery::ServiceList { services, .. } => render_service_list(services),
        Delivery::ServicesUnavailable { .. } => Response::not_found("services"),
    }
}

#[derive(Debug)]
pub struct ClientSession {
    id: SessionId,
    transport: Box<dyn Transport>,
    parser: RequestParser,
    out: OutBuffer,
    state: SessionState,
    keep_alive: bool,
    close_after_write: bool,
    closed: bool,
    /// A delivered message whose response has not been fully written yet.
    in_flight: Option<Message>,
}

impl ClientSession {
    pub fn new(id: SessionId, transport: Box<dyn Transport>) -> ClientSession {
        ClientSession {
            id,
            transport,
            parser: RequestParser::new(),
            out: OutBuffer::new(),
            state: SessionState::Idle,
            keep_alive: true,
            close_after_write: false,
            closed: false,
            in_flight: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reads new bytes and serves every complete request while the session is idle.
    /// Returns whether anything happened.
    pub fn process(&mut self, scope: &mut Scope, fallback: &dyn Fallback, now: Instant) -> bool {
        if self.closed {
            return false;
        }
        let mut did_stuff = false;
        match drain_readable(self.transport.as_mut(), |bytes| self.parser.add_bytes(bytes)) {
            Ok(got) => did_stuff |= got,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    logwise::warn_sync!(
                        "client {id} read error: {e}",
                        id = logwise::privacy::LogIt(&self.id),
                        e = logwise::privacy::LogIt(&e)
                    );
                }
                self.closed = true;
                return true;
            }
        }
        while self.state == SessionState::Idle && !self.close_after_write {
            match self.parser.next_request() {
                Ok(Some(request)) => {
                    did_stuff = true;
                    self.handle(scope, fallback, request, now);
                }
                Ok(None) => break,
                Err(e) => {
                    did_stuff = true;
                    self.reject(e);
                }
            }
        }
        did_stuff
    }

    fn reject(&mut self, error: ParseError) {
        logwise::warn_sync!(
            "client {id} sent a malformed request: {error}",
            id = logwise::privacy::LogIt(&self.id),
            error = logwise::privacy::LogIt(&error)
        );
        self.keep_alive = false;
        self.send(Response::bad_request());
    }

    fn handle(&mut self, scope: &mut Scope, fallback: &dyn Fallback, request: Request, now: Instant) {
        self.keep_alive = request.keep_alive();
        match self.dispatch(scope, fallback, &request, now) {
            Ok(Reply::Now(response)) => self.send(response),
            Ok(Reply::Parked(state)) => self.state = state,
            Err(e) => {
                logwise::warn_sync!(
                    "{method} {path} failed: {e}",
                    method = logwise::privacy::LogIt(&request.method),
                    path = logwise::privacy::LogIt(&request.path),
                    e = logwise::privacy::LogIt(&e)
                );
                self.send(e.to_response());
            }
        }
    }

    fn dispatch(
        &mut self,
        scope: &mut Scope,
        fallback: &dyn Fallback,
        request: &Request,
        now: Instant,
    ) -> Result<Reply, RequestError> {
        let verb = match request.method {
            Method::Get => Verb::Get,
            Method::Post => Verb::Post,
            Method::Other(ref method) => return Err(RequestError::NotFound(method.clone())),
        };
        let segments = request.segments();
        let (name, args) = match segments.split_first() {
            Some((name, args)) => (*name, args),
            None => ("", &[][..]),
        };
        match lookup(name) {
            Some((expected, handler)) if expected == verb => {
                handler(scope, request, args, self.id, now)
            }
            Some(_) => Err(RequestError::BadRequest(format!(
                "{name} does not accept {}",
                request.method.as_str()
            ))),
            None if verb == Verb::Get => Ok(Reply::Now(fallback.serve(request))),
            None => Err(RequestError::BadRequest(format!("unknown command {name}"))),
        }
    }

    /// Answers a parked request.  A message that arrives for a session that is not waiting for
    /// one is handed back.
    pub fn deliver(&mut self, delivery: Delivery, format: Format, debug: bool) -> Option<Message> {
        let expected = match &delivery {
            Delivery::Message { .. } | Delivery::Timeout { .. } => SessionState::AwaitingMessage,
            Delivery::ServiceList { .. } | Delivery::ServicesUnavailable { .. } => {
                SessionState::AwaitingServiceList
            }
        };
        if self.closed || self.state != expected {
            return match delivery {
                Delivery::Message { message, .. } => Some(message),
                _ => None,
            };
        }
        if debug {
            if let Delivery::Message { message, .. } = &delivery {
                logwise::info_sync!(
                    "send to client {id}: {message}",
                    id = logwise::privacy::LogIt(&self.id),
                    message = logwise::privacy::LogIt(message)
                );
            }
        }
        self.send(render_delivery(&delivery, format));
        if let Delivery::Message { message, .. } = delivery {
            self.in_flight = Some(message);
        }
        None
    }

    /// The last delivered message, if the session closed before its response was written out.
    pub fn take_undelivered(&mut self) -> Option<Message> {
        self.in_flight.take()
    }

    fn send(&mut self, response: Response) {
        self.out.push(&response.to_bytes());
        self.state = SessionState::Idle;
        if !self.keep_alive {
            self.close_after_write = true;
        }
    }

    /// Writes pending output.  Returns whether anything was written.
    pub fn flush(&mut self) -> bool {
        if self.closed {
            return false;
        }
        let wrote = match self.out.write_to(self.transport.as_mut()) {
            Ok(wrote) => wrote,
            Err(e) => {
                logwise::warn_sync!(
                    "client {id} write error: {e}",
                    id = logwise::privacy::LogIt(&self.id),
                    e = logwise::privacy::LogIt(&e)
                );
                self.closed = true;
                return true;
            }
        };
        if self.out.is_empty() {
            self.in_flight = None;
            if self.close_after_write {
                self.close();
            }
        }
        wrote
    }

    pub fn close(&mut self) {
        self.transport.shutdown();
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::NotFound;
    use crate::scope::ScopeOptions;
    use crate::transport::memory::MemoryTransport;
    use scopekeeper_internal::message::MessageType;
    use scopekeeper_internal::wire::{UPGRADE_TOKEN, stp0, stp1};

    struct Harness {
        scope: Scope,
        host: MemoryTransport,
        client: MemoryTransport,
        session: ClientSession,
    }

    impl Harness {
        fn new(services: &str, upgrade: bool) -> Harness {
            let mut scope = Scope::new(ScopeOptions::default());
            let host = MemoryTransport::new();
            scope.set_host(Box::new(host.clone()));
            host.feed(&stp0::encode_text(&format!("*services {services}")));
            scope.poll_host();
            if upgrade {
                scope.flush_host();
                host.feed(UPGRADE_TOKEN);
                scope.poll_host();
            }
            scope.flush_host();
            host.take_written();
            let client = MemoryTransport::new();
            let session = ClientSession::new(SessionId(1), Box::new(client.clone()));
            Harness {
                scope,
                host,
                client,
                session,
            }
        }

        fn request(&mut self, raw: &str) -> String {
            self.client.feed(raw.as_bytes());
            self.session
                .process(&mut self.scope, &NotFound, Instant::now());
            self.session.flush();
            String::from_utf8(self.client.take_written()).unwrap()
        }
    }

    #[test]
    fn stp0_services_and_enable() {
        let mut h = Harness::new("console-logger,window-manager", false);
        let text = h.request("GET /services HTTP/1.1\r\n\r\n");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with(
            "<services><service name=\"console-logger\"/><service name=\"window-manager\"/></services>"
        ));

        let text = h.request("GET /enable/console-logger HTTP/1.1\r\n\r\n");
        assert!(text.ends_with("<ok/>"));
        h.scope.flush_host();
        assert_eq!(
            h.host.take_written(),
            stp0::encode_text("*enable console-logger")
        );
        // enabling twice is fine
        let text = h.request("GET /enable/console-logger HTTP/1.1\r\n\r\n");
        assert!(text.ends_with("<ok/>"));
    }

    #[test]
    fn stp0_post_adds_prelude() {
        let mut h = Harness::new("console-logger", false);
        h.request("GET /enable/console-logger HTTP/1.1\r\n\r\n");
        h.scope.flush_host();
        h.host.take_written();
        let text = h.request(
            "POST /post-command/console-logger HTTP/1.1\r\nContent-Length: 4\r\n\r\n<x/>",
        );
        assert!(text.ends_with("<ok/>"));
        h.scope.flush_host();
        assert_eq!(
            h.host.take_written(),
            stp0::encode_text("console-logger <?xml version=\"1.0\"?><x/>")
        );
    }

    #[test]
    fn post_to_disabled_service_is_rejected() {
        let mut h = Harness::new("console-logger", false);
        let text = h.request(
            "POST /post-command/unknown-service HTTP/1.1\r\nContent-Length: 4\r\n\r\n<x/>",
        );
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        let text = h.request(
            "POST /post-command/console-logger HTTP/1.1\r\nContent-Length: 4\r\n\r\n<x/>",
        );
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        h.scope.flush_host();
        assert!(h.host.take_written().is_empty());
    }

    #[test]
    fn long_poll_parks_then_delivers() {
        let mut h = Harness::new("console-logger", false);
        assert_eq!(h.request("GET /get-message HTTP/1.1\r\n\r\n"), "");
        assert_eq!(h.session.state(), SessionState::AwaitingMessage);

        h.host.feed(&stp0::encode_text("console-logger <hello/>"));
        let (_, deliveries) = h.scope.poll_host();
        for delivery in deliveries {
            assert_eq!(delivery.session(), SessionId(1));
            assert!(h.session.deliver(delivery, Format::Json, false).is_none());
        }
        h.session.flush();
        let text = String::from_utf8(h.client.take_written()).unwrap();
        assert!(text.contains("\r\nX-Scope-Message-Service: console-logger\r\n"));
        assert!(text.contains("\r\nContent-Type: application/xml\r\n"));
        assert!(text.ends_with("\r\n\r\n<hello/>"));
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[test]
    fn pipelined_request_waits_for_parked_one() {
        let mut h = Harness::new("console-logger", false);
        let text = h.request("GET /get-message HTTP/1.1\r\n\r\nGET /services HTTP/1.1\r\n\r\n");
        assert_eq!(text, "");
        let expired = h.scope.expire(Instant::now() + std::time::Duration::from_secs(60));
        for delivery in expired {
            h.session.deliver(delivery, Format::Json, false);
        }
        // the buffered /services request is served on the next pass
        h.session.process(&mut h.scope, &NotFound, Instant::now());
        h.session.flush();
        let text = String::from_utf8(h.client.take_written()).unwrap();
        assert!(text.contains("<timeout/>"));
        assert!(text.ends_with("</services>"));
    }

    #[test]
    fn stp1_message_headers() {
        let mut h = Harness::new("scope,console-logger,stp-1", true);
        h.request("GET /scope_message HTTP/1.1\r\n\r\n");
        let event = Stp1Message {
            message_type: MessageType::Event,
            service: "console-logger".into(),
            command_id: 14,
            format: Format::Json,
            status: None,
            tag: None,
            client_id: None,
            uuid: None,
            payload: Vec::new(),
        };
        h.host.feed(&stp1::encode_message(&event));
        let (_, deliveries) = h.scope.poll_host();
        for delivery in deliveries {
            h.session.deliver(delivery, Format::Json, false);
        }
        h.session.flush();
        let text = String::from_utf8(h.client.take_written()).unwrap();
        assert!(text.contains("\r\nX-Scope-Message-Service: console-logger\r\n"));
        assert!(text.contains("\r\nX-Scope-Message-Command: 14\r\n"));
        assert!(text.contains("\r\nX-Scope-Message-Status: 0\r\n"));
        assert!(text.contains("\r\nX-Scope-Message-Tag: 0\r\n"));
        assert!(text.contains("\r\nContent-Type: application/json\r\n"));
        assert!(text.ends_with("Content-Length: 1\r\n\r\n "));
    }

    #[test]
    fn stp1_post_command_path() {
        let mut h = Harness::new("scope,console-logger,stp-1", true);
        let text = h.request(
            "POST /send-command/console-logger/3/7 HTTP/1.1\r\nContent-Length: 2\r\n\r\n[]",
        );
        assert!(text.ends_with("<ok/>"), "{text}");
        h.scope.flush_host();
        let mut reader = stp1::Stp1Reader::new();
        reader.add_bytes(&h.host.take_written());
        let sent = reader.next_message().unwrap().unwrap();
        assert_eq!(sent.service, "console-logger");
        assert_eq!(sent.command_id, 3);
        assert_eq!(sent.tag, Some(7));
        assert_eq!(sent.payload, b"[]");

        let text = h.request(
            "POST /post-command/console-logger/x/7 HTTP/1.1\r\nContent-Length: 2\r\n\r\n[]",
        );
        assert!(text.starts_with("HTTP/1.1 400 "));
    }

    #[test]
    fn unknown_requests() {
        let mut h = Harness::new("console-logger", false);
        let text = h.request("GET /index.html?v=2 HTTP/1.1\r\n\r\n");
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.ends_with("The server cannot handle: index.html"));

        let text = h.request("POST /nope HTTP/1.1\r\nContent-Length: 0\r\n\r\n");
        assert!(text.starts_with("HTTP/1.1 400 "));

        let text = h.request("DELETE /services HTTP/1.1\r\n\r\n");
        assert!(text.ends_with("The server cannot handle: DELETE"));

        let text = h.request("POST /services HTTP/1.1\r\nContent-Length: 0\r\n\r\n");
        assert!(text.starts_with("HTTP/1.1 400 "));
    }

    #[test]
    fn malformed_request_closes() {
        let mut h = Harness::new("console-logger", false);
        let text = h.request("garbage\r\n\r\n");
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(h.session.is_closed());
        assert!(h.client.is_shut_down());
    }

    #[test]
    fn connection_close_is_honoured() {
        let mut h = Harness::new("console-logger", false);
        let text = h.request("GET /services HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(text.contains("<services>"));
        assert!(h.session.is_closed());
    }

    #[test]
    fn late_message_is_handed_back() {
        let mut h = Harness::new("console-logger", false);
        let message = Message::from(Stp0Message::new("console-logger", "<x/>"));
        let returned = h.session.deliver(
            Delivery::Message {
                session: SessionId(1),
                message: message.clone(),
            },
            Format::Json,
            false,
        );
        assert_eq!(returned, Some(message));
    }

    #[test]
    fn message_is_kept_when_client_leaves_before_write() {
        let mut h = Harness::new("console-logger", false);
        h.request("GET /get-message HTTP/1.1\r\n\r\n");
        let message = Message::from(Stp0Message::new("console-logger", "<x/>"));
        let delivery = Delivery::Message {
            session: SessionId(1),
            message: message.clone(),
        };
        assert!(h.session.deliver(delivery, Format::Json, false).is_none());

        // EOF is seen before the response goes out
        h.client.close();
        h.session.process(&mut h.scope, &NotFound, Instant::now());
        assert!(h.session.is_closed());
        assert!(!h.session.flush());
        assert_eq!(h.session.take_undelivered(), Some(message));
        assert_eq!(h.session.take_undelivered(), None);
    }

    #[test]
    fn written_message_is_not_kept() {
        let mut h = Harness::new("console-logger", false);
        h.request("GET /get-message HTTP/1.1\r\n\r\n");
        let delivery = Delivery::Message {
            session: SessionId(1),
            message: Stp0Message::new("console-logger", "<x/>").into(),
        };
        h.session.deliver(delivery, Format::Json, false);
        h.session.flush();
        assert!(h.client.take_written().ends_with(b"<x/>"));
        h.client.close();
        h.session.process(&mut h.scope, &NotFound, Instant::now());
        assert_eq!(h.session.take_undelivered(), None);
    }

    #[test]
    fn alias_lookup() {
        assert!(lookup("get_message").is_some());
        assert!(lookup("scope.message").is_some());
        assert!(lookup("post_command").is_some());
        assert!(lookup("send_command").is_some());
        assert!(lookup("frobnicate").is_none());
    }
}
