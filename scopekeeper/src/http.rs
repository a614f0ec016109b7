//! Just enough HTTP/1.1 for the long-poll interface.
//!
//! Requests are parsed incrementally from whatever the socket has delivered so far; responses
//! are always complete (`Content-Length`, no chunking).

use scopekeeper_internal::wire::InFlightBuffer;

/// Longest request line plus header block we accept.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;
/// Largest request body we accept.
pub const MAX_BODY_BYTES: usize = scopekeeper_internal::wire::MAX_FRAME_LEN;

/// Value of the `Server` header.
pub const SERVER_NAME: &str = concat!("Scopekeeper/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other(String),
}

impl Method {
    fn parse(s: &str) -> Method {
        match s {
            "GET" => Method::Get,
            "POST" => Method::Post,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Other(s) => s.as_str(),
        }
    }
}

/// A fully received request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// The path with any query string removed.
    pub path: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Path segments with empty ones removed: `/post-command/a/1/2` → `["post-command", "a", "1", "2"]`.
    pub fn segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// Whether the client wants the connection kept after this exchange.
    pub fn keep_alive(&self) -> bool {
        match self.header("Connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version != "HTTP/1.0",
        }
    }
}

/// Malformed HTTP framing.  The connection cannot be trusted after any of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request line: {0}")]
    BadRequestLine(String),
    #[error("malformed header line: {0}")]
    BadHeader(String),
    #[error("invalid Content-Length: {0}")]
    BadContentLength(String),
    #[error("unsupported Transfer-Encoding: {0}")]
    UnsupportedTransferEncoding(String),
    #[error("request headers are too large")]
    HeadersTooLarge,
    #[error("request body of {0} bytes is too large")]
    BodyTooLarge(usize),
}

#[derive(Debug)]
enum ParseState {
    Method,
    Headers(Request),
    Body(Request, usize),
}

/// Incremental request parser.  Handles pipelined requests: bytes after one request stay
/// buffered for the next.
#[derive(Debug)]
pub struct RequestParser {
    buf: InFlightBuffer,
    state: ParseState,
    header_bytes: usize,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

fn take_line(buf: &mut InFlightBuffer) -> Result<Option<String>, ParseError> {
    let unread = buf.unread();
    let Some(pos) = unread.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    let line = &unread[..pos];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let line = String::from_utf8(line.to_vec())
        .map_err(|_| ParseError::BadHeader(String::from_utf8_lossy(line).into_owned()))?;
    buf.consume(pos + 1);
    Ok(Some(line))
}

impl RequestParser {
    pub fn new() -> RequestParser {
        RequestParser {
            buf: InFlightBuffer::new(),
            state: ParseState::Method,
            header_bytes: 0,
        }
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.buf.add_bytes(bytes);
    }

    /// True between requests with nothing buffered.
    #[cfg(test)]
    fn is_idle(&self) -> bool {
        matches!(self.state, ParseState::Method) && self.buf.is_empty()
    }

    /// Pops the next complete request, or `Ok(None)` if more bytes are needed.
    pub fn next_request(&mut self) -> Result<Option<Request>, ParseError> {
        loop {
            match std::mem::replace(&mut self.state, ParseState::Method) {
                ParseState::Method => {
                    let before = self.buf.len();
                    let Some(line) = take_line(&mut self.buf)? else {
                        return self.check_header_limit(before).map(|_| None);
                    };
                    self.header_bytes = before - self.buf.len();
                    // stray CRLFs between requests are allowed
                    if line.is_empty() {
                        continue;
                    }
                    self.state = ParseState::Headers(parse_request_line(&line)?);
                }
                ParseState::Headers(mut request) => {
                    let before = self.buf.len();
                    let Some(line) = take_line(&mut self.buf)? else {
                        self.state = ParseState::Headers(request);
                        return self.check_header_limit(before).map(|_| None);
                    };
                    self.header_bytes += before - self.buf.len();
                    if self.header_bytes > MAX_HEADER_BYTES {
                        return Err(ParseError::HeadersTooLarge);
                    }
                    if line.is_empty() {
                        let len = body_length(&request)?;
                        self.state = ParseState::Body(request, len);
                        continue;
                    }
                    let Some((name, value)) = line.split_once(':') else {
                        return Err(ParseError::BadHeader(line));
                    };
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(ParseError::BadHeader(line));
                    }
                    request
                        .headers
                        .push((name.to_string(), value.trim().to_string()));
                    self.state = ParseState::Headers(request);
                }
                ParseState::Body(mut request, len) => {
                    if self.buf.len() < len {
                        self.state = ParseState::Body(request, len);
                        return Ok(None);
                    }
                    request.body = self.buf.unread()[..len].to_vec();
                    self.buf.consume(len);
                    self.header_bytes = 0;
                    return Ok(Some(request));
                }
            }
        }
    }

    fn check_header_limit(&self, pending: usize) -> Result<(), ParseError> {
        if self.header_bytes + pending > MAX_HEADER_BYTES {
            Err(ParseError::HeadersTooLarge)
        } else {
            Ok(())
        }
    }
}

fn parse_request_line(line: &str) -> Result<Request, ParseError> {
    let mut parts = line.split_ascii_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::BadRequestLine(line.to_string()));
    };
    if !version.starts_with("HTTP/") {
        return Err(ParseError::BadRequestLine(line.to_string()));
    }
    let path = target.split_once('?').map_or(target, |(path, _)| path);
    Ok(Request {
        method: Method::parse(method),
        path: path.to_string(),
        version: version.to_string(),
        headers: Vec::new(),
        body: Vec::new(),
    })
}

fn body_length(request: &Request) -> Result<usize, ParseError> {
    if let Some(encoding) = request.header("Transfer-Encoding") {
        if !encoding.eq_ignore_ascii_case("identity") {
            return Err(ParseError::UnsupportedTransferEncoding(encoding.to_string()));
        }
    }
    let Some(value) = request.header("Content-Length") else {
        return Ok(0);
    };
    let len: usize = value
        .parse()
        .map_err(|_| ParseError::BadContentLength(value.to_string()))?;
    if len > MAX_BODY_BYTES {
        return Err(ParseError::BodyTooLarge(len));
    }
    Ok(len)
}

/// An HTTP response, rendered in one piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, reason: &'static str) -> Response {
        Response {
            status,
            reason,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// `200 OK` with an XML body and `Cache-Control: no-cache`, the shape of every scope reply.
    pub fn scope_xml(body: impl Into<Vec<u8>>) -> Response {
        Response::new(200, "OK")
            .with_header("Cache-Control", "no-cache")
            .with_header("Content-Type", "application/xml")
            .with_body(body)
    }

    pub fn bad_request() -> Response {
        Response::new(400, "Bad Request")
    }

    /// The "cannot handle" reply for requests nothing is able to answer.
    pub fn not_found(what: &str) -> Response {
        Response::new(404, "Not Found")
            .with_header("Content-Type", "text/plain")
            .with_body(format!("The server cannot handle: {what}"))
    }

    pub fn with_header(mut self, name: &str, value: impl ToString) -> Response {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Response {
        self.body = body.into();
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nDate: {date}\r\nServer: {SERVER_NAME}\r\n",
            self.status, self.reason
        );
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// Escapes text for use inside an XML attribute.
pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
