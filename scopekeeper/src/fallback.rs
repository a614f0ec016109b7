//! Requests the proxy itself does not understand.
//!
//! Any GET outside the scope commands is handed to a [`Fallback`].  Static file serving would
//! plug in here; the proxy only ships [`NotFound`].

use crate::http::{Request, Response};
use std::fmt::Debug;

pub trait Fallback: Send + Debug {
    fn serve(&self, request: &Request) -> Response;
}

/// Answers everything with 404.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFound;

impl Fallback for NotFound {
    fn serve(&self, request: &Request) -> Response {
        Response::not_found(request.path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RequestParser;

    #[test]
    fn not_found_names_the_path() {
        let mut parser = RequestParser::new();
        parser.add_bytes(b"GET /index.html HTTP/1.1\r\n\r\n");
        let request = parser.next_request().unwrap().unwrap();
        let response = NotFound.serve(&request);
        assert_eq!(response.status, 404);
        assert_eq!(response.body, b"The server cannot handle: index.html");
    }
}
