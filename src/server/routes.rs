//! Upgrade route table
//!
//! The set of request paths the server will upgrade to WebSocket. Built once
//! and handed to the server at construction.

use std::collections::BTreeSet;

use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

/// Default upgrade path
pub const LIVESTREAM_PATH: &str = "/live/livestream.flv";

/// Written verbatim to plain HTTP requests for unregistered paths
pub const NOT_FOUND_RESPONSE: &[u8] = b"HTTP/1.1 404 Not Found\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: 19\r\n\
Connection: close\r\n\
\r\n\
404 page not found\n";

/// Outcome of parsing the start of a connection as an HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestHead {
    /// Full request head; `path` has the query string removed
    Complete { path: String, len: usize },
    /// More bytes are needed
    Partial,
    /// Not an HTTP/1.x request
    Invalid,
}

/// Parse the request line and headers out of peeked bytes
pub fn parse_request_head(data: &[u8]) -> RequestHead {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(data) {
        Ok(httparse::Status::Complete(len)) => match req.path {
            Some(path) => {
                let path = path.split_once('?').map_or(path, |(path, _)| path);
                RequestHead::Complete {
                    path: path.to_string(),
                    len,
                }
            }
            None => RequestHead::Invalid,
        },
        Ok(httparse::Status::Partial) => RequestHead::Partial,
        Err(_) => RequestHead::Invalid,
    }
}

/// Paths accepted for the WebSocket handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    paths: BTreeSet<String>,
}

impl RouteTable {
    /// Create an empty route table
    pub fn new() -> Self {
        Self::default()
    }

    /// Route table with only the livestream path registered
    pub fn livestream() -> Self {
        Self::new().with_route(LIVESTREAM_PATH)
    }

    /// Register an upgrade path
    pub fn with_route(mut self, path: impl Into<String>) -> Self {
        self.paths.insert(path.into());
        self
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    /// Registered paths in sorted order
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    /// Handshake callback: accept registered paths, answer 404 otherwise.
    pub fn check(&self, request: &Request, response: Response) -> Result<Response, ErrorResponse> {
        if self.contains(request.uri().path()) {
            return Ok(response);
        }

        let mut rejection = ErrorResponse::new(Some("404 page not found".to_string()));
        *rejection.status_mut() = StatusCode::NOT_FOUND;
        Err(rejection)
    }
}
