//! Request and response values carried through the pool.
//!
//! The pool never interprets these beyond reading the request target to pick a
//! pool; header and body semantics belong to the codec and the caller.

use bytes::Bytes;

/// An outgoing request with an absolute target URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: String,
    uri: String,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Request {
    /// Create a request with the given method and target.
    pub fn new(method: &str, uri: impl Into<String>) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            uri: uri.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Shorthand for a `GET` request.
    pub fn get(uri: impl Into<String>) -> Self {
        Self::new("GET", uri)
    }

    /// Shorthand for a `POST` request with a body.
    pub fn post(uri: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new("POST", uri).with_body(body)
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Request method, upper-cased.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Target URI as given by the caller.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Request headers as (name, value) pairs.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Request body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// A response produced by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Response {
    /// Create a response with the given status and no headers or body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Create a response from its parts.
    pub fn from_parts(status: u16, headers: Vec<(String, String)>, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Status code (e.g. 200, 503).
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Whether the server answered with a 5xx status.
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }

    /// Response headers as (name, value) pairs.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Reference to the body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consume the response and return the body bytes.
    pub fn into_body(self) -> Bytes {
        self.body
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
