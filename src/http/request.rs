//! Outgoing HTTP request builder.
//!
//! A [`Request`] is the logical description of one network call: method,
//! absolute URL, headers, and an optional JSON body. It is deliberately
//! transport-agnostic — wire framing belongs to the transport that sends it.

use bytes::Bytes;
use serde_json::Value;

use super::{Headers, Method};

/// An outgoing HTTP request, ready to be handed to a transport.
///
/// # Examples
///
/// ```
/// use defetch::http::{Method, Request};
/// use serde_json::json;
///
/// let request = Request::new(Method::Post, "http://localhost:8080/api/tasks")
///     .header("Authorization", "Bearer token")
///     .json(&json!({"title": "write docs"}));
///
/// assert_eq!(request.method().as_str(), "POST");
/// assert_eq!(request.url(), "http://localhost:8080/api/tasks");
/// assert!(request.body().is_some());
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: String,
    headers: Headers,
    body: Option<Bytes>,
}

impl Request {
    /// Creates a new request with the given method and URL and no body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// Appends a request header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the header map wholesale. Used by the cache gateway to carry
    /// caller-supplied headers through unchanged.
    #[must_use]
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Sets a JSON body.
    ///
    /// Serializing a [`Value`] cannot fail, so this stays infallible. The
    /// `Content-Type` header is written by the transport at framing time.
    #[must_use]
    pub fn json(mut self, body: &Value) -> Self {
        self.body = Some(Bytes::from(body.to_string()));
        self
    }

    /// Sets the request body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the absolute URL this request targets.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the request headers.
    pub fn header_map(&self) -> &Headers {
        &self.headers
    }

    /// Returns the request body bytes, if any.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }
}
