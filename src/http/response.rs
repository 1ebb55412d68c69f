//! HTTP/1.1 response parsing using the [`httparse`] crate.
//!
//! Unlike a streaming client, a [`Response`] materializes its body into a
//! [`Bytes`] buffer up front. That makes `Response` cheap to clone, which is
//! what lets the deduplication cache hand every attached caller its own
//! independently readable copy of a single network result.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::Headers;

/// Errors that can occur while parsing an HTTP/1.1 response.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response is incomplete — more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// A fully materialized HTTP/1.1 response.
///
/// Created by [`Response::parse`] from a raw byte buffer, or constructed
/// directly by test transports. The status code is kept as a raw `u16` —
/// the deduplication layer forwards responses without interpreting them,
/// so there is nothing gained by a closed status enum here.
///
/// # Examples
///
/// ```
/// use defetch::http::Response;
///
/// let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
/// let (response, _offset) = Response::parse(raw).unwrap();
///
/// assert_eq!(response.status(), 200);
/// assert!(response.ok());
/// assert_eq!(response.text().unwrap(), "ok");
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    reason: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    body: Bytes,
}

impl Response {
    /// Maximum number of headers we support per response.
    const MAX_HEADERS: usize = 64;

    /// Parse a raw HTTP/1.1 response from a byte slice.
    ///
    /// Returns the parsed `Response` and the byte offset at which the body
    /// begins in `buf` (i.e. immediately after the `\r\n\r\n` header
    /// terminator). Everything past that offset is taken as the body; the
    /// caller is responsible for having buffered `Content-Length` bytes
    /// before calling.
    ///
    /// # Errors
    ///
    /// - [`ResponseError::Incomplete`] — more data is needed to complete the status line and headers.
    /// - [`ResponseError::Parse`] — the data is malformed and cannot be parsed.
    /// - [`ResponseError::MissingField`] — a required field (status, version) is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), ResponseError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_res = httparse::Response::new(&mut headers);

        let body_offset = match raw_res.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(ResponseError::Incomplete),
        };

        let status = raw_res
            .code
            .ok_or(ResponseError::MissingField { field: "status" })?;

        let version = raw_res
            .version
            .ok_or(ResponseError::MissingField { field: "version" })?;

        let reason = raw_res.reason.unwrap_or("").to_owned();

        let mut header_map = Headers::with_capacity(raw_res.headers.len());
        for header in raw_res.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let body = Bytes::copy_from_slice(&buf[body_offset..]);

        Ok((
            Self {
                status,
                reason,
                version,
                headers: header_map,
                body,
            },
            body_offset,
        ))
    }

    /// Builds a response directly from its parts. Primarily for test
    /// transports that never touch the wire.
    pub fn from_parts(status: u16, headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            reason: String::new(),
            version: 1,
            headers,
            body: body.into(),
        }
    }

    /// Returns the raw numeric status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns `true` if the status code is in the 2xx range.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns the reason phrase sent by the server (may be empty).
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.parse().ok()
    }

    /// Reads the body as UTF-8 text.
    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }

    /// Deserializes the body as JSON into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}
