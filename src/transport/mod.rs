//! Network transport seam.
//!
//! The deduplication cache never talks to the network directly — it hands a
//! [`Request`] to a [`Transport`] and awaits the outcome. The contract every
//! transport must honor:
//!
//! - the cancellation token aborts the exchange promptly, surfacing
//!   [`TransportError::Aborted`];
//! - the returned [`Response`] is fully materialized, so every clone the
//!   cache hands out is independently readable;
//! - non-2xx responses are returned, not raised — interpreting status codes
//!   is the caller's business.
//!
//! [`TcpTransport`] is the built-in HTTP/1.1-over-TCP implementation. Test
//! suites usually substitute their own in-memory transport instead.

use std::fmt;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::http::{Request, Response, response::ResponseError};

/// Errors produced by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Url(#[from] UrlError),

    #[error("connection to {authority} failed: {source}")]
    Connect {
        authority: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    Response(#[from] ResponseError),

    #[error("connection closed before a complete response was received")]
    Truncated,

    #[error("response exceeds maximum allowed size of {max_bytes} bytes")]
    ResponseTooLarge { max_bytes: usize },

    #[error("request aborted by cancellation")]
    Aborted,
}

/// An asynchronous request/response exchange.
///
/// Implementations must be cheap to share behind an `Arc` — the cache clones
/// its transport handle into every spawned call.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs one request/response exchange.
    ///
    /// Must return [`TransportError::Aborted`] promptly once `cancel` fires,
    /// even mid-exchange.
    async fn send(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<Response, TransportError>;
}

/// Maximum size of a complete HTTP response we will buffer before rejecting it (8 MiB).
const MAX_RESPONSE_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per exchange.
const INITIAL_BUF_SIZE: usize = 4096;

/// HTTP/1.1 over plain TCP, one connection per exchange.
///
/// Deliberately minimal: `http://` URLs only, `Connection: close` framing,
/// bodies delimited by `Content-Length` or end-of-stream. The deduplication
/// layer collapses request volume enough that connection reuse has not been
/// worth the added state.
///
/// # Examples
///
/// ```rust,no_run
/// use defetch::http::{Method, Request};
/// use defetch::transport::{TcpTransport, Transport};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let transport = TcpTransport::new();
///     let request = Request::new(Method::Get, "http://localhost:8080/api/boards");
///     let response = transport.send(request, CancellationToken::new()).await?;
///     println!("{}", response.status());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    /// Creates a new TCP transport.
    pub fn new() -> Self {
        Self
    }

    /// Runs the exchange to completion, without cancellation handling.
    async fn exchange(&self, request: Request) -> Result<Response, TransportError> {
        let url = Url::parse(request.url())?;
        let authority = url.authority();

        let mut stream =
            TcpStream::connect((url.host(), url.port()))
                .await
                .map_err(|e| TransportError::Connect {
                    authority: authority.clone(),
                    source: e,
                })?;

        debug!(authority = %authority, method = %request.method(), "connection established");

        let wire = encode_request(&request, &url);
        stream.write_all(&wire).await?;
        stream.flush().await?;

        let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

        loop {
            let bytes_read = stream.read_buf(&mut buf).await?;
            let eof = bytes_read == 0;

            // Guard against excessively large responses.
            if buf.len() > MAX_RESPONSE_SIZE {
                warn!(authority = %authority, "response too large — dropping connection");
                return Err(TransportError::ResponseTooLarge {
                    max_bytes: MAX_RESPONSE_SIZE,
                });
            }

            match Response::parse(&buf) {
                Ok((response, body_offset)) => match response.content_length() {
                    Some(len) if buf.len() - body_offset < len => {
                        // Body still arriving.
                        if eof {
                            return Err(TransportError::Truncated);
                        }
                    }
                    Some(len) => {
                        // Re-parse bounded to Content-Length so trailing
                        // bytes from a sloppy server never leak into the body.
                        let (response, _) = Response::parse(&buf[..body_offset + len])?;
                        return Ok(response);
                    }
                    None => {
                        // Without Content-Length the body runs to end-of-stream.
                        if eof {
                            return Ok(response);
                        }
                    }
                },
                Err(ResponseError::Incomplete) => {
                    if eof {
                        return Err(TransportError::Truncated);
                    }
                }
                Err(e) => return Err(TransportError::Response(e)),
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<Response, TransportError> {
        let url = request.url().to_owned();
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(url = %url, "exchange aborted by cancellation");
                Err(TransportError::Aborted)
            }
            result = self.exchange(request) => result,
        }
    }
}

/// Serializes a request into HTTP/1.1 wire format.
///
/// Automatically adds:
/// - `Host: <authority>` (always the first header).
/// - `Content-Type: application/json` if a body is present and no
///   `Content-Type` header was set.
/// - `Connection: close` (one exchange per connection).
/// - `Content-Length: <n>` (always written, last before the blank line).
fn encode_request(request: &Request, url: &Url) -> BytesMut {
    let body = request.body().map(|b| b.as_ref()).unwrap_or_default();
    let content_length = body.len();

    let estimated_size = 128 + request.header_map().len() * 64 + content_length;
    let mut buf = BytesMut::with_capacity(estimated_size);

    // Request line
    buf.put(format!("{} {} HTTP/1.1\r\n", request.method(), url.target()).as_bytes());
    buf.put(format!("Host: {}\r\n", url.authority()).as_bytes());

    // Caller headers
    for (name, value) in request.header_map().iter() {
        buf.put(format!("{name}: {value}\r\n").as_bytes());
    }

    if content_length > 0 && !request.header_map().contains("content-type") {
        buf.put(&b"Content-Type: application/json\r\n"[..]);
    }

    buf.put(&b"Connection: close\r\n"[..]);

    // Content-Length is always the last header before the blank line
    buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());

    // Header/body separator
    buf.put(&b"\r\n"[..]);

    if content_length > 0 {
        buf.put(body);
    }

    buf
}

/// Errors that can occur while parsing an absolute URL.
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("unsupported scheme in `{url}` — only http:// is supported")]
    UnsupportedScheme { url: String },

    #[error("missing host in `{url}`")]
    MissingHost { url: String },

    #[error("invalid port in `{url}`")]
    InvalidPort { url: String },
}

/// A parsed `http://host[:port]/target` URL.
///
/// Full percent-encoding and userinfo handling are intentionally omitted;
/// the dedup layer keys on the raw URL string, so the transport only needs
/// enough structure to connect and write the request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    host: String,
    port: u16,
    target: String,
}

impl Url {
    /// Parses an absolute `http://` URL.
    pub fn parse(raw: &str) -> Result<Self, UrlError> {
        let rest = raw
            .strip_prefix("http://")
            .ok_or_else(|| UrlError::UnsupportedScheme {
                url: raw.to_owned(),
            })?;

        let (authority, target) = match rest.find('/') {
            Some(pos) => (&rest[..pos], rest[pos..].to_owned()),
            None => (rest, "/".to_owned()),
        };

        let (host, port) = match authority.rfind(':') {
            Some(pos) => {
                let port = authority[pos + 1..]
                    .parse()
                    .map_err(|_| UrlError::InvalidPort {
                        url: raw.to_owned(),
                    })?;
                (&authority[..pos], port)
            }
            None => (authority, 80),
        };

        if host.is_empty() {
            return Err(UrlError::MissingHost {
                url: raw.to_owned(),
            });
        }

        Ok(Self {
            host: host.to_owned(),
            port,
            target,
        })
    }

    /// Returns the host component.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port, defaulting to 80.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the request target (path plus query), never empty.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns `host` or `host:port` when the port is non-default.
    pub fn authority(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}{}", self.authority(), self.target)
    }
}
