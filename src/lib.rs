//! # defetch
//!
//! A single-flight deduplicating HTTP fetch layer for Tokio.
//!
//! Concurrent logical requests with the same fingerprint (method + url +
//! body) share one underlying network call; every attached caller receives
//! its own independently readable copy of the response. Callers can cancel
//! in-flight work by key, clear the whole registry, or inspect how many
//! entries are live.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use defetch::cache::{DedupCache, FetchOptions};
//! use defetch::transport::TcpTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = DedupCache::new(Arc::new(TcpTransport::new()));
//!
//!     let url = "http://localhost:8080/api/boards";
//!     let (a, b, c) = tokio::join!(
//!         cache.fetch(url, FetchOptions::new()),
//!         cache.fetch(url, FetchOptions::new()),
//!         cache.fetch(url, FetchOptions::new()),
//!     );
//!     // One network exchange; three independently readable responses.
//!     println!("{} {} {}", a?.status(), b?.status(), c?.status());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod http;
pub mod transport;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheConfig, DedupCache, DedupKey, FetchError, FetchOptions};
pub use http::{Headers, Method, Request, Response};
pub use transport::{TcpTransport, Transport, TransportError};
