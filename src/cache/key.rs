//! Dedup key derivation.
//!
//! Two requests are "the same" when their method, URL, and serialized body
//! all match. The key is the canonical fingerprint of that triple; it is the
//! only notion of identity the cache has.

use std::fmt;

use serde_json::Value;

use crate::http::Method;

/// A canonical request fingerprint: `METHOD:url:body`.
///
/// The body component is the serialized JSON payload, or empty when absent.
/// Derivation is deterministic, so any caller holding the same
/// (method, url, body) triple can address the entry the original caller
/// created — that is what makes [`cancel_request`] work without handing out
/// tickets.
///
/// [`cancel_request`]: crate::cache::DedupCache::cancel_request
///
/// # Examples
///
/// ```
/// use defetch::cache::DedupKey;
/// use defetch::http::Method;
///
/// let a = DedupKey::derive(&Method::Get, "/api/boards", None);
/// let b = DedupKey::derive(&Method::Get, "/api/boards", None);
/// assert_eq!(a, b);
///
/// let c = DedupKey::derive(&Method::Post, "/api/boards", None);
/// assert_ne!(a, c);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    /// Derives the key for a (method, url, body) triple.
    ///
    /// The method is upper-cased so `Custom("get")` and `Method::Get`
    /// fingerprint identically.
    pub fn derive(method: &Method, url: &str, body: Option<&Value>) -> Self {
        let method = method.as_str().to_ascii_uppercase();
        let body = body.map(Value::to_string).unwrap_or_default();
        Self(format!("{method}:{url}:{body}"))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
