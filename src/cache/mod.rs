//! Request deduplication cache.
//!
//! A process-local, in-memory single-flight layer between application code
//! and a [`Transport`]: concurrent logical requests with the same
//! fingerprint (method + url + body) share one underlying network call, and
//! callers can cancel or inspect in-flight work.
//!
//! There is no hidden global — a [`DedupCache`] is an explicitly constructed
//! value owning its registry, built around an injected transport.
//!
//! ## Entry lifecycle
//!
//! ```text
//! absent → pending → (fulfilled | rejected | aborted) → [grace window] → absent
//! ```
//!
//! An entry leaves the registry when its backing call settles and the grace
//! window elapses, when it is explicitly cancelled, or on [`clear`]. An
//! entry older than [`CacheConfig::max_age`] is additionally ignored for
//! attach decisions — even while still pending — so a new call is issued in
//! its place. Terminal entries are never revived; a later request for the
//! same key creates a brand-new entry.
//!
//! [`clear`]: DedupCache::clear

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::http::{Headers, Method, Request, Response};
use crate::transport::{Transport, TransportError};

pub mod key;

pub use key::DedupKey;

/// Errors surfaced to callers of [`DedupCache::fetch`].
///
/// `Clone` because a single settled outcome is delivered to every caller
/// attached to the same entry.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The underlying call was aborted — by [`DedupCache::cancel_request`],
    /// [`DedupCache::clear`], or a caller-supplied cancellation token.
    ///
    /// Distinguished from ordinary transport failure so callers can choose
    /// not to surface it (e.g. to suppress retry-after-cancel).
    #[error("request aborted")]
    Aborted,

    /// The underlying call failed for a reason other than cancellation.
    #[error("transport failure: {0}")]
    Transport(Arc<TransportError>),
}

impl FetchError {
    /// Returns `true` for abort-class rejections.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

impl From<TransportError> for FetchError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Aborted => Self::Aborted,
            other => Self::Transport(Arc::new(other)),
        }
    }
}

/// Tuning knobs for the cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a settled entry stays in the registry so that callers who
    /// initiated in the same tick can still attach to its result.
    pub grace: Duration,
    /// Age ceiling after which an entry — settled or not — is no longer
    /// eligible for attachment and a fresh call is issued instead.
    pub max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(100),
            max_age: Duration::from_secs(30),
        }
    }
}

/// Per-call configuration for [`DedupCache::fetch`].
///
/// # Examples
///
/// ```
/// use defetch::cache::FetchOptions;
/// use defetch::http::Method;
/// use serde_json::json;
///
/// let options = FetchOptions::new()
///     .method(Method::Post)
///     .header("Authorization", "Bearer token")
///     .body(json!({"title": "write docs"}));
/// ```
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    method: Method,
    headers: Headers,
    body: Option<Value>,
    cancel: Option<CancellationToken>,
}

impl FetchOptions {
    /// Creates options with method GET, no headers, and no body.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the HTTP method (default GET).
    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Appends a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the JSON body. The body participates in the dedup key.
    #[must_use]
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Attaches an external cancellation token.
    ///
    /// The real call runs on a child of this token, so cancelling it aborts
    /// the underlying exchange for every attached caller.
    #[must_use]
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// The shared settlement of one underlying network call. Every attached
/// caller awaits a clone of this future and receives its own clone of the
/// outcome.
type SharedOutcome = Shared<BoxFuture<'static, Result<Response, FetchError>>>;

/// Registry record tracking one in-flight or recently-settled request.
struct Entry {
    outcome: SharedOutcome,
    /// The one cancellation handle backing this entry's real call.
    cancel: CancellationToken,
    created_at: Instant,
    /// Guards delayed eviction against removing a successor entry that
    /// reused the same key after this one expired.
    epoch: u64,
}

/// A single-flight deduplicating fetch gateway.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use defetch::cache::{DedupCache, FetchOptions};
/// use defetch::transport::TcpTransport;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let cache = DedupCache::new(Arc::new(TcpTransport::new()));
///
///     // Concurrent identical calls share one network exchange.
///     let url = "http://localhost:8080/api/boards";
///     let (a, b) = tokio::join!(
///         cache.fetch(url, FetchOptions::new()),
///         cache.fetch(url, FetchOptions::new()),
///     );
///     println!("{} {}", a?.status(), b?.status());
///     Ok(())
/// }
/// ```
pub struct DedupCache {
    transport: Arc<dyn Transport>,
    /// The registry. Only ever locked in synchronous sections — never held
    /// across an await.
    entries: Arc<Mutex<HashMap<DedupKey, Entry>>>,
    config: CacheConfig,
    next_epoch: AtomicU64,
}

impl DedupCache {
    /// Creates a cache with the default [`CacheConfig`].
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, CacheConfig::default())
    }

    /// Creates a cache with an explicit configuration.
    pub fn with_config(transport: Arc<dyn Transport>, config: CacheConfig) -> Self {
        Self {
            transport,
            entries: Arc::new(Mutex::new(HashMap::new())),
            config,
            next_epoch: AtomicU64::new(0),
        }
    }

    /// Fetches `url`, deduplicating against identical in-flight requests.
    ///
    /// If a live, non-expired entry exists for the derived key, this call
    /// attaches to it and resolves with its own clone of the shared outcome
    /// — same response data or same error class as every other attacher.
    /// Otherwise a new network call is issued through the transport and
    /// registered before the first suspension point.
    ///
    /// The gateway never retries; after a rejection, retry policy belongs to
    /// the caller.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Aborted`] — the backing call was cancelled.
    /// - [`FetchError::Transport`] — the backing call failed on the wire.
    pub async fn fetch(&self, url: &str, options: FetchOptions) -> Result<Response, FetchError> {
        let key = DedupKey::derive(&options.method, url, options.body.as_ref());

        let outcome = {
            let mut entries = self.entries.lock();

            let attachable = match entries.get(&key) {
                Some(entry) if entry.created_at.elapsed() <= self.config.max_age => {
                    Some(entry.outcome.clone())
                }
                Some(_) => {
                    debug!(key = %key, "entry exceeded max age — issuing fresh call");
                    None
                }
                None => None,
            };

            match attachable {
                Some(outcome) => {
                    if !options.method.is_idempotent() {
                        debug!(key = %key, "coalescing non-idempotent request");
                    }
                    debug!(key = %key, "attaching to in-flight request");
                    outcome
                }
                None => {
                    debug!(key = %key, "issuing new request");

                    let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                    let (outcome, cancel) = self.launch(url, &options);

                    // Insert happens inside this synchronous section, before
                    // anyone awaits, so a same-tick caller always finds the
                    // slot.
                    entries.insert(
                        key.clone(),
                        Entry {
                            outcome: outcome.clone(),
                            cancel,
                            created_at: Instant::now(),
                            epoch,
                        },
                    );

                    self.schedule_eviction(key.clone(), epoch, outcome.clone());
                    outcome
                }
            }
        };

        outcome.await
    }

    /// Spawns the real network call and returns its shared settlement plus
    /// the cancellation handle that aborts it.
    ///
    /// The call runs as its own task: it proceeds even if the initiating
    /// caller drops its future, so late attachers still get a settlement.
    fn launch(&self, url: &str, options: &FetchOptions) -> (SharedOutcome, CancellationToken) {
        let cancel = match &options.cancel {
            Some(external) => external.child_token(),
            None => CancellationToken::new(),
        };

        let mut request =
            Request::new(options.method.clone(), url).headers(options.headers.clone());
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        let transport = Arc::clone(&self.transport);
        let call_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            transport
                .send(request, call_cancel)
                .await
                .map_err(FetchError::from)
        });

        let outcome = async move {
            match handle.await {
                Ok(result) => result,
                // The call task only vanishes without settling if it
                // panicked or the runtime is shutting down.
                Err(_) => Err(FetchError::Aborted),
            }
        }
        .boxed()
        .shared();

        (outcome, cancel)
    }

    /// Removes the entry once it has settled and the grace window elapsed,
    /// or once it reaches the age ceiling — whichever comes first. The
    /// ceiling is what reclaims the slot when a call never settles.
    fn schedule_eviction(&self, key: DedupKey, epoch: u64, outcome: SharedOutcome) {
        let entries = Arc::clone(&self.entries);
        let grace = self.config.grace;
        let max_age = self.config.max_age;

        tokio::spawn(async move {
            // Settlement first — success or failure alike — then the grace
            // window, so near-simultaneous callers can still attach.
            let settled_then_grace = async {
                let _ = outcome.await;
                tokio::time::sleep(grace).await;
            };

            tokio::select! {
                _ = settled_then_grace => {
                    debug!(key = %key, "evicting settled entry after grace window");
                }
                _ = tokio::time::sleep(max_age) => {
                    debug!(key = %key, "evicting entry at age ceiling");
                }
            }

            let mut entries = entries.lock();
            if entries.get(&key).is_some_and(|entry| entry.epoch == epoch) {
                entries.remove(&key);
            }
        });
    }

    /// Cancels the in-flight request identified by the same derivation used
    /// when issuing: aborts the one underlying call (every attached caller
    /// rejects with an abort-class error) and removes the entry.
    ///
    /// Returns `false` — and does nothing else — when no such entry exists.
    pub fn cancel_request(&self, method: &Method, url: &str, body: Option<&Value>) -> bool {
        self.cancel_key(&DedupKey::derive(method, url, body))
    }

    /// [`cancel_request`](Self::cancel_request) for callers that retained a key.
    pub fn cancel_key(&self, key: &DedupKey) -> bool {
        let removed = self.entries.lock().remove(key);
        match removed {
            Some(entry) => {
                debug!(key = %key, "cancelling in-flight request");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Synchronously cancels and removes every entry. Intended for teardown
    /// and test isolation.
    pub fn clear(&self) {
        let drained: Vec<Entry> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            entry.cancel.cancel();
        }
        info!(cancelled = drained.len(), "request cache cleared");
    }

    /// Returns the number of live entries, including settled entries still
    /// inside their grace window. Observability hook — production logic does
    /// not depend on it.
    pub fn in_flight_count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use serde_json::json;

    /// In-memory transport: counts calls, sleeps `delay`, then answers with
    /// a canned body or a canned failure. Honors the cancellation token the
    /// way the contract requires.
    struct MockTransport {
        calls: AtomicUsize,
        delay: Duration,
        body: String,
        fail: bool,
    }

    impl MockTransport {
        fn ok(body: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                body: body.to_owned(),
                fail: false,
            })
        }

        fn failing(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                body: String::new(),
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn send(
            &self,
            _request: Request,
            cancel: CancellationToken,
        ) -> Result<Response, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = cancel.cancelled() => Err(TransportError::Aborted),
                _ = tokio::time::sleep(self.delay) => {
                    if self.fail {
                        Err(TransportError::Truncated)
                    } else {
                        Ok(Response::from_parts(200, Headers::new(), self.body.clone()))
                    }
                }
            }
        }
    }

    /// Routes cache tracing through the test writer so `--nocapture` shows
    /// the attach/evict decisions next to the assertions.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn cache_with(transport: Arc<MockTransport>, config: CacheConfig) -> Arc<DedupCache> {
        init_tracing();
        Arc::new(DedupCache::with_config(transport, config))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_gets_share_one_call() {
        let transport = MockTransport::ok(r#"{"boards":[1,2,3]}"#, Duration::from_millis(50));
        let cache = cache_with(transport.clone(), CacheConfig::default());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.fetch("/api/boards", FetchOptions::new()).await
            }));
        }

        let mut bodies = Vec::new();
        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            // Every attacher reads its own copy of the body.
            bodies.push(response.json::<Value>().unwrap());
        }

        assert_eq!(transport.calls(), 1);
        assert_eq!(bodies[0], bodies[1]);
        assert_eq!(bodies[1], bodies[2]);
        assert_eq!(bodies[0], json!({"boards": [1, 2, 3]}));
    }

    #[tokio::test(start_paused = true)]
    async fn different_bodies_are_not_merged() {
        let transport = MockTransport::ok("{}", Duration::from_millis(50));
        let cache = cache_with(transport.clone(), CacheConfig::default());

        let a = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let options = FetchOptions::new().method(Method::Post).body(json!({"a": 1}));
                cache.fetch("/api/test", options).await
            })
        };
        let b = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let options = FetchOptions::new().method(Method::Post).body(json!({"b": 2}));
                cache.fetch("/api/test", options).await
            })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn different_methods_and_urls_are_not_merged() {
        let transport = MockTransport::ok("{}", Duration::from_millis(10));
        let cache = cache_with(transport.clone(), CacheConfig::default());

        let gets = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.fetch("/api/boards", FetchOptions::new()).await })
        };
        let deletes = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .fetch("/api/boards", FetchOptions::new().method(Method::Delete))
                    .await
            })
        };
        let other_url = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.fetch("/api/columns", FetchOptions::new()).await })
        };

        gets.await.unwrap().unwrap();
        deletes.await.unwrap().unwrap();
        other_url.await.unwrap().unwrap();

        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_lingers_through_grace_window_then_evicts() {
        let transport = MockTransport::ok("{}", Duration::from_millis(50));
        let config = CacheConfig {
            grace: Duration::from_millis(100),
            max_age: Duration::from_secs(30),
        };
        let cache = cache_with(transport, config);

        cache.fetch("/api/boards", FetchOptions::new()).await.unwrap();

        // Settled, but the grace window keeps the slot open.
        assert_eq!(cache.in_flight_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_attacher_within_grace_window_reuses_result() {
        let transport = MockTransport::ok("{}", Duration::from_millis(50));
        let config = CacheConfig {
            grace: Duration::from_millis(100),
            max_age: Duration::from_secs(30),
        };
        let cache = cache_with(transport.clone(), config);

        cache.fetch("/api/boards", FetchOptions::new()).await.unwrap();
        // Inside the grace window: attaches to the settled entry.
        cache.fetch("/api/boards", FetchOptions::new()).await.unwrap();
        assert_eq!(transport.calls(), 1);

        // After eviction: a genuinely new call.
        tokio::time::sleep(Duration::from_millis(150)).await;
        cache.fetch("/api/boards", FetchOptions::new()).await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_every_attached_caller() {
        let transport = MockTransport::ok("{}", Duration::from_secs(10));
        let cache = cache_with(transport.clone(), CacheConfig::default());

        let mut handles = Vec::new();
        for _ in 0..2 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.fetch("/api/boards", FetchOptions::new()).await
            }));
        }

        // Let both callers register/attach.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(cache.in_flight_count(), 1);

        assert!(cache.cancel_request(&Method::Get, "/api/boards", None));
        assert_eq!(cache.in_flight_count(), 0);

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.is_abort());
        }
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn cancel_unknown_key_is_a_noop() {
        let transport = MockTransport::ok("{}", Duration::from_millis(1));
        let cache = cache_with(transport, CacheConfig::default());

        assert!(!cache.cancel_request(&Method::Get, "/never/issued", None));
        assert!(!cache.cancel_key(&DedupKey::derive(&Method::Put, "/nope", None)));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_and_empties_everything() {
        let transport = MockTransport::ok("{}", Duration::from_secs(10));
        let cache = cache_with(transport, CacheConfig::default());

        let a = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.fetch("/api/boards", FetchOptions::new()).await })
        };
        let b = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.fetch("/api/tasks", FetchOptions::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(cache.in_flight_count(), 2);

        cache.clear();
        assert_eq!(cache.in_flight_count(), 0);

        assert!(a.await.unwrap().unwrap_err().is_abort());
        assert!(b.await.unwrap().unwrap_err().is_abort());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_past_max_age_is_not_reused_even_while_pending() {
        let transport = MockTransport::ok("{}", Duration::from_millis(200));
        let config = CacheConfig {
            grace: Duration::from_millis(10),
            max_age: Duration::from_millis(50),
        };
        let cache = cache_with(transport.clone(), config);

        let first = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.fetch("/api/boards", FetchOptions::new()).await })
        };

        // The first call is still pending, but its entry is past the age
        // ceiling — the second fetch must issue a fresh call.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = cache.fetch("/api/boards", FetchOptions::new()).await;

        assert!(second.is_ok());
        assert!(first.await.unwrap().is_ok());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn never_settling_call_is_evicted_at_age_ceiling() {
        let transport = MockTransport::ok("{}", Duration::from_secs(3600));
        let config = CacheConfig {
            grace: Duration::from_millis(10),
            max_age: Duration::from_millis(50),
        };
        let cache = cache_with(transport.clone(), config);

        let pending = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.fetch("/api/boards", FetchOptions::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(cache.in_flight_count(), 1);

        // The call will not settle for an hour; the age ceiling alone must
        // reclaim the slot.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(cache.in_flight_count(), 0);
        assert_eq!(transport.calls(), 1);

        pending.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_reaches_every_waiter_once() {
        let transport = MockTransport::failing(Duration::from_millis(50));
        let cache = cache_with(transport.clone(), CacheConfig::default());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.fetch("/api/boards", FetchOptions::new()).await
            }));
        }

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(!err.is_abort());
            assert!(matches!(err, FetchError::Transport(_)));
        }
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_supplied_token_aborts_the_shared_call() {
        let transport = MockTransport::ok("{}", Duration::from_secs(10));
        let cache = cache_with(transport, CacheConfig::default());

        let token = CancellationToken::new();
        let handle = {
            let cache = Arc::clone(&cache);
            let options = FetchOptions::new().cancel(token.clone());
            tokio::spawn(async move { cache.fetch("/api/boards", options).await })
        };

        tokio::time::sleep(Duration::from_millis(1)).await;
        token.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_abort());
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_calls_after_eviction_each_hit_the_wire() {
        let transport = MockTransport::ok("{}", Duration::from_millis(10));
        let config = CacheConfig {
            grace: Duration::from_millis(20),
            max_age: Duration::from_secs(30),
        };
        let cache = cache_with(transport.clone(), config);

        cache.fetch("/api/boards", FetchOptions::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.fetch("/api/boards", FetchOptions::new()).await.unwrap();

        assert_eq!(transport.calls(), 2);
    }
}
