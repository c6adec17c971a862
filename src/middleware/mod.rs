//! Response memoization middleware.
//!
//! [`CacheMiddleware`] wraps a handler so that repeated requests for the same
//! cache key are answered from stored bytes instead of re-running the
//! handler. Per request:
//!
//! 1. the key function maps the request to a cache key;
//! 2. the store is asked for the key's value, with a fill callback that runs
//!    the wrapped handler against an in-memory recorder and serializes the
//!    captured response into an envelope;
//! 3. the resulting bytes — freshly filled or long cached — are decoded and
//!    replayed into the response handed back to the caller.
//!
//! The store guarantees single-flight fills, so an expensive handler runs at
//! most once per key no matter how many requests race for it. Failures (fill,
//! decode, replay) resolve at the request boundary: the fallback handler
//! answers if one is configured, otherwise a fixed 500 with a diagnostic.
//! Nothing is retried and no failure leaves a cache entry behind.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error};

use crate::cache::{CacheStore, FillFuture, MemoryStore};
use crate::envelope::Envelope;
use crate::http::{Request, Response, StatusCode};

/// A type-erased, shareable async request handler.
///
/// The same shape the server dispatches and the middleware wraps: cloning is
/// cheap, and the boxed future keeps the signature object-safe.
pub type Handler = Arc<
    dyn Fn(Request) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// Wraps an async closure into a [`Handler`].
///
/// # Examples
///
/// ```
/// use servecache::middleware::handler_fn;
/// use servecache::http::{Response, StatusCode};
///
/// let handler = handler_fn(|_req| async {
///     Response::new(StatusCode::Ok).body("hello")
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

/// A cache key derivation function.
///
/// Must be deterministic and side-effect free. The middleware cannot verify
/// the deeper obligation on the caller: the wrapped handler's observable
/// output must depend only on request attributes that feed into the key,
/// or requests will be answered with responses computed for other inputs.
pub type KeyFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// The default key function: request path plus query string, verbatim.
///
/// `GET /foo?page=2` keys as `"/foo?page=2"`. Method, headers, and body are
/// ignored; supply a custom [`KeyFn`] via [`CacheMiddleware::key_fn`] for
/// stricter or laxer granularity.
pub fn default_request_key(request: &Request) -> String {
    match request.query_string() {
        Some(query) => format!("{}?{}", request.path(), query),
        None => request.path().to_owned(),
    }
}

/// Everything a fill callback needs to recompute a response: the wrapped
/// handler and the request that missed. Ephemeral; lives for one fill.
struct FillContext {
    handler: Handler,
    request: Request,
}

/// Read-only snapshot of the middleware's lookup counters.
///
/// `hits + misses` equals the number of requests that resolved with a
/// replayed response; failed requests count as neither. Both counters only
/// grow.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Memoizes responses of the handlers it wraps.
///
/// Holds a cache store, a key function, hit/miss counters, and an optional
/// fallback error handler. Cloning shares all of them, so a clone wraps
/// handlers against the same cache.
///
/// # Examples
///
/// ```
/// use servecache::middleware::{handler_fn, CacheMiddleware};
/// use servecache::http::{Response, StatusCode};
///
/// let cache = CacheMiddleware::new("reports", 64);
/// let handler = cache.wrap_fn(|_req| async {
///     Response::new(StatusCode::Ok).body("expensive result")
/// });
/// ```
#[derive(Clone)]
pub struct CacheMiddleware {
    name: Arc<str>,
    store: Arc<dyn CacheStore>,
    key_fn: KeyFn,
    error_handler: Option<Handler>,
    counters: Arc<Counters>,
}

impl CacheMiddleware {
    /// Creates a middleware named `name` over an in-memory store bounded to
    /// `capacity_mib` MiB, with the default key function and no fallback
    /// handler.
    pub fn new(name: impl Into<String>, capacity_mib: u64) -> Self {
        let name = name.into();
        let store = Arc::new(MemoryStore::new(
            format!("servecache://{name}"),
            capacity_mib,
        ));
        Self::with_store(name, store)
    }

    /// Creates a middleware over an injected [`CacheStore`].
    pub fn with_store(name: impl Into<String>, store: Arc<dyn CacheStore>) -> Self {
        Self {
            name: Arc::from(name.into()),
            store,
            key_fn: Arc::new(default_request_key),
            error_handler: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Replaces the key function.
    ///
    /// See [`KeyFn`] for the determinism precondition this layer cannot
    /// check on the caller's behalf.
    #[must_use]
    pub fn key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> String + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(f);
        self
    }

    /// Sets a fallback handler invoked with the original request when a
    /// lookup, fill, or decode fails. Without one, failures answer with a
    /// fixed 500 carrying a diagnostic body.
    #[must_use]
    pub fn error_handler(mut self, handler: Handler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Returns a snapshot of the hit/miss counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        }
    }

    /// Wraps a [`Handler`] so its responses are memoized by this middleware.
    pub fn wrap(&self, handler: Handler) -> Handler {
        let middleware = self.clone();
        Arc::new(move |request| {
            let middleware = middleware.clone();
            let handler = Arc::clone(&handler);
            Box::pin(async move { middleware.serve(handler, request).await })
        })
    }

    /// Wraps an async closure; shorthand for `wrap(handler_fn(f))`.
    pub fn wrap_fn<F, Fut>(&self, f: F) -> Handler
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.wrap(handler_fn(f))
    }

    /// Runs one request through the memoization flow.
    async fn serve(&self, handler: Handler, request: Request) -> Response {
        let key = (self.key_fn)(&request);

        // Set by the fill callback, so afterwards it tells hit from miss:
        // under single-flight only the request whose fill actually ran
        // observes `true`.
        let filled = Arc::new(AtomicBool::new(false));
        let context = FillContext {
            handler,
            request: request.clone(),
        };
        let fill = fill_envelope(context, Arc::clone(&filled));

        let bytes = match self.store.get_or_fill(key.clone(), fill).await {
            Ok(bytes) => bytes,
            Err(err) => return self.fail(request, &key, "fill", &err).await,
        };

        let envelope = match Envelope::decode(&bytes) {
            Ok(envelope) => envelope,
            Err(err) => return self.fail(request, &key, "decode", &err).await,
        };
        let response = match envelope.into_response() {
            Ok(response) => response,
            Err(err) => return self.fail(request, &key, "replay", &err).await,
        };

        // Counted only once the request has actually resolved; a request that
        // falls through to `fail` is neither a hit nor a miss.
        if filled.load(Ordering::Acquire) {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!(cache = %self.name, key = %key, "miss filled");
        } else {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(cache = %self.name, key = %key, "hit");
        }

        response
    }

    /// Resolves a failed request: fallback handler if configured, fixed 500
    /// otherwise. The cache is never touched from here.
    async fn fail(
        &self,
        request: Request,
        key: &str,
        operation: &str,
        err: &(dyn fmt::Display + Sync),
    ) -> Response {
        error!(
            cache = %self.name,
            key = %key,
            operation,
            error = %err,
            "memoized request failed"
        );
        match &self.error_handler {
            Some(handler) => handler(request).await,
            None => Response::new(StatusCode::InternalServerError)
                .body(format!("cache {operation} for {key:?} failed: {err}")),
        }
    }
}

/// Builds the fill callback for one request: run the wrapped handler, capture
/// its response, and return the encoded envelope bytes.
///
/// Capture errors propagate out so the store caches nothing for this attempt.
fn fill_envelope(context: FillContext, filled: Arc<AtomicBool>) -> FillFuture {
    Box::pin(async move {
        filled.store(true, Ordering::Release);
        let FillContext { handler, request } = context;
        let response = handler(request).await;
        let envelope = Envelope::capture(&response)?;
        Ok(envelope.encode())
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::http::Method;

    const EXPENSIVE_BODY: &str = "Hello from expensive request\n";

    fn expensive_handler(invocations: Arc<AtomicUsize>) -> Handler {
        handler_fn(move |_req| {
            let invocations = Arc::clone(&invocations);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Response::new(StatusCode::Ok).body(EXPENSIVE_BODY)
            }
        })
    }

    #[tokio::test]
    async fn ten_requests_one_invocation() {
        let cache = CacheMiddleware::new("test", 64);
        let invocations = Arc::new(AtomicUsize::new(0));
        let handler = cache.wrap(expensive_handler(Arc::clone(&invocations)));

        for _ in 0..10 {
            let response = handler(Request::new(Method::Get, "/foo")).await;
            assert_eq!(response.status(), StatusCode::Ok);
            assert_eq!(response.body_ref(), EXPENSIVE_BODY.as_bytes());
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 9);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_requests_share_one_fill() {
        let cache = CacheMiddleware::new("test", 64);
        let invocations = Arc::new(AtomicUsize::new(0));
        let slow = {
            let invocations = Arc::clone(&invocations);
            cache.wrap_fn(move |_req| {
                let invocations = Arc::clone(&invocations);
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Response::new(StatusCode::Ok).body(EXPENSIVE_BODY)
                }
            })
        };

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let handler = Arc::clone(&slow);
            tasks.push(tokio::spawn(async move {
                handler(Request::new(Method::Get, "/foo")).await
            }));
        }
        for task in tasks {
            let response = task.await.unwrap();
            assert_eq!(response.status(), StatusCode::Ok);
            assert_eq!(response.body_ref(), EXPENSIVE_BODY.as_bytes());
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 9);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn default_key_ignores_headers() {
        let cache = CacheMiddleware::new("test", 64);
        // Handler output depends on a header the key function ignores; the
        // second request therefore gets the first request's cached response.
        let handler = cache.wrap_fn(|req| {
            let who = req.headers().get("x-who").unwrap_or("nobody").to_owned();
            async move { Response::new(StatusCode::Ok).body(format!("hello {who}")) }
        });

        let first = handler(Request::new(Method::Get, "/greet").header("X-Who", "alice")).await;
        let second = handler(Request::new(Method::Get, "/greet").header("X-Who", "bob")).await;
        assert_eq!(first.body_ref(), b"hello alice");
        assert_eq!(second.body_ref(), b"hello alice");
    }

    #[tokio::test]
    async fn default_key_distinguishes_query_strings() {
        let cache = CacheMiddleware::new("test", 64);
        let invocations = Arc::new(AtomicUsize::new(0));
        let handler = cache.wrap(expensive_handler(Arc::clone(&invocations)));

        handler(Request::new(Method::Get, "/foo?page=1")).await;
        handler(Request::new(Method::Get, "/foo?page=2")).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn custom_key_fn_controls_granularity() {
        let cache = CacheMiddleware::new("test", 64).key_fn(|req| req.path().to_owned());
        let invocations = Arc::new(AtomicUsize::new(0));
        let handler = cache.wrap(expensive_handler(Arc::clone(&invocations)));

        handler(Request::new(Method::Get, "/foo?page=1")).await;
        handler(Request::new(Method::Get, "/foo?page=2")).await;
        // Path-only key collapses the two queries into one entry.
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_fill_answers_500_and_does_not_poison_the_key() {
        let cache = CacheMiddleware::new("test", 64);
        let healthy = Arc::new(AtomicBool::new(false));
        let handler = {
            let healthy = Arc::clone(&healthy);
            cache.wrap_fn(move |_req| {
                let healthy = Arc::clone(&healthy);
                async move {
                    if !healthy.load(Ordering::SeqCst) {
                        panic!("backend unavailable");
                    }
                    Response::new(StatusCode::Ok).body("recovered")
                }
            })
        };

        let failed = handler(Request::new(Method::Get, "/flaky")).await;
        assert_eq!(failed.status(), StatusCode::InternalServerError);
        let body = String::from_utf8(failed.body_ref().to_vec()).unwrap();
        assert!(body.contains("cache fill"), "diagnostic body: {body}");

        // The failure was not cached: once the handler recovers, the same
        // key resolves and is then served from cache.
        healthy.store(true, Ordering::SeqCst);
        let ok = handler(Request::new(Method::Get, "/flaky")).await;
        assert_eq!(ok.status(), StatusCode::Ok);
        assert_eq!(ok.body_ref(), b"recovered");

        let again = handler(Request::new(Method::Get, "/flaky")).await;
        assert_eq!(again.body_ref(), b"recovered");
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fallback_error_handler_receives_original_request() {
        let fallback = handler_fn(|req| async move {
            Response::new(StatusCode::ServiceUnavailable).body(format!("sorry, {}", req.path()))
        });
        let cache = CacheMiddleware::new("test", 64).error_handler(fallback);
        let handler = cache.wrap_fn(|_req| async { panic!("always fails") });

        // Spawned so the failure path — diagnostic held across the fallback
        // await — is exercised inside a future that must be `Send`.
        let response = tokio::spawn(async move {
            handler(Request::new(Method::Get, "/broken")).await
        })
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::ServiceUnavailable);
        assert_eq!(response.body_ref(), b"sorry, /broken");
    }

    #[tokio::test]
    async fn undecodable_store_bytes_count_as_neither_hit_nor_miss() {
        use bytes::Bytes;

        use crate::cache::{CacheStore, StoreFuture};

        // A store that answers every lookup with bytes that are not a valid
        // envelope (wire type 3 is unsupported).
        struct GarbageStore;
        impl CacheStore for GarbageStore {
            fn get_or_fill(&self, _key: String, _fill: FillFuture) -> StoreFuture<'_> {
                Box::pin(async { Ok(Bytes::from_static(&[0x0b, 0xff])) })
            }
        }

        let cache = CacheMiddleware::with_store("test", Arc::new(GarbageStore));
        let handler = cache.wrap_fn(|_req| async { Response::new(StatusCode::Ok).body("never") });

        let response = handler(Request::new(Method::Get, "/garbled")).await;
        assert_eq!(response.status(), StatusCode::InternalServerError);
        let body = String::from_utf8(response.body_ref().to_vec()).unwrap();
        assert!(body.contains("cache decode"), "diagnostic body: {body}");

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test]
    async fn header_multiplicity_survives_the_cache() {
        let cache = CacheMiddleware::new("test", 64);
        let handler = cache.wrap_fn(|_req| async {
            Response::new(StatusCode::Ok)
                .header("Set-Cookie", "a=1")
                .header("Set-Cookie", "b=2")
                .body("ok")
        });

        // Second request is served from cache; both cookie values must
        // survive in original order.
        handler(Request::new(Method::Get, "/cookies")).await;
        let cached = handler(Request::new(Method::Get, "/cookies")).await;
        let cookies: Vec<_> = cached.headers().get_all("set-cookie").collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn clones_share_the_same_cache() {
        let cache = CacheMiddleware::new("test", 64);
        let invocations = Arc::new(AtomicUsize::new(0));
        let first = cache.wrap(expensive_handler(Arc::clone(&invocations)));
        let second = cache.clone().wrap(expensive_handler(Arc::clone(&invocations)));

        first(Request::new(Method::Get, "/shared")).await;
        second(Request::new(Method::Get, "/shared")).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
    }
}
