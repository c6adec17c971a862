//! Cache storage: the store interface the memoization layer consumes, and a
//! bounded in-memory implementation.
//!
//! The contract the middleware relies on is [`CacheStore::get_or_fill`]:
//! return the cached bytes for a key, or run the supplied fill future exactly
//! once — even under many concurrent requests for the same key — store its
//! output, and hand the same bytes to every waiter. A failed fill must leave
//! no entry behind.
//!
//! [`MemoryStore`] provides that contract on top of [`moka`], which brings
//! bounded capacity, eviction, and single-flight fill deduplication
//! (`try_get_with`) so none of it is reimplemented here.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error};

use crate::capture::SinkError;

/// Errors produced inside a fill callback.
#[derive(Debug, Error)]
pub enum FillError {
    /// The captured response violated the sink protocol.
    #[error("response capture failed: {0}")]
    Capture(#[from] SinkError),

    /// The detached fill task panicked or was aborted before completing.
    #[error("fill task panicked or was aborted")]
    TaskFailed,
}

/// Errors surfaced by [`CacheStore::get_or_fill`].
///
/// A fill error is shared by every request that was waiting on the same
/// in-flight fill, hence the [`Arc`].
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("fill failed: {0}")]
    Fill(Arc<FillError>),

    /// A storage backend problem unrelated to the fill itself. Unused by
    /// [`MemoryStore`]; available to external store implementations.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// The boxed future a fill callback produces.
///
/// `'static` because the store may keep the fill alive past the caller: a
/// disconnecting client must not cancel an in-flight computation.
pub type FillFuture = Pin<Box<dyn Future<Output = Result<Bytes, FillError>> + Send + 'static>>;

/// The boxed future returned by [`CacheStore::get_or_fill`].
pub type StoreFuture<'a> = Pin<Box<dyn Future<Output = Result<Bytes, StoreError>> + Send + 'a>>;

/// Byte-keyed, byte-valued bounded storage with single-flight fills.
///
/// # Contract
///
/// - If a value exists for `key`, return it without touching `fill`.
/// - Otherwise run `fill` at most once per key across all concurrent callers;
///   every caller waits (suspends, no polling loop) and receives the same
///   resulting bytes.
/// - A fill that returns an error is propagated to all waiters and **not**
///   stored; the next request for the key fills again.
/// - Entries may be evicted at any time under capacity pressure.
pub trait CacheStore: Send + Sync {
    /// Returns the value at `key`, running `fill` to produce it on a miss.
    fn get_or_fill(&self, key: String, fill: FillFuture) -> StoreFuture<'_>;
}

/// In-memory [`CacheStore`] backed by [`moka::future::Cache`].
///
/// Capacity is byte-weighed: each entry costs its key length plus its value
/// length, and the total is bounded by the configured number of MiB. Eviction
/// policy is moka's (TinyLFU); this layer does not add its own.
///
/// Fill futures are spawned as detached tokio tasks that insert their own
/// result, so dropping every waiter mid-fill (caller disconnect) neither
/// aborts the computation nor loses its value: the entry is populated for
/// subsequent requesters regardless.
pub struct MemoryStore {
    name: String,
    cache: moka::future::Cache<String, Bytes>,
}

impl MemoryStore {
    /// Creates a store holding at most `capacity_mib` MiB of keys and values.
    pub fn new(name: impl Into<String>, capacity_mib: u64) -> Self {
        let name = name.into();
        let cache = moka::future::Cache::builder()
            .name(&name)
            .max_capacity(capacity_mib << 20)
            .weigher(|key: &String, value: &Bytes| {
                (key.len() + value.len()).try_into().unwrap_or(u32::MAX)
            })
            .build();
        Self { name, cache }
    }

    /// The store's name, as given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of entries currently resident (approximate, per moka).
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl CacheStore for MemoryStore {
    fn get_or_fill(&self, key: String, fill: FillFuture) -> StoreFuture<'_> {
        Box::pin(async move {
            debug!(store = %self.name, key = %key, "lookup");
            let cache = self.cache.clone();
            let fill_key = key.clone();
            self.cache
                .try_get_with(key, async move {
                    // Detached task that commits its own result: even if every
                    // waiter is dropped mid-fill, the computed value still
                    // lands in the cache for subsequent requesters.
                    let handle = tokio::spawn(async move {
                        let bytes = fill.await?;
                        cache.insert(fill_key, bytes.clone()).await;
                        Ok(bytes)
                    });
                    match handle.await {
                        Ok(result) => result,
                        Err(join_err) => {
                            error!(error = %join_err, "fill task did not complete");
                            Err(FillError::TaskFailed)
                        }
                    }
                })
                .await
                .map_err(StoreError::Fill)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn counting_fill(counter: Arc<AtomicUsize>, value: &'static [u8]) -> FillFuture {
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Bytes::from_static(value))
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_requests_fill_once() {
        let store = Arc::new(MemoryStore::new("test", 4));
        let fills = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let store = Arc::clone(&store);
            let fills = Arc::clone(&fills);
            tasks.push(tokio::spawn(async move {
                store
                    .get_or_fill("k".to_owned(), counting_fill(fills, b"value"))
                    .await
                    .unwrap()
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), Bytes::from_static(b"value"));
        }
        assert_eq!(fills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_fill_independently() {
        let store = MemoryStore::new("test", 4);
        let fills = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b", "a"] {
            store
                .get_or_fill(key.to_owned(), counting_fill(Arc::clone(&fills), b"v"))
                .await
                .unwrap();
        }
        // "a" hit its cached value the second time.
        assert_eq!(fills.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_caller_does_not_lose_the_fill() {
        let store = Arc::new(MemoryStore::new("test", 4));
        let fills = Arc::new(AtomicUsize::new(0));

        let caller = {
            let store = Arc::clone(&store);
            let fills = Arc::clone(&fills);
            tokio::spawn(async move {
                let slow: FillFuture = Box::pin(async move {
                    fills.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(Bytes::from_static(b"slow result"))
                });
                store.get_or_fill("k".to_owned(), slow).await
            })
        };

        // Drop the only waiter while its fill is in flight, then give the
        // detached fill time to finish and commit.
        tokio::time::sleep(Duration::from_millis(30)).await;
        caller.abort();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The next requester is served the completed fill's value; its own
        // fill never runs.
        let value = store
            .get_or_fill("k".to_owned(), counting_fill(Arc::clone(&fills), b"refill"))
            .await
            .unwrap();
        assert_eq!(value, Bytes::from_static(b"slow result"));
        assert_eq!(fills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fill_is_not_cached() {
        let store = MemoryStore::new("test", 4);

        let failing: FillFuture = Box::pin(async { Err(FillError::TaskFailed) });
        let err = store.get_or_fill("k".to_owned(), failing).await.unwrap_err();
        assert!(matches!(err, StoreError::Fill(_)));

        // The key resolves on the next attempt.
        let ok: FillFuture = Box::pin(async { Ok(Bytes::from_static(b"fresh")) });
        let value = store.get_or_fill("k".to_owned(), ok).await.unwrap();
        assert_eq!(value, Bytes::from_static(b"fresh"));
    }

    #[tokio::test]
    async fn panicking_fill_surfaces_as_error() {
        let store = MemoryStore::new("test", 4);

        let panicking: FillFuture = Box::pin(async { panic!("handler blew up") });
        let err = store
            .get_or_fill("k".to_owned(), panicking)
            .await
            .unwrap_err();
        let StoreError::Fill(fill_err) = err else {
            panic!("expected fill error");
        };
        assert!(matches!(*fill_err, FillError::TaskFailed));
    }
}
