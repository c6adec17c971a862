//! # servecache
//!
//! HTTP response memoization middleware: wrap an expensive handler once, and
//! repeated requests for the same cache key are answered from stored bytes
//! instead of re-running the handler. Concurrent requests for an uncached key
//! trigger exactly one computation (single-flight); everyone else waits for
//! the same result.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use servecache::middleware::CacheMiddleware;
//! use servecache::server::Server;
//! use servecache::http::{Response, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = CacheMiddleware::new("hello", 64);
//!     let handler = cache.wrap_fn(|_req| async {
//!         Response::new(StatusCode::Ok).body("This was expensive to compute, but is cached.\n")
//!     });
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     server.run(handler).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## How a request flows
//!
//! 1. The key function maps the request to a string key (default: path plus
//!    query string).
//! 2. The [`cache::CacheStore`] is asked for the key, with a fill callback.
//! 3. On a miss, the fill runs the wrapped handler, captures its response
//!    into a binary [`envelope::Envelope`], and stores the bytes.
//! 4. The bytes are decoded and replayed into the response for this caller —
//!    identical status, header order, and body, hit or miss.

pub mod cache;
pub mod capture;
pub mod envelope;
pub mod http;
pub mod middleware;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use middleware::{handler_fn, CacheMiddleware, CacheStats, Handler};
pub use server::{Server, ServerError};
