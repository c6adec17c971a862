//! Demo: memoize an expensive handler and watch the hit counter climb.
//!
//! Run with `cargo run --example cached_server`, then:
//!
//! ```text
//! curl http://127.0.0.1:8080/report?q=anything
//! curl http://127.0.0.1:8080/stats
//! ```
//!
//! The first request for a given path+query takes about a second; repeats
//! are instant.

use std::time::Duration;

use servecache::http::{Response, StatusCode};
use servecache::middleware::{handler_fn, CacheMiddleware};
use servecache::server::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "servecache=debug".into()),
        )
        .init();

    let cache = CacheMiddleware::new("demo", 128);

    let expensive = cache.wrap_fn(|req| {
        let key = req.path().to_owned();
        async move {
            // Stand-in for a slow upstream call or heavy computation.
            tokio::time::sleep(Duration::from_secs(1)).await;
            Response::new(StatusCode::Ok)
                .header("X-Generated-For", key)
                .body("This response was very expensive to compute, but is cached.\n")
        }
    });

    let stats_cache = cache.clone();
    let handler = handler_fn(move |req| {
        let expensive = expensive.clone();
        let stats = stats_cache.stats();
        async move {
            match req.path() {
                "/stats" => {
                    let body = serde_json::to_string_pretty(&stats)
                        .unwrap_or_else(|_| "{}".to_owned());
                    Response::new(StatusCode::Ok)
                        .header("Content-Type", "application/json")
                        .body(body)
                }
                _ => expensive(req).await,
            }
        }
    });

    let server = Server::bind("127.0.0.1:8080").await?;
    println!("Listening on http://{}", server.local_addr());
    server.run(handler).await?;
    Ok(())
}
