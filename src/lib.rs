//! crawl_worker library: a high-throughput fetch pipeline.
//!
//! Reads URLs, fetches them over HTTP(S) with bounded global and per-host
//! parallelism, obeys robots.txt, follows redirects, and produces one JSON
//! report per URL. The binary wires this to stdin/stdout; the library surface
//! exists so the pipeline can be embedded and integration-tested without a
//! subprocess.
//!
//! # Example
//!
//! ```no_run
//! use crawl_worker::{Config, Transport, Worker};
//! use std::sync::Arc;
//! use url::Url;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let worker = Worker::new(Config::default(), Arc::new(Transport::new()));
//! let result = worker.fetch(&Url::parse("http://example.com/").unwrap()).await;
//! println!("{} -> {}", result.url, result.status);
//! # }
//! ```

pub mod app;
pub mod config;
pub mod dispatcher;
pub mod limits;
pub mod report;
pub mod robots;
pub mod transport;
pub mod worker;

// Re-export the public API
pub use config::{parse_duration, Config, LogFormat, LogLevel};
pub use dispatcher::{run, run_with_io, RunSummary};
pub use limits::{LimitMap, Semaphore};
pub use report::{encode_report, Report};
pub use transport::{Request, RequestOptions, Response, Transport, TransportError};
pub use worker::{FetchResult, FetchStat, Worker};
