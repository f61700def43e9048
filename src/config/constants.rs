//! Configuration constants.
//!
//! Defaults for the fetch pipeline, timeouts, and logging cadence. Most of
//! these can be overridden from the command line; the constants are the single
//! source of truth for the CLI defaults.

use std::time::Duration;

/// Default number of URLs fetched in parallel (`--jobs`).
pub const DEFAULT_CONCURRENCY: usize = 1000;

/// Default number of extra redirect hops to follow (`--redirects`).
pub const DEFAULT_REDIRECTS: u32 = 10;

/// Default idle keep-alive TTL for pooled connections (`--keepalive`).
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(120);

/// Default dial deadline (`--connect-timeout`).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default single-phase read/write deadline (`--io-timeout`).
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-URL ceiling, covering robots, every hop, and all socket I/O
/// (`--total-timeout`).
pub const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default per-host concurrent fetch cap (`--domain-concurrency`).
pub const DEFAULT_DOMAIN_CONCURRENCY: u32 = 2;

/// How often the progress task logs throughput, in seconds.
pub const LOGGING_INTERVAL_SECS: u64 = 10;

/// User-Agent sent with every outbound request. The same token is handed to
/// the robots matcher, so a site's `User-agent: CrawlWorkerBot` group applies
/// to our fetches.
pub const USER_AGENT: &str =
    "CrawlWorkerBot/0.3 (+https://github.com/crawl-worker/crawl-worker)";

/// Product token the robots matcher groups rules under.
pub const ROBOTS_AGENT: &str = "CrawlWorkerBot";

/// Upper bound on response head (status line + headers) size. A server that
/// streams more header bytes than this is speaking something other than HTTP.
pub const MAX_HEADER_BLOCK_SIZE: usize = 64 * 1024;

/// How many idle connections the transport keeps per `(scheme, host:port)`.
pub const MAX_IDLE_PER_HOST: usize = 1;
