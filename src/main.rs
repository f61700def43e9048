//! CLI entry point for the crawl worker.
//!
//! Reads URLs on stdin, fetches them, and writes result JSON on stdout.
//! Exit codes: 0 on a clean drain, 1 on argument errors or help, 2 on a
//! fatal stdin/stdout failure.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use crawl_worker::config::{
    parse_duration, Config, LogFormat, LogLevel, DEFAULT_CONCURRENCY, DEFAULT_DOMAIN_CONCURRENCY,
    DEFAULT_REDIRECTS,
};

#[derive(Debug, Parser)]
#[command(
    name = "crawl_worker",
    about = "Crawl worker: reads URLs on stdin, fetches them, writes results as JSON on stdout.\n\n\
             By default, follows up to 10 redirects and fetches /robots.txt first, obeying its rules.\n\
             Try `echo http://localhost/ | crawl_worker` to see a sample result.",
    disable_version_flag = true
)]
struct Opt {
    /// Try to crawl this many URLs in parallel
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    jobs: usize,

    /// How many redirects to follow. Can be 0
    #[arg(long, default_value_t = DEFAULT_REDIRECTS)]
    redirects: u32,

    /// Keep persistent connections to servers for this many seconds
    #[arg(long, default_value_t = 120)]
    keepalive: u64,

    /// Don't request and obey robots.txt
    #[arg(long)]
    skip_robots: bool,

    /// Don't return response bodies in results
    #[arg(long)]
    skip_body: bool,

    /// Deadline for establishing one connection (e.g. 15s, 500ms)
    #[arg(long, value_parser = parse_duration, default_value = "15s")]
    connect_timeout: Duration,

    /// Timeout for a single socket operation, read or write
    #[arg(long, value_parser = parse_duration, default_value = "30s")]
    io_timeout: Duration,

    /// Total timeout for crawling one URL, including robots.txt
    #[arg(long, value_parser = parse_duration, default_value = "60s")]
    total_timeout: Duration,

    /// Maximum concurrent fetches per host
    #[arg(long, default_value_t = DEFAULT_DOMAIN_CONCURRENCY)]
    domain_concurrency: u32,

    /// Log level (logs go to stderr)
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> ExitCode {
    let opt = match Opt::try_parse() {
        Ok(opt) => opt,
        Err(err) => {
            // Help and usage errors both land on stderr with exit code 1.
            eprint!("{err}");
            return ExitCode::from(1);
        }
    };
    if opt.jobs == 0 {
        eprintln!("Invalid concurrency limit: {}", opt.jobs);
        return ExitCode::from(1);
    }

    if let Err(err) =
        crawl_worker::app::init_logger_with(opt.log_level.clone().into(), opt.log_format.clone())
    {
        eprintln!("Failed to initialize logger: {err}");
        return ExitCode::from(1);
    }

    let config = Config {
        max_concurrency: opt.jobs,
        follow_redirects: opt.redirects,
        keep_alive: Duration::from_secs(opt.keepalive),
        skip_robots: opt.skip_robots,
        skip_body: opt.skip_body,
        connect_timeout: opt.connect_timeout,
        io_timeout: opt.io_timeout,
        fetch_timeout: opt.total_timeout,
        domain_concurrency: opt.domain_concurrency,
        ..Default::default()
    };

    match crawl_worker::run(config).await {
        Ok(summary) => {
            info!(
                "Done: {} URLs ({} succeeded, {} failed)",
                summary.total_urls, summary.succeeded, summary.failed
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("fatal: {err:#}");
            ExitCode::from(2)
        }
    }
}
