//! Configuration types and CLI-facing enums.
//!
//! `Config` is the library configuration: it can be built programmatically
//! without any CLI dependency. The binary maps clap arguments onto it.

use std::time::Duration;

use clap::ValueEnum;

use crate::config::constants::{
    DEFAULT_CONCURRENCY, DEFAULT_CONNECT_TIMEOUT, DEFAULT_DOMAIN_CONCURRENCY, DEFAULT_IO_TIMEOUT,
    DEFAULT_KEEPALIVE, DEFAULT_REDIRECTS, DEFAULT_TOTAL_TIMEOUT, USER_AGENT,
};

/// Logging level for the application.
#[derive(Clone, Debug, ValueEnum)]
pub enum LogLevel {
    /// Only error messages
    Error,
    /// Error and warning messages
    Warn,
    /// Error, warning, and informational messages
    Info,
    /// All messages except trace
    Debug,
    /// All messages including trace
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(name)
    }
}

impl From<LogLevel> for log::LevelFilter {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Log output format. Logs go to stderr; stdout carries reports only.
#[derive(Clone, Debug, ValueEnum)]
pub enum LogFormat {
    /// Human-readable format with colors (default)
    Plain,
    /// Structured JSON format for machine parsing
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LogFormat::Plain => "plain",
            LogFormat::Json => "json",
        })
    }
}

/// Worker configuration (no CLI dependencies).
///
/// # Examples
///
/// ```no_run
/// use crawl_worker::Config;
///
/// let config = Config {
///     max_concurrency: 200,
///     skip_robots: true,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum concurrent fetches across all hosts
    pub max_concurrency: usize,

    /// How many extra redirect hops to follow; 0 reports redirects as terminal
    pub follow_redirects: u32,

    /// Idle TTL for pooled keep-alive connections
    pub keep_alive: Duration,

    /// When true, robots.txt is never consulted
    pub skip_robots: bool,

    /// When true, response bodies are discarded after the read completes
    pub skip_body: bool,

    /// Deadline for establishing one connection (TCP + TLS)
    pub connect_timeout: Duration,

    /// Deadline for a single read or write phase
    pub io_timeout: Duration,

    /// Ceiling for one URL: robots, every hop, all network I/O
    pub fetch_timeout: Duration,

    /// Concurrent fetch cap per `host:port`
    pub domain_concurrency: u32,

    /// Hard cap on response body bytes; 0 means unlimited
    pub read_limit: u64,

    /// User-Agent header value, also used as the robots agent identity
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_CONCURRENCY,
            follow_redirects: DEFAULT_REDIRECTS,
            keep_alive: DEFAULT_KEEPALIVE,
            skip_robots: false,
            skip_body: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            fetch_timeout: DEFAULT_TOTAL_TIMEOUT,
            domain_concurrency: DEFAULT_DOMAIN_CONCURRENCY,
            read_limit: 0,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

/// Parses a human-friendly duration: `500ms`, `15s`, `2m`, or a bare number
/// of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {s:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" | "" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        other => Err(format!("unknown duration unit {other:?} in {s:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10h").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn test_config_defaults_match_cli_table() {
        let config = Config::default();
        assert_eq!(config.max_concurrency, 1000);
        assert_eq!(config.follow_redirects, 10);
        assert_eq!(config.keep_alive, Duration::from_secs(120));
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.io_timeout, Duration::from_secs(30));
        assert_eq!(config.fetch_timeout, Duration::from_secs(60));
        assert_eq!(config.domain_concurrency, 2);
        assert!(!config.skip_robots);
        assert!(!config.skip_body);
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(
            log::LevelFilter::from(LogLevel::Error),
            log::LevelFilter::Error
        );
        assert_eq!(
            log::LevelFilter::from(LogLevel::Trace),
            log::LevelFilter::Trace
        );
    }
}
