//! Logger setup and progress reporting.
//!
//! All logs go to stderr: stdout is reserved for report lines. The plain
//! format is colored for humans; the JSON format is one object per line for
//! log shippers.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use colored::Colorize;
use log::{info, LevelFilter};

use crate::config::LogFormat;

/// Initializes `env_logger` with the given level and format.
///
/// Returns an error when a logger was already installed (double
/// initialization), which only happens in misuse from tests.
pub fn init_logger_with(level: LevelFilter, format: LogFormat) -> Result<(), log::SetLoggerError> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    // The TLS stack is chatty at debug level and rarely the interesting part.
    builder.filter_module("rustls", LevelFilter::Info);
    builder.filter_module("crawl_worker", level);

    match format {
        LogFormat::Json => {
            builder.format(|buf, record| {
                writeln!(
                    buf,
                    "{{\"ts\":{},\"level\":\"{}\",\"target\":\"{}\",\"msg\":{}}}",
                    chrono::Utc::now().timestamp_millis(),
                    record.level(),
                    record.target(),
                    serde_json::to_string(&record.args().to_string())
                        .unwrap_or_else(|_| "\"\"".into())
                )
            });
        }
        LogFormat::Plain => {
            builder.format(|buf, record| {
                let level = record.level();
                let colored_level = match level {
                    log::Level::Error => level.to_string().red(),
                    log::Level::Warn => level.to_string().yellow(),
                    log::Level::Info => level.to_string().green(),
                    log::Level::Debug => level.to_string().blue(),
                    log::Level::Trace => level.to_string().purple(),
                };
                writeln!(
                    buf,
                    "{} [{}] {}",
                    record.target().cyan(),
                    colored_level,
                    record.args()
                )
            });
        }
    }

    builder.try_init()
}

/// Logs how many URLs completed and the observed rate.
pub fn log_progress(start_time: std::time::Instant, completed: &Arc<AtomicUsize>) {
    let elapsed = start_time.elapsed().as_secs_f64();
    let done = completed.load(Ordering::SeqCst);
    let rate = if elapsed > 0.0 { done as f64 / elapsed } else { 0.0 };
    info!("Processed {done} URLs in {elapsed:.2} seconds (~{rate:.2}/sec)");
}
