//! Run statistics.
//!
//! Thread-safe counters for every failure class the pipeline can hit, plus a
//! summary printed when the run drains. Counters are per-run, shared across
//! tasks via `Arc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::info;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

use crate::transport::TransportError;
use crate::worker::FetchResult;

/// Failure classes tracked across a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum ErrorType {
    IncorrectUrl,
    RobotsDisallow,
    RobotsDownloadError,
    RobotsParseError,
    FetchTimeout,
    ConnectTimeout,
    ReadTimeout,
    WriteTimeout,
    NetworkError,
    ProtocolError,
    EncodingError,
}

/// Per-`ErrorType` atomic counters.
pub struct FetchStats {
    errors: HashMap<ErrorType, AtomicUsize>,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl FetchStats {
    pub fn new() -> Self {
        let mut errors = HashMap::new();
        for error in ErrorType::iter() {
            errors.insert(error, AtomicUsize::new(0));
        }
        FetchStats {
            errors,
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    pub fn increment(&self, error: ErrorType) {
        if let Some(counter) = self.errors.get(&error) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_count(&self, error: ErrorType) -> usize {
        self.errors
            .get(&error)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Classifies a finished fetch into the right counter. The mapping keys
    /// off the status text the worker produces, which is stable.
    pub fn record(&self, result: &FetchResult) {
        if result.success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.failed.fetch_add(1, Ordering::Relaxed);

        let status = result.status.as_str();
        let error = if status.starts_with("Incorrect URL") {
            ErrorType::IncorrectUrl
        } else if status == "Robots disallow" {
            ErrorType::RobotsDisallow
        } else if status.starts_with("Robots download error") {
            ErrorType::RobotsDownloadError
        } else if status.starts_with("Robots parse error") {
            ErrorType::RobotsParseError
        } else if status.starts_with("Fetch timeout") {
            ErrorType::FetchTimeout
        } else if status.starts_with("connect timeout") {
            ErrorType::ConnectTimeout
        } else if status.starts_with("read timeout") {
            ErrorType::ReadTimeout
        } else if status.starts_with("write timeout") {
            ErrorType::WriteTimeout
        } else if status.starts_with("protocol error") {
            ErrorType::ProtocolError
        } else {
            ErrorType::NetworkError
        };
        self.increment(error);
    }

    /// Logs non-zero counters at the end of a run.
    pub fn log_summary(&self) {
        info!(
            "Fetches: {} succeeded, {} failed",
            self.succeeded(),
            self.failed()
        );
        for error in ErrorType::iter() {
            let count = self.get_count(error);
            if count > 0 {
                info!("   {error}: {count}");
            }
        }
    }
}

impl Default for FetchStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Classification helper for transport errors observed outside a result.
pub fn transport_error_type(err: &TransportError) -> ErrorType {
    match err {
        TransportError::DialTimeout(_) => ErrorType::ConnectTimeout,
        TransportError::WriteTimeout => ErrorType::WriteTimeout,
        TransportError::ReadTimeout => ErrorType::ReadTimeout,
        TransportError::Protocol(_) => ErrorType::ProtocolError,
        _ => ErrorType::NetworkError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_classifies_statuses() {
        let stats = FetchStats::new();

        stats.record(&FetchResult::error("u", "Incorrect URL: u"));
        stats.record(&FetchResult::error("u", "Robots disallow"));
        stats.record(&FetchResult::error(
            "u",
            "Robots download error: read timeout",
        ));
        stats.record(&FetchResult::error("u", "Fetch timeout: 60000"));
        stats.record(&FetchResult::error("u", "connect timeout to h:80"));
        stats.record(&FetchResult::error("u", "read error: connection reset"));

        assert_eq!(stats.get_count(ErrorType::IncorrectUrl), 1);
        assert_eq!(stats.get_count(ErrorType::RobotsDisallow), 1);
        assert_eq!(stats.get_count(ErrorType::RobotsDownloadError), 1);
        assert_eq!(stats.get_count(ErrorType::FetchTimeout), 1);
        assert_eq!(stats.get_count(ErrorType::ConnectTimeout), 1);
        assert_eq!(stats.get_count(ErrorType::NetworkError), 1);
        assert_eq!(stats.failed(), 6);
        assert_eq!(stats.succeeded(), 0);
    }

    #[test]
    fn test_record_counts_successes() {
        let stats = FetchStats::new();
        let mut result = FetchResult::error("u", "");
        result.success = true;
        stats.record(&result);
        assert_eq!(stats.succeeded(), 1);
        assert_eq!(stats.failed(), 0);
    }

    #[test]
    fn test_transport_error_mapping() {
        assert_eq!(
            transport_error_type(&TransportError::DialTimeout("h:80".into())),
            ErrorType::ConnectTimeout
        );
        assert_eq!(
            transport_error_type(&TransportError::WriteTimeout),
            ErrorType::WriteTimeout
        );
    }
}
