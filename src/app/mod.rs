//! Application plumbing: logging and run statistics.

pub mod logging;
pub mod stats;

pub use logging::{init_logger_with, log_progress};
pub use stats::{ErrorType, FetchStats};
