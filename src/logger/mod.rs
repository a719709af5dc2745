//! Structured, tag-based logging
//!
//! Every component logs through a level function and a [`LogTag`]:
//!
//! ```no_run
//! use chaintx::logger::{self, LogTag};
//!
//! logger::error(LogTag::Broadcaster, "Send failed");
//! logger::info(LogTag::HeadTracker, "Connected to node");
//! logger::debug(LogTag::Confirmer, "Receipt lookup details"); // only with the confirm debug tag
//! ```
//!
//! Filtering is driven by the process-wide [`LoggerConfig`], set with [`init`]
//! from the `[logging]` config section. Environment variables
//! `CHAINTX_LOG=<level>` and `CHAINTX_DEBUG=<tag>,<tag>` override it.

mod config;
mod core;
mod file;
mod format;
mod levels;
mod tags;

pub use config::{get_logger_config, set_logger_config, LoggerConfig};
pub use levels::LogLevel;
pub use tags::LogTag;

use crate::config::LoggingConfig;

/// Initialize the logger from configuration
///
/// Call once at startup, before starting services. Safe to call again to
/// reconfigure.
pub fn init(settings: &LoggingConfig) {
    let config = LoggerConfig::from_settings(settings).apply_env();
    if let Some(path) = &config.file_path {
        file::init_file_logging(path);
    }
    set_logger_config(config);
}

/// Log at ERROR level (always shown)
pub fn error(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Error, message);
}

/// Log at WARNING level
pub fn warning(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Warning, message);
}

/// Log at INFO level (normal operation)
pub fn info(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Info, message);
}

/// Log at DEBUG level, shown only for tags with debug enabled
pub fn debug(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Debug, message);
}

/// Log at VERBOSE level, shown only with the verbose flag
pub fn verbose(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Verbose, message);
}

/// Flush pending file writes; call during shutdown
pub fn flush() {
    file::flush_file_logging();
}
