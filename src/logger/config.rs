/// Process-wide logger configuration
///
/// Set once at startup from the `[logging]` config section and/or the
/// `CHAINTX_LOG` / `CHAINTX_DEBUG` environment variables, then read on
/// every log call.
use super::levels::LogLevel;
use super::tags::LogTag;
use crate::config::LoggingConfig;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashSet;

pub const LEVEL_ENV_VAR: &str = "CHAINTX_LOG";
pub const DEBUG_TAGS_ENV_VAR: &str = "CHAINTX_DEBUG";

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    /// Tags whose Debug output is shown
    pub debug_tags: HashSet<LogTag>,
    /// Show Verbose output for every tag
    pub verbose: bool,
    pub console: bool,
    pub file_path: Option<String>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            debug_tags: HashSet::new(),
            verbose: false,
            console: true,
            file_path: None,
        }
    }
}

impl LoggerConfig {
    pub fn from_settings(settings: &LoggingConfig) -> Self {
        let mut debug_tags = HashSet::new();
        for key in &settings.debug_tags {
            match LogTag::from_debug_key(key) {
                Some(tag) => {
                    debug_tags.insert(tag);
                }
                None => eprintln!("Unknown log tag '{}' in logging.debug_tags", key),
            }
        }

        let mut min_level = LogLevel::parse(&settings.level).unwrap_or(LogLevel::Info);
        if !debug_tags.is_empty() && min_level < LogLevel::Debug {
            min_level = LogLevel::Debug;
        }
        if settings.verbose {
            min_level = LogLevel::Verbose;
        }

        Self {
            min_level,
            debug_tags,
            verbose: settings.verbose,
            console: settings.console,
            file_path: settings.file_path.clone(),
        }
    }

    /// Overlay environment variables on top of this configuration
    pub fn apply_env(mut self) -> Self {
        if let Ok(level) = std::env::var(LEVEL_ENV_VAR) {
            if let Some(level) = LogLevel::parse(&level) {
                self.min_level = level;
                self.verbose = level == LogLevel::Verbose;
            }
        }
        if let Ok(tags) = std::env::var(DEBUG_TAGS_ENV_VAR) {
            self.debug_tags
                .extend(tags.split(',').filter_map(LogTag::from_debug_key));
            if !self.debug_tags.is_empty() && self.min_level < LogLevel::Debug {
                self.min_level = LogLevel::Debug;
            }
        }
        self
    }
}

static LOGGER_CONFIG: Lazy<RwLock<LoggerConfig>> =
    Lazy::new(|| RwLock::new(LoggerConfig::default().apply_env()));

pub fn get_logger_config() -> LoggerConfig {
    LOGGER_CONFIG.read().clone()
}

pub fn set_logger_config(config: LoggerConfig) {
    *LOGGER_CONFIG.write() = config;
}

pub fn is_debug_enabled_for_tag(tag: &LogTag) -> bool {
    let config = LOGGER_CONFIG.read();
    config.verbose || config.debug_tags.contains(tag)
}

pub fn is_verbose_enabled() -> bool {
    LOGGER_CONFIG.read().verbose
}

pub fn is_console_enabled() -> bool {
    LOGGER_CONFIG.read().console
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_tags_raise_minimum_level() {
        let settings = LoggingConfig {
            level: "warning".to_string(),
            debug_tags: vec!["heads".to_string(), "bogus".to_string()],
            ..LoggingConfig::default()
        };
        let config = LoggerConfig::from_settings(&settings);
        assert_eq!(config.min_level, LogLevel::Debug);
        assert!(config.debug_tags.contains(&LogTag::HeadTracker));
        assert_eq!(config.debug_tags.len(), 1);
    }

    #[test]
    fn verbose_setting_wins() {
        let settings = LoggingConfig {
            verbose: true,
            ..LoggingConfig::default()
        };
        assert_eq!(LoggerConfig::from_settings(&settings).min_level, LogLevel::Verbose);
    }
}
