/// Configuration loading and validation
use super::schemas::Config;
use crate::errors::ConfigError;
use crate::logger::{self, LogTag};
use std::path::Path;

/// Default configuration file path
pub const CONFIG_FILE_PATH: &str = "data/chaintx.toml";

/// Load configuration from a TOML file
///
/// A missing file yields the defaults. The result is validated before it is
/// returned.
pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let config = if path.exists() {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Config::from_toml_str(&contents)?
    } else {
        logger::warning(
            LogTag::Config,
            &format!("Config file '{}' not found, using default values", path.display()),
        );
        Config::default()
    };

    config.validate()?;
    Ok(config)
}

/// Load configuration from the default path
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from_path(CONFIG_FILE_PATH)
}

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Config, ConfigError> {
        Ok(toml::from_str::<Config>(contents)?)
    }

    /// Reject values that would make the managers misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.chain.chain_id == 0 {
            return invalid("chain.chain_id must be non-zero".to_string());
        }
        if self.chain.block_time_ms == 0 {
            return invalid("chain.block_time_ms must be non-zero".to_string());
        }
        if self.chain.finality_depth == 0 {
            return invalid("chain.finality_depth must be non-zero".to_string());
        }
        if self.chain.request_timeout_ms == 0 {
            return invalid("chain.request_timeout_ms must be non-zero".to_string());
        }
        if self.gas.default_gas_price > self.gas.max_gas_price {
            return invalid(format!(
                "gas.default_gas_price ({}) exceeds gas.max_gas_price ({})",
                self.gas.default_gas_price, self.gas.max_gas_price
            ));
        }
        if self.head_tracker.buffer_size == 0 {
            return invalid("head_tracker.buffer_size must be non-zero".to_string());
        }
        if self.head_tracker.retention_depth < self.chain.finality_depth {
            return invalid(format!(
                "head_tracker.retention_depth ({}) must be at least chain.finality_depth ({})",
                self.head_tracker.retention_depth, self.chain.finality_depth
            ));
        }
        if self.head_tracker.backoff_min_ms == 0
            || self.head_tracker.backoff_min_ms > self.head_tracker.backoff_max_ms
        {
            return invalid(
                "head_tracker.backoff_min_ms must be non-zero and not above backoff_max_ms"
                    .to_string(),
            );
        }
        if self.broadcaster.poll_interval_ms == 0 {
            return invalid("broadcaster.poll_interval_ms must be non-zero".to_string());
        }
        Ok(())
    }
}
