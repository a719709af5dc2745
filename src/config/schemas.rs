/// Configuration schemas
///
/// Every section is declared with `config_struct!`, so a TOML file only needs
/// the values it overrides. Wei amounts are decimal strings.
use crate::config_struct;
use crate::types::Wei;
use std::time::Duration;

// ============================================================================
// CHAIN
// ============================================================================

config_struct! {
    /// Target network and node interaction
    pub struct ChainConfig {
        /// Chain id the node must report on every (re)connect
        chain_id: u64 = 1,
        /// Expected block interval; head handling budgets derive from it
        block_time_ms: u64 = 15_000,
        /// Heads kept in a chain passed to observers, and blocks until a
        /// receipt is considered final
        finality_depth: u64 = 50,
        /// Upper bound for any single node request
        request_timeout_ms: u64 = 30_000,
    }
}

impl ChainConfig {
    pub fn block_time(&self) -> Duration {
        Duration::from_millis(self.block_time_ms)
    }

    /// Hard budget for handling one head, observers included
    pub fn head_budget(&self) -> Duration {
        self.block_time() * 2
    }

    /// Budget for fetching missing ancestors of a new head
    pub fn backfill_budget(&self) -> Duration {
        self.block_time().mul_f64(0.7)
    }

    /// Observer callbacks slower than this are reported
    pub fn callback_threshold(&self) -> Duration {
        self.block_time()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ============================================================================
// GAS
// ============================================================================

config_struct! {
    /// Gas pricing and escalation
    pub struct GasConfig {
        default_gas_price: Wei = Wei::from_gwei(20),
        max_gas_price: Wei = Wei::from_gwei(5_000),
        bump_percent: u64 = 20,
        bump_wei: Wei = Wei::from_gwei(5),
    }
}

// ============================================================================
// HEAD TRACKER
// ============================================================================

config_struct! {
    /// Head subscription and history retention
    pub struct HeadTrackerConfig {
        /// Raw heads queued between subscription and consumer; oldest dropped when full
        buffer_size: usize = 3,
        /// Persisted heads kept below the highest one
        retention_depth: u64 = 100,
        backoff_min_ms: u64 = 1_000,
        backoff_max_ms: u64 = 60_000,
    }
}

impl HeadTrackerConfig {
    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

// ============================================================================
// BROADCASTER
// ============================================================================

config_struct! {
    pub struct BroadcasterConfig {
        /// Pass interval when no trigger arrives
        poll_interval_ms: u64 = 5_000,
    }
}

impl BroadcasterConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ============================================================================
// CONFIRMER
// ============================================================================

config_struct! {
    /// Re-pricing of stuck transactions
    pub struct ConfirmerConfig {
        /// Blocks a broadcast attempt must wait before it is re-priced
        gas_bump_threshold: u64 = 3,
        /// Unconfirmed transactions per account considered for re-pricing (0 = all)
        in_flight_depth: u64 = 16,
    }
}

// ============================================================================
// LOGGING
// ============================================================================

config_struct! {
    pub struct LoggingConfig {
        level: String = "info".to_string(),
        /// Tags with debug output enabled, e.g. ["heads", "confirm"]
        debug_tags: Vec<String> = Vec::new(),
        verbose: bool = false,
        console: bool = true,
        file_path: Option<String> = None,
    }
}

// ============================================================================
// ROOT CONFIGURATION
// ============================================================================

config_struct! {
    pub struct Config {
        chain: ChainConfig = ChainConfig::default(),
        gas: GasConfig = GasConfig::default(),
        head_tracker: HeadTrackerConfig = HeadTrackerConfig::default(),
        broadcaster: BroadcasterConfig = BroadcasterConfig::default(),
        confirmer: ConfirmerConfig = ConfirmerConfig::default(),
        logging: LoggingConfig = LoggingConfig::default(),
    }
}
