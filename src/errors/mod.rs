/// Error types
///
/// Every fallible public operation returns [`TxmResult`]. Node send failures
/// are classified in [`send`] before anything else reacts to them.
pub mod send;

pub use send::{classify_send_error, classify_send_result, SendOutcome};

use crate::types::{Address, Wei};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub type TxmResult<T> = Result<T, TxmError>;

/// Errors reported by a chain client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The node answered with an error message
    #[error("{0}")] Rpc(String),

    #[error("request timed out after {0:?}")] Timeout(Duration),

    #[error("connection error: {0}")] Connection(String),

    #[error("subscription error: {0}")] Subscription(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")] Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")] Serialization(#[from] serde_json::Error),

    #[error("Corrupt record at '{key}': {reason}")] Corrupt {
        key: String,
        reason: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("no key for account {0}")] UnknownAccount(Address),

    #[error("signing failed: {0}")] Failed(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")] Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")] Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")] Invalid(String),
}

#[derive(Error, Debug)]
pub enum TxmError {
    #[error("Store error: {0}")] Store(#[from] StoreError),

    #[error("Client error: {0}")] Client(#[from] ClientError),

    /// A send failed in a way that must be retried by a later pass
    #[error("error while sending transaction {tx_id}: {source}")] Send {
        tx_id: Uuid,
        source: ClientError,
    },

    #[error("Signing error: {0}")] Signing(#[from] SignerError),

    #[error(
        "bumped gas price of {bumped} would exceed configured max gas price of {max} (original price was {original})"
    )] GasBumpExceedsLimit {
        bumped: Wei,
        max: Wei,
        original: Wei,
    },

    #[error(
        "bumped gas price of {0} is equal to original gas price of {0}. ACTION REQUIRED: This is a configuration error, you must increase either GasBumpPercent or GasBumpWei"
    )] GasBumpNoEffect(Wei),

    #[error("chain id mismatch: configured {expected}, node reports {actual}")] ChainIdMismatch {
        expected: u64,
        actual: u64,
    },

    #[error("Account not found: {0}")] AccountNotFound(Address),

    #[error("Transaction not found: {0}")] TxNotFound(Uuid),

    #[error("Transaction attempt not found: {0}")] AttemptNotFound(Uuid),

    #[error("Receipt not found: {0}")] ReceiptNotFound(Uuid),

    #[error("Job not found: {0}")] JobNotFound(Uuid),

    #[error("Configuration error: {0}")] Config(#[from] ConfigError),

    #[error("Service error: {0}")] Service(String),

    #[error("Shutdown in progress")] Shutdown,
}

impl TxmError {
    /// Deployment misconfiguration that no retry will fix
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            TxmError::GasBumpExceedsLimit { .. }
                | TxmError::GasBumpNoEffect(_)
                | TxmError::ChainIdMismatch { .. }
                | TxmError::Config(_)
        )
    }

    /// Transient failure; the same operation may succeed later
    pub fn is_retryable(&self) -> bool {
        matches!(self, TxmError::Send { .. } | TxmError::Client(_))
    }
}
