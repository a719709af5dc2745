/// External collaborators: the chain client and the signer
///
/// Transport, key custody and header decoding live behind these traits;
/// nothing in the crate talks to a node or a keystore directly.
use crate::errors::{ClientError, SignerError};
use crate::types::{Address, Head, Wei, H256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

// =============================================================================
// WIRE TYPES
// =============================================================================

/// Transaction fields handed to the signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTx {
    pub nonce: u64,
    pub to: Address,
    pub value: Wei,
    pub gas_limit: u64,
    pub gas_price: Wei,
    #[serde(with = "crate::types::hex_bytes")]
    pub payload: Vec<u8>,
}

/// Signed, broadcastable transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub hash: H256,
    pub raw: Vec<u8>,
}

/// Receipt as reported by the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: H256,
    pub block_number: u64,
    pub block_hash: H256,
    pub success: bool,
    pub gas_used: u64,
}

/// Event log filter (inclusive block range)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub addresses: Vec<Address>,
    pub topics: Vec<Option<H256>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub block_hash: H256,
    pub tx_hash: H256,
    pub log_index: u64,
}

// =============================================================================
// HEAD SUBSCRIPTION
// =============================================================================

/// Sending half of a head subscription, held by the client implementation
pub type HeadSender = mpsc::Sender<Result<Head, ClientError>>;

/// Stream of new heads from the node
///
/// `recv` yields `None` once the client drops its sender. Dropping the
/// subscription unsubscribes.
pub struct HeadSubscription {
    receiver: mpsc::Receiver<Result<Head, ClientError>>,
}

impl HeadSubscription {
    pub fn new(receiver: mpsc::Receiver<Result<Head, ClientError>>) -> Self {
        Self { receiver }
    }

    /// Create a connected sender/subscription pair
    pub fn channel(capacity: usize) -> (HeadSender, HeadSubscription) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, HeadSubscription::new(rx))
    }

    pub async fn recv(&mut self) -> Option<Result<Head, ClientError>> {
        self.receiver.recv().await
    }
}

// =============================================================================
// TRAITS
// =============================================================================

/// Node access
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64, ClientError>;

    /// Header at `number`, `None` if the node does not know it
    async fn header_by_number(&self, number: u64) -> Result<Option<Head>, ClientError>;

    /// Next nonce for `address` including pending transactions
    async fn pending_nonce_at(&self, address: &Address) -> Result<u64, ClientError>;

    async fn send_transaction(&self, tx: &SignedTx) -> Result<(), ClientError>;

    /// Receipt for `hash`, `None` while unmined
    async fn transaction_receipt(&self, hash: &H256) -> Result<Option<Receipt>, ClientError>;

    async fn subscribe_new_heads(&self) -> Result<HeadSubscription, ClientError>;

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, ClientError>;
}

/// Key custody
pub trait Signer: Send + Sync {
    fn has_account(&self, address: &Address) -> bool;

    fn sign_transaction(
        &self,
        from: &Address,
        tx: &UnsignedTx,
        chain_id: u64,
    ) -> Result<SignedTx, SignerError>;
}

/// Run a node request under `limit`; expiry becomes [`ClientError::Timeout`]
pub async fn with_timeout<T, F>(limit: Duration, request: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    match tokio::time::timeout(limit, request).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout(limit)),
    }
}
