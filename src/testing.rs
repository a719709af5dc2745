//! Test doubles shared by the unit and scenario tests

use crate::chain::{
    ChainClient, HeadSender, HeadSubscription, Log, LogFilter, Receipt, SignedTx, Signer, UnsignedTx,
};
use crate::config::Config;
use crate::errors::{ClientError, SignerError, TxmResult};
use crate::head_tracker::{HeadContext, HeadTrackable};
use crate::shutdown::ShutdownSignal;
use crate::store::Store;
use crate::types::{Address, Head, Tx, TxState, Wei, H256};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

pub const CHAIN_ID: u64 = 1337;
pub const FROM: Address = Address([0xaa; 20]);
pub const TO: Address = Address([0xbb; 20]);

/// Config tuned for fast tests
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.chain.chain_id = CHAIN_ID;
    config.chain.block_time_ms = 500;
    config.chain.finality_depth = 5;
    config.chain.request_timeout_ms = 200;
    config.head_tracker.retention_depth = 20;
    config.head_tracker.backoff_min_ms = 10;
    config.head_tracker.backoff_max_ms = 50;
    config.broadcaster.poll_interval_ms = 50;
    config.logging.console = false;
    config
}

pub fn store_with_account(address: &Address) -> Store {
    let store = Store::in_memory().unwrap();
    store.register_account(address).unwrap();
    store
}

/// Unstarted 1 wei transfer from `from`
pub fn unstarted_tx(from: Address) -> Tx {
    Tx {
        id: Uuid::new_v4(),
        from,
        to: TO,
        payload: Vec::new(),
        value: Wei(1),
        gas_limit: 21_000,
        max_gas_price: None,
        nonce: None,
        state: TxState::Unstarted,
        error: None,
        attempt_ids: Vec::new(),
        created_at: Utc::now(),
    }
}

/// Persist an Unstarted transaction for `from`
pub fn insert_unstarted(store: &Store, from: Address) -> Tx {
    let tx = unstarted_tx(from);
    store.insert_tx(&tx).unwrap();
    tx
}

/// Block hash used by [`head`] for `number` on fork `fork`
pub fn block_hash(number: u64, fork: u8) -> H256 {
    let mut bytes = [0u8; 32];
    bytes[0] = fork;
    bytes[24..].copy_from_slice(&number.to_be_bytes());
    H256(bytes)
}

/// Head on the main fork whose parent is `number - 1` on the same fork
pub fn head(number: u64) -> Head {
    fork_head(number, 0)
}

pub fn fork_head(number: u64, fork: u8) -> Head {
    let parent = if number == 0 { H256::default() } else { block_hash(number - 1, fork) };
    Head::new(number, block_hash(number, fork), parent, number as i64 * 12)
}

/// Linked main-fork chain from `from` to `to`, newest first
pub fn chain(from: u64, to: u64) -> Head {
    Head::link((from..=to).rev().map(head).collect()).unwrap()
}

pub fn ctx() -> HeadContext {
    HeadContext::new(Instant::now() + Duration::from_secs(5), ShutdownSignal::new())
}

// =============================================================================
// SIGNER
// =============================================================================

/// Raw bytes produced by [`MockSigner`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockSignedPayload {
    pub from: Address,
    pub chain_id: u64,
    pub tx: UnsignedTx,
}

pub fn decode_raw(raw: &[u8]) -> MockSignedPayload {
    serde_json::from_slice(raw).unwrap()
}

#[derive(Default)]
pub struct MockSigner {
    pub fail: AtomicBool,
    /// Empty means every address has a key
    pub accounts: Mutex<HashSet<Address>>,
    pub signed: AtomicUsize,
}

impl MockSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: &[Address]) -> Self {
        let signer = Self::default();
        signer.accounts.lock().extend(accounts.iter().copied());
        signer
    }
}

impl Signer for MockSigner {
    fn has_account(&self, address: &Address) -> bool {
        let accounts = self.accounts.lock();
        accounts.is_empty() || accounts.contains(address)
    }

    fn sign_transaction(&self, from: &Address, tx: &UnsignedTx, chain_id: u64) -> Result<SignedTx, SignerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SignerError::Failed("keystore locked".to_string()));
        }
        if !self.has_account(from) {
            return Err(SignerError::UnknownAccount(*from));
        }
        let payload = MockSignedPayload {
            from: *from,
            chain_id,
            tx: tx.clone(),
        };
        let raw = serde_json::to_vec(&payload).map_err(|e| SignerError::Failed(e.to_string()))?;
        let digest = Sha256::digest(&raw);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&digest);
        let hash = H256(hash);
        self.signed.fetch_add(1, Ordering::SeqCst);
        Ok(SignedTx { hash, raw })
    }
}

// =============================================================================
// CHAIN CLIENT
// =============================================================================

#[derive(Default)]
pub struct MockChainClient {
    chain_id: AtomicU64,
    /// Scripted send results, consumed in order; empty means success
    send_results: Mutex<VecDeque<Result<(), ClientError>>>,
    /// Send result used for every send once set
    sticky_send_result: Mutex<Option<Result<(), ClientError>>>,
    sent: Mutex<Vec<SignedTx>>,
    pending_nonce: Mutex<Option<Result<u64, ClientError>>>,
    pending_nonce_calls: AtomicUsize,
    headers: Mutex<HashMap<u64, Head>>,
    header_calls: Mutex<Vec<u64>>,
    header_delay: Mutex<Option<Duration>>,
    receipts: Mutex<HashMap<H256, Receipt>>,
    subscriptions: Mutex<Vec<HeadSender>>,
    subscribe_calls: AtomicUsize,
    fail_subscribe: AtomicBool,
    logs: Mutex<Vec<Log>>,
}

impl MockChainClient {
    pub fn new() -> Self {
        let client = Self::default();
        client.chain_id.store(CHAIN_ID, Ordering::SeqCst);
        *client.pending_nonce.lock() = Some(Ok(0));
        client
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.chain_id.store(chain_id, Ordering::SeqCst);
    }

    pub fn push_send_result(&self, result: Result<(), ClientError>) {
        self.send_results.lock().push_back(result);
    }

    pub fn push_send_error(&self, message: &str) {
        self.push_send_result(Err(ClientError::Rpc(message.to_string())));
    }

    pub fn set_sticky_send_error(&self, message: Option<&str>) {
        *self.sticky_send_result.lock() = message.map(|m| Err(ClientError::Rpc(m.to_string())));
    }

    pub fn sent(&self) -> Vec<SignedTx> {
        self.sent.lock().clone()
    }

    /// Decoded unsigned transactions in send order
    pub fn sent_txs(&self) -> Vec<UnsignedTx> {
        self.sent().iter().map(|tx| decode_raw(&tx.raw).tx).collect()
    }

    pub fn set_pending_nonce(&self, result: Result<u64, ClientError>) {
        *self.pending_nonce.lock() = Some(result);
    }

    pub fn pending_nonce_calls(&self) -> usize {
        self.pending_nonce_calls.load(Ordering::SeqCst)
    }

    pub fn insert_header(&self, head: Head) {
        self.headers.lock().insert(head.number, head);
    }

    pub fn header_calls(&self) -> Vec<u64> {
        self.header_calls.lock().clone()
    }

    pub fn set_header_delay(&self, delay: Duration) {
        *self.header_delay.lock() = Some(delay);
    }

    pub fn insert_receipt(&self, receipt: Receipt) {
        self.receipts.lock().insert(receipt.tx_hash, receipt);
    }

    pub fn remove_receipt(&self, hash: &H256) {
        self.receipts.lock().remove(hash);
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Deliver `head` to the newest live subscription
    pub async fn send_head(&self, head: Head) {
        let sender = self.subscriptions.lock().last().cloned();
        if let Some(sender) = sender {
            let _ = sender.send(Ok(head)).await;
        }
    }

    pub async fn send_subscription_error(&self, message: &str) {
        let sender = self.subscriptions.lock().last().cloned();
        if let Some(sender) = sender {
            let _ = sender
                .send(Err(ClientError::Subscription(message.to_string())))
                .await;
        }
    }

    pub fn add_log(&self, log: Log) {
        self.logs.lock().push(log);
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn chain_id(&self) -> Result<u64, ClientError> {
        Ok(self.chain_id.load(Ordering::SeqCst))
    }

    async fn header_by_number(&self, number: u64) -> Result<Option<Head>, ClientError> {
        self.header_calls.lock().push(number);
        let delay = *self.header_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.headers.lock().get(&number).cloned())
    }

    async fn pending_nonce_at(&self, _address: &Address) -> Result<u64, ClientError> {
        self.pending_nonce_calls.fetch_add(1, Ordering::SeqCst);
        self.pending_nonce
            .lock()
            .clone()
            .unwrap_or_else(|| Err(ClientError::Connection("no pending nonce scripted".to_string())))
    }

    async fn send_transaction(&self, tx: &SignedTx) -> Result<(), ClientError> {
        self.sent.lock().push(tx.clone());
        if let Some(result) = self.sticky_send_result.lock().clone() {
            return result;
        }
        self.send_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn transaction_receipt(&self, hash: &H256) -> Result<Option<Receipt>, ClientError> {
        Ok(self.receipts.lock().get(hash).cloned())
    }

    async fn subscribe_new_heads(&self) -> Result<HeadSubscription, ClientError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(ClientError::Connection("connection refused".to_string()));
        }
        let (sender, subscription) = HeadSubscription::channel(16);
        self.subscriptions.lock().push(sender);
        Ok(subscription)
    }

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, ClientError> {
        let logs = self.logs.lock().clone();
        Ok(logs
            .into_iter()
            .filter(|log| filter.from_block.map_or(true, |from| log.block_number >= from))
            .filter(|log| filter.to_block.map_or(true, |to| log.block_number <= to))
            .filter(|log| filter.addresses.is_empty() || filter.addresses.contains(&log.address))
            .collect())
    }
}

/// Receipt for `hash` mined in main-fork block `number`
pub fn receipt(hash: H256, number: u64) -> Receipt {
    Receipt {
        tx_hash: hash,
        block_number: number,
        block_hash: block_hash(number, 0),
        success: true,
        gas_used: 21_000,
    }
}

pub fn gwei(amount: u64) -> Wei {
    Wei::from_gwei(amount)
}

// =============================================================================
// OBSERVER
// =============================================================================

/// Records every observer callback
#[derive(Default)]
pub struct RecordingTrackable {
    pub connects: Mutex<Vec<Option<u64>>>,
    pub disconnects: AtomicUsize,
    /// (head number, chain length) per callback
    pub chains: Mutex<Vec<(u64, usize)>>,
    pub delay: Mutex<Option<Duration>>,
}

impl RecordingTrackable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heads(&self) -> Vec<u64> {
        self.chains.lock().iter().map(|(number, _)| *number).collect()
    }
}

#[async_trait]
impl HeadTrackable for RecordingTrackable {
    fn name(&self) -> &'static str {
        "recorder"
    }

    async fn connect(&self, head: Option<&Head>) -> TxmResult<()> {
        self.connects.lock().push(head.map(|h| h.number));
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_new_longest_chain(&self, _ctx: &HeadContext, head: &Head) {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.chains.lock().push((head.number, head.chain_length()));
    }
}

/// Poll `condition` until it holds or a second passes
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
