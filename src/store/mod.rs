/// Durable storage
///
/// [`KvStore`] is the minimal contract a persistence engine must provide:
/// keyed get/put/delete, prefix iteration and ordered write batches.
/// [`Store`] layers typed records (JSON encoded) and every query the
/// broadcaster, confirmer and head tracker need on top of it.
///
/// Write ordering: every batch lists the least advanced record first (new
/// attempt before the transaction that references it, transaction before the
/// account nonce that depends on it). A backend that cannot apply a batch
/// atomically still leaves a resumable state after a crash.
mod heads;
mod sqlite;
mod txs;

pub use sqlite::SqliteStore;
pub use txs::MISSING_RECEIPT_ERROR;

use crate::errors::{StoreError, TxmError, TxmResult};
use crate::types::{Account, Address};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

// =============================================================================
// KEY-VALUE CONTRACT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(String, Vec<u8>),
    Delete(String),
}

/// Ordered list of writes applied together
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Put(key.into(), value));
        self
    }

    pub fn put_json<T: Serialize>(&mut self, key: impl Into<String>, record: &T) -> Result<&mut Self, StoreError> {
        let value = serde_json::to_vec(record)?;
        Ok(self.put(key, value))
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Delete(key.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All entries whose key starts with `prefix`, ordered by key
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Apply `batch` in order
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

/// Record key layout
pub mod keys {
    use crate::types::{Address, H256};
    use uuid::Uuid;

    pub const ACCOUNT_PREFIX: &str = "account/";
    pub const TX_PREFIX: &str = "tx/";
    pub const ATTEMPT_PREFIX: &str = "attempt/";
    pub const RECEIPT_PREFIX: &str = "receipt/";
    pub const HEAD_PREFIX: &str = "head/";
    pub const JOB_PREFIX: &str = "job/";

    pub fn account(address: &Address) -> String {
        format!("{}{}", ACCOUNT_PREFIX, address)
    }

    pub fn tx(id: &Uuid) -> String {
        format!("{}{}", TX_PREFIX, id)
    }

    pub fn attempt(id: &Uuid) -> String {
        format!("{}{}", ATTEMPT_PREFIX, id)
    }

    pub fn receipt(id: &Uuid) -> String {
        format!("{}{}", RECEIPT_PREFIX, id)
    }

    pub fn head(hash: &H256) -> String {
        format!("{}{}", HEAD_PREFIX, hash)
    }

    pub fn job(id: &Uuid) -> String {
        format!("{}{}", JOB_PREFIX, id)
    }
}

// =============================================================================
// TYPED STORE
// =============================================================================

/// Typed access to persisted records
///
/// Cheap to clone; clones share the backend and the account write lock.
#[derive(Clone)]
pub struct Store {
    kv: Arc<dyn KvStore>,
    /// Serializes read-modify-write of account records. Never held across an await.
    account_lock: Arc<Mutex<()>>,
}

impl Store {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            account_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Store over a fresh in-memory SQLite database
    pub fn in_memory() -> TxmResult<Self> {
        Ok(Self::new(Arc::new(SqliteStore::open_in_memory()?)))
    }

    pub(crate) fn get_record<T: DeserializeOwned>(&self, key: &str) -> TxmResult<Option<T>> {
        match self.kv.get(key)? {
            Some(bytes) => Ok(Some(decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn put_record<T: Serialize>(&self, key: &str, record: &T) -> TxmResult<()> {
        let bytes = serde_json::to_vec(record).map_err(StoreError::from)?;
        self.kv.put(key, &bytes)?;
        Ok(())
    }

    pub(crate) fn delete_record(&self, key: &str) -> TxmResult<()> {
        self.kv.delete(key)?;
        Ok(())
    }

    pub(crate) fn scan_records<T: DeserializeOwned>(&self, prefix: &str) -> TxmResult<Vec<T>> {
        self.kv
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(key, bytes)| decode(&key, &bytes))
            .collect()
    }

    pub(crate) fn write(&self, batch: WriteBatch) -> TxmResult<()> {
        if !batch.is_empty() {
            self.kv.write_batch(batch)?;
        }
        Ok(())
    }

    // ===== ACCOUNTS =====

    pub fn get_account(&self, address: &Address) -> TxmResult<Option<Account>> {
        self.get_record(&keys::account(address))
    }

    pub fn accounts(&self) -> TxmResult<Vec<Account>> {
        self.scan_records(keys::ACCOUNT_PREFIX)
    }

    /// Create the account if it does not exist yet; returns the stored record
    pub fn register_account(&self, address: &Address) -> TxmResult<Account> {
        let _guard = self.account_lock.lock();
        if let Some(existing) = self.get_account(address)? {
            return Ok(existing);
        }
        let account = Account::new(*address);
        self.put_record(&keys::account(address), &account)?;
        Ok(account)
    }

    /// Read-modify-write an account, appending the result after `batch`
    pub(crate) fn write_with_account<F>(&self, address: &Address, mut batch: WriteBatch, update: F) -> TxmResult<Account>
    where
        F: FnOnce(&mut Account),
    {
        let _guard = self.account_lock.lock();
        let mut account = self
            .get_account(address)?
            .ok_or(TxmError::AccountNotFound(*address))?;
        update(&mut account);
        batch.put_json(keys::account(address), &account)?;
        self.write(batch)?;
        Ok(account)
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> TxmResult<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        TxmError::Store(StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    })
}
