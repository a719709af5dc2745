/// Transaction, attempt and receipt records and the reconciliation queries
/// run against them.
use super::{keys, Store, WriteBatch};
use crate::errors::{TxmError, TxmResult};
use crate::types::{Account, Address, AttemptState, Tx, TxAttempt, TxReceipt, TxState};
use std::collections::HashMap;
use uuid::Uuid;

/// Error recorded on transactions whose receipt never showed up
pub const MISSING_RECEIPT_ERROR: &str = "could not get receipt";

impl Store {
    // ===== PLAIN ACCESS =====

    pub fn get_tx(&self, id: &Uuid) -> TxmResult<Option<Tx>> {
        self.get_record(&keys::tx(id))
    }

    pub fn get_attempt(&self, id: &Uuid) -> TxmResult<Option<TxAttempt>> {
        self.get_record(&keys::attempt(id))
    }

    pub fn get_receipt(&self, id: &Uuid) -> TxmResult<Option<TxReceipt>> {
        self.get_record(&keys::receipt(id))
    }

    pub fn put_tx(&self, tx: &Tx) -> TxmResult<()> {
        self.put_record(&keys::tx(&tx.id), tx)
    }

    pub fn put_attempt(&self, attempt: &TxAttempt) -> TxmResult<()> {
        self.put_record(&keys::attempt(&attempt.id), attempt)
    }

    /// Attempts of `tx`, oldest first
    pub fn attempts_of(&self, tx: &Tx) -> TxmResult<Vec<TxAttempt>> {
        let mut attempts = Vec::with_capacity(tx.attempt_ids.len());
        for id in &tx.attempt_ids {
            if let Some(attempt) = self.get_attempt(id)? {
                attempts.push(attempt);
            }
        }
        Ok(attempts)
    }

    pub fn receipts_of(&self, attempt: &TxAttempt) -> TxmResult<Vec<TxReceipt>> {
        let mut receipts = Vec::with_capacity(attempt.receipt_ids.len());
        for id in &attempt.receipt_ids {
            if let Some(receipt) = self.get_receipt(id)? {
                receipts.push(receipt);
            }
        }
        Ok(receipts)
    }

    /// Transactions of an account in creation order
    pub fn txs_of_account(&self, account: &Account) -> TxmResult<Vec<Tx>> {
        let mut txs = Vec::with_capacity(account.tx_ids.len());
        for id in &account.tx_ids {
            if let Some(tx) = self.get_tx(id)? {
                txs.push(tx);
            }
        }
        Ok(txs)
    }

    fn txs_of_address(&self, address: &Address) -> TxmResult<Vec<Tx>> {
        match self.get_account(address)? {
            Some(account) => self.txs_of_account(&account),
            None => Ok(Vec::new()),
        }
    }

    fn txs_in_states(&self, states: &[TxState]) -> TxmResult<Vec<Tx>> {
        let txs: Vec<Tx> = self.scan_records(keys::TX_PREFIX)?;
        Ok(txs.into_iter().filter(|tx| states.contains(&tx.state)).collect())
    }

    // ===== LIFECYCLE WRITES =====

    /// Persist a new Unstarted transaction and append it to its account
    pub fn insert_tx(&self, tx: &Tx) -> TxmResult<()> {
        let mut batch = WriteBatch::new();
        batch.put_json(keys::tx(&tx.id), tx)?;
        self.write_with_account(&tx.from, batch, |account| account.tx_ids.push(tx.id))?;
        Ok(())
    }

    /// Persist a freshly signed attempt, then the transaction referencing it
    pub fn save_new_attempt(&self, tx: &Tx, attempt: &TxAttempt) -> TxmResult<()> {
        let mut batch = WriteBatch::new();
        batch
            .put_json(keys::attempt(&attempt.id), attempt)?
            .put_json(keys::tx(&tx.id), tx)?;
        self.write(batch)
    }

    /// Swap `old_attempt_id` for `replacement` on `tx`
    pub fn replace_attempt(&self, tx: &mut Tx, old_attempt_id: &Uuid, replacement: &TxAttempt) -> TxmResult<()> {
        match tx.attempt_ids.iter().position(|id| id == old_attempt_id) {
            Some(index) => tx.attempt_ids[index] = replacement.id,
            None => tx.attempt_ids.push(replacement.id),
        }
        let mut batch = WriteBatch::new();
        batch
            .put_json(keys::attempt(&replacement.id), replacement)?
            .put_json(keys::tx(&tx.id), tx)?
            .delete(keys::attempt(old_attempt_id));
        self.write(batch)
    }

    /// Record an accepted first broadcast: attempt Broadcast, transaction
    /// Unconfirmed, then the account's next nonce moves past this one
    pub fn save_broadcast(&self, tx: &mut Tx, attempt: &mut TxAttempt) -> TxmResult<Account> {
        let nonce = tx.nonce.ok_or_else(|| {
            TxmError::Service(format!("transaction {} has no nonce to broadcast", tx.id))
        })?;
        attempt.state = AttemptState::Broadcast;
        tx.state = TxState::Unconfirmed;
        tx.error = None;

        let mut batch = WriteBatch::new();
        batch
            .put_json(keys::attempt(&attempt.id), &*attempt)?
            .put_json(keys::tx(&tx.id), &*tx)?;
        self.write_with_account(&tx.from, batch, |account| {
            account.next_nonce = Some(nonce + 1);
        })
    }

    /// Record a fatal rejection: the nonce is released and attempts removed
    pub fn save_fatal(&self, tx: &mut Tx, error: &str) -> TxmResult<()> {
        let attempt_ids = std::mem::take(&mut tx.attempt_ids);
        tx.state = TxState::FatalError;
        tx.nonce = None;
        tx.error = Some(error.to_string());

        let mut batch = WriteBatch::new();
        batch.put_json(keys::tx(&tx.id), &*tx)?;
        for id in &attempt_ids {
            batch.delete(keys::attempt(id));
        }
        self.write(batch)
    }

    /// Drop one attempt from a transaction that stays alive
    pub fn discard_attempt(&self, tx: &mut Tx, attempt_id: &Uuid) -> TxmResult<()> {
        tx.attempt_ids.retain(|id| id != attempt_id);
        let mut batch = WriteBatch::new();
        batch.put_json(keys::tx(&tx.id), &*tx)?.delete(keys::attempt(attempt_id));
        self.write(batch)
    }

    /// Link a receipt to its attempt and mark the transaction Confirmed
    pub fn save_receipt(&self, tx: &mut Tx, attempt: &mut TxAttempt, receipt: &TxReceipt) -> TxmResult<()> {
        if !attempt.receipt_ids.contains(&receipt.id) {
            attempt.receipt_ids.push(receipt.id);
        }
        tx.state = TxState::Confirmed;
        tx.error = None;

        let mut batch = WriteBatch::new();
        batch
            .put_json(keys::receipt(&receipt.id), receipt)?
            .put_json(keys::attempt(&attempt.id), &*attempt)?
            .put_json(keys::tx(&tx.id), &*tx)?;
        self.write(batch)
    }

    /// Return a re-orged transaction to Unconfirmed and forget its receipts
    pub fn reopen_confirmed_tx(&self, tx: &mut Tx) -> TxmResult<()> {
        let mut batch = WriteBatch::new();
        for mut attempt in self.attempts_of(tx)? {
            if attempt.receipt_ids.is_empty() {
                continue;
            }
            for id in std::mem::take(&mut attempt.receipt_ids) {
                batch.delete(keys::receipt(&id));
            }
            batch.put_json(keys::attempt(&attempt.id), &attempt)?;
        }
        tx.state = TxState::Unconfirmed;
        batch.put_json(keys::tx(&tx.id), &*tx)?;
        self.write(batch)
    }

    // ===== BROADCASTER QUERIES =====

    /// The transaction a crash may have left mid-send, if any
    pub fn get_in_progress_tx(&self, address: &Address) -> TxmResult<Option<Tx>> {
        Ok(self
            .txs_of_address(address)?
            .into_iter()
            .find(|tx| tx.state == TxState::InProgress))
    }

    /// Oldest Unstarted transaction of the account
    pub fn get_next_unstarted_tx(&self, address: &Address) -> TxmResult<Option<Tx>> {
        Ok(self
            .txs_of_address(address)?
            .into_iter()
            .find(|tx| tx.state == TxState::Unstarted))
    }

    // ===== CONFIRMER QUERIES =====

    /// Unconfirmed and missing-receipt transactions
    pub fn txs_requiring_receipt_fetch(&self) -> TxmResult<Vec<Tx>> {
        self.txs_in_states(&[TxState::Unconfirmed, TxState::ConfirmedMissingReceipt])
    }

    /// Stamp unstamped Broadcast attempts of pending transactions with `block_num`
    pub fn set_broadcast_before_block_num(&self, block_num: u64) -> TxmResult<usize> {
        let mut batch = WriteBatch::new();
        let mut stamped = 0;
        for tx in self.txs_requiring_receipt_fetch()? {
            for mut attempt in self.attempts_of(&tx)? {
                if attempt.state == AttemptState::Broadcast && attempt.broadcast_before_block_num.is_none() {
                    attempt.broadcast_before_block_num = Some(block_num);
                    batch.put_json(keys::attempt(&attempt.id), &attempt)?;
                    stamped += 1;
                }
            }
        }
        self.write(batch)?;
        Ok(stamped)
    }

    /// Unconfirmed transactions below an account's highest confirmed nonce can
    /// no longer be mined; mark them ConfirmedMissingReceipt
    pub fn mark_confirmed_missing_receipt(&self) -> TxmResult<Vec<Tx>> {
        let txs = self.txs_in_states(&[TxState::Confirmed, TxState::Unconfirmed])?;

        let mut max_confirmed: HashMap<Address, u64> = HashMap::new();
        for tx in txs.iter().filter(|tx| tx.state == TxState::Confirmed) {
            if let Some(nonce) = tx.nonce {
                let entry = max_confirmed.entry(tx.from).or_insert(nonce);
                *entry = (*entry).max(nonce);
            }
        }

        let mut batch = WriteBatch::new();
        let mut marked = Vec::new();
        for mut tx in txs.into_iter().filter(|tx| tx.state == TxState::Unconfirmed) {
            let stale = match (tx.nonce, max_confirmed.get(&tx.from)) {
                (Some(nonce), Some(max)) => nonce < *max,
                _ => false,
            };
            if stale {
                tx.state = TxState::ConfirmedMissingReceipt;
                batch.put_json(keys::tx(&tx.id), &tx)?;
                marked.push(tx);
            }
        }
        self.write(batch)?;
        Ok(marked)
    }

    /// Give up on missing-receipt transactions whose latest broadcast is older
    /// than `cutoff`
    pub fn mark_old_txs_missing_receipt_as_errored(&self, cutoff: u64) -> TxmResult<Vec<Tx>> {
        let mut batch = WriteBatch::new();
        let mut errored = Vec::new();
        for mut tx in self.txs_in_states(&[TxState::ConfirmedMissingReceipt])? {
            let latest_broadcast = self
                .attempts_of(&tx)?
                .iter()
                .filter_map(|attempt| attempt.broadcast_before_block_num)
                .max();
            if matches!(latest_broadcast, Some(block) if block < cutoff) {
                tx.state = TxState::FatalError;
                tx.nonce = None;
                tx.error = Some(MISSING_RECEIPT_ERROR.to_string());
                batch.put_json(keys::tx(&tx.id), &tx)?;
                errored.push(tx);
            }
        }
        self.write(batch)?;
        Ok(errored)
    }

    /// Unconfirmed transactions of `address` due a higher-priced attempt
    ///
    /// Considers the `depth` lowest nonces (0 = all). A transaction is skipped
    /// while any attempt is still in flight: InProgress, Broadcast but not yet
    /// stamped, or stamped within `gas_bump_threshold` blocks of `block_num`.
    pub fn txs_requiring_new_attempt(
        &self,
        address: &Address,
        block_num: u64,
        gas_bump_threshold: u64,
        depth: u64,
    ) -> TxmResult<Vec<Tx>> {
        let mut candidates: Vec<Tx> = self
            .txs_of_address(address)?
            .into_iter()
            .filter(|tx| tx.state == TxState::Unconfirmed && tx.nonce.is_some())
            .collect();
        candidates.sort_by_key(|tx| tx.nonce);
        if depth > 0 {
            candidates.truncate(depth as usize);
        }

        let mut due = Vec::new();
        for tx in candidates {
            let attempts = self.attempts_of(&tx)?;
            if attempts.is_empty() {
                continue;
            }
            let blocked = attempts.iter().any(|attempt| match attempt.state {
                AttemptState::InsufficientEth => false,
                AttemptState::InProgress => true,
                AttemptState::Broadcast => match attempt.broadcast_before_block_num {
                    None => true,
                    Some(stamped) => stamped.saturating_add(gas_bump_threshold) > block_num,
                },
            });
            if !blocked {
                due.push(tx);
            }
        }
        Ok(due)
    }

    /// Unconfirmed transactions of `address` with an InProgress attempt
    pub fn txs_with_in_progress_attempts(&self, address: &Address) -> TxmResult<Vec<(Tx, TxAttempt)>> {
        let mut found = Vec::new();
        for tx in self.txs_of_address(address)? {
            if tx.state != TxState::Unconfirmed {
                continue;
            }
            for attempt in self.attempts_of(&tx)? {
                if attempt.state == AttemptState::InProgress {
                    found.push((tx.clone(), attempt));
                }
            }
        }
        Ok(found)
    }

    /// Confirmed transactions with a receipt at or above `height`
    pub fn txs_confirmed_at_or_above_block_height(&self, height: u64) -> TxmResult<Vec<Tx>> {
        let mut found = Vec::new();
        for tx in self.txs_in_states(&[TxState::Confirmed])? {
            let mut recent = false;
            for attempt in self.attempts_of(&tx)? {
                if self.receipts_of(&attempt)?.iter().any(|r| r.block_number >= height) {
                    recent = true;
                    break;
                }
            }
            if recent {
                found.push(tx);
            }
        }
        Ok(found)
    }

    /// Earliest receipt at or before `block_number` of a confirmed transaction
    pub fn confirmed_receipt_at_or_before(&self, tx_id: &Uuid, block_number: u64) -> TxmResult<Option<TxReceipt>> {
        let tx = match self.get_tx(tx_id)? {
            Some(tx) => tx,
            None => return Ok(None),
        };
        if !matches!(tx.state, TxState::Confirmed | TxState::ConfirmedMissingReceipt) {
            return Ok(None);
        }

        let mut earliest: Option<TxReceipt> = None;
        for attempt in self.attempts_of(&tx)? {
            if attempt.state != AttemptState::Broadcast {
                continue;
            }
            for receipt in self.receipts_of(&attempt)? {
                let better = earliest
                    .as_ref()
                    .map_or(true, |current| receipt.block_number < current.block_number);
                if receipt.block_number <= block_number && better {
                    earliest = Some(receipt);
                }
            }
        }
        Ok(earliest)
    }

    pub fn is_tx_confirmed_at_or_before_block_number(&self, tx_id: &Uuid, block_number: u64) -> TxmResult<bool> {
        Ok(self.confirmed_receipt_at_or_before(tx_id, block_number)?.is_some())
    }
}
