/// Transaction broadcasting
///
/// Turns Unstarted transactions into broadcast attempts one account at a
/// time. A pass assigns the nonce and persists the signed attempt before the
/// first network call, so an interrupted pass always resumes by resending
/// the exact same bytes.
mod sender;
mod service;


pub use sender::TxSender;
pub use service::BroadcasterService;

use crate::config::{BroadcasterConfig, Config, GasConfig};
use crate::errors::{classify_send_error, SendOutcome, TxmError, TxmResult};
use crate::gas::{bump_gas, gas_ceiling};
use crate::logger::{self, LogTag};
use crate::metrics::{Counter, MetricsSink, Timer};
use crate::shutdown::ShutdownSignal;
use crate::store::Store;
use crate::types::{Address, Tx, TxAttempt, TxState, Wei};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex as AsyncMutex, Notify};

pub struct TxBroadcaster {
    store: Store,
    sender: TxSender,
    gas: GasConfig,
    config: BroadcasterConfig,
    metrics: Arc<dyn MetricsSink>,
    trigger: Notify,
    /// One pass per account at a time
    pass_locks: Mutex<HashMap<Address, Arc<AsyncMutex<()>>>>,
}

impl TxBroadcaster {
    pub fn new(store: Store, sender: TxSender, config: &Config, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            store,
            sender,
            gas: config.gas.clone(),
            config: config.broadcaster.clone(),
            metrics,
            trigger: Notify::new(),
            pass_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wake the background loop; pending triggers collapse into one pass
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    fn pass_lock(&self, address: &Address) -> Arc<AsyncMutex<()>> {
        self.pass_locks.lock().entry(*address).or_default().clone()
    }

    // ===== BACKGROUND LOOP =====

    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) {
        logger::info(
            LogTag::Broadcaster,
            &format!("Broadcaster running (poll interval: {:?})", self.config.poll_interval()),
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.trigger.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
            if shutdown.is_triggered() {
                break;
            }
            self.process_all_accounts().await;
        }
        logger::info(LogTag::Broadcaster, "Broadcaster loop ended");
    }

    /// One pass for every registered account, accounts in parallel
    pub async fn process_all_accounts(&self) {
        let started = Instant::now();
        let accounts = match self.store.accounts() {
            Ok(accounts) => accounts,
            Err(e) => {
                logger::error(LogTag::Broadcaster, &format!("Failed to load accounts: {}", e));
                return;
            }
        };

        let passes = accounts.iter().map(|account| async move {
            if let Err(e) = self.process_unstarted_txs(&account.address).await {
                logger::error(
                    LogTag::Broadcaster,
                    &format!("Broadcast pass for {} failed: {}", account.address, e),
                );
            }
        });
        join_all(passes).await;

        self.metrics.observe(Timer::BroadcasterPass, started.elapsed());
    }

    // ===== PASS =====

    /// Broadcast every Unstarted transaction of `address` in creation order
    ///
    /// Returns the first error that needs a later retry; everything sent
    /// before it stays durably Unconfirmed.
    pub async fn process_unstarted_txs(&self, address: &Address) -> TxmResult<()> {
        let lock = self.pass_lock(address);
        let _pass = lock.lock().await;

        if let Some(tx) = self.store.get_in_progress_tx(address)? {
            self.resume_in_progress(tx).await?;
        }

        let mut adopted_nonce: Option<u64> = None;
        while let Some(mut tx) = self.store.get_next_unstarted_tx(address)? {
            let nonce = self.next_nonce(address, &mut adopted_nonce).await?;
            let attempt = self.start_tx(&mut tx, nonce)?;
            self.send_until_settled(tx, attempt).await?;
        }
        Ok(())
    }

    /// Resend the attempt an interrupted pass left behind
    async fn resume_in_progress(&self, mut tx: Tx) -> TxmResult<()> {
        let latest = match tx.latest_attempt_id() {
            Some(id) => self.store.get_attempt(&id)?,
            None => None,
        };
        let attempt = match latest {
            Some(attempt) => attempt,
            None => {
                // Attempt record lost; sign again at the same nonce
                let attempt = self.sender.new_attempt(&tx, self.initial_gas_price(&tx))?;
                tx.attempt_ids.push(attempt.id);
                self.store.save_new_attempt(&tx, &attempt)?;
                attempt
            }
        };
        logger::info(
            LogTag::Broadcaster,
            &format!(
                "Resuming in-progress transaction {} (nonce {:?}, attempt {})",
                tx.id, tx.nonce, attempt.hash
            ),
        );
        self.send_until_settled(tx, attempt).await
    }

    /// The account's next nonce, adopting the node's pending nonce when the
    /// account has never broadcast
    async fn next_nonce(&self, address: &Address, adopted: &mut Option<u64>) -> TxmResult<u64> {
        let account = self
            .store
            .get_account(address)?
            .ok_or(TxmError::AccountNotFound(*address))?;
        if let Some(nonce) = account.next_nonce {
            return Ok(nonce);
        }
        if let Some(nonce) = *adopted {
            return Ok(nonce);
        }

        let nonce = self.sender.pending_nonce(address).await?;
        logger::info(
            LogTag::Broadcaster,
            &format!("Adopting pending nonce {} from node for {}", nonce, address),
        );
        *adopted = Some(nonce);
        Ok(nonce)
    }

    fn initial_gas_price(&self, tx: &Tx) -> Wei {
        self.gas.default_gas_price.min(gas_ceiling(&self.gas, tx.max_gas_price))
    }

    /// Sign the first attempt, then persist nonce, attempt and InProgress state
    fn start_tx(&self, tx: &mut Tx, nonce: u64) -> TxmResult<TxAttempt> {
        let mut started = tx.clone();
        started.nonce = Some(nonce);
        let attempt = self.sender.new_attempt(&started, self.initial_gas_price(&started))?;

        started.state = TxState::InProgress;
        started.attempt_ids.push(attempt.id);
        self.store.save_new_attempt(&started, &attempt)?;
        *tx = started;

        logger::debug(
            LogTag::Broadcaster,
            &format!(
                "Transaction {} assigned nonce {} at {}",
                tx.id,
                nonce,
                attempt.gas_price.to_gwei_string()
            ),
        );
        Ok(attempt)
    }

    /// Send `attempt` until the node's answer settles the transaction
    async fn send_until_settled(&self, mut tx: Tx, mut attempt: TxAttempt) -> TxmResult<()> {
        loop {
            let error = match self.sender.send_attempt(&attempt).await {
                Ok(()) => return self.mark_broadcast(&mut tx, &mut attempt),
                Err(e) => e,
            };

            match classify_send_error(&error) {
                SendOutcome::Accepted => {
                    logger::debug(
                        LogTag::Broadcaster,
                        &format!("Node answered '{}' for {}; treating as broadcast", error, attempt.hash),
                    );
                    return self.mark_broadcast(&mut tx, &mut attempt);
                }
                SendOutcome::Underpriced => {
                    let ceiling = gas_ceiling(&self.gas, tx.max_gas_price);
                    let bumped = bump_gas(&self.gas, attempt.gas_price, ceiling).map_err(|e| {
                        logger::error(
                            LogTag::Broadcaster,
                            &format!("Cannot re-price underpriced transaction {}: {}", tx.id, e),
                        );
                        e
                    })?;
                    logger::warning(
                        LogTag::Broadcaster,
                        &format!(
                            "Transaction {} underpriced at {} ({}), retrying at {}",
                            tx.id,
                            attempt.gas_price.to_gwei_string(),
                            error,
                            bumped.to_gwei_string()
                        ),
                    );
                    let replacement = self.sender.new_attempt(&tx, bumped)?;
                    self.store.replace_attempt(&mut tx, &attempt.id, &replacement)?;
                    self.metrics.increment(Counter::GasBumps, 1);
                    attempt = replacement;
                }
                SendOutcome::Fatal => {
                    let message = error.to_string();
                    self.store.save_fatal(&mut tx, &message)?;
                    self.metrics.increment(Counter::TxsFatal, 1);
                    logger::error(
                        LogTag::Broadcaster,
                        &format!("Transaction {} rejected permanently: {}", tx.id, message),
                    );
                    return Ok(());
                }
                SendOutcome::InsufficientFunds | SendOutcome::Retryable => {
                    return Err(TxmError::Send {
                        tx_id: tx.id,
                        source: error,
                    });
                }
            }
        }
    }

    fn mark_broadcast(&self, tx: &mut Tx, attempt: &mut TxAttempt) -> TxmResult<()> {
        let account = self.store.save_broadcast(tx, attempt)?;
        self.metrics.increment(Counter::TxsBroadcast, 1);
        logger::info(
            LogTag::Broadcaster,
            &format!(
                "Broadcast transaction {} as {} (nonce {:?}, next nonce {:?})",
                tx.id, attempt.hash, tx.nonce, account.next_nonce
            ),
        );
        Ok(())
    }
}
