/// Confirmation and gas escalation
///
/// [`TxConfirmer`] reconciles persisted transactions against each new longest
/// chain: it stamps broadcast markers, collects receipts, gives up on
/// transactions whose receipt will never come, re-opens transactions whose
/// block left the canonical chain, and re-prices transactions that sat in
/// the mempool for too long.
use crate::broadcaster::TxSender;
use crate::chain::with_timeout;
use crate::config::{ChainConfig, Config, ConfirmerConfig, GasConfig};
use crate::errors::{classify_send_result, ClientError, SendOutcome, TxmResult};
use crate::gas::{bump_gas, gas_ceiling};
use crate::head_tracker::{HeadContext, HeadTrackable};
use crate::logger::{self, LogTag};
use crate::metrics::{Counter, MetricsSink};
use crate::store::Store;
use crate::types::{Address, AttemptState, Head, Tx, TxAttempt, TxReceipt};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;


/// How a send settled for the account's escalation loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    /// Carry on with the account's next transaction
    Continue,
    /// Node unavailable; leave the account for the next head
    Stop,
}

pub struct TxConfirmer {
    store: Store,
    sender: TxSender,
    gas: GasConfig,
    chain: ChainConfig,
    config: ConfirmerConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl TxConfirmer {
    pub const NAME: &'static str = "confirmer";

    pub fn new(store: Store, sender: TxSender, config: &Config, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            store,
            sender,
            gas: config.gas.clone(),
            chain: config.chain.clone(),
            config: config.confirmer.clone(),
            metrics,
        }
    }

    /// Run every reconciliation step for the chain ending at `head`
    pub async fn process_head(&self, ctx: &HeadContext, head: &Head) -> TxmResult<()> {
        let stamped = self.store.set_broadcast_before_block_num(head.number)?;
        if stamped > 0 {
            logger::debug(
                LogTag::Confirmer,
                &format!("Stamped {} broadcast attempts with block #{}", stamped, head.number),
            );
        }

        if ctx.is_done() {
            return Ok(());
        }
        self.fetch_receipts(ctx).await?;

        self.mark_missing_receipts(head.number)?;

        if ctx.is_done() {
            return Ok(());
        }
        self.ensure_txs_in_longest_chain(ctx, head).await?;

        for account in self.store.accounts()? {
            if ctx.is_done() {
                break;
            }
            if let Err(e) = self.rebroadcast_where_necessary(ctx, &account.address, head.number).await {
                logger::error(
                    LogTag::Confirmer,
                    &format!("Escalation for {} failed at head #{}: {}", account.address, head.number, e),
                );
            }
        }
        Ok(())
    }

    // ===== RECEIPTS =====

    async fn fetch_receipts(&self, ctx: &HeadContext) -> TxmResult<()> {
        for mut tx in self.store.txs_requiring_receipt_fetch()? {
            if ctx.is_done() {
                break;
            }
            for mut attempt in self.store.attempts_of(&tx)? {
                if attempt.state != AttemptState::Broadcast {
                    continue;
                }
                let found = with_timeout(
                    self.sender.request_timeout(),
                    self.sender.client().transaction_receipt(&attempt.hash),
                )
                .await;
                match found {
                    Ok(Some(receipt)) => {
                        let receipt = TxReceipt {
                            id: Uuid::new_v4(),
                            attempt_id: attempt.id,
                            tx_hash: receipt.tx_hash,
                            block_number: receipt.block_number,
                            block_hash: receipt.block_hash,
                            success: receipt.success,
                            gas_used: receipt.gas_used,
                        };
                        self.store.save_receipt(&mut tx, &mut attempt, &receipt)?;
                        self.metrics.increment(Counter::ReceiptsFound, 1);
                        logger::info(
                            LogTag::Confirmer,
                            &format!(
                                "Transaction {} confirmed in block #{} ({})",
                                tx.id,
                                receipt.block_number,
                                if receipt.success { "success" } else { "reverted" }
                            ),
                        );
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        logger::warning(
                            LogTag::Confirmer,
                            &format!("Failed to fetch receipt for {}: {}", attempt.hash, e),
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn mark_missing_receipts(&self, block_number: u64) -> TxmResult<()> {
        for tx in self.store.mark_confirmed_missing_receipt()? {
            self.metrics.increment(Counter::MissingReceipts, 1);
            logger::warning(
                LogTag::Confirmer,
                &format!(
                    "Transaction {} (nonce {:?}) was overtaken by a confirmed higher nonce; receipt missing",
                    tx.id, tx.nonce
                ),
            );
        }

        let cutoff = block_number.saturating_sub(self.chain.finality_depth);
        for tx in self.store.mark_old_txs_missing_receipt_as_errored(cutoff)? {
            self.metrics.increment(Counter::ReceiptTimeouts, 1);
            logger::error(
                LogTag::Confirmer,
                &format!(
                    "Transaction {} still has no receipt {} blocks after its last broadcast; marked fatal",
                    tx.id, self.chain.finality_depth
                ),
            );
        }
        Ok(())
    }

    // ===== REORGS =====

    /// Re-open confirmed transactions none of whose receipts is on `head`'s chain
    async fn ensure_txs_in_longest_chain(&self, ctx: &HeadContext, head: &Head) -> TxmResult<()> {
        let earliest = head.earliest_in_chain().number;
        for mut tx in self.store.txs_confirmed_at_or_above_block_height(earliest)? {
            if ctx.is_done() {
                break;
            }
            let mut on_chain = false;
            for attempt in self.store.attempts_of(&tx)? {
                for receipt in self.store.receipts_of(&attempt)? {
                    // Blocks above the head cannot be checked against this chain yet
                    if receipt.block_number > head.number
                        || head.hash_at_height(receipt.block_number) == Some(receipt.block_hash)
                    {
                        on_chain = true;
                    }
                }
            }
            if on_chain {
                continue;
            }

            self.metrics.increment(Counter::Reorgs, 1);
            logger::warning(
                LogTag::Confirmer,
                &format!(
                    "Transaction {} was confirmed on a block no longer in the longest chain (head {}); rebroadcasting",
                    tx.id, head
                ),
            );
            self.store.reopen_confirmed_tx(&mut tx)?;

            let latest_broadcast = self
                .store
                .attempts_of(&tx)?
                .into_iter()
                .rev()
                .find(|attempt| attempt.state == AttemptState::Broadcast);
            if let Some(mut attempt) = latest_broadcast {
                attempt.broadcast_before_block_num = None;
                self.store.put_attempt(&attempt)?;
                self.metrics.increment(Counter::AttemptsResent, 1);
                if let Err(e) = self.sender.send_attempt(&attempt).await {
                    logger::warning(
                        LogTag::Confirmer,
                        &format!("Rebroadcast of re-orged {} answered: {}", attempt.hash, e),
                    );
                }
            }
        }
        Ok(())
    }

    // ===== ESCALATION =====

    async fn rebroadcast_where_necessary(&self, ctx: &HeadContext, address: &Address, block_num: u64) -> TxmResult<()> {
        for (mut tx, attempt) in self.store.txs_with_in_progress_attempts(address)? {
            if ctx.is_done() {
                return Ok(());
            }
            self.metrics.increment(Counter::AttemptsResent, 1);
            if self.send_and_settle(&mut tx, attempt, false).await? == Settled::Stop {
                return Ok(());
            }
        }

        let due = self.store.txs_requiring_new_attempt(
            address,
            block_num,
            self.config.gas_bump_threshold,
            self.config.in_flight_depth,
        )?;
        for mut tx in due {
            if ctx.is_done() {
                break;
            }
            let latest = match tx.latest_attempt_id() {
                Some(id) => self.store.get_attempt(&id)?,
                None => None,
            };
            let Some(latest) = latest else {
                continue;
            };

            let settled = if latest.state == AttemptState::InsufficientEth {
                logger::debug(
                    LogTag::Confirmer,
                    &format!("Retrying underfunded attempt {} of transaction {}", latest.hash, tx.id),
                );
                self.metrics.increment(Counter::AttemptsResent, 1);
                self.send_and_settle(&mut tx, latest, false).await?
            } else {
                match self.bumped_attempt(&tx, &latest) {
                    Some(attempt) => {
                        tx.attempt_ids.push(attempt.id);
                        self.store.save_new_attempt(&tx, &attempt)?;
                        self.metrics.increment(Counter::GasBumps, 1);
                        logger::info(
                            LogTag::Confirmer,
                            &format!(
                                "Transaction {} stuck since block #{:?}; bumping gas {} -> {}",
                                tx.id,
                                latest.broadcast_before_block_num,
                                latest.gas_price.to_gwei_string(),
                                attempt.gas_price.to_gwei_string()
                            ),
                        );
                        self.send_and_settle(&mut tx, attempt, true).await?
                    }
                    None => Settled::Continue,
                }
            };
            if settled == Settled::Stop {
                break;
            }
        }
        Ok(())
    }

    /// Signed attempt priced above `latest`; failures are logged and skip the tx
    fn bumped_attempt(&self, tx: &Tx, latest: &TxAttempt) -> Option<TxAttempt> {
        let ceiling = gas_ceiling(&self.gas, tx.max_gas_price);
        let price = match bump_gas(&self.gas, latest.gas_price, ceiling) {
            Ok(price) => price,
            Err(e) => {
                logger::error(
                    LogTag::Confirmer,
                    &format!("Cannot escalate transaction {}: {}", tx.id, e),
                );
                return None;
            }
        };
        match self.sender.new_attempt(tx, price) {
            Ok(attempt) => Some(attempt),
            Err(e) => {
                logger::error(
                    LogTag::Confirmer,
                    &format!("Failed to sign escalated attempt for {}: {}", tx.id, e),
                );
                None
            }
        }
    }

    /// Send an attempt of an Unconfirmed tx and record the outcome
    ///
    /// `fresh` marks an attempt created for this send; only those are
    /// discarded on a fatal rejection.
    async fn send_and_settle(&self, tx: &mut Tx, mut attempt: TxAttempt, mut fresh: bool) -> TxmResult<Settled> {
        loop {
            let result = self.sender.send_attempt(&attempt).await;
            match classify_send_result(&result) {
                SendOutcome::Accepted => {
                    attempt.state = AttemptState::Broadcast;
                    self.store.put_attempt(&attempt)?;
                    return Ok(Settled::Continue);
                }
                SendOutcome::Underpriced => {
                    let Some(replacement) = self.bumped_attempt(tx, &attempt) else {
                        return Ok(Settled::Continue);
                    };
                    self.store.replace_attempt(tx, &attempt.id, &replacement)?;
                    self.metrics.increment(Counter::GasBumps, 1);
                    attempt = replacement;
                    fresh = true;
                }
                SendOutcome::InsufficientFunds => {
                    attempt.state = AttemptState::InsufficientEth;
                    self.store.put_attempt(&attempt)?;
                    self.metrics.increment(Counter::InsufficientFunds, 1);
                    logger::warning(
                        LogTag::Confirmer,
                        &format!(
                            "Account {} lacks funds for attempt {} of transaction {}",
                            tx.from, attempt.hash, tx.id
                        ),
                    );
                    return Ok(Settled::Continue);
                }
                SendOutcome::Fatal => {
                    logger::error(
                        LogTag::Confirmer,
                        &format!(
                            "Attempt {} of transaction {} rejected: {}",
                            attempt.hash,
                            tx.id,
                            describe(&result)
                        ),
                    );
                    if fresh {
                        self.store.discard_attempt(tx, &attempt.id)?;
                    }
                    return Ok(Settled::Continue);
                }
                SendOutcome::Retryable => {
                    logger::warning(
                        LogTag::Confirmer,
                        &format!(
                            "Could not send attempt {} of transaction {}: {}; retrying next head",
                            attempt.hash,
                            tx.id,
                            describe(&result)
                        ),
                    );
                    return Ok(Settled::Stop);
                }
            }
        }
    }
}

fn describe(result: &Result<(), ClientError>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(e) => e.to_string(),
    }
}

#[async_trait]
impl HeadTrackable for TxConfirmer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn connect(&self, head: Option<&Head>) -> TxmResult<()> {
        match head {
            Some(head) => logger::debug(LogTag::Confirmer, &format!("Confirmer connected at {}", head)),
            None => logger::debug(LogTag::Confirmer, "Confirmer connected with no known head"),
        }
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn on_new_longest_chain(&self, ctx: &HeadContext, head: &Head) {
        if let Err(e) = self.process_head(ctx, head).await {
            logger::error(
                LogTag::Confirmer,
                &format!("Failed to process head #{}: {}", head.number, e),
            );
        }
    }
}
