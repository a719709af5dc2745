/// Transaction manager facade
///
/// Owns the store and every component, registers the confirmer and the job
/// monitor as head observers, and runs the head tracker and the broadcaster
/// loop as services between `start` and `stop`.
use crate::broadcaster::{BroadcasterService, TxBroadcaster, TxSender};
use crate::chain::{with_timeout, ChainClient, Log, LogFilter, Signer};
use crate::config::Config;
use crate::confirmer::TxConfirmer;
use crate::errors::{SignerError, TxmError, TxmResult};
use crate::head_tracker::{HeadTrackable, HeadTracker, HeadTrackerService};
use crate::jobs::{JobHandler, JobMonitor};
use crate::logger::{self, LogTag};
use crate::metrics::MetricsSink;
use crate::services::{ServiceHealth, ServiceManager};
use crate::shutdown::ShutdownSignal;
use crate::store::{KvStore, Store};
use crate::types::{Account, Address, Head, Tx, TxAttempt, TxReceipt, TxState, Wei};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// A transaction submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTx {
    pub from: Address,
    pub to: Address,
    pub value: Wei,
    pub payload: Vec<u8>,
    pub gas_limit: u64,
    /// Lowers the configured max gas price for this transaction
    pub max_gas_price: Option<Wei>,
}

pub struct TxManager {
    config: Config,
    store: Store,
    sender: TxSender,
    head_tracker: Arc<HeadTracker>,
    broadcaster: Arc<TxBroadcaster>,
    jobs: Arc<JobMonitor>,
    services: AsyncMutex<Option<ServiceManager>>,
}

impl TxManager {
    pub fn new(
        config: Config,
        kv: Arc<dyn KvStore>,
        client: Arc<dyn ChainClient>,
        signer: Arc<dyn Signer>,
        metrics: Arc<dyn MetricsSink>,
    ) -> TxmResult<Self> {
        config.validate()?;

        let store = Store::new(kv);
        let sender = TxSender::new(client.clone(), signer, &config.chain);
        let broadcaster = Arc::new(TxBroadcaster::new(store.clone(), sender.clone(), &config, metrics.clone()));
        let confirmer = Arc::new(TxConfirmer::new(store.clone(), sender.clone(), &config, metrics.clone()));
        let jobs = Arc::new(JobMonitor::new(store.clone(), &config.chain, metrics.clone()));

        let trackables: Vec<Arc<dyn HeadTrackable>> = vec![
            confirmer as Arc<dyn HeadTrackable>,
            jobs.clone() as Arc<dyn HeadTrackable>,
        ];
        let head_tracker = Arc::new(HeadTracker::new(
            client,
            store.clone(),
            config.chain.clone(),
            config.head_tracker.clone(),
            trackables,
            metrics,
        ));

        Ok(Self {
            config,
            store,
            sender,
            head_tracker,
            broadcaster,
            jobs,
            services: AsyncMutex::new(None),
        })
    }

    // ===== LIFECYCLE =====

    /// Start head tracking and the broadcaster loop
    pub async fn start(&self) -> TxmResult<()> {
        let mut services = self.services.lock().await;
        if services.is_some() {
            return Err(TxmError::Service("transaction manager already started".to_string()));
        }

        let mut manager = ServiceManager::new(ShutdownSignal::new());
        manager.register(Box::new(HeadTrackerService::new(self.head_tracker.clone())));
        manager.register(Box::new(BroadcasterService::new(self.broadcaster.clone())));
        manager.start_all().await.map_err(TxmError::Service)?;
        *services = Some(manager);

        logger::info(
            LogTag::System,
            &format!("Transaction manager started on chain {}", self.config.chain.chain_id),
        );
        Ok(())
    }

    pub async fn stop(&self) -> TxmResult<()> {
        let manager = self.services.lock().await.take();
        match manager {
            Some(mut manager) => {
                manager.stop_all().await.map_err(TxmError::Service)?;
                logger::info(LogTag::System, "Transaction manager stopped");
                logger::flush();
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub async fn health(&self) -> HashMap<&'static str, ServiceHealth> {
        match self.services.lock().await.as_ref() {
            Some(manager) => manager.get_health().await,
            None => HashMap::new(),
        }
    }

    pub fn highest_seen_head(&self) -> Option<Head> {
        self.head_tracker.highest_seen_head()
    }

    /// Wake the broadcaster
    pub fn trigger(&self) {
        self.broadcaster.trigger();
    }

    // ===== ACCOUNTS & TRANSACTIONS =====

    /// Start managing `address`; the signer must hold its key
    pub fn register_account(&self, address: &Address) -> TxmResult<Account> {
        if !self.sender.signer().has_account(address) {
            return Err(TxmError::Signing(SignerError::UnknownAccount(*address)));
        }
        let account = self.store.register_account(address)?;
        logger::info(LogTag::System, &format!("Managing account {}", address));
        Ok(account)
    }

    /// Queue a transaction for broadcast and return its id
    pub fn add_tx(&self, new_tx: NewTx) -> TxmResult<Uuid> {
        if self.store.get_account(&new_tx.from)?.is_none() {
            return Err(TxmError::AccountNotFound(new_tx.from));
        }
        let tx = Tx {
            id: Uuid::new_v4(),
            from: new_tx.from,
            to: new_tx.to,
            payload: new_tx.payload,
            value: new_tx.value,
            gas_limit: new_tx.gas_limit,
            max_gas_price: new_tx.max_gas_price,
            nonce: None,
            state: TxState::Unstarted,
            error: None,
            attempt_ids: Vec::new(),
            created_at: Utc::now(),
        };
        self.store.insert_tx(&tx)?;
        logger::debug(
            LogTag::System,
            &format!("Queued transaction {} from {} to {}", tx.id, tx.from, tx.to),
        );
        self.broadcaster.trigger();
        Ok(tx.id)
    }

    pub fn get_tx(&self, id: &Uuid) -> TxmResult<Tx> {
        self.store.get_tx(id)?.ok_or(TxmError::TxNotFound(*id))
    }

    pub fn get_tx_attempt(&self, id: &Uuid) -> TxmResult<TxAttempt> {
        self.store.get_attempt(id)?.ok_or(TxmError::AttemptNotFound(*id))
    }

    pub fn get_tx_receipt(&self, id: &Uuid) -> TxmResult<TxReceipt> {
        self.store.get_receipt(id)?.ok_or(TxmError::ReceiptNotFound(*id))
    }

    /// True when a broadcast attempt of the transaction has a receipt at or
    /// before `block_number`
    pub fn is_tx_confirmed_at_or_before_block_number(&self, id: &Uuid, block_number: u64) -> TxmResult<bool> {
        self.store.is_tx_confirmed_at_or_before_block_number(id, block_number)
    }

    pub async fn filter_logs(&self, filter: &LogFilter) -> TxmResult<Vec<Log>> {
        let logs = with_timeout(
            self.sender.request_timeout(),
            self.sender.client().filter_logs(filter),
        )
        .await?;
        Ok(logs)
    }

    // ===== JOBS =====

    pub fn add_job(&self, tx_id: &Uuid, metadata: Vec<u8>) -> TxmResult<Uuid> {
        self.jobs.add_job(tx_id, metadata)
    }

    pub fn monitor_job(&self, job_id: &Uuid, handler: Arc<dyn JobHandler>) -> TxmResult<()> {
        self.jobs.monitor_job(job_id, handler)
    }

    pub fn delete_job(&self, job_id: &Uuid) -> TxmResult<()> {
        self.jobs.delete_job(job_id)
    }

    pub fn get_unhandled_job_ids(&self) -> TxmResult<Vec<Uuid>> {
        self.jobs.unhandled_job_ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::UnsignedTx;
    use crate::jobs::{Job, JobOutcome};
    use crate::metrics::{Counter, CounterMetrics};
    use crate::store::SqliteStore;
    use crate::testing::{
        block_hash, decode_raw, eventually, gwei, head, receipt, test_config, MockChainClient, MockSigner, FROM, TO,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Harness {
        client: Arc<MockChainClient>,
        metrics: Arc<CounterMetrics>,
        txm: TxManager,
    }

    fn harness() -> Harness {
        let client = Arc::new(MockChainClient::new());
        let metrics = Arc::new(CounterMetrics::new());
        let txm = TxManager::new(
            test_config(),
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            client.clone(),
            Arc::new(MockSigner::with_accounts(&[FROM])),
            metrics.clone(),
        )
        .unwrap();
        Harness { client, metrics, txm }
    }

    fn transfer() -> NewTx {
        NewTx {
            from: FROM,
            to: TO,
            value: gwei(1),
            payload: vec![0xde, 0xad],
            gas_limit: 21_000,
            max_gas_price: None,
        }
    }

    #[derive(Default)]
    struct Outcomes(Mutex<Vec<JobOutcome>>);

    #[async_trait]
    impl JobHandler for Outcomes {
        async fn handle(&self, _job: &Job, outcome: &JobOutcome) -> anyhow::Result<()> {
            self.0.lock().push(outcome.clone());
            Ok(())
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let mut config = test_config();
        config.chain.chain_id = 0;
        let result = TxManager::new(
            config,
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(MockChainClient::new()),
            Arc::new(MockSigner::new()),
            Arc::new(CounterMetrics::new()),
        );
        assert!(matches!(result, Err(TxmError::Config(_))));
    }

    #[test]
    fn register_account_requires_key() {
        let h = harness();
        let err = h.txm.register_account(&TO).unwrap_err();
        assert!(matches!(err, TxmError::Signing(SignerError::UnknownAccount(a)) if a == TO));

        let first = h.txm.register_account(&FROM).unwrap();
        let again = h.txm.register_account(&FROM).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn add_tx_requires_registered_account() {
        let h = harness();
        assert!(matches!(h.txm.add_tx(transfer()), Err(TxmError::AccountNotFound(_))));

        h.txm.register_account(&FROM).unwrap();
        let id = h.txm.add_tx(transfer()).unwrap();
        let tx = h.txm.get_tx(&id).unwrap();
        assert_eq!(tx.state, TxState::Unstarted);
        assert_eq!(tx.payload, vec![0xde, 0xad]);
        assert!(matches!(h.txm.get_tx(&Uuid::new_v4()), Err(TxmError::TxNotFound(_))));
    }

    #[tokio::test]
    async fn filter_logs_passes_through() {
        let h = harness();
        let log = Log {
            address: TO,
            topics: Vec::new(),
            data: vec![1],
            block_number: 4,
            block_hash: block_hash(4, 0),
            tx_hash: block_hash(99, 0),
            log_index: 0,
        };
        h.client.add_log(log.clone());

        let filter = LogFilter {
            from_block: Some(3),
            to_block: Some(5),
            ..LogFilter::default()
        };
        assert_eq!(h.txm.filter_logs(&filter).await.unwrap(), vec![log]);
        let later = LogFilter {
            from_block: Some(5),
            ..LogFilter::default()
        };
        assert!(h.txm.filter_logs(&later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transaction_settles_end_to_end() {
        let h = harness();
        h.client.set_pending_nonce(Ok(11));
        h.txm.register_account(&FROM).unwrap();
        h.txm.start().await.unwrap();
        assert!(eventually(|| h.client.subscribe_calls() == 1).await);

        let id = h.txm.add_tx(transfer()).unwrap();
        assert!(eventually(|| h.txm.get_tx(&id).unwrap().state == TxState::Unconfirmed).await);
        let sent: Vec<UnsignedTx> = h.client.sent().iter().map(|tx| decode_raw(&tx.raw).tx).collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].nonce, 11);

        let job_id = h.txm.add_job(&id, b"order-1".to_vec()).unwrap();
        let outcomes = Arc::new(Outcomes::default());
        h.txm.monitor_job(&job_id, outcomes.clone()).unwrap();

        let tx = h.txm.get_tx(&id).unwrap();
        let attempt = h.txm.get_tx_attempt(&tx.attempt_ids[0]).unwrap();
        h.client.insert_receipt(receipt(attempt.hash, 1));

        for number in 1..=6 {
            h.client.send_head(head(number)).await;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(eventually(|| h.txm.get_tx(&id).unwrap().state == TxState::Confirmed).await);
        assert!(eventually(|| !outcomes.0.lock().is_empty()).await);
        assert_eq!(*outcomes.0.lock(), vec![JobOutcome::Confirmed { block_number: 1 }]);
        assert!(h.txm.get_unhandled_job_ids().unwrap().is_empty());
        assert!(h.txm.is_tx_confirmed_at_or_before_block_number(&id, 1).unwrap());

        let attempt = h.txm.get_tx_attempt(&attempt.id).unwrap();
        let stored = h.txm.get_tx_receipt(&attempt.receipt_ids[0]).unwrap();
        assert_eq!(stored.block_number, 1);
        assert_eq!(h.txm.highest_seen_head().unwrap().number, 6);
        assert_eq!(h.metrics.count(Counter::JobsHandled), 1);

        let health = h.txm.health().await;
        assert!(health[HeadTrackerService::NAME].is_healthy());
        assert!(health.contains_key(BroadcasterService::NAME));

        h.txm.stop().await.unwrap();
        assert!(h.txm.health().await.is_empty());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let h = harness();
        h.txm.start().await.unwrap();
        assert!(matches!(h.txm.start().await, Err(TxmError::Service(_))));
        h.txm.stop().await.unwrap();
        // Restart after stop
        h.txm.start().await.unwrap();
        h.txm.stop().await.unwrap();
    }
}
