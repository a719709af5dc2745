/// Settlement notifications
///
/// A job ties application metadata to a transaction. Once the transaction is
/// final (confirmed at least `finality_depth` blocks deep) or has failed for
/// good, the job's handler is called. A handler error is retried on the next
/// head; success marks the job handled and ends monitoring.
use crate::config::ChainConfig;
use crate::errors::{TxmError, TxmResult};
use crate::head_tracker::{HeadContext, HeadTrackable};
use crate::logger::{self, LogTag};
use crate::metrics::{Counter, MetricsSink};
use crate::store::{keys, Store};
use crate::types::{hex_bytes, Head, TxState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Unhandled,
    Handled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub tx_id: Uuid,
    /// Opaque application data
    #[serde(with = "hex_bytes")]
    pub metadata: Vec<u8>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
}

/// How the job's transaction settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Confirmed { block_number: u64 },
    Failed { error: String },
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, outcome: &JobOutcome) -> anyhow::Result<()>;
}

// =============================================================================
// STORE
// =============================================================================

impl Store {
    pub fn get_job(&self, id: &Uuid) -> TxmResult<Option<Job>> {
        self.get_record(&keys::job(id))
    }

    pub fn put_job(&self, job: &Job) -> TxmResult<()> {
        self.put_record(&keys::job(&job.id), job)
    }

    pub fn delete_job(&self, id: &Uuid) -> TxmResult<()> {
        self.delete_record(&keys::job(id))
    }

    pub fn unhandled_jobs(&self) -> TxmResult<Vec<Job>> {
        let jobs: Vec<Job> = self.scan_records(keys::JOB_PREFIX)?;
        Ok(jobs.into_iter().filter(|job| job.state == JobState::Unhandled).collect())
    }
}

// =============================================================================
// MONITOR
// =============================================================================

pub struct JobMonitor {
    store: Store,
    finality_depth: u64,
    metrics: Arc<dyn MetricsSink>,
    handlers: Mutex<HashMap<Uuid, Arc<dyn JobHandler>>>,
    /// Serializes job record writes with deletion
    records: Mutex<()>,
}

impl JobMonitor {
    pub const NAME: &'static str = "job_monitor";

    pub fn new(store: Store, chain: &ChainConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            store,
            finality_depth: chain.finality_depth,
            metrics,
            handlers: Mutex::new(HashMap::new()),
            records: Mutex::new(()),
        }
    }

    /// Persist an Unhandled job for an existing transaction
    pub fn add_job(&self, tx_id: &Uuid, metadata: Vec<u8>) -> TxmResult<Uuid> {
        if self.store.get_tx(tx_id)?.is_none() {
            return Err(TxmError::TxNotFound(*tx_id));
        }
        let job = Job {
            id: Uuid::new_v4(),
            tx_id: *tx_id,
            metadata,
            state: JobState::Unhandled,
            created_at: Utc::now(),
        };
        self.store.put_job(&job)?;
        logger::debug(
            LogTag::Jobs,
            &format!("Added job {} for transaction {}", job.id, tx_id),
        );
        Ok(job.id)
    }

    /// Attach `handler` to a stored job; replaces any previous handler
    pub fn monitor_job(&self, job_id: &Uuid, handler: Arc<dyn JobHandler>) -> TxmResult<()> {
        match self.store.get_job(job_id)? {
            Some(job) if job.state == JobState::Handled => {
                logger::debug(LogTag::Jobs, &format!("Job {} already handled", job_id));
                Ok(())
            }
            Some(_) => {
                self.handlers.lock().insert(*job_id, handler);
                Ok(())
            }
            None => Err(TxmError::JobNotFound(*job_id)),
        }
    }

    pub fn delete_job(&self, job_id: &Uuid) -> TxmResult<()> {
        let _records = self.records.lock();
        if self.store.get_job(job_id)?.is_none() {
            return Err(TxmError::JobNotFound(*job_id));
        }
        self.handlers.lock().remove(job_id);
        self.store.delete_job(job_id)
    }

    pub fn unhandled_job_ids(&self) -> TxmResult<Vec<Uuid>> {
        Ok(self.store.unhandled_jobs()?.into_iter().map(|job| job.id).collect())
    }

    pub fn monitored_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Hand every settled monitored job to its handler
    pub async fn check_jobs(&self, ctx: &HeadContext, head: &Head) -> TxmResult<()> {
        let monitored: Vec<(Uuid, Arc<dyn JobHandler>)> = self
            .handlers
            .lock()
            .iter()
            .map(|(id, handler)| (*id, handler.clone()))
            .collect();
        let final_block = head.number.checked_sub(self.finality_depth);

        for (job_id, handler) in monitored {
            if ctx.is_done() {
                break;
            }
            let mut job = match self.store.get_job(&job_id)? {
                Some(job) if job.state == JobState::Unhandled => job,
                _ => {
                    self.handlers.lock().remove(&job_id);
                    continue;
                }
            };
            let Some(outcome) = self.outcome(&job, final_block)? else {
                continue;
            };

            match handler.handle(&job, &outcome).await {
                Ok(()) => {
                    let _records = self.records.lock();
                    self.handlers.lock().remove(&job_id);
                    if self.store.get_job(&job_id)?.is_none() {
                        logger::debug(
                            LogTag::Jobs,
                            &format!("Job {} was deleted while its handler ran", job_id),
                        );
                        continue;
                    }
                    job.state = JobState::Handled;
                    self.store.put_job(&job)?;
                    self.metrics.increment(Counter::JobsHandled, 1);
                    logger::info(
                        LogTag::Jobs,
                        &format!("Job {} handled ({:?})", job_id, outcome),
                    );
                }
                Err(e) => {
                    logger::warning(
                        LogTag::Jobs,
                        &format!("Handler for job {} failed, retrying next head: {:#}", job_id, e),
                    );
                }
            }
        }
        Ok(())
    }

    fn outcome(&self, job: &Job, final_block: Option<u64>) -> TxmResult<Option<JobOutcome>> {
        let tx = match self.store.get_tx(&job.tx_id)? {
            Some(tx) => tx,
            None => {
                logger::warning(
                    LogTag::Jobs,
                    &format!("Transaction {} of job {} is gone", job.tx_id, job.id),
                );
                return Ok(None);
            }
        };
        if tx.state == TxState::FatalError {
            return Ok(Some(JobOutcome::Failed {
                error: tx.error.unwrap_or_else(|| "unknown error".to_string()),
            }));
        }
        let Some(final_block) = final_block else {
            return Ok(None);
        };
        Ok(self
            .store
            .confirmed_receipt_at_or_before(&tx.id, final_block)?
            .map(|receipt| JobOutcome::Confirmed {
                block_number: receipt.block_number,
            }))
    }
}

#[async_trait]
impl HeadTrackable for JobMonitor {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn connect(&self, _head: Option<&Head>) -> TxmResult<()> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn on_new_longest_chain(&self, ctx: &HeadContext, head: &Head) {
        if let Err(e) = self.check_jobs(ctx, head).await {
            logger::error(
                LogTag::Jobs,
                &format!("Failed to check jobs at head #{}: {}", head.number, e),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CounterMetrics;
    use crate::testing::{ctx, gwei, head, insert_unstarted, store_with_account, test_config, FROM};
    use crate::types::{AttemptState, Tx, TxAttempt, TxReceipt, H256};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<(Uuid, JobOutcome)>>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        async fn handle(&self, job: &Job, outcome: &JobOutcome) -> anyhow::Result<()> {
            self.calls.lock().push((job.id, outcome.clone()));
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("downstream unavailable");
            }
            Ok(())
        }
    }

    fn monitor(store: &Store) -> JobMonitor {
        JobMonitor::new(store.clone(), &test_config().chain, Arc::new(CounterMetrics::new()))
    }

    /// Mark `tx` confirmed by a receipt in block `block_number`
    fn confirm(store: &Store, tx: &Tx, block_number: u64) {
        let mut tx = store.get_tx(&tx.id).unwrap().unwrap();
        let mut attempt = TxAttempt {
            id: Uuid::new_v4(),
            tx_id: tx.id,
            signed_raw: vec![1],
            gas_price: gwei(20),
            hash: H256([3; 32]),
            state: AttemptState::Broadcast,
            broadcast_before_block_num: Some(block_number),
            receipt_ids: Vec::new(),
            created_at: Utc::now(),
        };
        tx.nonce = Some(0);
        tx.state = TxState::Unconfirmed;
        tx.attempt_ids.push(attempt.id);
        store.save_new_attempt(&tx, &attempt).unwrap();
        let receipt = TxReceipt {
            id: Uuid::new_v4(),
            attempt_id: attempt.id,
            tx_hash: attempt.hash,
            block_number,
            block_hash: H256([4; 32]),
            success: true,
            gas_used: 21_000,
        };
        store.save_receipt(&mut tx, &mut attempt, &receipt).unwrap();
    }

    #[tokio::test]
    async fn confirmed_job_is_handled_once_at_finality() {
        let store = store_with_account(&FROM);
        let monitor = monitor(&store);
        let tx = insert_unstarted(&store, FROM);
        let job_id = monitor.add_job(&tx.id, b"invoice-17".to_vec()).unwrap();
        let handler = Arc::new(RecordingHandler::default());
        monitor.monitor_job(&job_id, handler.clone()).unwrap();
        confirm(&store, &tx, 10);

        // finality depth 5
        monitor.check_jobs(&ctx(), &head(14)).await.unwrap();
        assert!(handler.calls.lock().is_empty());

        monitor.check_jobs(&ctx(), &head(15)).await.unwrap();
        monitor.check_jobs(&ctx(), &head(16)).await.unwrap();

        let calls = handler.calls.lock().clone();
        assert_eq!(calls, vec![(job_id, JobOutcome::Confirmed { block_number: 10 })]);
        assert_eq!(store.get_job(&job_id).unwrap().unwrap().state, JobState::Handled);
        assert!(monitor.unhandled_job_ids().unwrap().is_empty());
        assert_eq!(monitor.monitored_count(), 0);
    }

    #[tokio::test]
    async fn failed_tx_reports_its_error() {
        let store = store_with_account(&FROM);
        let monitor = monitor(&store);
        let tx = insert_unstarted(&store, FROM);
        let job_id = monitor.add_job(&tx.id, Vec::new()).unwrap();
        let handler = Arc::new(RecordingHandler::default());
        monitor.monitor_job(&job_id, handler.clone()).unwrap();

        let mut failed = store.get_tx(&tx.id).unwrap().unwrap();
        store.save_fatal(&mut failed, "intrinsic gas too low").unwrap();
        monitor.check_jobs(&ctx(), &head(3)).await.unwrap();

        let calls = handler.calls.lock().clone();
        assert_eq!(
            calls,
            vec![(
                job_id,
                JobOutcome::Failed {
                    error: "intrinsic gas too low".to_string()
                }
            )]
        );
    }

    #[tokio::test]
    async fn handler_error_is_retried_next_head() {
        let store = store_with_account(&FROM);
        let monitor = monitor(&store);
        let tx = insert_unstarted(&store, FROM);
        let job_id = monitor.add_job(&tx.id, Vec::new()).unwrap();
        let handler = Arc::new(RecordingHandler::default());
        handler.failures_left.store(1, Ordering::SeqCst);
        monitor.monitor_job(&job_id, handler.clone()).unwrap();
        confirm(&store, &tx, 2);

        monitor.check_jobs(&ctx(), &head(10)).await.unwrap();
        assert_eq!(monitor.unhandled_job_ids().unwrap(), vec![job_id]);

        monitor.check_jobs(&ctx(), &head(11)).await.unwrap();
        assert_eq!(handler.calls.lock().len(), 2);
        assert!(monitor.unhandled_job_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_are_rejected() {
        let store = store_with_account(&FROM);
        let monitor = monitor(&store);
        let handler = Arc::new(RecordingHandler::default());

        assert!(matches!(
            monitor.add_job(&Uuid::new_v4(), Vec::new()),
            Err(TxmError::TxNotFound(_))
        ));
        assert!(matches!(
            monitor.monitor_job(&Uuid::new_v4(), handler),
            Err(TxmError::JobNotFound(_))
        ));
        assert!(matches!(
            monitor.delete_job(&Uuid::new_v4()),
            Err(TxmError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn deleted_job_is_no_longer_monitored() {
        let store = store_with_account(&FROM);
        let monitor = monitor(&store);
        let tx = insert_unstarted(&store, FROM);
        let job_id = monitor.add_job(&tx.id, Vec::new()).unwrap();
        let handler = Arc::new(RecordingHandler::default());
        monitor.monitor_job(&job_id, handler.clone()).unwrap();
        confirm(&store, &tx, 1);

        monitor.delete_job(&job_id).unwrap();
        monitor.check_jobs(&ctx(), &head(20)).await.unwrap();

        assert!(handler.calls.lock().is_empty());
        assert!(store.get_job(&job_id).unwrap().is_none());
        assert_eq!(monitor.monitored_count(), 0);
    }

    /// Deletes its own job through the monitor while handling it
    #[derive(Default)]
    struct DeletingHandler {
        monitor: Mutex<Option<Arc<JobMonitor>>>,
    }

    #[async_trait]
    impl JobHandler for DeletingHandler {
        async fn handle(&self, job: &Job, _outcome: &JobOutcome) -> anyhow::Result<()> {
            let monitor = self.monitor.lock().take();
            if let Some(monitor) = monitor {
                monitor.delete_job(&job.id)?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn job_deleted_during_handling_stays_deleted() {
        let store = store_with_account(&FROM);
        let monitor = Arc::new(monitor(&store));
        let tx = insert_unstarted(&store, FROM);
        let job_id = monitor.add_job(&tx.id, Vec::new()).unwrap();
        let handler = Arc::new(DeletingHandler::default());
        *handler.monitor.lock() = Some(monitor.clone());
        monitor.monitor_job(&job_id, handler).unwrap();
        confirm(&store, &tx, 1);

        monitor.check_jobs(&ctx(), &head(20)).await.unwrap();

        assert!(store.get_job(&job_id).unwrap().is_none());
        assert!(monitor.unhandled_job_ids().unwrap().is_empty());
        assert_eq!(monitor.monitored_count(), 0);
    }
}
