use super::backoff::Backoff;
use super::ring_buffer::HeadRingBuffer;
use super::{HeadContext, HeadTrackable};
use crate::chain::{with_timeout, ChainClient, HeadSubscription};
use crate::config::{ChainConfig, HeadTrackerConfig};
use crate::errors::{TxmError, TxmResult};
use crate::logger::{self, LogTag};
use crate::metrics::{Counter, MetricsSink, Timer};
use crate::services::ServiceHealth;
use crate::shutdown::ShutdownSignal;
use crate::store::Store;
use crate::types::Head;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Where a dequeued head stands relative to the highest seen one
enum HeadOrder {
    NewHighest,
    Duplicate,
    AlreadyKnown,
    OutOfOrder,
}

pub struct HeadTracker {
    client: Arc<dyn ChainClient>,
    store: Store,
    chain: ChainConfig,
    config: HeadTrackerConfig,
    trackables: Vec<Arc<dyn HeadTrackable>>,
    metrics: Arc<dyn MetricsSink>,
    highest_seen: Mutex<Option<Head>>,
    connected: AtomicBool,
    fatal_error: Mutex<Option<String>>,
}

impl HeadTracker {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Store,
        chain: ChainConfig,
        config: HeadTrackerConfig,
        trackables: Vec<Arc<dyn HeadTrackable>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            client,
            store,
            chain,
            config,
            trackables,
            metrics,
            highest_seen: Mutex::new(None),
            connected: AtomicBool::new(false),
            fatal_error: Mutex::new(None),
        }
    }

    // ===== STATUS =====

    pub fn highest_seen_head(&self) -> Option<Head> {
        self.highest_seen.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Error that stopped the tracker for good, if any
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal_error.lock().clone()
    }

    pub fn health(&self) -> ServiceHealth {
        if let Some(error) = self.fatal_error() {
            ServiceHealth::Unhealthy(error)
        } else if !self.is_connected() {
            ServiceHealth::Degraded("not connected to node".to_string())
        } else {
            ServiceHealth::Healthy
        }
    }

    /// Restore the highest seen head from the store
    pub fn load_highest_seen_head(&self) -> TxmResult<Option<Head>> {
        let highest = self.store.highest_head()?;
        if let Some(head) = &highest {
            logger::info(
                LogTag::HeadTracker,
                &format!("Resuming from highest persisted head {}", head),
            );
        }
        *self.highest_seen.lock() = highest.clone();
        Ok(highest)
    }

    // ===== LIFECYCLE =====

    /// Spawn the subscription and consumer tasks
    pub fn start(self: &Arc<Self>, shutdown: ShutdownSignal) -> TxmResult<Vec<JoinHandle<()>>> {
        self.load_highest_seen_head()?;
        *self.fatal_error.lock() = None;

        let buffer = Arc::new(HeadRingBuffer::new(self.config.buffer_size));
        let consumer = tokio::spawn(self.clone().consume(buffer.clone(), shutdown.clone()));
        let subscriber = tokio::spawn(self.clone().subscription_loop(buffer, shutdown));
        Ok(vec![subscriber, consumer])
    }

    async fn consume(self: Arc<Self>, buffer: Arc<HeadRingBuffer>, shutdown: ShutdownSignal) {
        loop {
            let head = tokio::select! {
                _ = shutdown.cancelled() => break,
                head = buffer.pop() => match head {
                    Some(head) => head,
                    None => break,
                },
            };
            self.handle_new_head(head, &shutdown).await;
        }
        logger::debug(LogTag::HeadTracker, "Head consumer stopped");
    }

    async fn subscription_loop(self: Arc<Self>, buffer: Arc<HeadRingBuffer>, shutdown: ShutdownSignal) {
        let mut backoff = Backoff::new(self.config.backoff_min(), self.config.backoff_max());

        loop {
            if shutdown.is_triggered() {
                break;
            }

            match self.subscribe().await {
                Ok(subscription) => {
                    backoff.reset();
                    self.connected.store(true, Ordering::SeqCst);
                    logger::info(
                        LogTag::HeadTracker,
                        &format!("Subscribed to new heads on chain {}", self.chain.chain_id),
                    );
                    self.connect_trackables().await;

                    let stopped = self.receive_heads(subscription, &buffer, &shutdown).await;

                    self.connected.store(false, Ordering::SeqCst);
                    self.disconnect_trackables().await;
                    if stopped {
                        break;
                    }
                }
                Err(TxmError::ChainIdMismatch { expected, actual }) => {
                    let message = format!(
                        "Node reports chain id {} but chain id {} is configured; head tracking stopped",
                        actual, expected
                    );
                    logger::error(LogTag::HeadTracker, &message);
                    *self.fatal_error.lock() = Some(message);
                    self.disconnect_trackables().await;
                    break;
                }
                Err(e) => {
                    logger::warning(
                        LogTag::HeadTracker,
                        &format!("Failed to subscribe to new heads: {}", e),
                    );
                }
            }

            self.metrics.increment(Counter::Resubscriptions, 1);
            let delay = backoff.next_delay();
            logger::debug(
                LogTag::HeadTracker,
                &format!("Resubscribing in {:?} (attempt {})", delay, backoff.attempts()),
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        buffer.close();
        logger::debug(LogTag::HeadTracker, "Head subscription loop stopped");
    }

    /// Subscribe and verify the node serves the configured chain
    async fn subscribe(&self) -> TxmResult<HeadSubscription> {
        let timeout = self.chain.request_timeout();
        let subscription = with_timeout(timeout, self.client.subscribe_new_heads()).await?;
        let actual = with_timeout(timeout, self.client.chain_id()).await?;
        if actual != self.chain.chain_id {
            return Err(TxmError::ChainIdMismatch {
                expected: self.chain.chain_id,
                actual,
            });
        }
        Ok(subscription)
    }

    /// Forward heads into the buffer; returns true when stopped by shutdown
    async fn receive_heads(
        &self,
        mut subscription: HeadSubscription,
        buffer: &HeadRingBuffer,
        shutdown: &ShutdownSignal,
    ) -> bool {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return true,
                message = subscription.recv() => match message {
                    Some(Ok(head)) => {
                        self.metrics.increment(Counter::HeadsReceived, 1);
                        if let Some(dropped) = buffer.push(head) {
                            self.metrics.increment(Counter::HeadsDropped, 1);
                            logger::debug(
                                LogTag::HeadTracker,
                                &format!("Head buffer full, dropped {}", dropped),
                            );
                        }
                    }
                    Some(Err(e)) => {
                        logger::warning(
                            LogTag::HeadTracker,
                            &format!("Head subscription error: {}", e),
                        );
                        return false;
                    }
                    None => {
                        logger::warning(LogTag::HeadTracker, "Head subscription closed by node");
                        return false;
                    }
                },
            }
        }
    }

    async fn connect_trackables(&self) {
        let highest = self.highest_seen_head();
        for trackable in &self.trackables {
            if let Err(e) = trackable.connect(highest.as_ref()).await {
                logger::warning(
                    LogTag::HeadTracker,
                    &format!("{} failed to connect: {}", trackable.name(), e),
                );
            }
        }
    }

    async fn disconnect_trackables(&self) {
        for trackable in &self.trackables {
            trackable.disconnect().await;
        }
    }

    // ===== HEAD HANDLING =====

    /// Handle one dequeued head within the total head budget
    pub async fn handle_new_head(&self, head: Head, shutdown: &ShutdownSignal) {
        let started = Instant::now();
        let deadline = started + self.chain.head_budget();
        let number = head.number;

        match tokio::time::timeout_at(deadline, self.process_head(head, deadline, shutdown)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                logger::error(
                    LogTag::HeadTracker,
                    &format!("Failed to handle head #{}: {}", number, e),
                );
            }
            Err(_) => {
                self.metrics.increment(Counter::HeadBudgetExceeded, 1);
                logger::warning(
                    LogTag::HeadTracker,
                    &format!(
                        "Handling head #{} exceeded its {:?} budget; remaining work abandoned",
                        number,
                        self.chain.head_budget()
                    ),
                );
            }
        }

        self.metrics.observe(Timer::HeadHandling, started.elapsed());
    }

    async fn process_head(&self, head: Head, deadline: Instant, shutdown: &ShutdownSignal) -> TxmResult<()> {
        self.store.save_head(&head)?;

        let (order, highest_number) = {
            let mut highest = self.highest_seen.lock();
            let order = match highest.as_ref() {
                None => HeadOrder::NewHighest,
                Some(prev) if head.number > prev.number => HeadOrder::NewHighest,
                Some(prev) if head.number == prev.number && head.hash != prev.hash => HeadOrder::Duplicate,
                Some(prev) if head.number == prev.number => HeadOrder::AlreadyKnown,
                Some(_) => HeadOrder::OutOfOrder,
            };
            if let HeadOrder::NewHighest = order {
                *highest = Some(head.detached());
            }
            let highest_number = highest.as_ref().map_or(head.number, |h| h.number);
            (order, highest_number)
        };

        let min_retained = highest_number.saturating_sub(self.config.retention_depth);
        let trimmed = self.store.trim_old_heads(min_retained)?;
        if trimmed > 0 {
            logger::verbose(
                LogTag::HeadTracker,
                &format!("Trimmed {} heads below #{}", trimmed, min_retained),
            );
        }

        match order {
            HeadOrder::NewHighest => {}
            HeadOrder::Duplicate => {
                logger::debug(
                    LogTag::HeadTracker,
                    &format!("Got duplicate head {} at current height #{}", head.hash, head.number),
                );
                return Ok(());
            }
            HeadOrder::AlreadyKnown => {
                logger::verbose(LogTag::HeadTracker, &format!("Head {} already known", head));
                return Ok(());
            }
            HeadOrder::OutOfOrder => {
                self.metrics.increment(Counter::HeadsOutOfOrder, 1);
                logger::debug(
                    LogTag::HeadTracker,
                    &format!("Got out of order head {}, highest seen is #{}", head, highest_number),
                );
                return Ok(());
            }
        }

        logger::debug(LogTag::HeadTracker, &format!("New highest head {}", head));

        let chain = self.get_chain_with_backfill(&head, deadline).await?;
        let ctx = HeadContext::new(deadline, shutdown.clone());
        self.run_callbacks(&chain, &ctx).await;
        Ok(())
    }

    /// Ancestry of `head` up to the finality depth
    ///
    /// Stored heads are used first; missing parents are fetched by number
    /// until the backfill budget runs out. Any gap truncates the chain.
    async fn get_chain_with_backfill(&self, head: &Head, deadline: Instant) -> TxmResult<Head> {
        let depth = self.chain.finality_depth;
        let stored = self.store.chain(&head.hash, depth)?;
        let mut headers: Vec<Head> = match &stored {
            Some(chain) => chain.ancestry().map(Head::detached).collect(),
            None => vec![head.detached()],
        };

        let backfill_deadline = (Instant::now() + self.chain.backfill_budget()).min(deadline);
        while (headers.len() as u64) < depth {
            let (parent_number, parent_hash) = match headers.last() {
                Some(earliest) if earliest.number > 0 => (earliest.number - 1, earliest.parent_hash),
                _ => break,
            };

            if let Some(parent) = self.store.get_head(&parent_hash)? {
                headers.push(parent);
                continue;
            }

            match tokio::time::timeout_at(backfill_deadline, self.client.header_by_number(parent_number)).await {
                Ok(Ok(Some(parent))) if parent.hash == parent_hash => {
                    self.store.save_head(&parent)?;
                    self.metrics.increment(Counter::BackfilledHeads, 1);
                    headers.push(parent.detached());
                }
                Ok(Ok(Some(other))) => {
                    logger::debug(
                        LogTag::HeadTracker,
                        &format!(
                            "Backfilled header {} is not the parent of #{}; chain truncated",
                            other,
                            parent_number + 1
                        ),
                    );
                    break;
                }
                Ok(Ok(None)) => {
                    logger::debug(
                        LogTag::HeadTracker,
                        &format!("Header #{} not found during backfill", parent_number),
                    );
                    break;
                }
                Ok(Err(e)) => {
                    logger::warning(
                        LogTag::HeadTracker,
                        &format!("Failed to fetch header #{}: {}", parent_number, e),
                    );
                    break;
                }
                Err(_) => {
                    logger::debug(
                        LogTag::HeadTracker,
                        &format!("Backfill budget exhausted at header #{}", parent_number),
                    );
                    break;
                }
            }
        }

        Ok(Head::link(headers).unwrap_or_else(|| head.detached()))
    }

    /// Run every observer concurrently and wait for all of them
    async fn run_callbacks(&self, chain: &Head, ctx: &HeadContext) {
        let threshold = self.chain.callback_threshold();
        let callbacks = self.trackables.iter().map(|trackable| async move {
            let started = Instant::now();
            trackable.on_new_longest_chain(ctx, chain).await;
            let elapsed = started.elapsed();
            self.metrics.observe(Timer::ObserverCallback(trackable.name()), elapsed);
            if elapsed > threshold {
                logger::warning(
                    LogTag::HeadTracker,
                    &format!(
                        "{} took {:?} for head #{}, above the {:?} threshold",
                        trackable.name(),
                        elapsed,
                        chain.number,
                        threshold
                    ),
                );
            }
        });
        join_all(callbacks).await;
    }
}
