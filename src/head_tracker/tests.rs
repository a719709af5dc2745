use super::*;
use crate::metrics::{Counter, CounterMetrics};
use crate::services::ServiceHealth;
use crate::store::Store;
use crate::testing::{eventually, fork_head, head, test_config, MockChainClient, RecordingTrackable};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    client: Arc<MockChainClient>,
    store: Store,
    recorder: Arc<RecordingTrackable>,
    metrics: Arc<CounterMetrics>,
    tracker: Arc<HeadTracker>,
}

fn harness() -> Harness {
    harness_with(Vec::new())
}

/// Harness whose tracker drives the recorder followed by `extra`
fn harness_with(extra: Vec<Arc<dyn HeadTrackable>>) -> Harness {
    let config = test_config();
    let client = Arc::new(MockChainClient::new());
    let store = Store::in_memory().unwrap();
    let recorder = Arc::new(RecordingTrackable::new());
    let metrics = Arc::new(CounterMetrics::new());
    let mut trackables = vec![recorder.clone() as Arc<dyn HeadTrackable>];
    trackables.extend(extra);
    let tracker = Arc::new(HeadTracker::new(
        client.clone(),
        store.clone(),
        config.chain.clone(),
        config.head_tracker.clone(),
        trackables,
        metrics.clone(),
    ));
    Harness {
        client,
        store,
        recorder,
        metrics,
        tracker,
    }
}

#[tokio::test]
async fn new_head_is_backfilled_to_finality_depth() {
    let h = harness();
    for number in 5..10 {
        h.client.insert_header(head(number));
    }

    h.tracker.handle_new_head(head(10), &ShutdownSignal::new()).await;

    assert_eq!(*h.recorder.chains.lock(), vec![(10, 5)]);
    assert_eq!(h.client.header_calls(), vec![9, 8, 7, 6]);
    assert_eq!(h.tracker.highest_seen_head().unwrap().number, 10);
    assert_eq!(h.metrics.count(Counter::BackfilledHeads), 4);

    // Ancestors are now stored, so the next head needs no fetches
    h.tracker.handle_new_head(head(11), &ShutdownSignal::new()).await;
    assert_eq!(h.client.header_calls().len(), 4);
    assert_eq!(h.recorder.chains.lock().last(), Some(&(11, 5)));
}

#[tokio::test]
async fn missing_ancestor_truncates_chain() {
    let h = harness();
    h.client.insert_header(head(9));
    // 8 is unknown to the node

    h.tracker.handle_new_head(head(10), &ShutdownSignal::new()).await;

    assert_eq!(*h.recorder.chains.lock(), vec![(10, 2)]);
    assert_eq!(h.client.header_calls(), vec![9, 8]);
}

#[tokio::test]
async fn header_from_another_fork_truncates_chain() {
    let h = harness();
    h.client.insert_header(fork_head(9, 1));

    h.tracker.handle_new_head(head(10), &ShutdownSignal::new()).await;

    assert_eq!(*h.recorder.chains.lock(), vec![(10, 1)]);
}

#[tokio::test]
async fn slow_backfill_is_cut_at_budget() {
    let h = harness();
    h.client.insert_header(head(9));
    h.client.set_header_delay(Duration::from_secs(2));

    let started = std::time::Instant::now();
    h.tracker.handle_new_head(head(10), &ShutdownSignal::new()).await;

    // 0.7 x 500ms block time
    assert!(started.elapsed() < Duration::from_millis(900));
    assert_eq!(*h.recorder.chains.lock(), vec![(10, 1)]);
}

#[tokio::test]
async fn stuck_observer_is_abandoned_at_head_budget() {
    let h = harness();
    *h.recorder.delay.lock() = Some(Duration::from_secs(5));

    let started = std::time::Instant::now();
    h.tracker.handle_new_head(head(3), &ShutdownSignal::new()).await;

    // 2 x 500ms block time
    assert!(started.elapsed() < Duration::from_millis(1_500));
    assert!(h.recorder.chains.lock().is_empty());
    assert_eq!(h.metrics.count(Counter::HeadBudgetExceeded), 1);
}

#[tokio::test]
async fn out_of_order_and_duplicate_heads_are_ignored() {
    let h = harness();
    let shutdown = ShutdownSignal::new();

    h.tracker.handle_new_head(head(10), &shutdown).await;
    h.tracker.handle_new_head(head(9), &shutdown).await;
    h.tracker.handle_new_head(fork_head(10, 1), &shutdown).await;
    h.tracker.handle_new_head(head(10), &shutdown).await;

    assert_eq!(h.recorder.heads(), vec![10]);
    assert_eq!(h.tracker.highest_seen_head().unwrap(), head(10));
    assert_eq!(h.metrics.count(Counter::HeadsOutOfOrder), 1);

    h.tracker.handle_new_head(head(11), &shutdown).await;
    assert_eq!(h.recorder.heads(), vec![10, 11]);
}

#[tokio::test]
async fn old_heads_are_trimmed() {
    let h = harness();
    let shutdown = ShutdownSignal::new();
    for number in 1..=30 {
        h.tracker.handle_new_head(head(number), &shutdown).await;
    }

    let lowest = h.store.heads().unwrap().iter().map(|head| head.number).min().unwrap();
    // retention depth 20 below the highest head
    assert_eq!(lowest, 10);
}

#[tokio::test]
async fn subscription_feeds_observers_until_shutdown() {
    let h = harness();
    let shutdown = ShutdownSignal::new();
    let handles = h.tracker.start(shutdown.clone()).unwrap();

    assert!(eventually(|| h.recorder.connects.lock().len() == 1).await);
    assert_eq!(*h.recorder.connects.lock(), vec![None]);
    assert!(h.tracker.health().is_healthy());

    for number in 1..=3 {
        h.client.send_head(head(number)).await;
    }
    assert!(eventually(|| h.recorder.heads().last() == Some(&3)).await);
    assert_eq!(h.tracker.highest_seen_head().unwrap().number, 3);

    shutdown.trigger();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(h.recorder.disconnects.load(Ordering::SeqCst), 1);
    assert!(!h.tracker.is_connected());
}

#[tokio::test]
async fn resubscribes_after_subscription_error() {
    let h = harness();
    h.store.save_head(&head(7)).unwrap();
    let shutdown = ShutdownSignal::new();
    h.tracker.start(shutdown.clone()).unwrap();

    assert!(eventually(|| h.recorder.connects.lock().len() == 1).await);
    // Highest persisted head is handed to observers on connect
    assert_eq!(*h.recorder.connects.lock(), vec![Some(7)]);

    h.client.send_subscription_error("websocket closed").await;
    assert!(eventually(|| h.client.subscribe_calls() == 2 && h.recorder.connects.lock().len() == 2).await);
    assert!(h.recorder.disconnects.load(Ordering::SeqCst) >= 1);

    h.client.send_head(head(8)).await;
    assert!(eventually(|| h.recorder.heads() == vec![8]).await);
    shutdown.trigger();
}

#[tokio::test]
async fn failed_subscribe_retries_with_backoff() {
    let h = harness();
    h.client.set_fail_subscribe(true);
    let shutdown = ShutdownSignal::new();
    h.tracker.start(shutdown.clone()).unwrap();

    assert!(eventually(|| h.client.subscribe_calls() >= 3).await);
    assert!(h.tracker.health().is_degraded());

    h.client.set_fail_subscribe(false);
    assert!(eventually(|| h.tracker.is_connected()).await);
    shutdown.trigger();
}

#[tokio::test]
async fn chain_id_mismatch_stops_tracker() {
    let h = harness();
    h.client.set_chain_id(99);
    let shutdown = ShutdownSignal::new();
    let handles = h.tracker.start(shutdown.clone()).unwrap();

    for handle in handles {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    assert_eq!(h.client.subscribe_calls(), 1);
    assert!(h.recorder.connects.lock().is_empty());
    assert_eq!(h.recorder.disconnects.load(Ordering::SeqCst), 1);
    assert!(h.recorder.chains.lock().is_empty());
    match h.tracker.health() {
        ServiceHealth::Unhealthy(reason) => assert!(reason.contains("chain id 99")),
        other => panic!("expected unhealthy tracker, got {}", other),
    }
}

#[tokio::test]
async fn observers_run_concurrently() {
    let slow = Arc::new(RecordingTrackable::new());
    *slow.delay.lock() = Some(Duration::from_millis(300));
    let h = harness_with(vec![slow.clone() as Arc<dyn HeadTrackable>]);
    *h.recorder.delay.lock() = Some(Duration::from_millis(300));

    let started = std::time::Instant::now();
    h.tracker.handle_new_head(head(10), &ShutdownSignal::new()).await;
    let elapsed = started.elapsed();

    assert_eq!(h.recorder.heads(), vec![10]);
    assert_eq!(slow.heads(), vec![10]);
    assert!(elapsed < Duration::from_millis(550), "took {:?}", elapsed);
    assert_eq!(h.metrics.count(Counter::HeadBudgetExceeded), 0);
}

#[tokio::test]
async fn slow_observer_does_not_delay_fast_one() {
    let slow = Arc::new(RecordingTrackable::new());
    *slow.delay.lock() = Some(Duration::from_millis(300));
    let h = harness_with(vec![slow.clone() as Arc<dyn HeadTrackable>]);

    let tracker = h.tracker.clone();
    let handling = tokio::spawn(async move {
        tracker.handle_new_head(head(10), &ShutdownSignal::new()).await;
    });

    assert!(eventually(|| h.recorder.heads() == vec![10]).await);
    assert!(slow.heads().is_empty());

    handling.await.unwrap();
    assert_eq!(slow.heads(), vec![10]);
}
