/// Injected metrics sink
///
/// Components receive an `Arc<dyn MetricsSink>` at construction; there are no
/// process-wide counters.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Counted events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    HeadsReceived,
    HeadsDropped,
    HeadsOutOfOrder,
    HeadBudgetExceeded,
    BackfilledHeads,
    Resubscriptions,
    TxsBroadcast,
    TxsFatal,
    GasBumps,
    AttemptsResent,
    InsufficientFunds,
    ReceiptsFound,
    MissingReceipts,
    ReceiptTimeouts,
    Reorgs,
    JobsHandled,
}

/// Timed operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    HeadHandling,
    ObserverCallback(&'static str),
    BroadcasterPass,
}

pub trait MetricsSink: Send + Sync {
    fn increment(&self, counter: Counter, by: u64);

    fn observe(&self, timer: Timer, elapsed: Duration);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _counter: Counter, _by: u64) {}

    fn observe(&self, _timer: Timer, _elapsed: Duration) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

/// In-memory counters, readable through [`CounterMetrics::count`] and
/// [`CounterMetrics::timer`]
#[derive(Debug, Default)]
pub struct CounterMetrics {
    counters: Mutex<HashMap<Counter, u64>>,
    timers: Mutex<HashMap<Timer, TimerStats>>,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, counter: Counter) -> u64 {
        self.counters.lock().get(&counter).copied().unwrap_or(0)
    }

    pub fn timer(&self, timer: Timer) -> TimerStats {
        self.timers.lock().get(&timer).copied().unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<Counter, u64> {
        self.counters.lock().clone()
    }
}

impl MetricsSink for CounterMetrics {
    fn increment(&self, counter: Counter, by: u64) {
        *self.counters.lock().entry(counter).or_insert(0) += by;
    }

    fn observe(&self, timer: Timer, elapsed: Duration) {
        let mut timers = self.timers.lock();
        let stats = timers.entry(timer).or_default();
        stats.count += 1;
        stats.total += elapsed;
        stats.max = stats.max.max(elapsed);
    }
}
