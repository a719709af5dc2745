/// Chain head tracking
///
/// Raw heads from the node subscription pass through a lossy
/// [`HeadRingBuffer`] into a single consumer that persists them, backfills
/// missing ancestors and fans the resulting chain out to every registered
/// [`HeadTrackable`] under a time budget.
mod backoff;
mod ring_buffer;
mod service;
mod tracker;

#[cfg(test)]
mod tests;

pub use backoff::Backoff;
pub use ring_buffer::HeadRingBuffer;
pub use service::HeadTrackerService;
pub use tracker::HeadTracker;

use crate::errors::TxmResult;
use crate::shutdown::ShutdownSignal;
use crate::types::Head;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Per-head execution context handed to observers
#[derive(Debug, Clone)]
pub struct HeadContext {
    /// Work past this instant is abandoned by the tracker
    pub deadline: Instant,
    pub shutdown: ShutdownSignal,
}

impl HeadContext {
    pub fn new(deadline: Instant, shutdown: ShutdownSignal) -> Self {
        Self { deadline, shutdown }
    }

    /// True once the deadline passed or shutdown was requested
    pub fn is_done(&self) -> bool {
        Instant::now() >= self.deadline || self.shutdown.is_triggered()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Observer of the canonical chain
#[async_trait]
pub trait HeadTrackable: Send + Sync {
    /// Name used in logs and callback timing metrics
    fn name(&self) -> &'static str;

    /// Called after every successful (re)subscription with the highest known head
    async fn connect(&self, head: Option<&Head>) -> TxmResult<()>;

    /// Called on teardown and before every resubscription
    async fn disconnect(&self);

    /// Called for each new highest head with its ancestry attached
    async fn on_new_longest_chain(&self, ctx: &HeadContext, head: &Head);
}
