use super::HeadTracker;
use crate::services::{Service, ServiceHealth};
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct HeadTrackerService {
    tracker: Arc<HeadTracker>,
}

impl HeadTrackerService {
    pub const NAME: &'static str = "head_tracker";

    pub fn new(tracker: Arc<HeadTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl Service for HeadTrackerService {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        10
    }

    async fn start(&mut self, shutdown: ShutdownSignal) -> Result<Vec<JoinHandle<()>>, String> {
        self.tracker.start(shutdown).map_err(|e| e.to_string())
    }

    async fn health(&self) -> ServiceHealth {
        self.tracker.health()
    }
}
