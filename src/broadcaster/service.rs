use super::TxBroadcaster;
use crate::head_tracker::HeadTrackerService;
use crate::services::Service;
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct BroadcasterService {
    broadcaster: Arc<TxBroadcaster>,
}

impl BroadcasterService {
    pub const NAME: &'static str = "broadcaster";

    pub fn new(broadcaster: Arc<TxBroadcaster>) -> Self {
        Self { broadcaster }
    }
}

#[async_trait]
impl Service for BroadcasterService {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        20
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![HeadTrackerService::NAME]
    }

    async fn start(&mut self, shutdown: ShutdownSignal) -> Result<Vec<JoinHandle<()>>, String> {
        let broadcaster = self.broadcaster.clone();
        // Pick up transactions queued before the start
        broadcaster.trigger();
        Ok(vec![tokio::spawn(broadcaster.run(shutdown))])
    }
}
