use std::sync::Arc;

use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

use crate::tracker::RepostTracker;

/// Background safety net: periodically forces every guild store to disk, independent
/// of the per-message commits.
pub struct DurabilityFlusher {
    tracker: Arc<RepostTracker>,
    interval: Duration,
}

impl DurabilityFlusher {
    pub fn new(tracker: Arc<RepostTracker>, interval: Duration) -> Self {
        Self { tracker, interval }
    }

    pub async fn run(self) {
        info!("Scheduled store flush every {:?}", self.interval);
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; nothing needs flushing at startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.flush_once().await;
        }
    }

    pub async fn flush_once(&self) -> usize {
        debug!("Performing scheduled store flush");
        self.tracker.flush_all().await
    }
}
