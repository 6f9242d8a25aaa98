use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::coordinator::RoundCoordinator;
use super::types::CompletionTrigger;

/// Configuration for the periodic deadline scan.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutMonitorConfig {
    pub interval: Duration,
    /// How long completed rounds stay registered so late updates are still recognized.
    pub completed_retention: Duration,
}

impl Default for TimeoutMonitorConfig {
    fn default() -> Self { Self { interval: Duration::from_secs(5), completed_retention: Duration::from_secs(3600) } }
}

pub struct TimeoutMonitor {
    coordinator: Arc<RoundCoordinator>,
    cfg: TimeoutMonitorConfig,
}

impl TimeoutMonitor {
    pub fn new(coordinator: Arc<RoundCoordinator>, cfg: TimeoutMonitorConfig) -> Self { Self { coordinator, cfg } }

    /// Forces completion of every overdue round. Returns how many this scan claimed.
    pub fn scan_once(&self) -> usize {
        let mut claimed = 0;
        for round_id in self.coordinator.registry().expired() {
            if self.coordinator.attempt_completion(&round_id, CompletionTrigger::Timeout) {
                info!(%round_id, "round_timed_out");
                claimed += 1;
            }
        }
        let pruned = self.coordinator.registry().prune_completed(self.cfg.completed_retention);
        if pruned > 0 { debug!(pruned, "completed_rounds_pruned"); }
        claimed
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.cfg.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = self.cfg.interval.as_millis() as u64, "timeout_monitor_started");
            loop {
                interval.tick().await;
                self.scan_once();
            }
        })
    }
}
