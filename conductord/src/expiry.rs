//! Periodic sweep that expires human requests past their deadline.

use std::time::Duration;

use conductor_core::config::HumanLoopConfig;
use conductor_engine::HumanLoop;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};

pub struct ExpiryWorker {
    humans: HumanLoop,
    config: HumanLoopConfig,
}

impl ExpiryWorker {
    pub fn new(humans: HumanLoop, config: HumanLoopConfig) -> Self {
        Self { humans, config }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll = interval(Duration::from_secs(
            self.config.expiry_poll_interval_seconds.max(1),
        ));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            poll_interval_seconds = self.config.expiry_poll_interval_seconds,
            "expiry_worker_started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = poll.tick() => {
                    match self.humans.expire_stale().await {
                        Ok(0) => {}
                        Ok(expired) => tracing::info!(expired, "human_requests_expired"),
                        Err(err) => tracing::error!(error = %err, "expiry_sweep_failed"),
                    }
                }
            }
        }
        tracing::info!("expiry_worker_stopped");
    }
}
