//! Replica poll loop.
//!
//! Every tick fetches the primary's settings and compares its watermarks with
//! the ones currently applied. A strictly greater remote watermark starts a
//! reload of that subsystem in its own task, so a slow reload never delays
//! the next poll. When `Sync_Seconds` changes the ticker is re-armed with the
//! new period.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use crate::manager::{ConfigManager, Subsystem};
use crate::store::SyncSettings;

/// Subsystems whose remote watermark is ahead of the applied one.
pub fn stale_subsystems(applied: &SyncSettings, remote: &SyncSettings) -> Vec<(Subsystem, i64)> {
    let mut stale = Vec::with_capacity(2);
    if remote.backend_last_modified > applied.backend_last_modified {
        stale.push((Subsystem::Backend, remote.backend_last_modified));
    }
    if remote.firewall_last_modified > applied.firewall_last_modified {
        stale.push((Subsystem::Firewall, remote.firewall_last_modified));
    }
    stale
}

fn sync_ticker(period: Duration) -> Interval {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

pub struct SyncLoop {
    manager: Arc<ConfigManager>,
    period: Duration,
}

impl SyncLoop {
    pub fn new(manager: Arc<ConfigManager>, initial_period: Duration) -> Self {
        Self {
            manager,
            period: initial_period.max(Duration::from_secs(1)),
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = sync_ticker(self.period);
        tracing::info!(period_secs = self.period.as_secs(), "Replica sync loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(period) = self.poll().await {
                        tracing::info!(period_secs = period.as_secs(), "Sync interval changed");
                        self.period = period;
                        ticker = sync_ticker(period);
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Replica sync loop stopping");
                    break;
                }
            }
        }
    }

    /// One poll. Returns the new period when `Sync_Seconds` changed.
    pub async fn poll(&self) -> Option<Duration> {
        let remote = match self.manager.fetch_settings().await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch settings from primary");
                return None;
            }
        };

        for (subsystem, watermark) in stale_subsystems(&self.manager.applied(), &remote) {
            let manager = self.manager.clone();
            tokio::spawn(async move {
                match manager.reload_guarded(subsystem, watermark).await {
                    Ok(true) => tracing::info!(subsystem = subsystem.as_str(), watermark, "Replica reloaded"),
                    Ok(false) => tracing::debug!(subsystem = subsystem.as_str(), "Reload already in flight"),
                    Err(e) => tracing::error!(subsystem = subsystem.as_str(), error = %e, "Replica reload failed"),
                }
            });
        }

        let period = Duration::from_secs(remote.sync_seconds.max(1));
        if remote.sync_seconds != 0 && period != self.period {
            self.manager.set_sync_seconds(remote.sync_seconds);
            Some(period)
        } else {
            None
        }
    }
}
