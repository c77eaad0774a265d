//! Periodic housekeeping tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::clock::unix_now;
use crate::manager::ConfigManager;
use crate::security::ChallengeStore;
use crate::store::Store;

pub const LOG_RETENTION_PERIOD: Duration = Duration::from_secs(300);

fn ticker(period: Duration) -> time::Interval {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Drop hit logs older than `Log_Expire_Seconds`.
pub fn purge_expired_logs(store: &dyn Store) {
    let settings = match store.settings() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!(error = %e, "Log retention skipped");
            return;
        }
    };
    let cutoff = unix_now() - settings.log_expire_seconds;
    match store.purge_logs_before(cutoff) {
        Ok(0) => {}
        Ok(purged) => tracing::info!(purged, cutoff, "Expired hit logs purged"),
        Err(e) => tracing::warn!(error = %e, "Log retention failed"),
    }
}

pub async fn log_retention(store: Arc<dyn Store>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => purge_expired_logs(store.as_ref()),
            _ = shutdown.recv() => break,
        }
    }
    tracing::debug!("Log retention stopped");
}

pub async fn challenge_sweep(
    challenges: Arc<ChallengeStore>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = ticker(period.max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = challenges.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "Expired challenges swept");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
    tracing::debug!("Challenge sweep stopped");
}

/// Apply data file changes reported by the watcher.
pub async fn data_reload(
    manager: Arc<ConfigManager>,
    mut changes: mpsc::UnboundedReceiver<()>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            change = changes.recv() => {
                if change.is_none() {
                    break;
                }
                // editors and the store both write in bursts
                time::sleep(Duration::from_millis(200)).await;
                while changes.try_recv().is_ok() {}
                if let Err(e) = manager.refresh_from_store().await {
                    tracing::error!(error = %e, "Data file reload failed, keeping current configuration");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
    tracing::debug!("Data file reload stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{CcLog, PolicyAction, RequestSummary};
    use crate::store::JsonStore;

    fn cc_log(request_time: i64) -> CcLog {
        CcLog {
            request: RequestSummary {
                request_time,
                client_ip: "10.0.0.1".to_string(),
                host: "a.example.com".to_string(),
                method: "GET".to_string(),
                url_path: "/".to_string(),
                url_query: String::new(),
                user_agent: String::new(),
                referer: String::new(),
            },
            app_id: 1,
            action: PolicyAction::Block,
        }
    }

    #[test]
    fn test_purge_uses_log_expire_seconds() {
        let store = JsonStore::in_memory();
        let now = unix_now();
        store.insert_cc_log(cc_log(now - 8 * 86_400)).unwrap();
        store.insert_cc_log(cc_log(now - 60)).unwrap();

        purge_expired_logs(&store);

        let left = store.cc_logs();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].request.request_time, now - 60);
    }

    #[tokio::test]
    async fn test_routines_stop_on_shutdown() {
        let store: Arc<dyn Store> = Arc::new(JsonStore::in_memory());
        let (tx, _) = broadcast::channel(1);
        let task = tokio::spawn(log_retention(store, Duration::from_secs(3600), tx.subscribe()));
        tx.send(()).unwrap();
        task.await.unwrap();
    }
}
