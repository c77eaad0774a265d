//! Bounded queue for work the request path must not wait on.
//!
//! # Responsibilities
//! - Accept hit logs and blocklist inserts from request handlers without
//!   blocking them
//! - Run them on one worker task, independent of the request that queued them
//!
//! # Design Decisions
//! - `try_send` only: a full queue drops the task, logs it and counts it
//! - Blocklist inserts shell out to `nft`, so they run on the blocking pool
//! - On shutdown the worker drains what is already queued before exiting

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use crate::firewall::{CcLog, GroupHitLog, KernelBlocklist};
use crate::observability::metrics;
use crate::replication::ReplicationClient;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundTask {
    GroupHit(GroupHitLog),
    FloodHit(CcLog),
    BlockAddress { ip: IpAddr, ttl: Duration },
}

impl BackgroundTask {
    pub fn kind(&self) -> &'static str {
        match self {
            BackgroundTask::GroupHit(_) => "group_hit",
            BackgroundTask::FloodHit(_) => "cc_log",
            BackgroundTask::BlockAddress { .. } => "block_address",
        }
    }
}

/// Handle given to request handlers.
#[derive(Debug, Clone)]
pub struct TaskDispatcher {
    tx: mpsc::Sender<BackgroundTask>,
}

impl TaskDispatcher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BackgroundTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a task. Returns false when it was dropped.
    pub fn dispatch(&self, task: BackgroundTask) -> bool {
        let kind = task.kind();
        match self.tx.try_send(task) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::record_task_dropped(kind);
                tracing::warn!(kind, "Background queue full, task dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                metrics::record_task_dropped(kind);
                tracing::warn!(kind, "Background worker stopped, task dropped");
                false
            }
        }
    }
}

/// Where hit logs end up: the local store on a primary, the primary's RPC on
/// a replica.
#[derive(Clone)]
pub enum HitLogSink {
    Store(Arc<dyn Store>),
    Primary(Arc<ReplicationClient>),
}

pub struct TaskWorker {
    sink: HitLogSink,
    blocklist: Arc<KernelBlocklist>,
}

impl TaskWorker {
    pub fn new(sink: HitLogSink, blocklist: Arc<KernelBlocklist>) -> Self {
        Self { sink, blocklist }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<BackgroundTask>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                task = rx.recv() => match task {
                    Some(task) => self.execute(task).await,
                    None => break,
                },
                _ = shutdown.recv() => {
                    rx.close();
                    while let Some(task) = rx.recv().await {
                        self.execute(task).await;
                    }
                    break;
                }
            }
        }
        tracing::info!("Background worker stopped");
    }

    pub async fn execute(&self, task: BackgroundTask) {
        let kind = task.kind();
        let result = match task {
            BackgroundTask::GroupHit(log) => self.store_group_hit(log).await,
            BackgroundTask::FloodHit(log) => self.store_cc_log(log).await,
            BackgroundTask::BlockAddress { ip, ttl } => self.block(ip, ttl).await,
        };
        if let Err(e) = result {
            metrics::record_task_failure(kind);
            tracing::warn!(kind, error = %e, "Background task failed");
        }
    }

    async fn store_group_hit(&self, log: GroupHitLog) -> Result<(), String> {
        match &self.sink {
            HitLogSink::Store(store) => store.insert_group_hit(log).map_err(|e| e.to_string()),
            HitLogSink::Primary(client) => client.submit_group_hit(&log).await.map_err(|e| e.to_string()),
        }
    }

    async fn store_cc_log(&self, log: CcLog) -> Result<(), String> {
        match &self.sink {
            HitLogSink::Store(store) => store.insert_cc_log(log).map_err(|e| e.to_string()),
            HitLogSink::Primary(client) => client.submit_cc_log(&log).await.map_err(|e| e.to_string()),
        }
    }

    async fn block(&self, ip: IpAddr, ttl: Duration) -> Result<(), String> {
        if !self.blocklist.is_enabled() {
            return Ok(());
        }
        let blocklist = self.blocklist.clone();
        let result = tokio::task::spawn_blocking(move || blocklist.block(ip, ttl))
            .await
            .map_err(|e| e.to_string())?;
        metrics::record_blocklist_update(if result.is_ok() { "ok" } else { "error" });
        result.map_err(|e| e.to_string())?;
        tracing::info!(ip = %ip, ttl_secs = ttl.as_secs(), "Address added to kernel blocklist");
        Ok(())
    }
}
