//! Shutdown coordination.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, Instant};

/// Broadcast every long-running task subscribes to. Tasks drop their
/// receiver when they finish, which is what [`Shutdown::drain`] waits for.
#[derive(Debug)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Number of tasks still holding a receiver.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Wait until every subscriber is gone or `deadline` passes. Returns the
    /// number of tasks still running.
    pub async fn drain(&self, deadline: Duration) -> usize {
        let until = Instant::now() + deadline;
        while self.receiver_count() > 0 && Instant::now() < until {
            time::sleep(Duration::from_millis(50)).await;
        }
        self.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
