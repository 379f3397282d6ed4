// RPC Transport and Workers
//
// The async front end reads record-marked calls from TCP connections and
// answers portmapper calls itself. MOUNT and NFS calls go to one of a
// fixed set of worker threads, each of which owns a private export table
// and handle cache and serves one call at a time.

pub mod server;
pub mod supervisor;
pub mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

pub use server::RpcServer;
pub use supervisor::WorkerPool;

/// Requests the signal task raises for every worker
///
/// Each flag is a counter; a worker acts when the value differs from the
/// one it last handled, after its current call has completed.
#[derive(Debug, Default)]
pub struct Control {
    reload: AtomicU64,
    flush: AtomicU64,
}

impl Control {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every worker to rebuild its export table
    pub fn request_reload(&self) {
        self.reload.fetch_add(1, Ordering::SeqCst);
    }

    /// Ask every worker to close idle cached descriptors
    pub fn request_flush(&self) {
        self.flush.fetch_add(1, Ordering::SeqCst);
    }

    pub fn reload_epoch(&self) -> u64 {
        self.reload.load(Ordering::SeqCst)
    }

    pub fn flush_epoch(&self) -> u64 {
        self.flush.load(Ordering::SeqCst)
    }
}

/// Turn SIGHUP into export reloads and raise periodic cache flushes
///
/// Runs until the task is dropped.
pub async fn watch_signals(control: Arc<Control>, pool: Arc<WorkerPool>, flush_interval: Duration) -> anyhow::Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut ticker = tokio::time::interval(flush_interval);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading exports");
                control.request_reload();
            }
            _ = ticker.tick() => control.request_flush(),
        }
        pool.wake_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_epochs() {
        let control = Control::new();
        assert_eq!(control.reload_epoch(), 0);
        control.request_reload();
        control.request_reload();
        control.request_flush();
        assert_eq!(control.reload_epoch(), 2);
        assert_eq!(control.flush_epoch(), 1);
    }
}
