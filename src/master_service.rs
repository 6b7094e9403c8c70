// Wraps the master state in its mutex and drives the background tasks:
// failure detection with repair planning, garbage collection, and periodic
// metadata snapshots.
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{self, Duration};
use tracing::{error, info};

use crate::config::{CommonConfig, MasterConfig};
use crate::error::FsError;
use crate::master_state::MasterState;
use crate::util::now_secs;

#[derive(Debug)]
pub struct MasterService {
    // One mutex over all metadata: entry points lock it, MasterState methods
    // assume it is held.
    pub state: Arc<Mutex<MasterState>>,
    pub common: CommonConfig,
    pub config: MasterConfig,
    pub addr: String,
}

impl MasterService {
    /// Recover metadata from snapshot + WAL and wrap it for serving.
    pub fn recover(
        addr: &str,
        config: MasterConfig,
        common: CommonConfig,
    ) -> Result<Self, FsError> {
        let state = MasterState::recover(config.clone(), common.clone())?;
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            common,
            config,
            addr: addr.to_string(),
        })
    }

    /// Starts a periodic task that marks silent chunkservers dead and plans
    /// re-replication for the chunks they held.
    pub async fn start_failure_detector(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.failure_scan_interval;
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(interval));
            loop {
                ticker.tick().await;
                let now = now_secs();
                let mut state = state.lock().await;
                state.detect_failures(now);
                state.plan_repairs(now);
            }
        })
    }

    /// Starts the garbage-collection task: tombstoned files, unreferenced
    /// chunks, and deferred stale-replica deletions.
    pub async fn start_gc_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.gc_interval;
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(interval));
            loop {
                ticker.tick().await;
                let mut state = state.lock().await;
                state.collect_garbage(now_secs());
            }
        })
    }

    /// Starts the periodic metadata snapshot. A failed snapshot is retried
    /// on the next tick; the WAL still covers everything in between.
    pub async fn start_snapshot_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.common.snapshot_interval;
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(interval));
            // The first tick fires immediately; skip it so a fresh master
            // does not snapshot an empty state over a recovered one.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut state = state.lock().await;
                match state.snapshot_to_disk() {
                    Ok(()) => {}
                    Err(e) => error!("[Snapshot] Failed to write snapshot: {}", e),
                }
            }
        })
    }

    /// Final snapshot on orderly shutdown.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        match state.snapshot_to_disk() {
            Ok(()) => info!("[Shutdown] Final metadata snapshot written"),
            Err(e) => error!("[Shutdown] Final snapshot failed: {}", e),
        }
    }
}
