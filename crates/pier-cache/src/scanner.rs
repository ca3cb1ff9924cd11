//! Background scan task.
//!
//! Runs [`CacheEngine::scan_and_evict`] every `scan_interval_secs`. The
//! deadline is recomputed whenever the limits change, so a shorter interval
//! takes effect immediately instead of after the old one elapses.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info};

use crate::engine::CacheEngine;

impl CacheEngine {
    /// Spawn the periodic scan loop.
    ///
    /// The loop stops once `stopping` turns `true` or its sender is dropped.
    pub fn spawn_scanner(self: &Arc<Self>, stopping: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run_scanner(stopping).await })
    }

    async fn run_scanner(&self, mut stopping: watch::Receiver<bool>) {
        let mut limits = self.subscribe_limits();
        let mut last_scan = Instant::now();
        info!(
            interval_secs = limits.borrow().scan_interval_secs,
            "cache scanner started"
        );

        loop {
            let interval = limits.borrow_and_update().scan_interval();

            tokio::select! {
                _ = sleep_until(last_scan + interval) => {
                    let report = self.scan_and_evict().await;
                    info!(
                        total_bytes = report.total_bytes,
                        entries = report.entry_count,
                        expired = report.expired,
                        evicted = report.evicted,
                        failed = report.failed,
                        anomalies = report.anomalies(),
                        "cache scan finished"
                    );
                    last_scan = Instant::now();
                }
                changed = limits.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!("cache limits changed, rescheduling scan");
                }
                _ = async { stopping.wait_for(|stop| *stop).await.map(|_| ()) } => {
                    break;
                }
            }
        }

        info!("cache scanner stopped");
    }
}
