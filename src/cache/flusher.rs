//! Background flusher that sweeps idle dirty files to the content
//! store, plus the eviction pass that keeps the cache under budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::SliceCache;

/// Sweeps the cache at a fixed interval, flushing files whose dirty
/// bytes have been idle past the configured threshold. Writers under
/// backpressure kick it ahead of schedule.
pub struct Flusher {
    cache: Arc<SliceCache>,
    interval: Duration,
    idle_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Flusher {
    pub fn spawn(
        cache: Arc<SliceCache>,
        interval: Duration,
        idle_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { Self { cache, interval, idle_timeout, shutdown }.run().await })
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = self.cache.kicked() => self.sweep().await,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        debug!("flusher stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn sweep(&self) {
        // Under budget pressure every dirty file qualifies, idle or not,
        // so blocked writers drain as fast as the store allows.
        let pressured = self.cache.dirty_size() > self.cache.byte_budget();
        let files = self.cache.dirty_files(self.idle_timeout, pressured).await;
        for file in files {
            trace!(file = file.0, "background flush");
            // Failures revert the slices to Buffering; the next sweep
            // retries and the error surfaces on explicit flush.
            let _ = self.cache.flush_file(file).await;
        }
        self.cache.evict_to_budget().await;
    }
}
