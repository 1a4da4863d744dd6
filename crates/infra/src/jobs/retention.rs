//! Periodic removal of old terminal jobs and dead letters.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::store::JobStore;

/// Deletes terminal records older than `max_age` every `interval`.
pub struct RetentionSweeper<S: JobStore + ?Sized> {
    store: Arc<S>,
    max_age: Duration,
    interval: Duration,
}

impl<S: JobStore + ?Sized> RetentionSweeper<S> {
    pub fn new(store: Arc<S>, max_age: Duration, interval: Duration) -> Self {
        Self {
            store,
            max_age,
            interval,
        }
    }

    /// Run until the cancellation token is triggered. Returns the total number
    /// of records removed.
    pub async fn run(self, cancel: CancellationToken) -> usize {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut total = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.store.cleanup_older_than(self.max_age).await {
                        Ok(0) => {}
                        Ok(removed) => {
                            total += removed;
                            tracing::info!(
                                removed,
                                max_age_secs = self.max_age.as_secs(),
                                "retention sweep removed old records"
                            );
                        }
                        Err(e) => tracing::error!(error = %e, "retention sweep failed"),
                    }
                }
            }
        }

        total
    }
}
