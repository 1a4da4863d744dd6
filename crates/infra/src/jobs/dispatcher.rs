//! Single-writer result dispatcher.
//!
//! Periodically drains terminal jobs from the store in creation order and
//! hands their messages to the [`DeliverySink`] it owns. A job's record is only
//! removed (or dead-lettered) after every one of its messages was accepted, so
//! a crash or sink outage leads to re-delivery rather than loss.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::sink::{DeliverySink, OutboundMessage, SinkDeliveryError};
use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobStatus};

/// Default dispatch interval.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchReport {
    pub messages_sent: usize,
    pub jobs_delivered: usize,
    pub jobs_dead_lettered: usize,
    /// Jobs left for the next cycle because the sink refused their channel.
    pub jobs_deferred: usize,
    /// The sink refused at least one message this cycle.
    pub stalled: bool,
}

/// Cumulative dispatcher statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub cycles: u64,
    pub messages_sent: u64,
    pub jobs_delivered: u64,
    pub jobs_dead_lettered: u64,
    pub delivery_failures: u64,
}

impl DispatcherStats {
    fn record(&mut self, report: &DispatchReport) {
        self.cycles += 1;
        self.messages_sent += report.messages_sent as u64;
        self.jobs_delivered += report.jobs_delivered as u64;
        self.jobs_dead_lettered += report.jobs_dead_lettered as u64;
        if report.stalled {
            self.delivery_failures += 1;
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum DeliveryError {
    #[error(transparent)]
    Sink(#[from] SinkDeliveryError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// The only component that writes to the delivery sink.
pub struct ResultDispatcher<S: JobStore + ?Sized, K: DeliverySink> {
    store: Arc<S>,
    sink: K,
    interval: Duration,
    stats: DispatcherStats,
}

impl<S: JobStore + ?Sized, K: DeliverySink> ResultDispatcher<S, K> {
    /// Create a dispatcher with the default 1-second interval.
    pub fn new(store: Arc<S>, sink: K) -> Self {
        Self {
            store,
            sink,
            interval: DEFAULT_INTERVAL,
            stats: DispatcherStats::default(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// Run until `cancel` fires, then make one last pass so results of jobs
    /// that finished during shutdown still go out.
    pub async fn run(mut self, cancel: CancellationToken) -> DispatcherStats {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "result dispatcher started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.cycle().await;
                    info!(stats = ?self.stats, "result dispatcher stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.cycle().await;
                }
            }
        }

        self.stats
    }

    async fn cycle(&mut self) {
        match self.dispatch_once().await {
            Ok(report) => {
                if report.messages_sent > 0 || report.stalled {
                    debug!(?report, "dispatch cycle finished");
                }
                self.stats.record(&report);
            }
            Err(e) => error!(error = %e, "dispatch cycle failed"),
        }
    }

    /// One pass over all terminal jobs, oldest first.
    ///
    /// When the sink refuses a message, the rest of that job and every later job
    /// for the same channel wait for the next cycle, so a channel never sees a
    /// newer job ahead of an older one. Other channels keep flowing.
    pub async fn dispatch_once(&mut self) -> Result<DispatchReport, JobStoreError> {
        let mut jobs = self.store.drain_completed().await?;
        jobs.extend(self.store.drain_failed().await?);
        jobs.sort_by(|a, b| (a.created_at, a.seq).cmp(&(b.created_at, b.seq)));

        let mut report = DispatchReport::default();
        let mut blocked: HashSet<&str> = HashSet::new();
        for job in &jobs {
            let channel = job.payload.reply_to.channel.as_str();
            if blocked.contains(channel) {
                report.jobs_deferred += 1;
                continue;
            }

            let delivered = match job.status {
                JobStatus::Completed => self.deliver_completed(job, &mut report).await,
                JobStatus::Failed => self.deliver_failed(job, &mut report).await,
                JobStatus::Pending | JobStatus::Processing => continue,
            };

            match delivered {
                Ok(()) => {}
                Err(DeliveryError::Sink(e)) => {
                    warn!(
                        job_id = %job.id,
                        channel,
                        error = %e,
                        "delivery failed; channel deferred to next cycle"
                    );
                    report.stalled = true;
                    report.jobs_deferred += 1;
                    blocked.insert(channel);
                }
                // Swept by retention between drain and delivery.
                Err(DeliveryError::Store(JobStoreError::NotFound(id))) => {
                    debug!(job_id = %id, "job disappeared before delivery finished");
                }
                Err(DeliveryError::Store(e)) => return Err(e),
            }
        }

        Ok(report)
    }

    async fn deliver_completed(
        &mut self,
        job: &Job,
        report: &mut DispatchReport,
    ) -> Result<(), DeliveryError> {
        for (index, slot) in job.undelivered_slots() {
            self.sink.send(&OutboundMessage::for_slot(job, slot)).await?;
            report.messages_sent += 1;
            self.store.record_delivery(job.id, index as u32 + 1).await?;
        }

        self.store.remove(job.id).await?;
        report.jobs_delivered += 1;
        info!(job_id = %job.id, filename = %job.payload.filename, "results delivered");
        Ok(())
    }

    async fn deliver_failed(
        &mut self,
        job: &Job,
        report: &mut DispatchReport,
    ) -> Result<(), DeliveryError> {
        if job.delivered_slots == 0 {
            self.sink.send(&OutboundMessage::dead_letter(job)).await?;
            report.messages_sent += 1;
            self.store.record_delivery(job.id, 1).await?;
        }

        let reason = job.error.as_deref().unwrap_or("unknown error");
        self.store.dead_letter(job.id, reason).await?;
        report.jobs_dead_lettered += 1;
        warn!(
            job_id = %job.id,
            filename = %job.payload.filename,
            retry_count = job.retry_count,
            error = reason,
            "job dead-lettered"
        );
        Ok(())
    }
}
