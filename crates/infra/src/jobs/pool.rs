//! Fixed-size worker pool: W slots, each claiming and executing one job at a time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use super::executor::{ExecutionOutcome, TaskExecutor};
use super::store::JobStore;
use super::types::{FailureOutcome, Job, JobId};

/// Error recorded when a job is released because shutdown ran out of time.
pub const SHUTDOWN_ERROR: &str = "interrupted by shutdown";

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker slots (W)
    pub workers: usize,
    /// How long an idle slot waits before polling the store again
    pub idle_wait: Duration,
    /// How long shutdown waits for in-flight jobs before aborting them
    pub shutdown_grace: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            idle_wait: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_requeued: u64,
    pub jobs_failed: u64,
    pub worker_faults: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Outcome of [`WorkerPoolHandle::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every slot finished its job within the grace period.
    pub graceful: bool,
    /// Jobs aborted at the deadline and handed back to the store.
    pub released: Vec<JobId>,
}

struct Shared<S: ?Sized> {
    store: Arc<S>,
    executor: TaskExecutor,
    config: WorkerPoolConfig,
    in_flight: Mutex<HashSet<JobId>>,
    stats: Mutex<PoolStats>,
    started: Instant,
}

impl<S: JobStore + ?Sized> Shared<S> {
    fn update_stats(&self, f: impl FnOnce(&mut PoolStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    fn track(&self, id: JobId, running: bool) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            if running {
                in_flight.insert(id);
            } else {
                in_flight.remove(&id);
            }
            let count = in_flight.len();
            self.update_stats(|s| s.current_running = count);
        }
    }
}

/// Worker pool over a job store.
pub struct WorkerPool<S: JobStore + ?Sized> {
    store: Arc<S>,
    executor: TaskExecutor,
    config: WorkerPoolConfig,
}

impl<S: JobStore + ?Sized> WorkerPool<S> {
    pub fn new(store: Arc<S>, executor: TaskExecutor) -> Self {
        Self {
            store,
            executor,
            config: WorkerPoolConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerPoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Start W slots. Slots stop claiming once `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> WorkerPoolHandle<S> {
        let workers = self.config.workers.max(1);
        let shared = Arc::new(Shared {
            store: self.store,
            executor: self.executor,
            config: self.config,
            in_flight: Mutex::new(HashSet::new()),
            stats: Mutex::new(PoolStats::default()),
            started: Instant::now(),
        });

        info!(
            workers,
            idle_wait_ms = shared.config.idle_wait.as_millis() as u64,
            "worker pool started"
        );

        let slots = (0..workers)
            .map(|slot| tokio::spawn(run_slot(slot, shared.clone(), cancel.clone())))
            .collect();

        WorkerPoolHandle {
            shared,
            slots,
            cancel,
        }
    }
}

async fn run_slot<S: JobStore + ?Sized>(
    slot: usize,
    shared: Arc<Shared<S>>,
    cancel: CancellationToken,
) {
    debug!(slot, "worker slot started");

    while !cancel.is_cancelled() {
        match shared.store.claim_next().await {
            Ok(Some(job)) => process(slot, &shared, job).await,
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(shared.config.idle_wait) => {}
                }
            }
            Err(e) => {
                error!(slot, error = %e, "failed to claim job");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(shared.config.idle_wait) => {}
                }
            }
        }
    }

    debug!(slot, "worker slot stopped");
}

async fn process<S: JobStore + ?Sized>(slot: usize, shared: &Arc<Shared<S>>, job: Job) {
    let id = job.id;
    let attempt = job.retry_count + 1;
    info!(slot, job_id = %id, attempt, filename = %job.payload.filename, "processing job");
    shared.track(id, true);

    // Executing on a separate task turns a panic into a JoinError instead of
    // taking the slot down with it.
    let executor = shared.executor.clone();
    let execution =
        AbortOnDropHandle::new(tokio::spawn(async move { executor.execute(&job).await }));

    let started = Instant::now();
    let recorded = match execution.await {
        Ok(ExecutionOutcome::Completed(slots)) => {
            let succeeded = slots.iter().filter(|s| s.is_success()).count();
            let total = slots.len();
            let result = shared.store.complete(id, slots).await;
            if result.is_ok() {
                info!(
                    slot,
                    job_id = %id,
                    succeeded,
                    total,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job completed"
                );
                shared.update_stats(|s| s.jobs_completed += 1);
            }
            result
        }
        Ok(ExecutionOutcome::JobFailed { error, retryable: true }) => {
            record_retryable(slot, shared, id, &error).await
        }
        Ok(ExecutionOutcome::JobFailed { error, retryable: false }) => {
            let result = shared.store.fail_terminal(id, &error).await;
            if result.is_ok() {
                warn!(slot, job_id = %id, error = %error, "job failed permanently");
                shared.update_stats(|s| s.jobs_failed += 1);
            }
            result
        }
        Err(join_error) => {
            error!(slot, job_id = %id, error = %join_error, "worker fault while executing job");
            shared.update_stats(|s| s.worker_faults += 1);
            record_retryable(slot, shared, id, &format!("worker fault: {join_error}")).await
        }
    };

    // The job stays `Processing`; startup recovery reclaims it.
    if let Err(e) = recorded {
        error!(slot, job_id = %id, error = %e, "failed to record job outcome");
    }

    shared.update_stats(|s| s.jobs_processed += 1);
    shared.track(id, false);
}

async fn record_retryable<S: JobStore + ?Sized>(
    slot: usize,
    shared: &Shared<S>,
    id: JobId,
    error: &str,
) -> Result<(), super::store::JobStoreError> {
    match shared.store.fail_retryable(id, error).await? {
        FailureOutcome::Requeued {
            retry_count,
            available_at,
        } => {
            warn!(slot, job_id = %id, retry_count, %available_at, error, "job requeued");
            shared.update_stats(|s| s.jobs_requeued += 1);
        }
        FailureOutcome::Exhausted => {
            warn!(slot, job_id = %id, error, "job failed after exhausting retries");
            shared.update_stats(|s| s.jobs_failed += 1);
        }
    }
    Ok(())
}

/// Handle to control a running pool.
pub struct WorkerPoolHandle<S: JobStore + ?Sized> {
    shared: Arc<Shared<S>>,
    slots: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl<S: JobStore + ?Sized> WorkerPoolHandle<S> {
    /// Get current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let mut stats = self
            .shared
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.uptime_secs = self.shared.started.elapsed().as_secs();
        stats
    }

    /// Jobs currently being executed.
    pub fn in_flight(&self) -> Vec<JobId> {
        self.shared
            .in_flight
            .lock()
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Stop claiming, let in-flight jobs finish within the grace period, then
    /// abort whatever is left and hand those jobs back as retryable failures.
    pub async fn shutdown(mut self) -> ShutdownReport {
        self.cancel.cancel();
        let grace = self.shared.config.shutdown_grace;
        info!(grace_secs = grace.as_secs(), "worker pool shutting down");

        let deadline = tokio::time::Instant::now() + grace;
        let mut finished = 0;
        while finished < self.slots.len() {
            if tokio::time::timeout_at(deadline, &mut self.slots[finished]).await.is_err() {
                break;
            }
            finished += 1;
        }
        if finished == self.slots.len() {
            info!("worker pool stopped");
            return ShutdownReport {
                graceful: true,
                released: Vec::new(),
            };
        }

        // Aborting a slot drops its execution handle, which aborts the job's tasks.
        let remaining: Vec<_> = self.slots.drain(finished..).collect();
        for slot in &remaining {
            slot.abort();
        }
        for slot in remaining {
            let _ = slot.await;
        }

        let mut released = Vec::new();
        for id in self.in_flight() {
            match self.shared.store.fail_retryable(id, SHUTDOWN_ERROR).await {
                Ok(_) => released.push(id),
                Err(e) => error!(job_id = %id, error = %e, "failed to release job at shutdown"),
            }
        }
        warn!(released = released.len(), "worker pool aborted in-flight jobs");

        ShutdownReport {
            graceful: false,
            released,
        }
    }
}
